//! Sequencer
//!
//! Transport state machine, timebase and the two-layer value model. Layer A
//! holds manual static overrides, layer B is the interpolated output of the
//! active program; the visible mix is one or the other, cross-faded on mode
//! change. All mutation happens under a single lock and every settled change
//! emits exactly one frame to the subscribed listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::models::frame::{layer_key, unix_millis, LayerValueMap, PlayheadPatch, PlayheadState, RenderFrame};
use crate::models::program::{clamp_byte, clamp_spm, DEFAULT_SPM};
use crate::models::Program;

/// Duration of the cross-fade run whenever the visible mix switches between
/// the sequencer layer and the static layer.
pub const MODE_SWITCH_FADE_MS: f64 = 500.0;

/// Nominal step length baseline: a step with `duration_ms == 500` lasts
/// exactly `60000 / spm` milliseconds.
const STEP_SCALE_BASE_MS: f64 = 500.0;

/// Wall-clock delta per tick is clamped to this, so frozen executors do not
/// cause multi-second catch-ups.
const MAX_TICK_DELTA_MS: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MixMode {
    Sequencer,
    Static,
}

/// A single manual-layer mutation. Batches of these are applied atomically
/// with respect to frame emission.
#[derive(Debug, Clone)]
pub enum LayerAOp {
    Set {
        fixture: String,
        feature: String,
        value: Vec<f64>,
    },
    ClearFeature {
        fixture: String,
        feature: String,
    },
    ClearFixture {
        fixture: String,
    },
}

pub type FrameListener = Arc<dyn Fn(&RenderFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, FrameListener)>,
}

struct CrossFade {
    from: LayerValueMap,
    started: Instant,
}

struct ModeGuard {
    from: LayerValueMap,
    mode: MixMode,
}

struct SequencerInner {
    program: Option<Arc<Program>>,
    is_playing: bool,
    is_blackout: bool,
    step_index: usize,
    position_ms: f64,
    spm: u32,
    loop_enabled: bool,
    render_fps: u32,
    layer_a: LayerValueMap,
    fade: Option<CrossFade>,
    last_tick: Option<Instant>,
    /// Set while the playhead sits at the top of the program without having
    /// advanced; step 0 then interpolates from itself instead of wrapping to
    /// the last step.
    at_program_start: bool,
}

impl SequencerInner {
    fn new(render_fps: u32) -> Self {
        Self {
            program: None,
            is_playing: false,
            is_blackout: false,
            step_index: 0,
            position_ms: 0.0,
            spm: DEFAULT_SPM,
            loop_enabled: true,
            render_fps: render_fps.clamp(1, 120),
            layer_a: LayerValueMap::new(),
            fade: None,
            last_tick: None,
            at_program_start: true,
        }
    }

    fn tick_period(&self) -> Duration {
        let ms = (1000.0 / self.render_fps as f64).round().max(1.0);
        Duration::from_millis(ms as u64)
    }

    fn step_count(&self) -> usize {
        self.program.as_ref().map(|p| p.steps.len()).unwrap_or(0)
    }

    fn mix_mode(&self) -> MixMode {
        if self.is_playing && self.step_count() > 0 {
            MixMode::Sequencer
        } else {
            MixMode::Static
        }
    }

    /// Interpolated sequencer output for the current playhead. Empty when
    /// blacked out; all-zero vectors are elided.
    fn layer_b_values(&self) -> LayerValueMap {
        let mut out = LayerValueMap::new();
        if self.is_blackout {
            return out;
        }
        let Some(program) = &self.program else {
            return out;
        };
        if program.steps.is_empty() {
            return out;
        }

        let idx = self.step_index.min(program.steps.len() - 1);
        let curr = &program.steps[idx];
        let prev = if idx > 0 {
            &program.steps[idx - 1]
        } else if self.loop_enabled && !self.at_program_start {
            &program.steps[program.steps.len() - 1]
        } else {
            curr
        };

        let ratio = if !self.is_playing || curr.fade_ms == 0 {
            1.0
        } else {
            (self.position_ms / curr.fade_ms as f64).clamp(0.0, 1.0)
        };

        let mut pairs: HashMap<String, (Vec<u8>, Vec<u8>)> = HashMap::new();
        for frame in &prev.frames {
            pairs
                .entry(layer_key(&frame.fixture, &frame.feature))
                .or_default()
                .0 = frame.value.to_bytes();
        }
        for frame in &curr.frames {
            pairs
                .entry(layer_key(&frame.fixture, &frame.feature))
                .or_default()
                .1 = frame.value.to_bytes();
        }

        for (key, (from, to)) in pairs {
            let bytes = lerp_bytes(&from, &to, ratio);
            if bytes.iter().any(|&b| b != 0) {
                out.insert(key, bytes);
            }
        }
        out
    }

    /// Target values of the current visible mode, before any cross-fade.
    fn mode_values(&self) -> LayerValueMap {
        match self.mix_mode() {
            MixMode::Sequencer => self.layer_b_values(),
            MixMode::Static => self.layer_a.clone(),
        }
    }

    /// Visible mix at `now`. A completed cross-fade clears itself here, and
    /// blackout hard-cuts to empty regardless of any fade in flight.
    fn visible_values(&mut self, now: Instant) -> LayerValueMap {
        let progress = self
            .fade
            .as_ref()
            .map(|f| now.duration_since(f.started).as_secs_f64() * 1000.0 / MODE_SWITCH_FADE_MS);
        if matches!(progress, Some(p) if p >= 1.0) {
            self.fade = None;
        }
        if self.is_blackout {
            return LayerValueMap::new();
        }
        let target = self.mode_values();
        match (&self.fade, progress) {
            (Some(fade), Some(p)) => lerp_maps(&fade.from, &target, p),
            _ => target,
        }
    }

    fn begin_fade(&mut self, from: LayerValueMap, now: Instant) {
        self.fade = Some(CrossFade { from, started: now });
    }

    fn capture(&mut self, now: Instant) -> ModeGuard {
        ModeGuard {
            from: self.visible_values(now),
            mode: self.mix_mode(),
        }
    }

    /// Start a cross-fade from the captured values when the visible mode
    /// changed across the mutation (or when forced by a static-layer edit).
    fn settle(&mut self, guard: ModeGuard, now: Instant, force: bool) {
        if force || self.mix_mode() != guard.mode {
            self.begin_fade(guard.from, now);
        }
    }

    /// Advance the playhead by `dt_ms` of wall time, stepping through as many
    /// steps as the elapsed time covers.
    fn advance(&mut self, now: Instant, dt_ms: f64) {
        self.position_ms += dt_ms;
        let Some(program) = self.program.clone() else {
            return;
        };
        if program.steps.is_empty() {
            return;
        }

        loop {
            let idx = self.step_index.min(program.steps.len() - 1);
            let step = &program.steps[idx];
            let step_scale = step.duration_ms.max(1) as f64 / STEP_SCALE_BASE_MS;
            let target_ms = (60_000.0 / self.spm as f64) * step_scale;
            if self.position_ms < target_ms {
                break;
            }
            self.position_ms -= target_ms;

            if idx + 1 >= program.steps.len() {
                if self.loop_enabled {
                    self.step_index = 0;
                    self.at_program_start = false;
                } else {
                    // End of a non-looping program: hold the last step and
                    // fade the visible mix back to the static layer.
                    self.step_index = program.steps.len() - 1;
                    let from = self.visible_values(now);
                    self.is_playing = false;
                    self.begin_fade(from, now);
                    break;
                }
            } else {
                self.step_index = idx + 1;
                self.at_program_start = false;
            }
        }
    }

    fn set_layer_a(&mut self, fixture: &str, feature: &str, value: &[f64]) -> bool {
        let bytes: Vec<u8> = value.iter().map(|&v| clamp_byte(v)).collect();
        let key = layer_key(fixture, feature);
        if bytes.iter().all(|&b| b == 0) {
            return self.layer_a.remove(&key).is_some();
        }
        if self.layer_a.get(&key).map(|v| v.as_slice()) == Some(bytes.as_slice()) {
            return false;
        }
        self.layer_a.insert(key, bytes);
        true
    }

    fn apply_op(&mut self, op: &LayerAOp) -> bool {
        match op {
            LayerAOp::Set {
                fixture,
                feature,
                value,
            } => self.set_layer_a(fixture, feature, value),
            LayerAOp::ClearFeature { fixture, feature } => {
                self.layer_a.remove(&layer_key(fixture, feature)).is_some()
            }
            LayerAOp::ClearFixture { fixture } => {
                let prefix = format!("{}:", fixture);
                let before = self.layer_a.len();
                self.layer_a.retain(|k, _| !k.starts_with(&prefix));
                self.layer_a.len() != before
            }
        }
    }

    fn snapshot_state(&self) -> PlayheadState {
        PlayheadState {
            is_playing: self.is_playing,
            is_blackout: self.is_blackout,
            program_id: self.program.as_ref().map(|p| p.id.clone()),
            step_index: self.step_index,
            position_ms: self.position_ms,
            spm: self.spm,
            loop_enabled: self.loop_enabled,
        }
    }

    fn build_frame(&mut self, now: Instant) -> RenderFrame {
        RenderFrame {
            timestamp: unix_millis(),
            state: self.snapshot_state(),
            layer_a_values: self.layer_a.clone(),
            layer_b_values: self.layer_b_values(),
            values: self.visible_values(now),
        }
    }
}

fn lerp_bytes(from: &[u8], to: &[u8], t: f64) -> Vec<u8> {
    let len = from.len().max(to.len());
    (0..len)
        .map(|i| {
            let a = from.get(i).copied().unwrap_or(0) as f64;
            let b = to.get(i).copied().unwrap_or(0) as f64;
            (a + (b - a) * t).round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

fn lerp_maps(from: &LayerValueMap, to: &LayerValueMap, t: f64) -> LayerValueMap {
    let mut out = LayerValueMap::new();
    let empty: Vec<u8> = Vec::new();
    let keys: std::collections::HashSet<&String> = from.keys().chain(to.keys()).collect();
    for key in keys {
        let a = from.get(key).unwrap_or(&empty);
        let b = to.get(key).unwrap_or(&empty);
        let bytes = lerp_bytes(a, b, t);
        if bytes.iter().any(|&v| v != 0) {
            out.insert(key.clone(), bytes);
        }
    }
    out
}

/// Shared handle to the sequencer. Cheap to clone; every operation locks,
/// mutates, snapshots the resulting frame and notifies listeners after the
/// lock is released.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Mutex<SequencerInner>>,
    listeners: Arc<Mutex<ListenerSet>>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(crate::models::environment::DEFAULT_RENDER_FPS)
    }
}

impl Sequencer {
    pub fn new(render_fps: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SequencerInner::new(render_fps))),
            listeners: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SequencerInner> {
        self.inner.lock().expect("sequencer state poisoned")
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&RenderFrame) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut set = self.listeners.lock().expect("listener set poisoned");
        set.next_id += 1;
        let id = set.next_id;
        set.entries.push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut set = self.listeners.lock().expect("listener set poisoned");
        set.entries.retain(|(entry_id, _)| *entry_id != id.0);
    }

    fn notify(&self, frame: &RenderFrame) {
        let entries: Vec<FrameListener> = {
            let set = self.listeners.lock().expect("listener set poisoned");
            set.entries.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in entries {
            listener(frame);
        }
    }

    pub fn state(&self) -> PlayheadState {
        self.lock().snapshot_state()
    }

    pub fn frame(&self) -> RenderFrame {
        self.lock().build_frame(Instant::now())
    }

    /// Replace the active program snapshot. The playhead either resets to the
    /// top or is clamped into the new step range.
    pub fn set_program(
        &self,
        program: Option<Arc<Program>>,
        preserve_playhead: bool,
        suppress_emit: bool,
    ) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            g.program = program;
            g.spm = clamp_spm(g.spm);
            if preserve_playhead {
                let len = g.step_count();
                g.step_index = g.step_index.min(len.saturating_sub(1));
            } else {
                g.step_index = 0;
                g.position_ms = 0.0;
                g.at_program_start = true;
            }
            g.settle(guard, now, false);
            if suppress_emit {
                None
            } else {
                Some(g.build_frame(now))
            }
        };
        if let Some(frame) = &frame {
            self.notify(frame);
        }
    }

    /// Start playback from the top of the active program.
    pub fn play(&self) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            if !g.is_playing && g.program.is_some() {
                g.step_index = 0;
                g.position_ms = 0.0;
                g.at_program_start = true;
                g.is_playing = true;
                g.last_tick = Some(now);
                g.settle(guard, now, false);
            }
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    /// Start playback without resetting the playhead.
    pub fn resume(&self) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            if !g.is_playing && g.program.is_some() {
                g.is_playing = true;
                g.last_tick = Some(now);
                g.settle(guard, now, false);
            }
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    pub fn pause(&self) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            if g.is_playing {
                g.is_playing = false;
                g.settle(guard, now, false);
            }
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    pub fn next_step(&self) {
        self.step_op(|index, len, wrap| {
            if index + 1 >= len {
                if wrap {
                    0
                } else {
                    len - 1
                }
            } else {
                index + 1
            }
        });
    }

    pub fn previous_step(&self) {
        self.step_op(|index, len, wrap| {
            if index == 0 {
                if wrap {
                    len - 1
                } else {
                    0
                }
            } else {
                index - 1
            }
        });
    }

    fn step_op(&self, next: impl FnOnce(usize, usize, bool) -> usize) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let len = g.step_count();
            if len > 0 {
                g.step_index = next(g.step_index.min(len - 1), len, g.loop_enabled);
                g.position_ms = 0.0;
                g.at_program_start = false;
            }
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    /// Seek to a step. Out-of-range indices are clamped, never auto-extended.
    pub fn set_step(&self, index: usize) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let len = g.step_count();
            g.step_index = index.min(len.saturating_sub(1));
            g.position_ms = 0.0;
            g.at_program_start = g.step_index == 0;
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    pub fn set_spm(&self, spm: u32) {
        let frame = {
            let mut g = self.lock();
            g.spm = clamp_spm(spm);
            g.build_frame(Instant::now())
        };
        self.notify(&frame);
    }

    pub fn set_loop(&self, enabled: bool) {
        let frame = {
            let mut g = self.lock();
            g.loop_enabled = enabled;
            g.build_frame(Instant::now())
        };
        self.notify(&frame);
    }

    pub fn set_blackout(&self, blackout: bool) {
        let frame = {
            let mut g = self.lock();
            g.is_blackout = blackout;
            g.build_frame(Instant::now())
        };
        self.notify(&frame);
    }

    /// Change the tick rate. The ticker picks up the new period on its next
    /// pass; no frame is emitted.
    pub fn set_frame_rate(&self, fps: u32) {
        let mut g = self.lock();
        g.render_fps = fps.clamp(1, 120);
    }

    /// Write one manual override. Returns whether the stored layer changed; a
    /// frame is emitted only then.
    pub fn set_layer_a_value(&self, fixture: &str, feature: &str, value: &[f64]) -> bool {
        self.apply_layer_a_batch(vec![LayerAOp::Set {
            fixture: fixture.to_string(),
            feature: feature.to_string(),
            value: value.to_vec(),
        }])
    }

    pub fn clear_layer_a_feature(&self, fixture: &str, feature: &str) -> bool {
        self.apply_layer_a_batch(vec![LayerAOp::ClearFeature {
            fixture: fixture.to_string(),
            feature: feature.to_string(),
        }])
    }

    pub fn clear_layer_a_fixture(&self, fixture: &str) -> bool {
        self.apply_layer_a_batch(vec![LayerAOp::ClearFixture {
            fixture: fixture.to_string(),
        }])
    }

    /// Apply a batch of manual-layer operations atomically: one visible-values
    /// snapshot, at most one frame, at most one cross-fade start.
    pub fn apply_layer_a_batch(&self, ops: Vec<LayerAOp>) -> bool {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            let in_static = g.mix_mode() == MixMode::Static;
            let mut changed = false;
            for op in &ops {
                changed |= g.apply_op(op);
            }
            if !changed {
                return false;
            }
            g.settle(guard, now, in_static);
            g.build_frame(now)
        };
        self.notify(&frame);
        true
    }

    /// Apply a partial playhead state, clamping every field. Used by the
    /// editor flow that rebinds a program and restores the previous playhead.
    pub fn apply_state_snapshot(&self, patch: PlayheadPatch) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            let guard = g.capture(now);
            if let Some(spm) = patch.spm {
                g.spm = clamp_spm(spm);
            }
            if let Some(loop_enabled) = patch.loop_enabled {
                g.loop_enabled = loop_enabled;
            }
            if let Some(blackout) = patch.is_blackout {
                g.is_blackout = blackout;
            }
            if let Some(index) = patch.step_index {
                let len = g.step_count();
                g.step_index = index.min(len.saturating_sub(1));
            }
            if let Some(position) = patch.position_ms {
                g.position_ms = position.max(0.0);
            }
            if patch.step_index.is_some() || patch.position_ms.is_some() {
                g.at_program_start = g.step_index == 0 && g.position_ms == 0.0;
            }
            if let Some(playing) = patch.is_playing {
                if playing && !g.is_playing && g.program.is_some() {
                    g.is_playing = true;
                    g.last_tick = Some(now);
                } else if !playing {
                    g.is_playing = false;
                }
            }
            g.settle(guard, now, false);
            g.build_frame(now)
        };
        self.notify(&frame);
    }

    /// One pass of the shared ticker: advance the playhead when playing, keep
    /// frames flowing while a cross-fade runs when paused, otherwise idle.
    pub fn tick(&self) {
        let frame = {
            let mut g = self.lock();
            let now = Instant::now();
            if g.is_playing {
                let dt_ms = g
                    .last_tick
                    .map(|t| now.duration_since(t).as_secs_f64() * 1000.0)
                    .unwrap_or(0.0)
                    .clamp(0.0, MAX_TICK_DELTA_MS);
                g.last_tick = Some(now);
                g.advance(now, dt_ms);
                Some(g.build_frame(now))
            } else if g.fade.is_some() {
                g.last_tick = Some(now);
                Some(g.build_frame(now))
            } else {
                g.last_tick = Some(now);
                None
            }
        };
        if let Some(frame) = &frame {
            self.notify(frame);
        }
    }

    /// Spawn the periodic ticker driving both the sequencer tick and the mix
    /// tick. The period is re-read every pass so frame-rate changes apply on
    /// the next tick.
    pub fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let sequencer = self.clone();
        tokio::spawn(async move {
            debug!("sequencer ticker started");
            loop {
                let period = sequencer.lock().tick_period();
                sleep(period).await;
                sequencer.tick();
            }
        })
    }
}
