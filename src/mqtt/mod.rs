//! MQTT bridge
//!
//! Advertises the sequencer to a home-automation broker via retained
//! discovery payloads, accepts commands that translate into transport and
//! manual-layer operations, and mirrors the manual layer per fixture as light
//! states. One runtime per (environment, output, broker url).

pub mod discovery;
pub mod light;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::models::program::clamp_spm;
use crate::models::{Environment, OutputConfig};
use crate::render::RenderPacket;
use crate::sequencer::{LayerAOp, Sequencer};

use discovery::{
    availability_topic, blackout_switch_config, light_config, light_state_topic,
    pause_button_config, play_button_config, program_config_topic, program_button_config,
    sanitize, spm_number_config,
};
use light::{
    apply_light_command, light_metas, mirror_light_state, parse_number, parse_on_off,
    FixtureLightState, LightCommand, LightMeta, LIGHT_COMMAND_BATCH_MS,
};

pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetKey {
    environment_id: String,
    output_id: String,
    url: String,
}

struct TargetState {
    /// Last serialized payload per retained topic, in first-publish order.
    retained: HashMap<String, String>,
    retained_order: Vec<String>,
    subscriptions: Vec<String>,
    advertised_programs: HashSet<String>,
    light_states: HashMap<String, FixtureLightState>,
    /// Queued manual-layer ops per fixture; later commands overwrite earlier
    /// ones for the same fixture.
    pending_ops: HashMap<String, Vec<LayerAOp>>,
    pending_order: Vec<String>,
    flush_scheduled: bool,
}

#[derive(Clone)]
struct MqttTarget {
    client: AsyncClient,
    environment_id: String,
    base_topic: String,
    discovery_prefix: String,
    node_id: String,
    legacy_topic: Option<String>,
    light_metas: Arc<Vec<LightMeta>>,
    state: Arc<Mutex<TargetState>>,
}

/// Shared handle to the bridge. `push` keeps every configured broker target
/// in sync with the latest frame; inbound commands are marshalled into
/// sequencer calls on the shared executor.
#[derive(Clone)]
pub struct MqttBridge {
    sequencer: Sequencer,
    config: Arc<RuntimeConfig>,
    targets: Arc<Mutex<HashMap<TargetKey, MqttTarget>>>,
}

impl MqttBridge {
    pub fn new(sequencer: Sequencer, config: Arc<RuntimeConfig>) -> Self {
        Self {
            sequencer,
            config,
            targets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn push(&self, packet: &RenderPacket) {
        for output in &packet.environment.outputs {
            let OutputConfig::Mqtt { enabled, .. } = output else {
                continue;
            };
            if !*enabled {
                continue;
            }
            if let Some(target) = self.ensure_target(&packet.environment, output) {
                target.sync(packet, &self.config);
            }
        }
    }

    fn ensure_target(
        &self,
        environment: &Arc<Environment>,
        output: &OutputConfig,
    ) -> Option<MqttTarget> {
        let OutputConfig::Mqtt {
            id,
            url,
            base_topic,
            discovery_prefix,
            node_id,
            topic,
            ..
        } = output
        else {
            return None;
        };

        let key = TargetKey {
            environment_id: environment.id.clone(),
            output_id: id.clone(),
            url: url.clone(),
        };
        {
            let targets = self.targets.lock().expect("mqtt targets poisoned");
            if let Some(target) = targets.get(&key) {
                return Some(target.clone());
            }
        }

        let base = base_topic.clone().unwrap_or_else(|| {
            format!("chaser/{}/{}", sanitize(&environment.id), sanitize(id))
        });
        let prefix = discovery_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_DISCOVERY_PREFIX.to_string());
        let node = node_id
            .clone()
            .map(|n| sanitize(&n))
            .unwrap_or_else(|| sanitize(&format!("chaser_{}", environment.id)));

        let (host, port) = parse_broker_url(url);
        let client_id = format!("{}_{}", node, sanitize(id));
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let subscriptions = vec![
            format!("{}/control/spm/set", base),
            format!("{}/control/play_from_start/press", base),
            format!("{}/control/pause/press", base),
            format!("{}/control/blackout/set", base),
            format!("{}/program/+/press", base),
            format!("{}/light/+/set", base),
        ];

        let target = MqttTarget {
            client,
            environment_id: environment.id.clone(),
            base_topic: base,
            discovery_prefix: prefix,
            node_id: node,
            legacy_topic: topic.clone(),
            light_metas: Arc::new(light_metas(environment, &self.config)),
            state: Arc::new(Mutex::new(TargetState {
                retained: HashMap::new(),
                retained_order: Vec::new(),
                subscriptions,
                advertised_programs: HashSet::new(),
                light_states: HashMap::new(),
                pending_ops: HashMap::new(),
                pending_order: Vec::new(),
                flush_scheduled: false,
            })),
        };

        {
            let mut targets = self.targets.lock().expect("mqtt targets poisoned");
            targets.insert(key, target.clone());
        }

        let task_target = target.clone();
        let sequencer = self.sequencer.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            debug!(base = %task_target.base_topic, "mqtt event loop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => task_target.on_connect(),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).to_string();
                        task_target.handle_command(&sequencer, &config, &publish.topic, &payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // The client reconnects on the next poll; state is kept.
                        debug!(error = %e, "mqtt connection error");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Some(target)
    }
}

impl MqttTarget {
    fn lock(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().expect("mqtt target state poisoned")
    }

    /// Re-subscribe and re-publish the retained cache after every (re)connect.
    fn on_connect(&self) {
        let (subscriptions, retained) = {
            let g = self.lock();
            let retained: Vec<(String, String)> = g
                .retained_order
                .iter()
                .filter_map(|t| g.retained.get(t).map(|p| (t.clone(), p.clone())))
                .collect();
            (g.subscriptions.clone(), retained)
        };
        for topic in subscriptions {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                warn!(topic = %topic, error = %e, "mqtt subscribe failed");
            }
        }
        for (topic, payload) in retained {
            self.publish(&topic, payload, true);
        }
    }

    fn publish(&self, topic: &str, payload: String, retain: bool) {
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
        {
            debug!(topic = %topic, error = %e, "mqtt publish dropped");
        }
    }

    /// Publish retained, deduplicated against the cache.
    fn publish_retained(&self, topic: &str, payload: String) {
        {
            let mut g = self.lock();
            if g.retained.get(topic) == Some(&payload) {
                return;
            }
            if !g.retained.contains_key(topic) {
                g.retained_order.push(topic.to_string());
            }
            g.retained.insert(topic.to_string(), payload.clone());
        }
        self.publish(topic, payload, true);
    }

    /// Bring discovery, control states and light states up to date with the
    /// latest frame.
    fn sync(&self, packet: &RenderPacket, config: &RuntimeConfig) {
        let prefix = &self.discovery_prefix;
        let node = &self.node_id;
        let base = &self.base_topic;

        for meta in self.light_metas.iter() {
            let (topic, payload) = light_config(prefix, node, base, meta);
            self.publish_retained(&topic, payload.to_string());
        }
        let (topic, payload) = spm_number_config(prefix, node, base);
        self.publish_retained(&topic, payload.to_string());
        let (topic, payload) = play_button_config(prefix, node, base);
        self.publish_retained(&topic, payload.to_string());
        let (topic, payload) = pause_button_config(prefix, node, base);
        self.publish_retained(&topic, payload.to_string());
        let (topic, payload) = blackout_switch_config(prefix, node, base);
        self.publish_retained(&topic, payload.to_string());

        // Program buttons, with discovery removal for vanished programs.
        let programs = config.programs_for(&self.environment_id);
        let current: HashSet<String> = programs.iter().map(|p| p.id.clone()).collect();
        let stale: Vec<String> = {
            let mut g = self.lock();
            let stale = g
                .advertised_programs
                .difference(&current)
                .map(|id| program_config_topic(prefix, node, id))
                .collect();
            g.advertised_programs = current;
            stale
        };
        for topic in stale {
            self.publish_retained(&topic, String::new());
        }
        for program in &programs {
            let (topic, payload) = program_button_config(prefix, node, base, program);
            self.publish_retained(&topic, payload.to_string());
        }

        let state = &packet.frame.state;
        self.publish_retained(&availability_topic(base), "online".to_string());
        self.publish_retained(
            &format!("{}/control/blackout/state", base),
            if state.is_blackout { "ON" } else { "OFF" }.to_string(),
        );
        self.publish_retained(
            &format!("{}/control/spm/state", base),
            clamp_spm(state.spm).to_string(),
        );

        // Mirror the manual layer as per-fixture light states.
        let mirrored: Vec<(String, String)> = {
            let mut g = self.lock();
            self.light_metas
                .iter()
                .map(|meta| {
                    let light = g
                        .light_states
                        .entry(meta.fixture_id.clone())
                        .or_insert_with(|| FixtureLightState::initial(meta));
                    let payload =
                        mirror_light_state(meta, &packet.frame.layer_a_values, light);
                    (
                        light_state_topic(base, &meta.fixture_id),
                        payload.to_string(),
                    )
                })
                .collect()
        };
        for (topic, payload) in mirrored {
            self.publish_retained(&topic, payload);
        }

        // Legacy raw frame payload, non-retained.
        if let Some(legacy) = &self.legacy_topic {
            let dmx: HashMap<String, Vec<u8>> = packet
                .dmx_by_universe
                .iter()
                .map(|(u, data)| (u.to_string(), data.to_vec()))
                .collect();
            let payload = json!({
                "timestamp": packet.frame.timestamp,
                "state": &packet.frame.state,
                "values": &packet.frame.values,
                "layerAValues": &packet.frame.layer_a_values,
                "layerBValues": &packet.frame.layer_b_values,
                "dmxByUniverse": dmx,
            });
            self.publish(legacy, payload.to_string(), false);
        }
    }

    fn handle_command(
        &self,
        sequencer: &Sequencer,
        config: &RuntimeConfig,
        topic: &str,
        payload: &str,
    ) {
        let Some(rest) = topic
            .strip_prefix(self.base_topic.as_str())
            .and_then(|r| r.strip_prefix('/'))
        else {
            return;
        };
        debug!(topic = %rest, "mqtt command");

        match rest {
            "control/spm/set" => {
                if let Some(value) = parse_number(payload) {
                    if value.is_finite() && value >= 0.0 {
                        sequencer.set_spm(clamp_spm(value.round() as u32));
                    }
                }
            }
            "control/play_from_start/press" => {
                sequencer.set_step(0);
                sequencer.resume();
            }
            "control/pause/press" => sequencer.pause(),
            "control/blackout/set" => {
                if let Some(blackout) = parse_on_off(payload) {
                    sequencer.set_blackout(blackout);
                }
            }
            _ => {
                if let Some(program_id) = rest
                    .strip_prefix("program/")
                    .and_then(|r| r.strip_suffix("/press"))
                {
                    self.trigger_program(sequencer, config, program_id);
                } else if let Some(fixture_id) = rest
                    .strip_prefix("light/")
                    .and_then(|r| r.strip_suffix("/set"))
                {
                    self.handle_light_command(sequencer, fixture_id, payload);
                }
            }
        }
    }

    /// Apply a program by id and play it from the top. A program triggered
    /// while stopped also takes over the tempo.
    fn trigger_program(&self, sequencer: &Sequencer, config: &RuntimeConfig, program_id: &str) {
        let Some(program) = config.program(program_id) else {
            debug!(program = %program_id, "unknown program trigger ignored");
            return;
        };
        if !sequencer.state().is_playing {
            sequencer.set_spm(program.spm);
        }
        sequencer.set_program(Some(Arc::new(program.clone())), false, false);
        sequencer.set_step(0);
        sequencer.resume();
    }

    fn handle_light_command(&self, sequencer: &Sequencer, fixture_id: &str, payload: &str) {
        let Ok(command) = serde_json::from_str::<LightCommand>(payload) else {
            debug!(fixture = %fixture_id, "malformed light command ignored");
            return;
        };
        let Some(meta) = self
            .light_metas
            .iter()
            .find(|m| m.fixture_id == fixture_id)
        else {
            return;
        };

        let ops = {
            let mut g = self.lock();
            let light = g
                .light_states
                .entry(fixture_id.to_string())
                .or_insert_with(|| FixtureLightState::initial(meta));
            apply_light_command(meta, light, &command)
        };
        self.queue_ops(sequencer, fixture_id, ops);
    }

    /// Queue a fixture's ops and arm one trailing debounce timer; the flush
    /// concatenates all queued fixtures into a single atomic batch.
    fn queue_ops(&self, sequencer: &Sequencer, fixture_id: &str, ops: Vec<LayerAOp>) {
        let arm_timer = {
            let mut g = self.lock();
            if !g.pending_ops.contains_key(fixture_id) {
                g.pending_order.push(fixture_id.to_string());
            }
            g.pending_ops.insert(fixture_id.to_string(), ops);
            if g.flush_scheduled {
                false
            } else {
                g.flush_scheduled = true;
                true
            }
        };
        if !arm_timer {
            return;
        }

        let target = self.clone();
        let sequencer = sequencer.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(LIGHT_COMMAND_BATCH_MS)).await;
            let ops: Vec<LayerAOp> = {
                let mut g = target.lock();
                g.flush_scheduled = false;
                let order = std::mem::take(&mut g.pending_order);
                let mut by_fixture = std::mem::take(&mut g.pending_ops);
                order
                    .into_iter()
                    .filter_map(|f| by_fixture.remove(&f))
                    .flatten()
                    .collect()
            };
            if !ops.is_empty() {
                sequencer.apply_layer_a_batch(ops);
            }
        });
    }
}

fn parse_broker_url(url: &str) -> (String, u16) {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);
    let authority = stripped.split('/').next().unwrap_or(stripped);
    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (authority.to_string(), 1883),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_parsing_handles_scheme_and_port() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local:1884"),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_url("tcp://10.0.0.5"),
            ("10.0.0.5".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_url("broker.local"),
            ("broker.local".to_string(), 1883)
        );
    }
}
