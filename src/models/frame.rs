use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Per-feature byte vectors keyed `"{fixtureId}:{featureId}"`. Keys whose
/// vector is all-zero are never stored.
pub type LayerValueMap = HashMap<String, Vec<u8>>;

pub fn layer_key(fixture: &str, feature: &str) -> String {
    format!("{}:{}", fixture, feature)
}

pub fn split_layer_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayheadState {
    pub is_playing: bool,
    pub is_blackout: bool,
    pub program_id: Option<String>,
    pub step_index: usize,
    pub position_ms: f64,
    pub spm: u32,
    #[serde(rename = "loop")]
    pub loop_enabled: bool,
}

/// Partial playhead update applied by `apply_state_snapshot`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayheadPatch {
    pub step_index: Option<usize>,
    pub position_ms: Option<f64>,
    pub spm: Option<u32>,
    #[serde(rename = "loop")]
    pub loop_enabled: Option<bool>,
    pub is_blackout: Option<bool>,
    pub is_playing: Option<bool>,
}

/// Snapshot emitted to listeners after every settled state change.
/// `values` is the visible mix; the two layers ride along for telemetry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderFrame {
    pub timestamp: u64,
    pub state: PlayheadState,
    pub layer_a_values: LayerValueMap,
    pub layer_b_values: LayerValueMap,
    pub values: LayerValueMap,
}

pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
