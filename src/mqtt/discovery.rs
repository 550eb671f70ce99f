//! Home-Assistant discovery payloads.
//!
//! Every config is published retained and deduplicated against the retained
//! cache, so unchanged payloads are never re-sent.

use serde_json::json;

use crate::models::Program;
use crate::models::program::{MAX_SPM, MIN_SPM};

use super::light::{kelvin_to_mired, LightMeta, DEFAULT_MAX_KELVIN, DEFAULT_MIN_KELVIN};

/// Lowercase, collapse every run of characters outside `[a-z0-9_]` into one
/// underscore and trim the ends.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending = false;
    for c in raw.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            if pending && !out.is_empty() {
                out.push('_');
            }
            pending = false;
            out.push(c);
        } else {
            pending = true;
        }
    }
    out.trim_matches('_').to_string()
}

pub fn availability_topic(base: &str) -> String {
    format!("{}/availability", base)
}

pub fn light_command_topic(base: &str, fixture_id: &str) -> String {
    format!("{}/light/{}/set", base, fixture_id)
}

pub fn light_state_topic(base: &str, fixture_id: &str) -> String {
    format!("{}/light/{}/state", base, fixture_id)
}

pub fn program_press_topic(base: &str, program_id: &str) -> String {
    format!("{}/program/{}/press", base, program_id)
}

pub fn program_config_topic(prefix: &str, node_id: &str, program_id: &str) -> String {
    format!(
        "{}/button/{}/program_{}/config",
        prefix,
        node_id,
        sanitize(program_id)
    )
}

/// Light entity config for one fixture.
pub fn light_config(
    prefix: &str,
    node_id: &str,
    base: &str,
    meta: &LightMeta,
) -> (String, serde_json::Value) {
    let object_id = sanitize(&meta.fixture_id);
    let topic = format!("{}/light/{}/{}/config", prefix, node_id, object_id);

    let mut modes: Vec<&str> = Vec::new();
    if meta.rgb_feature.is_some() {
        modes.push("rgb");
    }
    if meta.cct_feature.is_some() {
        modes.push("color_temp");
    }
    if modes.is_empty() {
        modes.push("brightness");
    }

    let mut payload = json!({
        "name": &meta.name,
        "unique_id": format!("{}_{}", node_id, object_id),
        "schema": "json",
        "command_topic": light_command_topic(base, &meta.fixture_id),
        "state_topic": light_state_topic(base, &meta.fixture_id),
        "availability_topic": availability_topic(base),
        "brightness": true,
        "supported_color_modes": modes,
    });
    if meta.cct_feature.is_some() {
        payload["min_mireds"] = json!(kelvin_to_mired(DEFAULT_MAX_KELVIN));
        payload["max_mireds"] = json!(kelvin_to_mired(DEFAULT_MIN_KELVIN));
    }
    (topic, payload)
}

pub fn spm_number_config(prefix: &str, node_id: &str, base: &str) -> (String, serde_json::Value) {
    let topic = format!("{}/number/{}/spm/config", prefix, node_id);
    let payload = json!({
        "name": "SPM",
        "unique_id": format!("{}_spm", node_id),
        "command_topic": format!("{}/control/spm/set", base),
        "state_topic": format!("{}/control/spm/state", base),
        "availability_topic": availability_topic(base),
        "min": MIN_SPM,
        "max": MAX_SPM,
        "step": 1,
    });
    (topic, payload)
}

pub fn play_button_config(prefix: &str, node_id: &str, base: &str) -> (String, serde_json::Value) {
    let topic = format!("{}/button/{}/play_from_start/config", prefix, node_id);
    let payload = json!({
        "name": "Play From Start",
        "unique_id": format!("{}_play_from_start", node_id),
        "command_topic": format!("{}/control/play_from_start/press", base),
        "availability_topic": availability_topic(base),
    });
    (topic, payload)
}

pub fn pause_button_config(prefix: &str, node_id: &str, base: &str) -> (String, serde_json::Value) {
    let topic = format!("{}/button/{}/pause/config", prefix, node_id);
    let payload = json!({
        "name": "Pause",
        "unique_id": format!("{}_pause", node_id),
        "command_topic": format!("{}/control/pause/press", base),
        "availability_topic": availability_topic(base),
    });
    (topic, payload)
}

pub fn blackout_switch_config(
    prefix: &str,
    node_id: &str,
    base: &str,
) -> (String, serde_json::Value) {
    let topic = format!("{}/switch/{}/blackout/config", prefix, node_id);
    let payload = json!({
        "name": "Blackout",
        "unique_id": format!("{}_blackout", node_id),
        "command_topic": format!("{}/control/blackout/set", base),
        "state_topic": format!("{}/control/blackout/state", base),
        "availability_topic": availability_topic(base),
        "payload_on": "ON",
        "payload_off": "OFF",
    });
    (topic, payload)
}

pub fn program_button_config(
    prefix: &str,
    node_id: &str,
    base: &str,
    program: &Program,
) -> (String, serde_json::Value) {
    let topic = program_config_topic(prefix, node_id, &program.id);
    let payload = json!({
        "name": &program.name,
        "unique_id": format!("{}_program_{}", node_id, sanitize(&program.id)),
        "command_topic": program_press_topic(base, &program.id),
        "availability_topic": availability_topic(base),
    });
    (topic, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(rgb: bool, cct: bool, dimmer: bool) -> LightMeta {
        LightMeta {
            fixture_id: "Wash-Left 1".to_string(),
            name: "Wash Left".to_string(),
            rgb_feature: rgb.then(|| "rgb".to_string()),
            cct_feature: cct.then(|| "cct".to_string()),
            dimmer_feature: dimmer.then(|| "dim".to_string()),
        }
    }

    #[test]
    fn sanitize_collapses_runs_and_trims() {
        assert_eq!(sanitize("Main Hall"), "main_hall");
        assert_eq!(sanitize("--Wash//Left--"), "wash_left");
        assert_eq!(sanitize("a__b"), "a__b", "allowed underscores survive");
        assert_eq!(sanitize("Par #1 (rear)"), "par_1_rear");
    }

    #[test]
    fn light_config_lists_color_modes_by_feature() {
        let (topic, payload) = light_config("homeassistant", "chaser_env", "chaser/env/ha", &meta(true, true, true));
        assert_eq!(topic, "homeassistant/light/chaser_env/wash_left_1/config");
        assert_eq!(payload["schema"], "json");
        assert_eq!(
            payload["supported_color_modes"],
            serde_json::json!(["rgb", "color_temp"])
        );
        assert_eq!(payload["min_mireds"], 154);
        assert_eq!(payload["max_mireds"], 370);
        assert_eq!(
            payload["command_topic"],
            "chaser/env/ha/light/Wash-Left 1/set"
        );
    }

    #[test]
    fn dimmer_only_light_advertises_brightness_mode() {
        let (_, payload) = light_config("homeassistant", "n", "b", &meta(false, false, true));
        assert_eq!(
            payload["supported_color_modes"],
            serde_json::json!(["brightness"])
        );
        assert!(payload.get("min_mireds").is_none());
    }

    #[test]
    fn spm_number_spans_valid_range() {
        let (_, payload) = spm_number_config("homeassistant", "n", "b");
        assert_eq!(payload["min"], 1);
        assert_eq!(payload["max"], 500);
        assert_eq!(payload["step"], 1);
    }
}
