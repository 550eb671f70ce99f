//! Light command translation and layer-A state mirroring.
//!
//! A fixture is surfaced as one Home-Assistant "light" whose rgb / color-temp
//! / brightness payloads are translated into manual-layer operations, and
//! whose state topic mirrors the manual layer back out.

use serde::Deserialize;
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::models::frame::{layer_key, LayerValueMap};
use crate::models::program::clamp_byte;
use crate::models::{Environment, FeatureKind};
use crate::sequencer::LayerAOp;

pub const LIGHT_COMMAND_BATCH_MS: u64 = 25;
pub const DEFAULT_MIN_KELVIN: f64 = 2700.0;
pub const DEFAULT_MAX_KELVIN: f64 = 6500.0;
const KELVIN_SPAN: f64 = DEFAULT_MAX_KELVIN - DEFAULT_MIN_KELVIN;

pub fn kelvin_to_mired(kelvin: f64) -> u32 {
    (1_000_000.0 / kelvin).round() as u32
}

/// Per-fixture light surface: the first feature of each kind, if any.
#[derive(Debug, Clone)]
pub struct LightMeta {
    pub fixture_id: String,
    pub name: String,
    pub rgb_feature: Option<String>,
    pub cct_feature: Option<String>,
    pub dimmer_feature: Option<String>,
}

/// Collect the light surface of every exposed environment fixture.
pub fn light_metas(environment: &Environment, config: &RuntimeConfig) -> Vec<LightMeta> {
    environment
        .fixtures
        .iter()
        .filter_map(|fixture| {
            if !fixture.mqtt_expose {
                return None;
            }
            let fixture_type = config.fixture_type(&fixture.fixture_type)?;
            let rgb = fixture_type.first_feature_of(FeatureKind::Rgb).map(|f| f.id.clone());
            let cct = fixture_type.first_feature_of(FeatureKind::Cct).map(|f| f.id.clone());
            let dimmer = fixture_type
                .first_feature_of(FeatureKind::Scalar)
                .map(|f| f.id.clone());
            if rgb.is_none() && cct.is_none() && dimmer.is_none() {
                return None;
            }
            Some(LightMeta {
                fixture_id: fixture.id.clone(),
                name: fixture.name.clone(),
                rgb_feature: rgb,
                cct_feature: cct,
                dimmer_feature: dimmer,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb,
    ColorTemp,
    Brightness,
}

impl ColorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ColorMode::Rgb => "rgb",
            ColorMode::ColorTemp => "color_temp",
            ColorMode::Brightness => "brightness",
        }
    }
}

/// Remembered light state per fixture, used both to fill unspecified command
/// fields and to keep mirrored base colors round-trip stable.
#[derive(Debug, Clone)]
pub struct FixtureLightState {
    pub mode: ColorMode,
    pub brightness: u8,
    pub base_rgb: [u8; 3],
    pub base_cct: [u8; 2],
}

impl FixtureLightState {
    pub fn initial(meta: &LightMeta) -> Self {
        let mode = if meta.rgb_feature.is_some() {
            ColorMode::Rgb
        } else if meta.cct_feature.is_some() {
            ColorMode::ColorTemp
        } else {
            ColorMode::Brightness
        };
        Self {
            mode,
            brightness: 255,
            base_rgb: [255, 255, 255],
            base_cct: [255, 255],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RgbColor {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

/// Home-Assistant JSON-schema light command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LightCommand {
    pub state: Option<String>,
    pub brightness: Option<f64>,
    pub color: Option<RgbColor>,
    pub color_temp: Option<f64>,
}

fn on_off_token(raw: &str) -> Option<bool> {
    match raw.trim().trim_matches('"').to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parse an on/off payload: a bare token, a JSON bool/number/string, or an
/// object carrying `state`. Anything else is ignored.
pub fn parse_on_off(raw: &str) -> Option<bool> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        let state = match &value {
            serde_json::Value::Object(obj) => obj.get("state")?.clone(),
            other => other.clone(),
        };
        return match state {
            serde_json::Value::Bool(b) => Some(b),
            serde_json::Value::Number(n) => n.as_f64().and_then(|v| match v as i64 {
                1 => Some(true),
                0 => Some(false),
                _ => None,
            }),
            serde_json::Value::String(s) => on_off_token(&s),
            _ => None,
        };
    }
    on_off_token(raw)
}

/// Parse a numeric payload: a bare number, a JSON number/string, or an object
/// carrying `value`.
pub fn parse_number(raw: &str) -> Option<f64> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Number(n)) => n.as_f64(),
        Ok(serde_json::Value::Object(obj)) => obj.get("value").and_then(|v| v.as_f64()),
        Ok(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => raw.trim().parse().ok(),
    }
}

/// Fold a light command into the fixture's remembered state and produce the
/// manual-layer operations that realize it.
pub fn apply_light_command(
    meta: &LightMeta,
    light: &mut FixtureLightState,
    command: &LightCommand,
) -> Vec<LayerAOp> {
    if command
        .state
        .as_deref()
        .and_then(on_off_token)
        .map(|on| !on)
        .unwrap_or(false)
    {
        light.brightness = 0;
        return vec![LayerAOp::ClearFixture {
            fixture: meta.fixture_id.clone(),
        }];
    }

    let resuming_from_off = light.brightness == 0;
    if let Some(brightness) = command.brightness {
        light.brightness = clamp_byte(brightness);
    } else if resuming_from_off {
        light.brightness = 255;
    }

    if let (Some(color), Some(_)) = (&command.color, &meta.rgb_feature) {
        light.base_rgb = [clamp_byte(color.r), clamp_byte(color.g), clamp_byte(color.b)];
        light.mode = ColorMode::Rgb;
    }
    if let (Some(mireds), Some(_)) = (command.color_temp, &meta.cct_feature) {
        let kelvin = (1_000_000.0 / mireds).clamp(DEFAULT_MIN_KELVIN, DEFAULT_MAX_KELVIN);
        light.base_cct = [
            clamp_byte(255.0 * (DEFAULT_MAX_KELVIN - kelvin) / KELVIN_SPAN),
            clamp_byte(255.0 * (kelvin - DEFAULT_MIN_KELVIN) / KELVIN_SPAN),
        ];
        light.mode = ColorMode::ColorTemp;
    }

    ops_for_mode(meta, light)
}

fn scaled(base: &[u8], brightness: u8) -> Vec<f64> {
    let ratio = brightness as f64 / 255.0;
    base.iter().map(|&b| b as f64 * ratio).collect()
}

fn set_op(fixture: &str, feature: &str, value: Vec<f64>) -> LayerAOp {
    LayerAOp::Set {
        fixture: fixture.to_string(),
        feature: feature.to_string(),
        value,
    }
}

fn clear_op(fixture: &str, feature: &str) -> LayerAOp {
    LayerAOp::ClearFeature {
        fixture: fixture.to_string(),
        feature: feature.to_string(),
    }
}

fn ops_for_mode(meta: &LightMeta, light: &FixtureLightState) -> Vec<LayerAOp> {
    let fixture = &meta.fixture_id;
    let mut ops = Vec::new();
    match light.mode {
        ColorMode::Rgb if meta.rgb_feature.is_some() => {
            let rgb = meta.rgb_feature.as_deref().unwrap_or_default();
            ops.push(set_op(fixture, rgb, scaled(&light.base_rgb, light.brightness)));
            if let Some(cct) = &meta.cct_feature {
                ops.push(clear_op(fixture, cct));
            }
            if let Some(dimmer) = &meta.dimmer_feature {
                ops.push(clear_op(fixture, dimmer));
            }
        }
        ColorMode::ColorTemp if meta.cct_feature.is_some() => {
            let cct = meta.cct_feature.as_deref().unwrap_or_default();
            ops.push(set_op(fixture, cct, scaled(&light.base_cct, light.brightness)));
            if let Some(rgb) = &meta.rgb_feature {
                ops.push(clear_op(fixture, rgb));
            }
            if let Some(dimmer) = &meta.dimmer_feature {
                ops.push(clear_op(fixture, dimmer));
            }
        }
        _ => {
            if let Some(dimmer) = &meta.dimmer_feature {
                ops.push(set_op(fixture, dimmer, vec![light.brightness as f64]));
            } else if let Some(cct) = &meta.cct_feature {
                ops.push(set_op(fixture, cct, scaled(&light.base_cct, light.brightness)));
            } else if let Some(rgb) = &meta.rgb_feature {
                ops.push(set_op(fixture, rgb, scaled(&light.base_rgb, light.brightness)));
            }
        }
    }
    ops
}

fn observed(layer_a: &LayerValueMap, fixture: &str, feature: Option<&String>) -> Vec<u8> {
    feature
        .and_then(|f| layer_a.get(&layer_key(fixture, f)))
        .cloned()
        .unwrap_or_default()
}

/// Derive the fixture's light state from the manual layer, update the
/// remembered state and build the retained state payload.
pub fn mirror_light_state(
    meta: &LightMeta,
    layer_a: &LayerValueMap,
    light: &mut FixtureLightState,
) -> serde_json::Value {
    let rgb = observed(layer_a, &meta.fixture_id, meta.rgb_feature.as_ref());
    let cct = observed(layer_a, &meta.fixture_id, meta.cct_feature.as_ref());
    let dimmer = observed(layer_a, &meta.fixture_id, meta.dimmer_feature.as_ref());

    let rgb_max = rgb.iter().copied().max().unwrap_or(0);
    let cct_max = cct.iter().copied().max().unwrap_or(0);
    let dimmer_value = dimmer.first().copied().unwrap_or(0);

    // rgb wins when both color features carry non-zero channels.
    let mode = if rgb_max > 0 {
        ColorMode::Rgb
    } else if cct_max > 0 {
        ColorMode::ColorTemp
    } else if dimmer_value > 0 {
        ColorMode::Brightness
    } else {
        light.mode
    };
    light.mode = mode;

    let brightness = match mode {
        ColorMode::Rgb => {
            if light.brightness == 0 {
                rgb_max
            } else {
                light.brightness
            }
        }
        ColorMode::ColorTemp => {
            if light.brightness == 0 {
                cct_max
            } else {
                light.brightness
            }
        }
        ColorMode::Brightness => dimmer_value,
    };
    light.brightness = brightness;

    // Undo the brightness scaling on the observed channels so the base color
    // round-trips through set/state unchanged.
    if brightness > 0 {
        let ratio = brightness as f64 / 255.0;
        if mode == ColorMode::Rgb && rgb_max > 0 {
            for (i, &b) in rgb.iter().take(3).enumerate() {
                light.base_rgb[i] = clamp_byte(b as f64 / ratio);
            }
        }
        if mode == ColorMode::ColorTemp && cct_max > 0 {
            for (i, &b) in cct.iter().take(2).enumerate() {
                light.base_cct[i] = clamp_byte(b as f64 / ratio);
            }
        }
    }

    let mut payload = json!({
        "state": if brightness > 0 { "ON" } else { "OFF" },
        "brightness": brightness,
        "color_mode": mode.as_str(),
    });
    if mode == ColorMode::Rgb {
        payload["color"] = json!({
            "r": light.base_rgb[0],
            "g": light.base_rgb[1],
            "b": light.base_rgb[2],
        });
    }
    if mode == ColorMode::ColorTemp {
        let kelvin = DEFAULT_MAX_KELVIN - KELVIN_SPAN * (light.base_cct[0] as f64 / 255.0);
        payload["color_temp"] = json!(kelvin_to_mired(kelvin));
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb_cct_meta() -> LightMeta {
        LightMeta {
            fixture_id: "f1".to_string(),
            name: "Wash".to_string(),
            rgb_feature: Some("rgb".to_string()),
            cct_feature: Some("cct".to_string()),
            dimmer_feature: None,
        }
    }

    fn dimmer_meta() -> LightMeta {
        LightMeta {
            fixture_id: "f2".to_string(),
            name: "Blinder".to_string(),
            rgb_feature: None,
            cct_feature: None,
            dimmer_feature: Some("dim".to_string()),
        }
    }

    #[test]
    fn on_off_parsing_accepts_tokens_and_objects() {
        assert_eq!(parse_on_off("ON"), Some(true));
        assert_eq!(parse_on_off("off"), Some(false));
        assert_eq!(parse_on_off("1"), Some(true));
        assert_eq!(parse_on_off("false"), Some(false));
        assert_eq!(parse_on_off(r#"{"state":"OFF"}"#), Some(false));
        assert_eq!(parse_on_off("maybe"), None);
    }

    #[test]
    fn number_parsing_accepts_bare_and_wrapped_values() {
        assert_eq!(parse_number("120"), Some(120.0));
        assert_eq!(parse_number(r#"{"value": 90.5}"#), Some(90.5));
        assert_eq!(parse_number(r#""42""#), Some(42.0));
        assert_eq!(parse_number("not a number"), None);
    }

    #[test]
    fn rgb_command_scales_color_and_clears_other_features() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        let command = LightCommand {
            state: Some("ON".to_string()),
            brightness: Some(128.0),
            color: Some(RgbColor {
                r: 255.0,
                g: 0.0,
                b: 0.0,
            }),
            color_temp: None,
        };
        let ops = apply_light_command(&meta, &mut light, &command);
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            LayerAOp::Set {
                fixture,
                feature,
                value,
            } => {
                assert_eq!(fixture, "f1");
                assert_eq!(feature, "rgb");
                let bytes: Vec<u8> = value.iter().map(|&v| clamp_byte(v)).collect();
                assert_eq!(bytes, vec![128, 0, 0]);
            }
            other => panic!("expected rgb set, got {:?}", other),
        }
        match &ops[1] {
            LayerAOp::ClearFeature { feature, .. } => assert_eq!(feature, "cct"),
            other => panic!("expected cct clear, got {:?}", other),
        }
    }

    #[test]
    fn off_command_clears_fixture_and_zeroes_brightness() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        let command = LightCommand {
            state: Some("OFF".to_string()),
            ..Default::default()
        };
        let ops = apply_light_command(&meta, &mut light, &command);
        assert!(matches!(&ops[..], [LayerAOp::ClearFixture { fixture }] if fixture == "f1"));
        assert_eq!(light.brightness, 0);
    }

    #[test]
    fn bare_on_after_off_restores_full_brightness() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        apply_light_command(
            &meta,
            &mut light,
            &LightCommand {
                state: Some("OFF".to_string()),
                ..Default::default()
            },
        );
        apply_light_command(
            &meta,
            &mut light,
            &LightCommand {
                state: Some("ON".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(light.brightness, 255);
    }

    #[test]
    fn color_temp_command_maps_kelvin_to_warm_cool_pair() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        // 2700 K = warmest supported temperature.
        let command = LightCommand {
            brightness: Some(255.0),
            color_temp: Some(kelvin_to_mired(2700.0) as f64),
            ..Default::default()
        };
        let ops = apply_light_command(&meta, &mut light, &command);
        assert_eq!(light.mode, ColorMode::ColorTemp);
        assert_eq!(light.base_cct, [255, 0]);
        match &ops[0] {
            LayerAOp::Set { feature, value, .. } => {
                assert_eq!(feature, "cct");
                assert_eq!(clamp_byte(value[0]), 255);
                assert_eq!(clamp_byte(value[1]), 0);
            }
            other => panic!("expected cct set, got {:?}", other),
        }
    }

    #[test]
    fn dimmer_only_fixture_sets_brightness_directly() {
        let meta = dimmer_meta();
        let mut light = FixtureLightState::initial(&meta);
        let ops = apply_light_command(
            &meta,
            &mut light,
            &LightCommand {
                brightness: Some(64.0),
                ..Default::default()
            },
        );
        assert!(
            matches!(&ops[..], [LayerAOp::Set { feature, value, .. }]
                if feature == "dim" && value == &vec![64.0])
        );
    }

    #[test]
    fn mirror_reconstructs_base_color_from_scaled_channels() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        light.brightness = 128;

        let mut layer_a = LayerValueMap::new();
        layer_a.insert(layer_key("f1", "rgb"), vec![128, 0, 0]);

        let payload = mirror_light_state(&meta, &layer_a, &mut light);
        assert_eq!(payload["state"], "ON");
        assert_eq!(payload["brightness"], 128);
        assert_eq!(payload["color_mode"], "rgb");
        assert_eq!(payload["color"]["r"], 255);
        assert_eq!(payload["color"]["g"], 0);
        assert_eq!(payload["color"]["b"], 0);
    }

    #[test]
    fn mirror_prefers_rgb_when_both_color_features_are_lit() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        let mut layer_a = LayerValueMap::new();
        layer_a.insert(layer_key("f1", "rgb"), vec![10, 0, 0]);
        layer_a.insert(layer_key("f1", "cct"), vec![200, 200]);

        let payload = mirror_light_state(&meta, &layer_a, &mut light);
        assert_eq!(payload["color_mode"], "rgb");
    }

    #[test]
    fn mirror_reports_off_for_cleared_fixture() {
        let meta = rgb_cct_meta();
        let mut light = FixtureLightState::initial(&meta);
        light.brightness = 0;
        let payload = mirror_light_state(&meta, &LayerValueMap::new(), &mut light);
        assert_eq!(payload["state"], "OFF");
        assert_eq!(payload["brightness"], 0);
    }

    #[test]
    fn mired_bounds_match_supported_kelvin_range() {
        assert_eq!(kelvin_to_mired(DEFAULT_MAX_KELVIN), 154);
        assert_eq!(kelvin_to_mired(DEFAULT_MIN_KELVIN), 370);
    }
}
