//! Render packet builder
//!
//! Turns a frame snapshot into universe-addressed DMX byte buffers using each
//! environment fixture's base address and the fixture type's per-feature
//! channel list. Every modeled channel is written on every render, so
//! downstream devices never latch stale data from unused features.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::config::RuntimeConfig;
use crate::models::frame::split_layer_key;
use crate::models::{Environment, RenderFrame};

pub const DMX_UNIVERSE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct RenderPacket {
    pub frame: RenderFrame,
    pub environment: Arc<Environment>,
    pub dmx_by_universe: HashMap<u16, [u8; DMX_UNIVERSE_SIZE]>,
}

/// Build the per-universe DMX view of `frame` for one environment. Returns
/// `None` when the environment is unknown; fixtures with a missing type or
/// malformed addresses are skipped channel-by-channel, never failing the
/// packet.
pub fn build_render_packet(
    frame: RenderFrame,
    config: &RuntimeConfig,
    environment: &Arc<Environment>,
) -> RenderPacket {
    let mut dmx_by_universe: HashMap<u16, [u8; DMX_UNIVERSE_SIZE]> = HashMap::new();

    // Zero every modeled channel of every fixture first.
    for fixture in &environment.fixtures {
        let Some(fixture_type) = config.fixture_type(&fixture.fixture_type) else {
            continue;
        };
        let buffer = dmx_by_universe
            .entry(fixture.universe)
            .or_insert([0u8; DMX_UNIVERSE_SIZE]);
        for ch in 1..=fixture_type.channels {
            let address = fixture.address as i32 + ch as i32 - 1;
            if (1..=DMX_UNIVERSE_SIZE as i32).contains(&address) {
                buffer[(address - 1) as usize] = 0;
            }
        }
    }

    // Write the visible mix through each feature's channel map.
    for (key, values) in &frame.values {
        let Some((fixture_id, feature_id)) = split_layer_key(key) else {
            continue;
        };
        let Some(fixture) = environment.fixture(fixture_id) else {
            continue;
        };
        let Some(fixture_type) = config.fixture_type(&fixture.fixture_type) else {
            continue;
        };
        let Some(feature) = fixture_type.feature(feature_id) else {
            continue;
        };
        let Some(buffer) = dmx_by_universe.get_mut(&fixture.universe) else {
            continue;
        };

        for (i, &channel) in feature.channels.iter().enumerate() {
            let raw = values
                .get(i)
                .or_else(|| values.first())
                .copied()
                .unwrap_or(0);
            let byte = map_feature_value(raw, feature.range);
            let address = fixture.address as i32 + channel as i32 - 1;
            if (1..=DMX_UNIVERSE_SIZE as i32).contains(&address) {
                buffer[(address - 1) as usize] = byte;
            }
        }
    }

    trace!(
        environment = %environment.id,
        universes = dmx_by_universe.len(),
        "render packet built"
    );

    RenderPacket {
        frame,
        environment: environment.clone(),
        dmx_by_universe,
    }
}

/// Map a DMX-domain byte through a feature's optional `(min, max)` range. A
/// range starting at zero with a reduced ceiling rescales linearly; any other
/// range clamps.
fn map_feature_value(raw: u8, range: Option<(u8, u8)>) -> u8 {
    let Some((min, max)) = range else {
        return raw;
    };
    if min == 0 && max > 0 && max < 255 {
        ((raw as f64 / 255.0) * max as f64).round() as u8
    } else {
        raw.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::frame::{layer_key, unix_millis, LayerValueMap, PlayheadState};
    use crate::models::{Environment, EnvironmentFixture, Feature, FeatureKind, FixtureType};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            fixtures: vec![FixtureType {
                id: "par".to_string(),
                name: "LED Par".to_string(),
                channels: 5,
                features: vec![
                    Feature {
                        id: "rgb".to_string(),
                        kind: FeatureKind::Rgb,
                        channels: vec![1, 2, 3],
                        range: None,
                    },
                    Feature {
                        id: "dim".to_string(),
                        kind: FeatureKind::Scalar,
                        channels: vec![4],
                        range: Some((0, 100)),
                    },
                    Feature {
                        id: "strobe".to_string(),
                        kind: FeatureKind::Scalar,
                        channels: vec![5],
                        range: Some((10, 200)),
                    },
                ],
            }],
            environments: Vec::new(),
            programs: Vec::new(),
        }
    }

    fn test_environment(address: u16) -> Arc<Environment> {
        Arc::new(Environment {
            id: "env".to_string(),
            render_fps: 30,
            fixtures: vec![EnvironmentFixture {
                id: "f1".to_string(),
                fixture_type: "par".to_string(),
                name: "Par 1".to_string(),
                universe: 0,
                address,
                position: None,
                mqtt_expose: true,
            }],
            outputs: Vec::new(),
        })
    }

    fn frame_with(values: LayerValueMap) -> RenderFrame {
        RenderFrame {
            timestamp: unix_millis(),
            state: PlayheadState {
                is_playing: false,
                is_blackout: false,
                program_id: None,
                step_index: 0,
                position_ms: 0.0,
                spm: 120,
                loop_enabled: true,
            },
            layer_a_values: LayerValueMap::new(),
            layer_b_values: LayerValueMap::new(),
            values,
        }
    }

    #[test]
    fn every_universe_buffer_is_512_bytes_and_zeroed() {
        let config = test_config();
        let env = test_environment(1);
        let packet = build_render_packet(frame_with(LayerValueMap::new()), &config, &env);
        assert_eq!(packet.dmx_by_universe.len(), 1);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(buffer.len(), 512);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn feature_values_land_at_base_address_offsets() {
        let config = test_config();
        let env = test_environment(10);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("f1", "rgb"), vec![255, 128, 1]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        // Address 10 is 1-based: channels 1..3 land at bytes 9..11.
        assert_eq!(&buffer[9..12], &[255, 128, 1]);
    }

    #[test]
    fn zero_based_range_rescales_linearly() {
        let config = test_config();
        let env = test_environment(1);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("f1", "dim"), vec![255]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(buffer[3], 100, "full DMX scales into (0,100)");
    }

    #[test]
    fn offset_range_clamps_instead_of_scaling() {
        let config = test_config();
        let env = test_environment(1);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("f1", "strobe"), vec![5]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(buffer[4], 10, "value clamps up to the range floor");
    }

    #[test]
    fn out_of_range_addresses_are_dropped_channel_wise() {
        let config = test_config();
        // Base 510: rgb channels land at 510, 511, 512; dim at 513 (dropped).
        let env = test_environment(510);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("f1", "rgb"), vec![7, 8, 9]);
        values.insert(layer_key("f1", "dim"), vec![255]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(&buffer[509..512], &[7, 8, 9]);
    }

    #[test]
    fn short_value_vector_repeats_first_element() {
        let config = test_config();
        let env = test_environment(1);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("f1", "rgb"), vec![42]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(&buffer[0..3], &[42, 42, 42]);
    }

    #[test]
    fn unknown_fixture_or_feature_is_skipped() {
        let config = test_config();
        let env = test_environment(1);
        let mut values = LayerValueMap::new();
        values.insert(layer_key("ghost", "rgb"), vec![1, 2, 3]);
        values.insert(layer_key("f1", "ghost"), vec![4]);
        values.insert(layer_key("f1", "rgb"), vec![9, 9, 9]);
        let packet = build_render_packet(frame_with(values), &config, &env);
        let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
        assert_eq!(&buffer[0..3], &[9, 9, 9]);
        assert!(buffer[3..].iter().all(|&b| b == 0));
    }
}
