//! End-to-end pipeline tests: sequencer frames through the render builder and
//! the Art-Net transmitter.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use chaser::artnet::ArtnetOutput;
use chaser::config::RuntimeConfig;
use chaser::models::frame::{unix_millis, LayerValueMap, PlayheadState};
use chaser::models::{
    Environment, EnvironmentFixture, Feature, FeatureKind, FixtureType, OutputConfig, RenderFrame,
};
use chaser::render::{build_render_packet, RenderPacket, DMX_UNIVERSE_SIZE};
use chaser::sequencer::Sequencer;

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        fixtures: vec![FixtureType {
            id: "par".to_string(),
            name: "LED Par".to_string(),
            channels: 3,
            features: vec![Feature {
                id: "rgb".to_string(),
                kind: FeatureKind::Rgb,
                channels: vec![1, 2, 3],
                range: None,
            }],
        }],
        environments: Vec::new(),
        programs: Vec::new(),
    }
}

fn test_environment(outputs: Vec<OutputConfig>) -> Arc<Environment> {
    Arc::new(Environment {
        id: "stage".to_string(),
        render_fps: 30,
        fixtures: vec![EnvironmentFixture {
            id: "par1".to_string(),
            fixture_type: "par".to_string(),
            name: "Par 1".to_string(),
            universe: 0,
            address: 1,
            position: None,
            mqtt_expose: true,
        }],
        outputs,
    })
}

#[test]
fn layer_a_override_reaches_dmx_after_cross_fade() {
    let config = test_config();
    let environment = test_environment(Vec::new());
    let sequencer = Sequencer::new(30);

    sequencer.set_layer_a_value("par1", "rgb", &[10.0, 20.0, 30.0]);
    // The 500 ms mode-switch fade settles to the target values.
    std::thread::sleep(Duration::from_millis(600));

    let frame = sequencer.frame();
    assert_eq!(frame.values.get("par1:rgb"), Some(&vec![10, 20, 30]));

    let packet = build_render_packet(frame, &config, &environment);
    let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
    assert_eq!(&buffer[0..3], &[10, 20, 30]);
    assert!(buffer[3..].iter().all(|&b| b == 0));
}

#[test]
fn blackout_zeroes_the_whole_packet() {
    let config = test_config();
    let environment = test_environment(Vec::new());
    let sequencer = Sequencer::new(30);

    sequencer.set_layer_a_value("par1", "rgb", &[200.0, 200.0, 200.0]);
    sequencer.set_blackout(true);

    let frame = sequencer.frame();
    assert!(frame.values.is_empty());

    let packet = build_render_packet(frame, &config, &environment);
    let buffer = packet.dmx_by_universe.get(&0).expect("universe 0");
    assert!(buffer.iter().all(|&b| b == 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn artnet_refresh_retransmits_the_cached_frame() {
    let listener = UdpSocket::bind("127.0.0.1:0").expect("bind listener");
    listener
        .set_read_timeout(Some(Duration::from_millis(500)))
        .expect("set timeout");
    let port = listener.local_addr().expect("local addr").port();

    let environment = test_environment(vec![OutputConfig::Artnet {
        id: "an".to_string(),
        enabled: true,
        host: "127.0.0.1".to_string(),
        port,
        universes: None,
    }]);

    let mut data = [0u8; DMX_UNIVERSE_SIZE];
    data[0] = 255;
    let packet = RenderPacket {
        frame: RenderFrame {
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
            values: LayerValueMap::new(),
        },
        environment,
        dmx_by_universe: [(0u16, data)].into_iter().collect(),
    };

    let output = ArtnetOutput::new();
    output.push(&packet);
    let _refresh = output.spawn_refresh();

    // One datagram from the push itself, at least one more from the refresh.
    let mut buf = [0u8; 1024];
    for _ in 0..2 {
        let (len, _) = listener.recv_from(&mut buf).expect("datagram within refresh window");
        assert_eq!(len, 18 + 512);
        assert_eq!(&buf[0..8], b"Art-Net\0");
        assert_eq!(
            &buf[8..18],
            &[0x00, 0x50, 0x00, 0x0E, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]
        );
        assert_eq!(buf[18], 255);
    }
}
