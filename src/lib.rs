pub mod artnet;
pub mod config;
pub mod debug;
pub mod error;
pub mod models;
pub mod mqtt;
pub mod render;
pub mod renderer;
pub mod sequencer;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::artnet::ArtnetOutput;
use crate::config::load_runtime_config;
use crate::error::{ChaserError, ChaserResult};
use crate::models::OutputConfig;
use crate::mqtt::MqttBridge;
use crate::render::build_render_packet;
use crate::renderer::{OutputSink, Renderer};
use crate::sequencer::Sequencer;

/// Wire the engine for the first configured environment and run until Ctrl-C.
pub async fn run(data_dir: &Path) -> ChaserResult<()> {
    let config = Arc::new(load_runtime_config(data_dir)?);
    let environment = Arc::new(
        config
            .environments
            .first()
            .cloned()
            .ok_or_else(|| ChaserError::config("no environments configured"))?,
    );

    let sequencer = Sequencer::new(environment.render_fps);

    let mut sinks = Vec::new();
    let mut artnet: Option<ArtnetOutput> = None;
    let mut has_mqtt = false;
    for output in &environment.outputs {
        if !output.enabled() {
            continue;
        }
        match output {
            OutputConfig::Simulator { id, .. } => sinks.push(OutputSink::Simulator {
                id: id.clone(),
            }),
            OutputConfig::Artnet { .. } => {
                if artnet.is_none() {
                    let output = ArtnetOutput::new();
                    sinks.push(OutputSink::Artnet(output.clone()));
                    artnet = Some(output);
                }
            }
            OutputConfig::Mqtt { .. } => {
                if !has_mqtt {
                    sinks.push(OutputSink::Mqtt(MqttBridge::new(
                        sequencer.clone(),
                        config.clone(),
                    )));
                    has_mqtt = true;
                }
            }
        }
    }
    let renderer = Arc::new(Renderer::new(sinks));

    {
        let renderer = renderer.clone();
        let config = config.clone();
        let environment = environment.clone();
        sequencer.subscribe(move |frame| {
            let packet = build_render_packet(frame.clone(), &config, &environment);
            renderer.push(&packet);
        });
    }

    // Bind the first program of the environment so play() has something to
    // drive; program selection happens over MQTT or the external editor.
    if let Some(program) = config.programs_for(&environment.id).first() {
        sequencer.set_program(Some(Arc::new((*program).clone())), false, true);
    }

    let _ticker = sequencer.spawn_ticker();
    let _refresh = artnet.as_ref().map(|a| a.spawn_refresh());

    info!(environment = %environment.id, fps = environment.render_fps, "chaser engine running");
    tokio::signal::ctrl_c()
        .await
        .map_err(ChaserError::from)?;
    info!("shutting down");
    Ok(())
}
