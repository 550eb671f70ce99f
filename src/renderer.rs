//! Renderer fan-out: pushes each render packet into every registered output.

use tracing::trace;

use crate::artnet::ArtnetOutput;
use crate::mqtt::MqttBridge;
use crate::render::RenderPacket;

pub enum OutputSink {
    /// The 2D simulator consumes frames over the external websocket surface;
    /// this sink only traces that a frame passed through.
    Simulator { id: String },
    Artnet(ArtnetOutput),
    Mqtt(MqttBridge),
}

pub struct Renderer {
    sinks: Vec<OutputSink>,
}

impl Renderer {
    pub fn new(sinks: Vec<OutputSink>) -> Self {
        Self { sinks }
    }

    pub fn push(&self, packet: &RenderPacket) {
        for sink in &self.sinks {
            match sink {
                OutputSink::Simulator { id } => {
                    trace!(output = %id, universes = packet.dmx_by_universe.len(), "simulator frame")
                }
                OutputSink::Artnet(output) => output.push(packet),
                OutputSink::Mqtt(bridge) => bridge.push(packet),
            }
        }
    }
}
