//! Art-Net output
//!
//! Ships each universe's latest 512-byte frame to the configured UDP
//! endpoints as Art-DMX datagrams and keeps retransmitting them on a short
//! refresh period so fixtures never latch stale data.

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::models::OutputConfig;
use crate::render::{RenderPacket, DMX_UNIVERSE_SIZE};

const ARTNET_HEADER_LEN: usize = 18;
const OPCODE_OUTPUT: u16 = 0x5000;
const PROTOCOL_VERSION: u16 = 14;

pub const DEFAULT_REFRESH_MS: u64 = 40;
pub const MIN_REFRESH_MS: u64 = 20;

/// Refresh period from `CHASER_ARTNET_REFRESH_MS`, default 40 ms, floor 20 ms.
static REFRESH_PERIOD: Lazy<Duration> = Lazy::new(|| {
    let ms = std::env::var("CHASER_ARTNET_REFRESH_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_REFRESH_MS)
        .max(MIN_REFRESH_MS);
    Duration::from_millis(ms)
});

pub fn refresh_period() -> Duration {
    *REFRESH_PERIOD
}

/// Build one Art-DMX datagram. The sequence byte is fixed at zero, which
/// disables sequence handling on receivers.
pub fn build_artdmx_packet(universe: u16, data: &[u8; DMX_UNIVERSE_SIZE]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(ARTNET_HEADER_LEN + DMX_UNIVERSE_SIZE);

    // ID "Art-Net\0"
    packet.extend_from_slice(b"Art-Net\0");

    // OpCode OpOutput - little endian
    packet.push((OPCODE_OUTPUT & 0xFF) as u8);
    packet.push((OPCODE_OUTPUT >> 8) as u8);

    // Protocol version - big endian
    packet.push((PROTOCOL_VERSION >> 8) as u8);
    packet.push((PROTOCOL_VERSION & 0xFF) as u8);

    // Sequence, physical port
    packet.push(0x00);
    packet.push(0x00);

    // 15-bit port-address - little endian
    let address = universe & 0x7FFF;
    packet.push((address & 0xFF) as u8);
    packet.push((address >> 8) as u8);

    // Payload length - big endian
    packet.push((DMX_UNIVERSE_SIZE >> 8) as u8);
    packet.push((DMX_UNIVERSE_SIZE & 0xFF) as u8);

    packet.extend_from_slice(data);
    packet
}

#[derive(Clone)]
struct CachedFrame {
    host: String,
    port: u16,
    universe: u16,
    data: [u8; DMX_UNIVERSE_SIZE],
}

struct ArtnetInner {
    socket: Option<UdpSocket>,
    /// Latest frame per (host, port, universe), in insertion order.
    frames: Vec<CachedFrame>,
    flushing: bool,
    flush_requested: bool,
}

/// Shared handle to the Art-Net transmitter. Owns the per-target frame cache;
/// `push` updates it from render packets and the refresh task retransmits it.
#[derive(Clone)]
pub struct ArtnetOutput {
    inner: Arc<Mutex<ArtnetInner>>,
}

impl Default for ArtnetOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtnetOutput {
    pub fn new() -> Self {
        let socket = UdpSocket::bind("0.0.0.0:0").ok();
        match &socket {
            Some(s) => {
                let _ = s.set_broadcast(true);
                debug!(addr = ?s.local_addr().ok(), "artnet socket bound");
            }
            None => warn!("failed to bind artnet socket, output disabled"),
        }
        Self {
            inner: Arc::new(Mutex::new(ArtnetInner {
                socket,
                frames: Vec::new(),
                flushing: false,
                flush_requested: false,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArtnetInner> {
        self.inner.lock().expect("artnet state poisoned")
    }

    /// Update the frame cache from a render packet and flush. Each enabled
    /// artnet output of the packet's environment contributes one cache entry
    /// per universe, limited to the output's allow-list when present.
    pub fn push(&self, packet: &RenderPacket) {
        let mut updated = false;
        {
            let mut g = self.lock();
            for output in &packet.environment.outputs {
                let OutputConfig::Artnet {
                    enabled,
                    host,
                    port,
                    universes,
                    ..
                } = output
                else {
                    continue;
                };
                if !*enabled {
                    continue;
                }
                for (&universe, data) in &packet.dmx_by_universe {
                    if let Some(allowed) = universes {
                        if !allowed.contains(&universe) {
                            continue;
                        }
                    }
                    g.upsert(host, *port, universe, data);
                    updated = true;
                }
            }
        }
        if updated {
            self.flush();
        }
    }

    /// Send every cached frame once per pass, in insertion order. Concurrent
    /// requests while a flush is in progress set a flush-again bit which the
    /// loop drains before exiting.
    pub fn flush(&self) {
        {
            let mut g = self.lock();
            if g.flushing {
                g.flush_requested = true;
                return;
            }
            g.flushing = true;
            g.flush_requested = false;
        }

        loop {
            let (socket, frames) = {
                let g = self.lock();
                (
                    g.socket.as_ref().and_then(|s| s.try_clone().ok()),
                    g.frames.clone(),
                )
            };

            if let Some(socket) = socket {
                for frame in &frames {
                    let datagram = build_artdmx_packet(frame.universe, &frame.data);
                    let target = format!("{}:{}", frame.host, frame.port);
                    if let Err(e) = socket.send_to(&datagram, &target) {
                        // Dropped datagrams are retried by the next refresh.
                        warn!(target = %target, universe = frame.universe, error = %e, "artnet send failed");
                    }
                }
            }

            let mut g = self.lock();
            if g.flush_requested {
                g.flush_requested = false;
                continue;
            }
            g.flushing = false;
            break;
        }
    }

    /// Spawn the periodic retransmit task.
    pub fn spawn_refresh(&self) -> tokio::task::JoinHandle<()> {
        let output = self.clone();
        tokio::spawn(async move {
            debug!(period = ?refresh_period(), "artnet refresh started");
            loop {
                sleep(refresh_period()).await;
                output.flush();
            }
        })
    }
}

impl ArtnetInner {
    fn upsert(&mut self, host: &str, port: u16, universe: u16, data: &[u8; DMX_UNIVERSE_SIZE]) {
        if let Some(entry) = self
            .frames
            .iter_mut()
            .find(|f| f.host == host && f.port == port && f.universe == universe)
        {
            entry.data = *data;
        } else {
            self.frames.push(CachedFrame {
                host: host.to_string(),
                port,
                universe,
                data: *data,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artdmx_header_is_bit_exact() {
        let mut data = [0u8; DMX_UNIVERSE_SIZE];
        data[0] = 255;
        let packet = build_artdmx_packet(0, &data);

        assert_eq!(packet.len(), 18 + 512);
        assert_eq!(&packet[0..8], b"Art-Net\0");
        // OpCode 0x5000 little endian, ProtVer 14 big endian, seq 0, phys 0,
        // universe 0 little endian, length 512 big endian.
        assert_eq!(
            &packet[8..18],
            &[0x00, 0x50, 0x00, 0x0E, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]
        );
        assert_eq!(packet[18], 255);
        assert!(packet[19..].iter().all(|&b| b == 0));
    }

    #[test]
    fn universe_address_masks_to_15_bits() {
        let data = [0u8; DMX_UNIVERSE_SIZE];
        let packet = build_artdmx_packet(0x9234, &data);
        assert_eq!(packet[14], 0x34);
        assert_eq!(packet[15], 0x12, "top bit is masked off");
    }

    #[test]
    fn cache_keeps_latest_frame_per_target() {
        let output = ArtnetOutput::new();
        let mut first = [0u8; DMX_UNIVERSE_SIZE];
        first[0] = 1;
        let mut second = [0u8; DMX_UNIVERSE_SIZE];
        second[0] = 2;

        {
            let mut g = output.lock();
            g.upsert("127.0.0.1", 6454, 0, &first);
            g.upsert("127.0.0.1", 6454, 1, &first);
            g.upsert("127.0.0.1", 6454, 0, &second);
        }

        let g = output.lock();
        assert_eq!(g.frames.len(), 2);
        assert_eq!(g.frames[0].universe, 0);
        assert_eq!(g.frames[0].data[0], 2, "newer push replaces the cached frame");
        assert_eq!(g.frames[1].universe, 1);
    }

    #[test]
    fn refresh_period_has_a_floor() {
        assert!(refresh_period() >= Duration::from_millis(MIN_REFRESH_MS));
    }
}
