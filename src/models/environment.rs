use serde::{Deserialize, Serialize};

pub const DEFAULT_RENDER_FPS: u32 = 30;
pub const DEFAULT_ARTNET_PORT: u16 = 6454;

fn default_true() -> bool {
    true
}

fn default_render_fps() -> u32 {
    DEFAULT_RENDER_FPS
}

fn default_artnet_port() -> u16 {
    DEFAULT_ARTNET_PORT
}

/// Placement of a fixture type in the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentFixture {
    pub id: String,
    #[serde(rename = "type")]
    pub fixture_type: String,
    pub name: String,
    /// Art-Net port-address, 0..=32767.
    pub universe: u16,
    /// 1-based DMX start address.
    pub address: u16,
    #[serde(default)]
    pub position: Option<[f64; 2]>,
    /// Opt-out flag for the MQTT light surface.
    #[serde(default = "default_true")]
    pub mqtt_expose: bool,
}

/// Transport targets attached to an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    #[serde(rename_all = "camelCase")]
    Simulator {
        id: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    Artnet {
        id: String,
        #[serde(default = "default_true")]
        enabled: bool,
        host: String,
        #[serde(default = "default_artnet_port")]
        port: u16,
        /// When present, only these universes are forwarded to this target.
        #[serde(default)]
        universes: Option<Vec<u16>>,
    },
    #[serde(rename_all = "camelCase")]
    Mqtt {
        id: String,
        #[serde(default = "default_true")]
        enabled: bool,
        url: String,
        #[serde(default)]
        base_topic: Option<String>,
        #[serde(default)]
        discovery_prefix: Option<String>,
        #[serde(default)]
        node_id: Option<String>,
        /// Legacy raw per-frame payload topic.
        #[serde(default)]
        topic: Option<String>,
    },
}

impl OutputConfig {
    pub fn id(&self) -> &str {
        match self {
            OutputConfig::Simulator { id, .. } => id,
            OutputConfig::Artnet { id, .. } => id,
            OutputConfig::Mqtt { id, .. } => id,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            OutputConfig::Simulator { enabled, .. } => *enabled,
            OutputConfig::Artnet { enabled, .. } => *enabled,
            OutputConfig::Mqtt { enabled, .. } => *enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    #[serde(default = "default_render_fps")]
    pub render_fps: u32,
    pub fixtures: Vec<EnvironmentFixture>,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl Environment {
    pub fn fixture(&self, id: &str) -> Option<&EnvironmentFixture> {
        self.fixtures.iter().find(|f| f.id == id)
    }
}
