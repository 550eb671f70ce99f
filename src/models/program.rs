use serde::{Deserialize, Serialize};

pub const MIN_SPM: u32 = 1;
pub const MAX_SPM: u32 = 500;
pub const DEFAULT_SPM: u32 = 120;

pub fn clamp_spm(spm: u32) -> u32 {
    spm.clamp(MIN_SPM, MAX_SPM)
}

fn default_true() -> bool {
    true
}

fn default_spm() -> u32 {
    DEFAULT_SPM
}

/// A feature value pinned by a program step. Either a single scalar or a
/// fixed-length array matching the feature's channel count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl FrameValue {
    /// Normalized byte vector: each element clamped to [0, 255] and rounded,
    /// NaN collapsed to 0.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            FrameValue::Scalar(v) => vec![clamp_byte(*v)],
            FrameValue::Vector(vs) => vs.iter().map(|&v| clamp_byte(v)).collect(),
        }
    }
}

pub fn clamp_byte(v: f64) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.clamp(0.0, 255.0).round() as u8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFrame {
    #[serde(rename = "fixtureId")]
    pub fixture: String,
    #[serde(rename = "featureId")]
    pub feature: String,
    pub value: FrameValue,
}

/// One keyframe of a program. `duration_ms` scales the step's share of the
/// SPM-derived pacing (500 => 1x); `fade_ms` is the interpolation window from
/// the previous step's values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramStep {
    pub id: String,
    pub duration_ms: u32,
    #[serde(default)]
    pub fade_ms: u32,
    #[serde(default)]
    pub frames: Vec<FeatureFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub id: String,
    pub name: String,
    pub environment_id: String,
    /// Steps per minute. Legacy files carry this as `tempoBpm`.
    #[serde(default = "default_spm", alias = "tempoBpm")]
    pub spm: u32,
    #[serde(rename = "loop", default = "default_true")]
    pub loop_enabled: bool,
    #[serde(default)]
    pub steps: Vec<ProgramStep>,
}
