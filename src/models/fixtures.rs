use serde::{Deserialize, Serialize};

/// Logical channel grouping on a fixture type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureKind {
    Scalar,
    Rgb,
    Cct,
}

impl FeatureKind {
    /// Channels a feature of this kind occupies.
    pub fn channel_count(self) -> usize {
        match self {
            FeatureKind::Scalar => 1,
            FeatureKind::Rgb => 3,
            FeatureKind::Cct => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub kind: FeatureKind,
    /// 1-based channel offsets within the fixture.
    pub channels: Vec<u16>,
    /// Optional (min, max) output range for the feature's channels.
    #[serde(default)]
    pub range: Option<(u8, u8)>,
}

/// Immutable catalog entry describing one kind of light.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureType {
    pub id: String,
    pub name: String,
    /// Total channel footprint of the fixture.
    pub channels: u16,
    pub features: Vec<Feature>,
}

impl FixtureType {
    pub fn feature(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn first_feature_of(&self, kind: FeatureKind) -> Option<&Feature> {
        self.features.iter().find(|f| f.kind == kind)
    }
}
