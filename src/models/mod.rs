pub mod environment;
pub mod fixtures;
pub mod frame;
pub mod program;

pub use environment::{Environment, EnvironmentFixture, OutputConfig};
pub use fixtures::{Feature, FeatureKind, FixtureType};
pub use frame::{layer_key, split_layer_key, LayerValueMap, PlayheadPatch, PlayheadState, RenderFrame};
pub use program::{clamp_spm, FeatureFrame, FrameValue, Program, ProgramStep};
