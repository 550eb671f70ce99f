//! Runtime configuration loaded from the three JSON stores under `data/`.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{ChaserError, ChaserResult};
use crate::models::program::clamp_spm;
use crate::models::{Environment, FixtureType, Program};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub fixtures: Vec<FixtureType>,
    pub environments: Vec<Environment>,
    pub programs: Vec<Program>,
}

impl RuntimeConfig {
    pub fn fixture_type(&self, id: &str) -> Option<&FixtureType> {
        self.fixtures.iter().find(|f| f.id == id)
    }

    pub fn environment(&self, id: &str) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == id)
    }

    pub fn program(&self, id: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.id == id)
    }

    /// Programs bound to the given environment, in file order.
    pub fn programs_for(&self, environment_id: &str) -> Vec<&Program> {
        self.programs
            .iter()
            .filter(|p| p.environment_id == environment_id)
            .collect()
    }
}

pub fn load_runtime_config(dir: &Path) -> ChaserResult<RuntimeConfig> {
    let fixtures: Vec<FixtureType> = load_json(&dir.join("fixtures.json"))?;
    let mut environments: Vec<Environment> = load_json(&dir.join("environments.json"))?;
    let mut programs: Vec<Program> = load_json(&dir.join("programs.json"))?;

    for env in &mut environments {
        env.render_fps = env.render_fps.clamp(1, 120);
    }
    for program in &mut programs {
        program.spm = clamp_spm(program.spm);
    }

    info!(
        fixtures = fixtures.len(),
        environments = environments.len(),
        programs = programs.len(),
        "runtime config loaded"
    );

    Ok(RuntimeConfig {
        fixtures,
        environments,
        programs,
    })
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> ChaserResult<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ChaserError::config(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| ChaserError::config(format!("failed to parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_spm_accepts_legacy_tempo_bpm() {
        let raw = r#"{
            "id": "p1",
            "name": "Warmup",
            "environmentId": "env1",
            "tempoBpm": 90,
            "steps": []
        }"#;
        let program: Program = serde_json::from_str(raw).expect("program parses");
        assert_eq!(program.spm, 90);
        assert!(program.loop_enabled, "loop defaults to true");
    }

    #[test]
    fn output_config_variants_parse() {
        let raw = r#"[
            {"type": "simulator", "id": "sim"},
            {"type": "artnet", "id": "an", "host": "10.0.0.20", "universes": [0, 1]},
            {"type": "mqtt", "id": "ha", "url": "mqtt://broker:1883", "baseTopic": "chaser/club"}
        ]"#;
        let outputs: Vec<crate::models::OutputConfig> =
            serde_json::from_str(raw).expect("outputs parse");
        assert_eq!(outputs.len(), 3);
        assert!(outputs.iter().all(|o| o.enabled()));
        match &outputs[1] {
            crate::models::OutputConfig::Artnet { port, universes, .. } => {
                assert_eq!(*port, 6454);
                assert_eq!(universes.as_deref(), Some(&[0u16, 1][..]));
            }
            other => panic!("expected artnet output, got {:?}", other),
        }
    }
}
