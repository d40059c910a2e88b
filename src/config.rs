//! JSON configuration for the engine, the prover and the setup location.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::prover::ProverConfig;
use crate::setup::SetupManifest;

/// Errors raised while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(String),
    /// The file is not valid configuration JSON.
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Top-level configuration; every section falls back to its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Proving limits.
    pub prover: ProverConfig,
    /// Engine tuning.
    pub engine: EngineConfig,
    /// Pinned structured-setup file for wrapped proofs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupManifest>,
}

impl BridgeConfig {
    /// Reads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
        Self::from_json(&contents)
    }

    /// Parses config JSON.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_take_defaults() {
        let config = BridgeConfig::from_json(r#"{ "prover": { "max_batch": 8 } }"#).unwrap();
        assert_eq!(config.prover.max_batch, 8);
        assert_eq!(config.prover.timeout_ms, ProverConfig::default().timeout_ms);
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.setup.is_none());
    }

    #[test]
    fn setup_manifest_is_parsed() {
        let digest = "ab".repeat(32);
        let json = format!(
            r#"{{ "setup": {{ "version": 1, "digest": "{digest}", "path": "params/setup.bin" }} }}"#
        );
        let config = BridgeConfig::from_json(&json).unwrap();
        let manifest = config.setup.unwrap();
        assert_eq!(manifest.digest, [0xab; 32]);
        assert_eq!(manifest.path, Path::new("params/setup.bin"));
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(matches!(
            BridgeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            BridgeConfig::load(Path::new("/nonexistent/bridge.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
