//! User configuration loaded from a JSON file

use crate::codec::CodecConfig;
use crate::crypto::{self, DEFAULT_ITERATIONS};
use crate::engine::EngineConfig;
use crate::storage::VaultFile;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Key-stretching rounds used when saving
    pub iterations: u32,
    /// Undo history limit; absent means unlimited
    pub max_history: Option<usize>,
    /// Database location; absent means the platform data directory
    pub vault_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            max_history: None,
            vault_path: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("safekeep").join("config.json"))
    }

    /// Parse a config file. Out-of-range iteration counts are rejected here
    /// rather than at the first save.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_json::from_slice(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        crypto::check_iterations(config.iterations)?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            iterations: self.iterations,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_history: self.max_history,
        }
    }

    pub fn vault_path(&self) -> Result<PathBuf> {
        match &self.vault_path {
            Some(path) => Ok(path.clone()),
            None => VaultFile::default_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.codec_config(), CodecConfig::default());
        assert_eq!(config.engine_config(), EngineConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "max_history": 50, "vault_path": "/tmp/x.skv" }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.iterations, DEFAULT_ITERATIONS);
        assert_eq!(config.engine_config().max_history, Some(50));
        assert_eq!(config.vault_path().unwrap(), PathBuf::from("/tmp/x.skv"));
    }

    #[test]
    fn test_rejects_weak_iterations() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, r#"{ "iterations": 10 }"#).unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_rejects_malformed_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "iterations = 4096").unwrap();
        assert!(Config::load_or_default(&path).is_err());
    }
}
