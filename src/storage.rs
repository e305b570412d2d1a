//! Database files on disk

use crate::app::App;
use crate::codec::CodecConfig;
use crate::engine::EngineConfig;
use crate::secure::SecureBuffer;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name used when no path is configured
pub const DEFAULT_FILE_NAME: &str = "vault.skv";

/// Reading and writing encrypted database files
pub struct VaultFile;

impl VaultFile {
    /// Get default database file path
    pub fn default_path() -> Result<PathBuf> {
        let data_dir =
            dirs::data_dir().ok_or_else(|| anyhow!("Could not determine data directory"))?;
        Ok(data_dir.join("safekeep").join(DEFAULT_FILE_NAME))
    }

    /// Ensure the database directory exists
    pub fn ensure_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Write through a sibling temp file and rename, so a crash never leaves
    /// a half-written database behind
    pub fn write(path: &Path, bytes: &[u8]) -> Result<()> {
        Self::ensure_dir(path)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, bytes)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        debug!(path = %path.display(), bytes = bytes.len(), "database written");
        Ok(())
    }

    /// Check if database file exists
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Read and unlock a database
    pub fn load(
        path: &Path,
        passphrase: SecureBuffer,
        codec_config: CodecConfig,
        engine_config: EngineConfig,
    ) -> Result<App> {
        let bytes = Self::read(path)?;
        let app = App::open(&bytes, passphrase, codec_config, engine_config)
            .with_context(|| format!("Failed to unlock {}", path.display()))?;
        Ok(app)
    }

    /// Encode and persist the session's database
    pub fn save(path: &Path, app: &mut App) -> Result<()> {
        let bytes = app.save()?;
        Self::write(path, &bytes)
    }
}
