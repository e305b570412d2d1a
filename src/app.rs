//! Open-database session: engine, codec and session keys together

use crate::codec::{Codec, CodecConfig};
use crate::command::Command;
use crate::crypto::{DerivedKeys, KdfParams};
use crate::engine::{CommandEngine, EngineConfig};
use crate::error::{Result, VaultError};
use crate::secure::SecureBuffer;
use crate::store::EntryStore;
use std::ops::ControlFlow;
use tracing::info;

/// One unlocked database.
///
/// The passphrase is only held long enough to derive the session keys. Those
/// keys, and the salt they were stretched with, are reused by every save
/// until the passphrase changes. Locking wipes the keys, every record and the
/// undo history.
pub struct App {
    engine: CommandEngine,
    codec: Codec,
    /// `None` while locked
    keys: Option<DerivedKeys>,
    /// Keys changed since the last save
    rekeyed: bool,
}

impl App {
    /// Start a new, empty database with a fresh salt
    pub fn create(
        passphrase: SecureBuffer,
        codec_config: CodecConfig,
        engine_config: EngineConfig,
    ) -> Result<Self> {
        let codec = Codec::new(codec_config)?;
        let keys = Self::fresh_keys(&codec, &passphrase)?;
        Ok(Self {
            engine: CommandEngine::new(EntryStore::new(), engine_config),
            codec,
            keys: Some(keys),
            rekeyed: true,
        })
    }

    /// Decrypt an existing database
    pub fn open(
        bytes: &[u8],
        passphrase: SecureBuffer,
        codec_config: CodecConfig,
        engine_config: EngineConfig,
    ) -> Result<Self> {
        let codec = Codec::new(codec_config)?;
        let (store, keys, rekeyed) = Self::decode(&codec, bytes, &passphrase)?;
        info!(entries = store.len(), "database unlocked");
        Ok(Self {
            engine: CommandEngine::new(store, engine_config),
            codec,
            keys: Some(keys),
            rekeyed,
        })
    }

    pub fn store(&self) -> &EntryStore {
        self.engine.store()
    }

    pub fn engine(&self) -> &CommandEngine {
        &self.engine
    }

    /// Mutable engine access for executing commands and managing observers
    pub fn engine_mut(&mut self) -> Result<&mut CommandEngine> {
        if self.is_locked() {
            return Err(VaultError::Locked);
        }
        Ok(&mut self.engine)
    }

    /// Shorthand for `engine_mut()?.execute(command)`
    pub fn execute(&mut self, command: Command) -> Result<()> {
        self.engine_mut()?.execute(command)
    }

    /// Whether there is anything to save
    pub fn is_changed(&self) -> bool {
        !self.is_locked() && (self.rekeyed || self.engine.is_changed())
    }

    /// Encode the database for writing. The caller persists the bytes.
    pub fn save(&mut self) -> Result<Vec<u8>> {
        let keys = self.keys.as_ref().ok_or(VaultError::Locked)?;
        let bytes = self.codec.save_with_keys(self.engine.store(), keys)?;
        self.engine.mark_saved();
        self.rekeyed = false;
        info!(entries = self.engine.store().len(), "database saved");
        Ok(bytes)
    }

    /// Replace the master passphrase. The current one must be supplied and
    /// derive the session keys; a mismatch is reported like any failed unlock.
    /// The new keys get a new salt.
    pub fn change_passphrase(&mut self, current: &SecureBuffer, new: SecureBuffer) -> Result<()> {
        let keys = self.keys.as_ref().ok_or(VaultError::Locked)?;
        let check = DerivedKeys::derive(current, keys.params())?;
        if !check.matches(keys) {
            return Err(VaultError::IntegrityCheckFailed);
        }
        self.keys = Some(Self::fresh_keys(&self.codec, &new)?);
        self.rekeyed = true;
        info!("master passphrase changed");
        Ok(())
    }

    /// Wipe everything held in memory. Unsaved changes are lost.
    pub fn lock(&mut self) {
        if self.is_locked() {
            return;
        }
        self.engine.clear();
        self.keys = None;
        self.rekeyed = false;
        info!("database locked");
    }

    /// Reopen after `lock`, from freshly read bytes. Does nothing if the
    /// session is already unlocked.
    pub fn unlock(&mut self, bytes: &[u8], passphrase: SecureBuffer) -> Result<()> {
        if !self.is_locked() {
            return Ok(());
        }
        let (store, keys, rekeyed) = Self::decode(&self.codec, bytes, &passphrase)?;
        self.engine.load(store);
        self.keys = Some(keys);
        self.rekeyed = rekeyed;
        info!(entries = self.engine.store().len(), "database unlocked");
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.keys.is_none()
    }

    fn fresh_keys(codec: &Codec, passphrase: &SecureBuffer) -> Result<DerivedKeys> {
        let params = KdfParams::new(codec.config().iterations)?;
        DerivedKeys::derive(passphrase, &params)
    }

    /// Open `bytes`, re-keying with a fresh salt when the file was stretched
    /// with fewer rounds than configured. The flag reports a re-key.
    fn decode(
        codec: &Codec,
        bytes: &[u8],
        passphrase: &SecureBuffer,
    ) -> Result<(EntryStore, DerivedKeys, bool)> {
        let (store, keys) =
            codec.open_with_keys(bytes, passphrase, |_, _| ControlFlow::Continue(()))?;
        if keys.params().iterations < codec.config().iterations {
            let upgraded = Self::fresh_keys(codec, passphrase)?;
            info!(
                iterations = upgraded.params().iterations,
                "key stretching upgraded; next save uses the new cost"
            );
            return Ok((store, upgraded, true));
        }
        Ok((store, keys, false))
    }
}
