//! Error types shared by the storage engine

use thiserror::Error;
use uuid::Uuid;

/// Every failure the engine can report.
///
/// `Bounds`, `OutOfMemory` and `InvalidKeyLength` indicate programmer errors.
/// `IntegrityCheckFailed` and `Format` mean the database cannot be opened and
/// no records were produced. `NotFound`, `NothingToUndo` and `NothingToRedo`
/// are ordinary control-flow signals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    Bounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("out of memory while allocating secure buffer")]
    OutOfMemory,

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Wrong passphrase and tampering are deliberately indistinguishable.
    #[error("integrity check failed: wrong passphrase or corrupted database")]
    IntegrityCheckFailed,

    #[error("malformed database: {0}")]
    Format(String),

    #[error("entry not found: {0}")]
    NotFound(Uuid),

    #[error("entry id already present: {0}")]
    DuplicateId(Uuid),

    #[error("an entry titled '{title}' for user '{user}' already exists in group '{group}'")]
    DuplicateEntry {
        title: String,
        user: String,
        group: String,
    },

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("key derivation cancelled")]
    Cancelled,

    #[error("database is locked")]
    Locked,
}

impl VaultError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        VaultError::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
