//! Passphrase stretching and key separation
//!
//! ## Scheme (format version 1)
//!
//! **Key stretching**: `X = SHA-256(passphrase || salt)`, then `X = SHA-256(X)`
//! repeated `iterations` times. The iteration count is stored in the envelope
//! header so the cost can be raised for new saves without breaking old files.
//!
//! **Key separation**: the stretched key never touches data directly. Two
//! independent 256-bit keys are derived from it with HMAC-SHA-256 over fixed
//! labels, one for Twofish-CBC and one for the integrity tag.
//!
//! ## Security Properties
//!
//! - Random 256-bit salt chosen when a database is created or its
//!   passphrase changes; saves within a session reuse it
//! - Random IV per save
//! - Encrypt-then-MAC over the whole envelope
//! - All intermediate and derived keys live in wiped memory

use crate::cipher::{Block, BLOCK_LEN, KEY_LEN};
use crate::error::{Result, VaultError};
use crate::hash::{self, Hasher};
use crate::secure::SecureBuffer;
use rand::{rngs::OsRng, RngCore};
use std::ops::ControlFlow;
use tracing::debug;
use zeroize::Zeroizing;

/// Size of salt in bytes (256 bits)
pub const SALT_LEN: usize = 32;

/// Default and minimum stretch rounds
pub const DEFAULT_ITERATIONS: u32 = 2048;
pub const MIN_ITERATIONS: u32 = 2048;

/// Upper bound accepted from a file header
pub const MAX_ITERATIONS: u32 = 1 << 24;

/// How often the cancellation hook is consulted
const PROGRESS_INTERVAL: u32 = 1024;

const ENCRYPTION_LABEL: &[u8] = b"safekeep v1 encryption key";
const INTEGRITY_LABEL: &[u8] = b"safekeep v1 integrity key";

/// Stretching parameters persisted with the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    pub salt: [u8; SALT_LEN],
    pub iterations: u32,
}

impl KdfParams {
    /// Fresh parameters with a random salt
    pub fn new(iterations: u32) -> Result<Self> {
        check_iterations(iterations)?;
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Ok(Self { salt, iterations })
    }
}

/// Reject iteration counts outside the supported range
pub fn check_iterations(iterations: u32) -> Result<()> {
    if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&iterations) {
        return Err(VaultError::format(format!(
            "iteration count {} outside {}..={}",
            iterations, MIN_ITERATIONS, MAX_ITERATIONS
        )));
    }
    Ok(())
}

/// Random CBC initialization vector
pub fn random_iv() -> Block {
    let mut iv = [0u8; BLOCK_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// The encryption and integrity keys for one open session, together with
/// the parameters they were stretched with
pub struct DerivedKeys {
    params: KdfParams,
    encryption: SecureBuffer,
    integrity: SecureBuffer,
}

impl DerivedKeys {
    /// Derive both keys from the passphrase
    pub fn derive(passphrase: &SecureBuffer, params: &KdfParams) -> Result<Self> {
        Self::derive_with_progress(passphrase, params, |_, _| ControlFlow::Continue(()))
    }

    /// Derive both keys, calling `progress(done, total)` periodically during
    /// stretching. Returning `Break` aborts with `Cancelled`.
    pub fn derive_with_progress<F>(
        passphrase: &SecureBuffer,
        params: &KdfParams,
        mut progress: F,
    ) -> Result<Self>
    where
        F: FnMut(u32, u32) -> ControlFlow<()>,
    {
        let total = params.iterations;

        let mut hasher = Hasher::new();
        hasher.update(passphrase.as_bytes()).update(&params.salt);
        let mut stretched = Zeroizing::new(hasher.finalize());

        for round in 1..=total {
            *stretched = hash::hash(stretched.as_slice());
            if round % PROGRESS_INTERVAL == 0 || round == total {
                if let ControlFlow::Break(()) = progress(round, total) {
                    debug!(round, total, "key derivation cancelled");
                    return Err(VaultError::Cancelled);
                }
            }
        }

        let encryption = Zeroizing::new(hash::hmac(stretched.as_slice(), ENCRYPTION_LABEL)?);
        let integrity = Zeroizing::new(hash::hmac(stretched.as_slice(), INTEGRITY_LABEL)?);

        debug!(iterations = total, "derived session keys");
        Ok(Self {
            params: params.clone(),
            encryption: SecureBuffer::from_slice(encryption.as_slice())?,
            integrity: SecureBuffer::from_slice(integrity.as_slice())?,
        })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Constant-time comparison of both keys
    pub fn matches(&self, other: &DerivedKeys) -> bool {
        let encryption = self.encryption == other.encryption;
        let integrity = self.integrity == other.integrity;
        encryption & integrity
    }

    /// Key for Twofish-CBC
    pub fn encryption_key(&self) -> &[u8] {
        debug_assert_eq!(self.encryption.len(), KEY_LEN);
        self.encryption.as_bytes()
    }

    /// Key for the HMAC-SHA-256 integrity tag
    pub fn integrity_key(&self) -> &[u8] {
        self.integrity.as_bytes()
    }
}
