//! SHA-256 and HMAC-SHA-256
//!
//! Both are streaming: data may be fed in any number of chunks before the
//! single final digest is produced. They must stay bit-exact with the
//! standard algorithms because the on-disk format depends on them.

use crate::error::{Result, VaultError};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Size of a digest or tag in bytes (256 bits)
pub const DIGEST_LEN: usize = 32;

pub type Digest256 = [u8; DIGEST_LEN];

/// Incremental SHA-256
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        Digest::update(&mut self.inner, data);
        self
    }

    pub fn finalize(self) -> Digest256 {
        let digest = self.inner.finalize();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&digest);
        out
    }
}

/// One-shot SHA-256
pub fn hash(data: &[u8]) -> Digest256 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental HMAC-SHA-256
#[derive(Clone)]
pub struct KeyedHasher {
    inner: Hmac<Sha256>,
}

impl KeyedHasher {
    /// HMAC accepts keys of any length; longer keys are hashed first.
    pub fn new(key: &[u8]) -> Result<Self> {
        let inner = <Hmac<Sha256> as Mac>::new_from_slice(key)
            .map_err(|_| VaultError::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        Mac::update(&mut self.inner, data);
        self
    }

    pub fn finalize(self) -> Digest256 {
        let tag = self.inner.finalize().into_bytes();
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&tag);
        out
    }

    /// Compare the computed tag against `expected` in constant time
    pub fn verify(self, expected: &[u8]) -> Result<()> {
        let computed = self.finalize();
        if tags_match(&computed, expected) {
            Ok(())
        } else {
            Err(VaultError::IntegrityCheckFailed)
        }
    }
}

/// One-shot HMAC-SHA-256
pub fn hmac(key: &[u8], data: &[u8]) -> Result<Digest256> {
    let mut mac = KeyedHasher::new(key)?;
    mac.update(data);
    Ok(mac.finalize())
}

/// Constant-time equality for tags; differing lengths never match
pub fn tags_match(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
