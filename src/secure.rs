//! Wipe-on-drop byte container for passphrases, keys and decrypted fields
//!
//! `SecureBuffer` never lets its bytes outlive it: every drop path zeroes the
//! whole allocation (including spare capacity), growth copies into a fresh
//! allocation and wipes the old one, and `Clone` is a deep copy that is itself
//! wiped on drop.

use crate::error::{Result, VaultError};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Minimum capacity allocated when a buffer has to grow.
const MIN_GROWTH: usize = 32;

#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct SecureBuffer {
    bytes: Vec<u8>,
}

impl SecureBuffer {
    /// Create an empty buffer without allocating
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Create an empty buffer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| VaultError::OutOfMemory)?;
        Ok(Self { bytes })
    }

    /// Create a buffer of `len` zero bytes
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut buf = Self::with_capacity(len)?;
        buf.bytes.resize(len, 0);
        Ok(buf)
    }

    /// Copy `data` into a new buffer
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = Self::with_capacity(data.len())?;
        buf.bytes.extend_from_slice(data);
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// View the contents as UTF-8 text
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.bytes)
            .map_err(|_| VaultError::format("field is not valid UTF-8"))
    }

    /// Borrow `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.checked_end(offset, len)?;
        Ok(&self.bytes[offset..end])
    }

    /// Overwrite bytes starting at `offset`; the buffer does not grow
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = self.checked_end(offset, data.len())?;
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Append `data`, moving to a larger allocation if needed
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    /// Grow with zero bytes or shrink (wiping the discarded tail) to `new_len`
    pub fn resize(&mut self, new_len: usize) -> Result<()> {
        let len = self.bytes.len();
        if new_len <= len {
            self.truncate(new_len);
            return Ok(());
        }
        self.reserve(new_len - len)?;
        self.bytes.resize(new_len, 0);
        Ok(())
    }

    /// Shorten to `len` bytes, wiping the removed tail
    pub fn truncate(&mut self, len: usize) {
        if len < self.bytes.len() {
            self.bytes[len..].zeroize();
            self.bytes.truncate(len);
        }
    }

    /// Zero the whole allocation and empty the buffer.
    ///
    /// This is the same routine that runs on drop.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        let size = self.bytes.len();
        offset
            .checked_add(len)
            .filter(|end| *end <= size)
            .ok_or(VaultError::Bounds { offset, len, size })
    }

    /// Ensure room for `additional` bytes. `Vec` would realloc in place and
    /// leave the old copy behind, so growth goes through a fresh allocation.
    fn reserve(&mut self, additional: usize) -> Result<()> {
        let len = self.bytes.len();
        if self.bytes.capacity() - len >= additional {
            return Ok(());
        }
        let needed = len
            .checked_add(additional)
            .ok_or(VaultError::OutOfMemory)?;
        let target = needed.max(self.bytes.capacity() * 2).max(MIN_GROWTH);

        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(target)
            .map_err(|_| VaultError::OutOfMemory)?;
        fresh.extend_from_slice(&self.bytes);

        let mut old = std::mem::replace(&mut self.bytes, fresh);
        old.zeroize();
        Ok(())
    }
}

impl From<Vec<u8>> for SecureBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl From<String> for SecureBuffer {
    fn from(text: String) -> Self {
        Self {
            bytes: text.into_bytes(),
        }
    }
}

impl From<&str> for SecureBuffer {
    fn from(text: &str) -> Self {
        Self {
            bytes: text.as_bytes().to_vec(),
        }
    }
}

impl AsRef<[u8]> for SecureBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Constant-time comparison
impl PartialEq for SecureBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.as_slice().ct_eq(other.bytes.as_slice()).into()
    }
}

impl Eq for SecureBuffer {}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {} bytes])", self.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_within_bounds() {
        let mut buf = SecureBuffer::zeroed(8).unwrap();
        buf.write(2, b"abc").unwrap();
        assert_eq!(buf.read(2, 3).unwrap(), b"abc");
        assert_eq!(buf.read(0, 2).unwrap(), &[0, 0]);
        assert_eq!(buf.read(8, 0).unwrap(), b"");
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut buf = SecureBuffer::from("secret");
        assert_eq!(
            buf.read(4, 3),
            Err(VaultError::Bounds {
                offset: 4,
                len: 3,
                size: 6
            })
        );
        assert!(matches!(
            buf.write(usize::MAX, b"x"),
            Err(VaultError::Bounds { .. })
        ));
        // Failed write leaves contents untouched
        assert_eq!(buf.as_bytes(), b"secret");
    }

    #[test]
    fn test_resize_and_extend() {
        let mut buf = SecureBuffer::new();
        buf.extend_from_slice(b"hello").unwrap();
        buf.extend_from_slice(b" world").unwrap();
        assert_eq!(buf.as_str().unwrap(), "hello world");

        buf.resize(5).unwrap();
        assert_eq!(buf.as_bytes(), b"hello");

        buf.resize(7).unwrap();
        assert_eq!(buf.as_bytes(), b"hello\0\0");
    }

    #[test]
    fn test_growth_preserves_contents() {
        let mut buf = SecureBuffer::with_capacity(1).unwrap();
        for i in 0..200u8 {
            buf.extend_from_slice(&[i]).unwrap();
        }
        assert_eq!(buf.len(), 200);
        assert_eq!(buf.read(199, 1).unwrap(), &[199]);
    }

    #[test]
    fn test_wipe_zeroes_whole_allocation() {
        let mut buf = SecureBuffer::with_capacity(64).unwrap();
        buf.extend_from_slice(b"correct horse battery staple").unwrap();
        let ptr = buf.bytes.as_ptr();
        let capacity = buf.bytes.capacity();

        buf.wipe();
        assert!(buf.is_empty());

        // The allocation is still owned by `buf`, and every byte of it was
        // written by the wipe, so reading it back is sound.
        let raw = unsafe { std::slice::from_raw_parts(ptr, capacity) };
        assert!(raw.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_truncate_wipes_tail() {
        let mut buf = SecureBuffer::from("abcdef");
        let ptr = buf.bytes.as_ptr();
        buf.truncate(2);
        let raw = unsafe { std::slice::from_raw_parts(ptr, 6) };
        assert_eq!(raw, b"ab\0\0\0\0");
    }

    #[test]
    fn test_clone_is_deep() {
        let original = SecureBuffer::from("pw");
        let mut copy = original.clone();
        assert_eq!(original, copy);
        assert_ne!(original.as_bytes().as_ptr(), copy.as_bytes().as_ptr());

        copy.wipe();
        assert_eq!(original.as_bytes(), b"pw");
    }

    #[test]
    fn test_debug_redacts_contents() {
        let buf = SecureBuffer::from("topsecret");
        let rendered = format!("{:?}", buf);
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("9 bytes"));
    }

    #[test]
    fn test_invalid_utf8() {
        let buf = SecureBuffer::from(vec![0xff, 0xfe]);
        assert!(matches!(buf.as_str(), Err(VaultError::Format(_))));
    }
}
