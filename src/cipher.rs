//! Twofish block cipher with a 256-bit key, and the CBC mode built on it
//!
//! The cipher never chooses an IV itself; callers pass one in.

use crate::error::{Result, VaultError};
use crate::secure::SecureBuffer;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, InnerIvInit};
use twofish::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use twofish::Twofish;

/// Block size in bytes (128 bits)
pub const BLOCK_LEN: usize = 16;

/// Key size in bytes (256 bits)
pub const KEY_LEN: usize = 32;

pub type Block = [u8; BLOCK_LEN];

/// Keyed Twofish instance. The key schedule is wiped on drop.
#[derive(Clone)]
pub struct BlockCipher {
    inner: Twofish,
}

impl BlockCipher {
    /// Run the key schedule for a 256-bit key
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength(key.len()));
        }
        let inner =
            Twofish::new_from_slice(key).map_err(|_| VaultError::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }

    /// Replace the key schedule
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        *self = Self::new(key)?;
        Ok(())
    }

    pub fn encrypt_block(&self, input: &Block) -> Block {
        let mut block = GenericArray::clone_from_slice(&input[..]);
        self.inner.encrypt_block(&mut block);
        let mut out = [0u8; BLOCK_LEN];
        out.copy_from_slice(&block);
        out
    }

    pub fn decrypt_block(&self, input: &Block) -> Block {
        let mut block = GenericArray::clone_from_slice(&input[..]);
        self.inner.decrypt_block(&mut block);
        let mut out = [0u8; BLOCK_LEN];
        out.copy_from_slice(&block);
        out
    }

    /// CBC-encrypt with PKCS#7 padding. Output is always a non-empty
    /// multiple of the block size.
    pub fn cbc_encrypt(&self, iv: &Block, plaintext: &[u8]) -> Vec<u8> {
        let iv = GenericArray::from_slice(&iv[..]);
        let encryptor = cbc::Encryptor::<Twofish>::inner_iv_init(self.inner.clone(), iv);
        encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// CBC-decrypt and strip PKCS#7 padding. Decryption happens in place in
    /// a secure buffer, so the plaintext is wiped even when padding fails.
    pub fn cbc_decrypt(&self, iv: &Block, ciphertext: &[u8]) -> Result<SecureBuffer> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return Err(VaultError::format(format!(
                "ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                BLOCK_LEN
            )));
        }
        let mut buf = SecureBuffer::from_slice(ciphertext)?;
        let iv = GenericArray::from_slice(&iv[..]);
        let decryptor = cbc::Decryptor::<Twofish>::inner_iv_init(self.inner.clone(), iv);
        let len = decryptor
            .decrypt_padded_mut::<Pkcs7>(buf.as_mut_bytes())
            .map_err(|_| VaultError::format("invalid block padding"))?
            .len();
        buf.truncate(len);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn block(s: &str) -> Block {
        let mut out = [0u8; BLOCK_LEN];
        out.copy_from_slice(&hex(s));
        out
    }

    #[test]
    fn test_twofish_256_known_answers() {
        let cipher = BlockCipher::new(&[0u8; KEY_LEN]).unwrap();
        let ct = cipher.encrypt_block(&[0u8; BLOCK_LEN]);
        assert_eq!(ct, block("57ff739d4dc92c1bd7fc01700cc8216f"));
        assert_eq!(cipher.decrypt_block(&ct), [0u8; BLOCK_LEN]);

        let key = hex("0123456789abcdeffedcba987654321000112233445566778899aabbccddeeff");
        let cipher = BlockCipher::new(&key).unwrap();
        let ct = cipher.encrypt_block(&[0u8; BLOCK_LEN]);
        assert_eq!(ct, block("37527be0052334b89f0cfccae87cfa20"));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(
            BlockCipher::new(&[0u8; 16]),
            Err(VaultError::InvalidKeyLength(16))
        ));

        let mut cipher = BlockCipher::new(&[1u8; KEY_LEN]).unwrap();
        assert_eq!(
            cipher.set_key(&[0u8; 33]).err(),
            Some(VaultError::InvalidKeyLength(33))
        );
    }

    #[test]
    fn test_set_key_changes_output() {
        let mut cipher = BlockCipher::new(&[1u8; KEY_LEN]).unwrap();
        let before = cipher.encrypt_block(&[7u8; BLOCK_LEN]);
        cipher.set_key(&[2u8; KEY_LEN]).unwrap();
        assert_ne!(before, cipher.encrypt_block(&[7u8; BLOCK_LEN]));
    }

    #[test]
    fn test_cbc_chains_blocks() {
        let cipher = BlockCipher::new(&[9u8; KEY_LEN]).unwrap();
        let iv = [0x5au8; BLOCK_LEN];
        let plaintext = [0x11u8; 2 * BLOCK_LEN];

        let ciphertext = cipher.cbc_encrypt(&iv, &plaintext);
        // Block-aligned input gains a full padding block
        assert_eq!(ciphertext.len(), 3 * BLOCK_LEN);

        let mut x0 = [0u8; BLOCK_LEN];
        for i in 0..BLOCK_LEN {
            x0[i] = plaintext[i] ^ iv[i];
        }
        let c0 = cipher.encrypt_block(&x0);
        assert_eq!(&ciphertext[..BLOCK_LEN], &c0);

        let mut x1 = [0u8; BLOCK_LEN];
        for i in 0..BLOCK_LEN {
            x1[i] = plaintext[BLOCK_LEN + i] ^ c0[i];
        }
        assert_eq!(&ciphertext[BLOCK_LEN..2 * BLOCK_LEN], &cipher.encrypt_block(&x1));
    }

    #[test]
    fn test_cbc_roundtrip_and_iv_dependence() {
        let cipher = BlockCipher::new(&[3u8; KEY_LEN]).unwrap();
        let plaintext = b"title=Bank;user=alice;password=secret1";

        let a = cipher.cbc_encrypt(&[0u8; BLOCK_LEN], plaintext);
        let b = cipher.cbc_encrypt(&[1u8; BLOCK_LEN], plaintext);
        assert_ne!(a, b);

        let decrypted = cipher.cbc_decrypt(&[0u8; BLOCK_LEN], &a).unwrap();
        assert_eq!(decrypted.as_bytes(), plaintext);
    }

    #[test]
    fn test_cbc_rejects_bad_padding() {
        let cipher = BlockCipher::new(&[3u8; KEY_LEN]).unwrap();
        let iv = [0u8; BLOCK_LEN];
        let mut ciphertext = cipher.cbc_encrypt(&iv, &[0x42u8; 2 * BLOCK_LEN]);
        assert_eq!(ciphertext.len(), 3 * BLOCK_LEN);

        // Last plaintext byte becomes 0x10 ^ 0x80, which is not a padding length
        let last = ciphertext.len() - BLOCK_LEN - 1;
        ciphertext[last] ^= 0x80;
        assert!(matches!(
            cipher.cbc_decrypt(&iv, &ciphertext),
            Err(VaultError::Format(_))
        ));
    }

    #[test]
    fn test_cbc_rejects_misaligned_ciphertext() {
        let cipher = BlockCipher::new(&[3u8; KEY_LEN]).unwrap();
        assert!(matches!(
            cipher.cbc_decrypt(&[0u8; BLOCK_LEN], &[0u8; 17]),
            Err(VaultError::Format(_))
        ));
        assert!(matches!(
            cipher.cbc_decrypt(&[0u8; BLOCK_LEN], &[]),
            Err(VaultError::Format(_))
        ));
    }
}
