//! Envelope codec: the encrypted, authenticated on-disk representation
//!
//! ## Layout (version 1, integers little-endian)
//!
//! ```text
//! tag "SKV\x01" | version u16 | salt [32] | iterations u32 | iv [16]
//! | ciphertext length u32 | ciphertext | HMAC-SHA-256 tag [32]
//! ```
//!
//! The tag covers every byte before it. Decoding verifies it before anything
//! is decrypted, so a wrong passphrase or a modified file yields
//! `IntegrityCheckFailed` and never a partial store.
//!
//! The plaintext is a record count followed by each record as a run of
//! `[type u8][length u32][value]` fields closed by an end marker.
//!
//! The codec works on byte buffers only; reading and writing files is the
//! caller's business.

use crate::cipher::{Block, BlockCipher, BLOCK_LEN};
use crate::crypto::{self, DerivedKeys, KdfParams, DEFAULT_ITERATIONS, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::hash::{KeyedHasher, DIGEST_LEN};
use crate::model::{Entry, UnknownField};
use crate::secure::SecureBuffer;
use crate::store::EntryStore;
use chrono::{DateTime, Utc};
use std::ops::ControlFlow;
use tracing::{debug, info};
use uuid::Uuid;

pub const FORMAT_TAG: [u8; 4] = *b"SKV\x01";
pub const FORMAT_VERSION: u16 = 1;

/// Bytes before the ciphertext
pub const HEADER_LEN: usize = 4 + 2 + SALT_LEN + 4 + BLOCK_LEN + 4;

/// Bytes of the trailing integrity tag
pub const TAG_LEN: usize = DIGEST_LEN;

// Record field types
const FIELD_UUID: u8 = 0x01;
const FIELD_GROUP: u8 = 0x02;
const FIELD_TITLE: u8 = 0x03;
const FIELD_USER: u8 = 0x04;
const FIELD_NOTES: u8 = 0x05;
const FIELD_PASSWORD: u8 = 0x06;
const FIELD_CREATED: u8 = 0x07;
const FIELD_EXPIRES: u8 = 0x0a;
const FIELD_MODIFIED: u8 = 0x0c;
const FIELD_URL: u8 = 0x0d;
const FIELD_END: u8 = 0xff;

const TIMESTAMP_LEN: usize = 12;

/// Codec settings supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Key-stretch rounds used for new saves
    pub iterations: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

/// Cleartext header fields of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub version: u16,
    pub kdf: KdfParams,
    pub iv: Block,
    pub ciphertext_len: usize,
}

impl EnvelopeHeader {
    /// Parse and sanity-check the cleartext header without any key material
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + BLOCK_LEN + TAG_LEN {
            return Err(VaultError::format("file too short to be a database"));
        }
        let mut reader = Reader::new(&bytes[..HEADER_LEN]);
        if reader.take(FORMAT_TAG.len())? != &FORMAT_TAG[..] {
            return Err(VaultError::format("not a safekeep database"));
        }
        let version = reader.u16()?;
        if version != FORMAT_VERSION {
            return Err(VaultError::format(format!(
                "unsupported format version {}",
                version
            )));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(reader.take(SALT_LEN)?);
        let iterations = reader.u32()?;
        crypto::check_iterations(iterations)?;
        let mut iv = [0u8; BLOCK_LEN];
        iv.copy_from_slice(reader.take(BLOCK_LEN)?);
        let ciphertext_len = reader.u32()? as usize;

        if ciphertext_len == 0
            || ciphertext_len % BLOCK_LEN != 0
            || HEADER_LEN + ciphertext_len + TAG_LEN != bytes.len()
        {
            return Err(VaultError::format("ciphertext length does not match file size"));
        }

        Ok(Self {
            version,
            kdf: KdfParams { salt, iterations },
            iv,
            ciphertext_len,
        })
    }
}

/// Encodes and decodes whole databases
#[derive(Debug, Clone)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Result<Self> {
        crypto::check_iterations(config.iterations)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Encrypt a store under `passphrase` with a fresh salt and IV
    pub fn save(&self, store: &EntryStore, passphrase: &SecureBuffer) -> Result<Vec<u8>> {
        let params = KdfParams::new(self.config.iterations)?;
        let keys = DerivedKeys::derive(passphrase, &params)?;
        self.save_with_keys(store, &keys)
    }

    /// Encrypt a store under already derived session keys. The salt and
    /// iteration count are those the keys were stretched with; only the IV
    /// is new.
    pub fn save_with_keys(&self, store: &EntryStore, keys: &DerivedKeys) -> Result<Vec<u8>> {
        encode_keyed(store, keys, &crypto::random_iv())
    }

    /// Verify and decrypt an envelope into a fresh store
    pub fn open(&self, bytes: &[u8], passphrase: &SecureBuffer) -> Result<EntryStore> {
        self.open_with_progress(bytes, passphrase, |_, _| ControlFlow::Continue(()))
    }

    /// Like [`open`](Self::open), reporting key-stretch progress. Returning
    /// `Break` from `progress` aborts with `Cancelled`.
    pub fn open_with_progress<F>(
        &self,
        bytes: &[u8],
        passphrase: &SecureBuffer,
        progress: F,
    ) -> Result<EntryStore>
    where
        F: FnMut(u32, u32) -> ControlFlow<()>,
    {
        let (store, _keys) = self.open_with_keys(bytes, passphrase, progress)?;
        Ok(store)
    }

    /// Decrypt an envelope and keep the derived keys for later saves
    pub fn open_with_keys<F>(
        &self,
        bytes: &[u8],
        passphrase: &SecureBuffer,
        progress: F,
    ) -> Result<(EntryStore, DerivedKeys)>
    where
        F: FnMut(u32, u32) -> ControlFlow<()>,
    {
        let header = EnvelopeHeader::parse(bytes)?;
        if header.kdf.iterations < self.config.iterations {
            info!(
                stored = header.kdf.iterations,
                configured = self.config.iterations,
                "database uses fewer key-stretch rounds than configured"
            );
        }

        let keys = DerivedKeys::derive_with_progress(passphrase, &header.kdf, progress)?;

        let body_end = HEADER_LEN + header.ciphertext_len;
        let mut mac = KeyedHasher::new(keys.integrity_key())?;
        mac.update(&bytes[..body_end]);
        mac.verify(&bytes[body_end..])?;

        let cipher = BlockCipher::new(keys.encryption_key())?;
        let plaintext = cipher.cbc_decrypt(&header.iv, &bytes[HEADER_LEN..body_end])?;
        let store = parse_records(plaintext.as_bytes())?;

        debug!(entries = store.len(), "decoded database");
        Ok((store, keys))
    }
}

/// Encode with explicit parameters. `Codec::save` is the normal entry point;
/// this exists for reproducible output.
pub fn encode_with(
    store: &EntryStore,
    passphrase: &SecureBuffer,
    params: &KdfParams,
    iv: &Block,
) -> Result<Vec<u8>> {
    crypto::check_iterations(params.iterations)?;
    let keys = DerivedKeys::derive(passphrase, params)?;
    encode_keyed(store, &keys, iv)
}

fn encode_keyed(store: &EntryStore, keys: &DerivedKeys, iv: &Block) -> Result<Vec<u8>> {
    let plaintext = serialize_records(store)?;
    let bytes = seal(plaintext.as_bytes(), keys, iv)?;
    debug!(
        entries = store.len(),
        iterations = keys.params().iterations,
        bytes = bytes.len(),
        "encoded database"
    );
    Ok(bytes)
}

/// Encrypt and authenticate an already serialized plaintext
fn seal(plaintext: &[u8], keys: &DerivedKeys, iv: &Block) -> Result<Vec<u8>> {
    let params = keys.params();
    let cipher = BlockCipher::new(keys.encryption_key())?;
    let ciphertext = cipher.cbc_encrypt(iv, plaintext);
    let ciphertext_len = u32::try_from(ciphertext.len())
        .map_err(|_| VaultError::format("database too large"))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
    out.extend_from_slice(&FORMAT_TAG);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&params.salt);
    out.extend_from_slice(&params.iterations.to_le_bytes());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext_len.to_le_bytes());
    out.extend_from_slice(&ciphertext);

    let mut mac = KeyedHasher::new(keys.integrity_key())?;
    mac.update(&out);
    out.extend_from_slice(&mac.finalize());
    Ok(out)
}

fn serialize_records(store: &EntryStore) -> Result<SecureBuffer> {
    let count =
        u32::try_from(store.len()).map_err(|_| VaultError::format("too many entries"))?;
    let mut out = SecureBuffer::new();
    out.extend_from_slice(&count.to_le_bytes())?;

    for entry in store.iter_all() {
        put_field(&mut out, FIELD_UUID, entry.uuid().as_bytes())?;
        put_text(&mut out, FIELD_GROUP, entry.group())?;
        put_text(&mut out, FIELD_TITLE, entry.title())?;
        put_text(&mut out, FIELD_USER, entry.user())?;
        put_field(&mut out, FIELD_NOTES, entry.notes().as_bytes())?;
        put_field(&mut out, FIELD_PASSWORD, entry.password().as_bytes())?;
        put_field(&mut out, FIELD_CREATED, &timestamp_bytes(entry.created()))?;
        put_field(&mut out, FIELD_MODIFIED, &timestamp_bytes(entry.modified()))?;
        if let Some(expires) = entry.expires() {
            put_field(&mut out, FIELD_EXPIRES, &timestamp_bytes(expires))?;
        }
        put_text(&mut out, FIELD_URL, entry.url())?;
        for unknown in entry.unknown_fields() {
            put_field(&mut out, unknown.kind, unknown.value.as_bytes())?;
        }
        put_field(&mut out, FIELD_END, &[])?;
    }
    Ok(out)
}

fn put_text(out: &mut SecureBuffer, kind: u8, value: &str) -> Result<()> {
    put_field(out, kind, value.as_bytes())
}

fn put_field(out: &mut SecureBuffer, kind: u8, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| VaultError::format("field too large"))?;
    out.extend_from_slice(&[kind])?;
    out.extend_from_slice(&len.to_le_bytes())?;
    out.extend_from_slice(value)
}

fn parse_records(plaintext: &[u8]) -> Result<EntryStore> {
    let mut reader = Reader::new(plaintext);
    let count = reader.u32()?;
    let mut store = EntryStore::new();

    for _ in 0..count {
        let entry = parse_entry(&mut reader)?;
        let uuid = entry.uuid();
        store.insert(entry).map_err(|_| {
            VaultError::format(format!("entry id {} appears more than once", uuid))
        })?;
    }
    if !reader.is_empty() {
        return Err(VaultError::format("unexpected data after last entry"));
    }
    Ok(store)
}

fn parse_entry(reader: &mut Reader<'_>) -> Result<Entry> {
    let mut fields: Vec<(u8, &[u8])> = Vec::new();
    loop {
        let kind = reader.u8()?;
        let len = reader.u32()? as usize;
        let value = reader.take(len)?;
        if kind == FIELD_END {
            if len != 0 {
                return Err(VaultError::format("end-of-entry marker carries data"));
            }
            break;
        }
        fields.push((kind, value));
    }

    let mut uuids = fields.iter().filter(|(kind, _)| *kind == FIELD_UUID);
    let uuid = match (uuids.next(), uuids.next()) {
        (Some((_, value)), None) => Uuid::from_slice(value)
            .map_err(|_| VaultError::format("entry id is not 16 bytes"))?,
        (None, _) => return Err(VaultError::format("entry without id")),
        (Some(_), Some(_)) => return Err(VaultError::format("entry with several ids")),
    };

    let mut entry = Entry::empty(uuid);
    for (kind, value) in fields {
        match kind {
            FIELD_UUID => {}
            FIELD_GROUP => entry.group = text(value)?,
            FIELD_TITLE => entry.title = text(value)?,
            FIELD_USER => entry.user = text(value)?,
            FIELD_URL => entry.url = text(value)?,
            FIELD_NOTES => entry.notes = SecureBuffer::from_slice(value)?,
            FIELD_PASSWORD => entry.password = SecureBuffer::from_slice(value)?,
            FIELD_CREATED => entry.created = timestamp(value)?,
            FIELD_MODIFIED => entry.modified = timestamp(value)?,
            FIELD_EXPIRES => entry.expires = Some(timestamp(value)?),
            other => entry.unknown.push(UnknownField {
                kind: other,
                value: SecureBuffer::from_slice(value)?,
            }),
        }
    }
    Ok(entry)
}

fn text(value: &[u8]) -> Result<String> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| VaultError::format("text field is not valid UTF-8"))
}

fn timestamp_bytes(at: DateTime<Utc>) -> [u8; TIMESTAMP_LEN] {
    let mut out = [0u8; TIMESTAMP_LEN];
    out[..8].copy_from_slice(&at.timestamp().to_le_bytes());
    out[8..].copy_from_slice(&at.timestamp_subsec_nanos().to_le_bytes());
    out
}

fn timestamp(value: &[u8]) -> Result<DateTime<Utc>> {
    if value.len() != TIMESTAMP_LEN {
        return Err(VaultError::format("timestamp field has wrong size"));
    }
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&value[..8]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&value[8..]);
    DateTime::<Utc>::from_timestamp(i64::from_le_bytes(secs), u32::from_le_bytes(nanos))
        .ok_or_else(|| VaultError::format("timestamp out of range"))
}

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| VaultError::format("unexpected end of data"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(buf))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(buf))
    }
}
