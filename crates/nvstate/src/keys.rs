//! Symmetric key registry: the state key and the migration key.
//!
//! Keys arrive from a file, a borrowed file descriptor, or a passphrase run
//! through a KDF. Whatever the source, the raw material is parsed into a
//! [`SymKey`] and every intermediate buffer is wiped.

use std::fs;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::path::Path;

use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::NvError;

/// Cipher selection for blobs at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// AES-128 in CBC mode, 16-byte key.
    Aes128Cbc,
    /// AES-256 in CBC mode, 32-byte key.
    Aes256Cbc,
}

impl EncryptionMode {
    /// Key size in bytes for this mode.
    pub fn key_len(self) -> usize {
        match self {
            EncryptionMode::Aes128Cbc => 16,
            EncryptionMode::Aes256Cbc => 32,
        }
    }

    /// Parse the option-string spelling of a mode.
    pub fn from_name(name: &str) -> Result<Self, NvError> {
        match name {
            "aes-128-cbc" | "aes-cbc" => Ok(EncryptionMode::Aes128Cbc),
            "aes-256-cbc" => Ok(EncryptionMode::Aes256Cbc),
            _ => Err(NvError::BadMode),
        }
    }
}

/// Key derivation scheme carried with a passphrase source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfId {
    /// PBKDF2-HMAC-SHA-512 with the fixed compatibility parameters.
    Pbkdf2,
    /// Legacy single SHA-512 pass, truncated to the key size.
    Sha512,
}

impl KdfId {
    /// Parse the option-string spelling of a KDF.
    pub fn from_name(name: &str) -> Result<Self, NvError> {
        match name {
            "pbkdf2" => Ok(KdfId::Pbkdf2),
            "sha512" => Ok(KdfId::Sha512),
            _ => Err(NvError::BadKeyProperty(format!("unknown kdf '{name}'"))),
        }
    }
}

/// Serialization of raw key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// Hexadecimal, 32 or 64 nibbles depending on the mode.
    Hex,
    /// Raw bytes of exactly the mode's key size.
    Binary,
}

impl KeyFormat {
    /// Parse the option-string spelling of a format.
    pub fn from_name(name: &str) -> Result<Self, NvError> {
        match name {
            "hex" => Ok(KeyFormat::Hex),
            "binary" => Ok(KeyFormat::Binary),
            _ => Err(NvError::BadKeyProperty(format!("unknown key format '{name}'"))),
        }
    }
}

/// A loaded symmetric key. Material is wiped on drop.
#[derive(Clone)]
pub struct SymKey {
    mode: EncryptionMode,
    material: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key bytes.
        f.debug_struct("SymKey").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl SymKey {
    /// Build a key from raw bytes, validating the length against the mode.
    pub fn new(mode: EncryptionMode, bytes: &[u8]) -> Result<Self, NvError> {
        if bytes.len() != mode.key_len() {
            return Err(NvError::BadKeyProperty(format!(
                "key is {} bytes, mode needs {}",
                bytes.len(),
                mode.key_len()
            )));
        }
        Ok(SymKey { mode, material: Zeroizing::new(bytes.to_vec()) })
    }

    /// Parse key material out of `buf` according to `format`, wiping `buf`
    /// before returning. Hex input may carry trailing ASCII whitespace.
    pub fn from_buffer(
        mode: EncryptionMode,
        format: KeyFormat,
        buf: &mut Vec<u8>,
    ) -> Result<Self, NvError> {
        let res = Self::parse(mode, format, buf);
        buf.zeroize();
        res
    }

    fn parse(mode: EncryptionMode, format: KeyFormat, buf: &[u8]) -> Result<Self, NvError> {
        match format {
            KeyFormat::Hex => {
                let text = std::str::from_utf8(buf)
                    .map_err(|_| NvError::BadKeyProperty("key file is not hex".into()))?
                    .trim();
                let decoded = Zeroizing::new(hex::decode(text).map_err(|_| {
                    NvError::BadKeyProperty("key file is not hex".into())
                })?);
                SymKey::new(mode, &decoded)
            }
            KeyFormat::Binary => SymKey::new(mode, buf),
        }
    }

    /// Derive a key from a passphrase with the selected KDF.
    pub fn from_passphrase(
        mode: EncryptionMode,
        kdf: KdfId,
        passphrase: &[u8],
    ) -> Result<Self, NvError> {
        if passphrase.is_empty() {
            return Err(NvError::BadKeyProperty("empty passphrase".into()));
        }
        let derived = crypto::kdf(passphrase, mode.key_len(), kdf);
        SymKey::new(mode, &derived)
    }

    /// The cipher mode this key belongs to.
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Raw key bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.material
    }
}

/// Read a key file and parse it; optionally unlink the file afterwards.
pub fn load_key_file(
    path: &Path,
    format: KeyFormat,
    mode: EncryptionMode,
    remove: bool,
) -> Result<SymKey, NvError> {
    let mut raw = fs::read(path)?;
    let key = SymKey::from_buffer(mode, format, &mut raw);
    if key.is_ok() && remove {
        fs::remove_file(path)?;
    }
    key
}

/// Read key material from a file descriptor handed over by the caller.
/// The descriptor is consumed and closed.
pub fn load_key_fd(fd: RawFd, format: KeyFormat, mode: EncryptionMode) -> Result<SymKey, NvError> {
    let mut raw = read_fd(fd, 2 * mode.key_len() + 16)?;
    SymKey::from_buffer(mode, format, &mut raw)
}

/// Read a passphrase file and derive a key; optionally unlink the file.
pub fn load_passphrase_file(
    path: &Path,
    mode: EncryptionMode,
    kdf: KdfId,
    remove: bool,
) -> Result<SymKey, NvError> {
    let raw = Zeroizing::new(fs::read(path)?);
    let key = SymKey::from_passphrase(mode, kdf, trim_newline(&raw));
    if key.is_ok() && remove {
        fs::remove_file(path)?;
    }
    key
}

/// Read a passphrase from a file descriptor and derive a key.
/// The descriptor is consumed and closed.
pub fn load_passphrase_fd(fd: RawFd, mode: EncryptionMode, kdf: KdfId) -> Result<SymKey, NvError> {
    let raw = Zeroizing::new(read_fd(fd, 4096)?);
    SymKey::from_passphrase(mode, kdf, trim_newline(&raw))
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && (buf[end - 1] == b'\n' || buf[end - 1] == b'\r') {
        end -= 1;
    }
    &buf[..end]
}

fn read_fd(fd: RawFd, limit: usize) -> Result<Vec<u8>, NvError> {
    // The caller hands the descriptor over for good; File closes it on drop.
    let mut file = unsafe { fs::File::from_raw_fd(fd) };
    let mut raw = Vec::new();
    file.by_ref().take(limit as u64 + 1).read_to_end(&mut raw)?;
    if raw.len() > limit {
        raw.zeroize();
        return Err(NvError::BadKeyProperty("key material too large".into()));
    }
    Ok(raw)
}

/// Holds at most one state key and one migration key. Keys are installed
/// once, before the store starts serving, and never rotated.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    state: Option<SymKey>,
    migration: Option<SymKey>,
}

impl KeyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the state key. Fails if one is already installed.
    pub fn set_state_key(&mut self, key: SymKey) -> Result<(), NvError> {
        if self.state.is_some() {
            return Err(NvError::Fail("state key already installed".into()));
        }
        self.state = Some(key);
        Ok(())
    }

    /// Install the migration key. Fails if one is already installed.
    pub fn set_migration_key(&mut self, key: SymKey) -> Result<(), NvError> {
        if self.migration.is_some() {
            return Err(NvError::Fail("migration key already installed".into()));
        }
        self.migration = Some(key);
        Ok(())
    }

    /// The state key, if installed.
    pub fn state_key(&self) -> Option<&SymKey> {
        self.state.as_ref()
    }

    /// The migration key, if installed.
    pub fn migration_key(&self) -> Option<&SymKey> {
        self.migration.as_ref()
    }

    /// Whether a state key is installed.
    pub fn has_state_key(&self) -> bool {
        self.state.is_some()
    }

    /// Whether a migration key is installed.
    pub fn has_migration_key(&self) -> bool {
        self.migration.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_key_lengths() {
        assert_eq!(EncryptionMode::Aes128Cbc.key_len(), 16);
        assert_eq!(EncryptionMode::Aes256Cbc.key_len(), 32);
        assert!(EncryptionMode::from_name("aes-192-cbc").is_err());
    }

    #[test]
    fn hex_parse_and_wipe() {
        let mut buf = b"000102030405060708090a0b0c0d0e0f\n".to_vec();
        let key = SymKey::from_buffer(EncryptionMode::Aes128Cbc, KeyFormat::Hex, &mut buf).unwrap();
        assert_eq!(key.bytes()[0], 0x00);
        assert_eq!(key.bytes()[15], 0x0f);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn binary_wrong_length_rejected() {
        let mut buf = vec![0x42; 17];
        let err = SymKey::from_buffer(EncryptionMode::Aes128Cbc, KeyFormat::Binary, &mut buf)
            .unwrap_err();
        assert!(matches!(err, NvError::BadKeyProperty(_)));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn registry_rejects_rotation() {
        let mut reg = KeyRegistry::new();
        let key = SymKey::new(EncryptionMode::Aes128Cbc, &[7u8; 16]).unwrap();
        reg.set_state_key(key.clone()).unwrap();
        assert!(reg.has_state_key());
        assert!(!reg.has_migration_key());
        assert!(reg.set_state_key(key).is_err());
    }

    #[test]
    fn passphrase_kdfs_differ() {
        let a = SymKey::from_passphrase(EncryptionMode::Aes256Cbc, KdfId::Pbkdf2, b"secret")
            .unwrap();
        let b = SymKey::from_passphrase(EncryptionMode::Aes256Cbc, KdfId::Sha512, b"secret")
            .unwrap();
        assert_ne!(a.bytes(), b.bytes());
        assert_eq!(a.bytes().len(), 32);
    }
}
