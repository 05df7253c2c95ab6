//! The NVRAM store: named blobs bound to a backend, a key registry, and the
//! durability policy chosen at configuration time.
//!
//! The store is the process-wide context for everything persistence-related.
//! It is built once, shared behind an `Arc`, and serializes all backend
//! access through an internal mutex. Keys are fixed at build time.

use std::sync::Mutex;

use crate::backend::Backend;
use crate::blob;
use crate::keys::KeyRegistry;
use crate::NvError;

/// The three persisted state blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobName {
    /// Permanent state: survives restarts, subject to backup.
    PermAll,
    /// Volatile state snapshot taken across suspend.
    VolatileState,
    /// Saved state written by the TPM's own save operation.
    SaveState,
}

impl BlobName {
    /// The on-disk name component.
    pub fn as_str(self) -> &'static str {
        match self {
            BlobName::PermAll => "permall",
            BlobName::VolatileState => "volatilestate",
            BlobName::SaveState => "savestate",
        }
    }
}

/// Store configuration, immutable once the store is built.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend URI: `dir://<path>` or `file://<path>`.
    pub backend_uri: String,
    /// TPM instance number; 0 for a single TPM.
    pub tpm_number: u32,
    /// Permission bits applied on each write.
    pub mode: u32,
    /// Whether `mode` is the built-in default rather than operator-chosen.
    pub mode_is_default: bool,
    /// Whether the backend takes the storage lock at init.
    pub do_locking: bool,
    /// Keep a backup of permanent state across overwrites.
    pub make_backup: bool,
    /// fsync file and directory on every write.
    pub do_fsync: bool,
}

impl StoreConfig {
    /// Defaults for a backend URI: mode 0640, locking on for the directory
    /// backend and off for the single-file backend, no backup, no fsync.
    pub fn new(backend_uri: impl Into<String>) -> Self {
        let backend_uri = backend_uri.into();
        let do_locking = !backend_uri.starts_with("file://");
        StoreConfig {
            backend_uri,
            tpm_number: 0,
            mode: 0o640,
            mode_is_default: true,
            do_locking,
            make_backup: false,
            do_fsync: false,
        }
    }
}

/// Name-to-bytes persistence with encryption, locking, and backup.
#[derive(Debug)]
pub struct NvStore {
    cfg: StoreConfig,
    keys: KeyRegistry,
    backend: Mutex<Backend>,
}

impl NvStore {
    /// Build a store. Validates the backend URI, the access rights of the
    /// target, and the backup/backend combination.
    pub fn new(cfg: StoreConfig, keys: KeyRegistry) -> Result<Self, NvError> {
        if cfg.make_backup && cfg.backend_uri.starts_with("file://") {
            return Err(NvError::BadParameter(
                "backup requires the directory backend".into(),
            ));
        }
        let backend =
            Backend::from_uri(&cfg.backend_uri, cfg.tpm_number, cfg.mode, cfg.do_fsync)?;
        backend.check_access()?;
        Ok(NvStore { cfg, keys, backend: Mutex::new(backend) })
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &StoreConfig {
        &self.cfg
    }

    /// The key registry (read-only after build).
    pub fn keys(&self) -> &KeyRegistry {
        &self.keys
    }

    fn backend(&self) -> std::sync::MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Load and unwrap a blob. `Retry` marks a blob that was never written.
    pub fn load(&self, name: BlobName) -> Result<Vec<u8>, NvError> {
        let raw = self.backend().load(name)?;
        let plain = blob::unwrap(&self.keys, &raw);
        if let Err(ref e) = plain {
            tracing::error!(name = name.as_str(), error = %e, "decrypting stored blob failed");
        }
        plain
    }

    /// Wrap and store a blob. Permanent state is backed up first when
    /// backups are enabled.
    pub fn store(&self, name: BlobName, plaintext: &[u8]) -> Result<(), NvError> {
        let wrapped = blob::wrap(&self.keys, plaintext, true)?;
        let backend = self.backend();
        if name == BlobName::PermAll && self.cfg.make_backup {
            backend.backup_current(name)?;
        }
        backend.store(name, &wrapped)
    }

    /// Remove a blob. A missing blob is fatal only when `must_exist`.
    pub fn delete(&self, name: BlobName, must_exist: bool) -> Result<(), NvError> {
        self.backend().delete(name, must_exist)
    }

    /// Acquire the storage lock, retrying with exponential back-off.
    /// Idempotent when the lock is already held.
    pub fn lock_storage(&self, retries: u32) -> Result<(), NvError> {
        self.backend().lock(retries)
    }

    /// Drop the storage lock, e.g. after handing state to a migration peer.
    pub fn release_lock(&self) {
        self.backend().unlock();
    }

    /// Whether the storage lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.backend().is_locked()
    }

    /// Swap permanent state with its backup copy. A second call reverts the
    /// swap; used by the driver's init-failure recovery.
    pub fn restore_backup(&self) -> Result<(), NvError> {
        self.backend().restore_backup(BlobName::PermAll)
    }

    /// Produce a transfer blob for `name`. With `reencrypt` the payload goes
    /// back under the state key instead of travelling as plain data inside
    /// the (possibly migration-encrypted) envelope. Returns the blob and
    /// whether the inner layer is encrypted.
    pub fn export_blob(&self, name: BlobName, reencrypt: bool) -> Result<(Vec<u8>, bool), NvError> {
        let plain = self.load(name)?;
        blob::export(&self.keys, &plain, reencrypt)
    }

    /// Unpack a transfer blob down to plaintext for the TPM library.
    pub fn import_blob(
        &self,
        data: &[u8],
        caller_says_encrypted: bool,
    ) -> Result<Vec<u8>, NvError> {
        blob::import(&self.keys, data, caller_says_encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{EncryptionMode, SymKey};

    fn dir_store(dir: &std::path::Path, keys: KeyRegistry) -> NvStore {
        let cfg = StoreConfig::new(format!("dir://{}", dir.display()));
        NvStore::new(cfg, keys).unwrap()
    }

    #[test]
    fn first_boot_load_is_retry() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir_store(dir.path(), KeyRegistry::new());
        assert!(matches!(store.load(BlobName::PermAll), Err(NvError::Retry)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn store_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir_store(dir.path(), KeyRegistry::new());
        store.store(BlobName::VolatileState, b"volatile bytes").unwrap();
        assert_eq!(store.load(BlobName::VolatileState).unwrap(), b"volatile bytes");
    }

    #[test]
    fn encrypted_store_unreadable_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut keys = KeyRegistry::new();
        keys.set_state_key(SymKey::new(EncryptionMode::Aes256Cbc, &[9u8; 32]).unwrap())
            .unwrap();
        let store = dir_store(dir.path(), keys);
        store.store(BlobName::PermAll, b"secret state").unwrap();

        let bare = dir_store(dir.path(), KeyRegistry::new());
        assert!(matches!(bare.load(BlobName::PermAll), Err(NvError::KeyNotFound)));
    }

    #[test]
    fn backup_with_file_backend_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = StoreConfig::new(format!("file://{}/state", dir.path().display()));
        cfg.make_backup = true;
        assert!(matches!(
            NvStore::new(cfg, KeyRegistry::new()),
            Err(NvError::BadParameter(_))
        ));
    }

    #[test]
    fn locking_defaults_follow_backend() {
        assert!(StoreConfig::new("dir:///tmp/x").do_locking);
        assert!(!StoreConfig::new("file:///tmp/x").do_locking);
    }
}
