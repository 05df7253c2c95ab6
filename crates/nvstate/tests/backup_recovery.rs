// Permanent-state backup chain: overwrite keeps a .bak, corruption recovery
// swaps it in, a second swap reverts.

use nvstate::{BlobName, KeyRegistry, NvError, NvStore, StoreConfig};

fn backed_up_store(dir: &std::path::Path) -> NvStore {
    let mut cfg = StoreConfig::new(format!("dir://{}", dir.display()));
    cfg.make_backup = true;
    NvStore::new(cfg, KeyRegistry::new()).unwrap()
}

#[test]
fn overwrite_leaves_backup_of_previous_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = backed_up_store(dir.path());

    store.store(BlobName::PermAll, b"generation 1").unwrap();
    assert!(!dir.path().join("tpm-00.permall.bak").exists());

    store.store(BlobName::PermAll, b"generation 2").unwrap();
    assert!(dir.path().join("tpm-00.permall.bak").exists());
    assert_eq!(store.load(BlobName::PermAll).unwrap(), b"generation 2");
}

#[test]
fn corrupt_current_state_recovers_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = backed_up_store(dir.path());

    store.store(BlobName::PermAll, b"good state").unwrap();
    store.store(BlobName::PermAll, b"good state").unwrap();

    // Corrupt the current file the way a torn write would.
    let current = dir.path().join("tpm-00.permall");
    std::fs::write(&current, b"garbage").unwrap();
    assert!(store.load(BlobName::PermAll).is_err());

    // First swap brings the backup in; this is what init-failure recovery does.
    store.restore_backup().unwrap();
    assert_eq!(store.load(BlobName::PermAll).unwrap(), b"good state");

    // Second swap reverts, as when the retried init also fails.
    store.restore_backup().unwrap();
    assert!(store.load(BlobName::PermAll).is_err());
}

#[test]
fn restore_without_backup_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = backed_up_store(dir.path());
    store.store(BlobName::PermAll, b"only generation").unwrap();
    assert!(matches!(store.restore_backup(), Err(NvError::Fail(_))));
}

#[test]
fn volatile_state_is_not_backed_up() {
    let dir = tempfile::tempdir().unwrap();
    let store = backed_up_store(dir.path());
    store.store(BlobName::VolatileState, b"v1").unwrap();
    store.store(BlobName::VolatileState, b"v2").unwrap();
    assert!(!dir.path().join("tpm-00.volatilestate.bak").exists());
}
