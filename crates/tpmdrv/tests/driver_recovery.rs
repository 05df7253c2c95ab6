// Driver startup recovery from the permanent-state backup, and the
// synthesized TPM2_Shutdown on stop.

use std::sync::Arc;

use nvstate::{BlobName, KeyRegistry, NvStore, StoreConfig};
use tpmdrv::wire::{self, rc};
use tpmdrv::{StubEngine, TpmDriver, TpmVersion};

fn store_in(dir: &std::path::Path, backup: bool) -> Arc<NvStore> {
    let mut cfg = StoreConfig::new(format!("dir://{}", dir.display()));
    cfg.make_backup = backup;
    Arc::new(NvStore::new(cfg, KeyRegistry::new()).unwrap())
}

fn driver_for(store: Arc<NvStore>, auto_shutdown: bool) -> TpmDriver<StubEngine> {
    TpmDriver::new(StubEngine::new(store.clone()), store, TpmVersion::V2, auto_shutdown)
}

#[test]
fn init_failure_recovers_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path(), true);

    // Manufacture, then overwrite once so a .bak exists.
    let mut driver = driver_for(store.clone(), true);
    driver.start(None, false, false).unwrap();
    let good = driver.get_state(BlobName::PermAll).unwrap();
    store.store(BlobName::PermAll, &good).unwrap();
    driver.stop();

    // Corrupt the current permanent state.
    std::fs::write(dir.path().join("tpm-00.permall"), b"torn write").unwrap();

    let mut driver = driver_for(store.clone(), true);
    driver.start(None, false, false).unwrap();
    assert_eq!(driver.get_state(BlobName::PermAll).unwrap(), good);
}

#[test]
fn init_failure_with_corrupt_backup_reverts_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path(), true);

    let mut driver = driver_for(store.clone(), true);
    driver.start(None, false, false).unwrap();
    let good = driver.get_state(BlobName::PermAll).unwrap();
    store.store(BlobName::PermAll, &good).unwrap();
    driver.stop();

    std::fs::write(dir.path().join("tpm-00.permall"), b"torn current").unwrap();
    std::fs::write(dir.path().join("tpm-00.permall.bak"), b"torn backup").unwrap();

    let mut driver = driver_for(store, true);
    assert!(driver.start(None, false, false).is_err());
    // The rename chain was reverted: the torn current file is back in place.
    assert_eq!(std::fs::read(dir.path().join("tpm-00.permall")).unwrap(), b"torn current");
    assert_eq!(std::fs::read(dir.path().join("tpm-00.permall.bak")).unwrap(), b"torn backup");
}

#[test]
fn init_failure_without_backup_policy_surfaces() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path(), false);
    store.store(BlobName::PermAll, b"not a stub blob").unwrap();

    let mut driver = driver_for(store, true);
    assert!(driver.start(None, false, false).is_err());
}

#[test]
fn stop_synthesizes_exactly_one_shutdown_su_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_for(store_in(dir.path(), false), true);
    driver.start(None, false, false).unwrap();

    let startup = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
    driver.process(&startup, 0).unwrap();
    let mut getcap = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
    getcap[6..10].copy_from_slice(&wire::TPM2_CC_GET_CAPABILITY.to_be_bytes());
    driver.process(&getcap, 0).unwrap();

    driver.stop();

    let shutdowns: Vec<_> = driver
        .engine()
        .seen()
        .iter()
        .filter(|c| c.ordinal == wire::TPM2_CC_SHUTDOWN)
        .collect();
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].param, Some(wire::TPM2_SU_STATE));
    assert_eq!(shutdowns[0].result, rc::SUCCESS);
}

#[test]
fn no_shutdown_when_disabled_or_already_sent() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_for(store_in(dir.path(), false), false);
    driver.start(None, false, false).unwrap();
    driver
        .process(&wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap(), 0)
        .unwrap();
    driver.stop();
    assert!(driver.engine().seen().iter().all(|c| c.ordinal != wire::TPM2_CC_SHUTDOWN));

    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_for(store_in(dir.path(), false), true);
    driver.start(None, false, false).unwrap();
    driver
        .process(&wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap(), 0)
        .unwrap();
    driver.process(&wire::tpm2_shutdown_cmd(wire::TPM2_SU_STATE), 0).unwrap();
    driver.stop();
    let shutdowns = driver
        .engine()
        .seen()
        .iter()
        .filter(|c| c.ordinal == wire::TPM2_CC_SHUTDOWN)
        .count();
    assert_eq!(shutdowns, 1);
}

#[test]
fn shutdown_before_startup_stops_at_initialize() {
    // A TPM that never saw Startup answers RC_INITIALIZE; the driver must
    // not fall through to SU_CLEAR.
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_for(store_in(dir.path(), false), true);
    driver.start(None, false, false).unwrap();
    driver.stop();

    let shutdowns: Vec<_> = driver
        .engine()
        .seen()
        .iter()
        .filter(|c| c.ordinal == wire::TPM2_CC_SHUTDOWN)
        .collect();
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].result, rc::TPM2_RC_INITIALIZE);
}

#[test]
fn cancel_reaches_only_inflight_cancelable_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_for(store_in(dir.path(), false), true);
    driver.start(None, false, false).unwrap();
    let canceller = driver.canceller();

    // Nothing in flight: the request is not forwarded.
    assert!(!canceller.cancel());
}

#[test]
fn store_volatile_snapshots_engine_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path(), false);
    let mut driver = driver_for(store.clone(), true);
    driver.start(None, false, false).unwrap();

    driver.store_volatile().unwrap();
    let on_disk = store.load(BlobName::VolatileState).unwrap();
    assert!(!on_disk.is_empty());
}
