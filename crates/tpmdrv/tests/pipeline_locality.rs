// Locality policy through the request pipeline, including the exact wire
// shapes a TPM 2 front-end produces.

use std::sync::Arc;

use nvstate::{KeyRegistry, NvStore, StoreConfig};
use tpmdrv::wire::{self, rc};
use tpmdrv::{LocalityPolicy, RequestPipeline, StubEngine, TpmDriver, TpmVersion};

fn driver_in(dir: &std::path::Path) -> TpmDriver<StubEngine> {
    let store = Arc::new(
        NvStore::new(StoreConfig::new(format!("dir://{}", dir.display())), KeyRegistry::new())
            .unwrap(),
    );
    let mut driver = TpmDriver::new(StubEngine::new(store.clone()), store, TpmVersion::V2, true);
    driver.start(None, false, false).unwrap();
    driver
}

fn startup(driver: &mut TpmDriver<StubEngine>, pipeline: &mut RequestPipeline) {
    let cmd = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
    let resp = pipeline.handle(driver, &cmd);
    assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
}

fn set_locality_cmd(locality: u8) -> Vec<u8> {
    // tag 8001, size 000B, ordinal 0000013B, locality byte.
    let mut cmd = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x3B];
    cmd.push(locality);
    cmd
}

#[test]
fn set_locality_3_with_policy_allowing_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_in(dir.path());
    let policy = LocalityPolicy { allow_set_locality: true, reject_locality_4: false };
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, policy);
    startup(&mut driver, &mut pipeline);

    let resp = pipeline.handle(&mut driver, &set_locality_cmd(3));
    assert_eq!(resp, vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(pipeline.locality(), 3);

    // Subsequent commands observe locality 3.
    let mut getcap = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
    getcap[6..10].copy_from_slice(&wire::TPM2_CC_GET_CAPABILITY.to_be_bytes());
    let resp = pipeline.handle(&mut driver, &getcap);
    assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
    assert_eq!(pipeline.locality(), 3);
}

#[test]
fn set_locality_rejected_without_policy() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_in(dir.path());
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, LocalityPolicy::default());
    startup(&mut driver, &mut pipeline);

    let resp = pipeline.handle(&mut driver, &set_locality_cmd(1));
    assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_FAILURE));
    assert_eq!(pipeline.locality(), 0);
}

#[test]
fn locality_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_in(dir.path());
    let policy = LocalityPolicy { allow_set_locality: true, reject_locality_4: true };
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, policy);
    startup(&mut driver, &mut pipeline);

    for bad in [4u8, 5, 6, 255] {
        let resp = pipeline.handle(&mut driver, &set_locality_cmd(bad));
        assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_LOCALITY), "locality {bad}");
        assert_eq!(pipeline.locality(), 0);
    }

    // Locality 4 passes once the rejection bit is off.
    let policy = LocalityPolicy { allow_set_locality: true, reject_locality_4: false };
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, policy);
    let resp = pipeline.handle(&mut driver, &set_locality_cmd(4));
    assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
    assert_eq!(pipeline.locality(), 4);
}

#[test]
fn short_buffers_answer_insufficient() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_in(dir.path());
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, LocalityPolicy::default());

    let resp = pipeline.handle(&mut driver, &[0x80, 0x01, 0x00]);
    assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_INSUFFICIENT));

    // SetLocality without its locality byte is short as well.
    let policy = LocalityPolicy { allow_set_locality: true, reject_locality_4: false };
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, policy);
    let resp = pipeline.handle(&mut driver, &set_locality_cmd(0)[..10]);
    assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_INSUFFICIENT));
}

#[test]
fn tcg_prefix_overrides_locality_for_one_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut driver = driver_in(dir.path());
    let policy = LocalityPolicy { allow_set_locality: true, reject_locality_4: false };
    let mut pipeline = RequestPipeline::new(TpmVersion::V2, policy);
    startup(&mut driver, &mut pipeline);

    let inner = {
        let mut cmd = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
        cmd[6..10].copy_from_slice(&wire::TPM2_CC_GET_CAPABILITY.to_be_bytes());
        cmd
    };
    let mut prefixed = Vec::new();
    prefixed.extend_from_slice(&8u32.to_be_bytes());
    prefixed.push(2);
    prefixed.extend_from_slice(&(inner.len() as u32).to_be_bytes());
    prefixed.extend_from_slice(&inner);

    let resp = pipeline.handle(&mut driver, &prefixed);
    assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
    // The override was per-command; the connection locality is unchanged.
    assert_eq!(pipeline.locality(), 0);
}
