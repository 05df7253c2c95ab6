//! Loopback engine.
//!
//! Stands in for a linked TPM command library in the test-suite and in
//! deployments that only exercise the persistence and control planes. It
//! answers the handful of ordinals the surrounding layers synthesize or
//! observe (Startup, Shutdown, the cancelable primitives) with well-formed
//! responses and keeps its state through the injected store.

use std::sync::Arc;

use nvstate::{BlobName, NvError, NvStore};

use crate::engine::{CancelHandle, TpmEngine};
use crate::wire::{self, rc, TpmVersion};
use crate::DrvError;

// Permanent-state container prefix; init fails on anything else, which is
// what lets the driver's backup recovery kick in.
const PERM_MAGIC: &[u8] = b"STUB1";

const BUFSIZE_DEFAULT: u32 = 4096;
const BUFSIZE_MIN: u32 = 4096;
const BUFSIZE_MAX: u32 = 32768;

/// One command the stub saw, for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenCommand {
    /// Command ordinal.
    pub ordinal: u32,
    /// First 16-bit parameter after the header, when present.
    pub param: Option<u16>,
    /// Result code of the stub's response.
    pub result: u32,
}

/// In-process loopback TPM engine.
pub struct StubEngine {
    store: Arc<NvStore>,
    version: TpmVersion,
    cancel: CancelHandle,
    running: bool,
    started: bool,
    established: bool,
    manufactured: bool,
    buffer_size: u32,
    permanent: Vec<u8>,
    volatile: Vec<u8>,
    pending: Vec<(BlobName, Vec<u8>)>,
    seen: Vec<SeenCommand>,
}

impl StubEngine {
    /// Engine bound to a store; state materializes at `main_init`.
    pub fn new(store: Arc<NvStore>) -> Self {
        StubEngine {
            store,
            version: TpmVersion::V2,
            cancel: CancelHandle::new(),
            running: false,
            started: false,
            established: false,
            manufactured: false,
            buffer_size: BUFSIZE_DEFAULT,
            permanent: Vec::new(),
            volatile: Vec::new(),
            pending: Vec::new(),
            seen: Vec::new(),
        }
    }

    /// Commands processed so far, oldest first.
    pub fn seen(&self) -> &[SeenCommand] {
        &self.seen
    }

    fn respond(&mut self, ordinal: u32, param: Option<u16>, result: u32) -> Vec<u8> {
        self.seen.push(SeenCommand { ordinal, param, result });
        wire::error_response(self.version, result)
    }

    fn take_pending(&mut self, name: BlobName) -> Option<Vec<u8>> {
        let at = self.pending.iter().position(|(n, _)| *n == name)?;
        Some(self.pending.remove(at).1)
    }
}

impl TpmEngine for StubEngine {
    fn choose_version(&mut self, version: TpmVersion) -> Result<(), DrvError> {
        if self.running {
            return Err(DrvError::Engine("cannot change version while running".into()));
        }
        self.version = version;
        Ok(())
    }

    fn set_profile(&mut self, profile_json: &str) -> Result<(), DrvError> {
        serde_json::from_str::<serde_json::Value>(profile_json)
            .map_err(|e| DrvError::Profile(e.to_string()))?;
        Ok(())
    }

    fn main_init(&mut self) -> Result<(), DrvError> {
        let permanent = match self.take_pending(BlobName::PermAll) {
            Some(blob) => {
                self.store.store(BlobName::PermAll, &blob)?;
                blob
            }
            None => match self.store.load(BlobName::PermAll) {
                Ok(blob) => blob,
                Err(NvError::Retry) => {
                    // First boot: manufacture and persist.
                    let blob = PERM_MAGIC.to_vec();
                    self.store.store(BlobName::PermAll, &blob)?;
                    self.manufactured = true;
                    self.permanent = blob;
                    self.volatile = self.take_pending(BlobName::VolatileState).unwrap_or_default();
                    self.running = true;
                    self.started = false;
                    return Ok(());
                }
                Err(e) => return Err(DrvError::Nv(e)),
            },
        };
        if !permanent.starts_with(PERM_MAGIC) {
            return Err(DrvError::Engine("permanent state is corrupted".into()));
        }
        self.manufactured = false;
        self.permanent = permanent;
        self.volatile = self.take_pending(BlobName::VolatileState).unwrap_or_default();
        self.running = true;
        self.started = false;
        Ok(())
    }

    fn terminate(&mut self) {
        self.running = false;
        self.started = false;
    }

    fn process(&mut self, command: &[u8], _locality: u8) -> Result<Vec<u8>, DrvError> {
        if !self.running {
            return Err(DrvError::Engine("engine not initialized".into()));
        }
        let Some(hdr) = wire::parse_req_header(command) else {
            return Ok(wire::shortmsg_error_response(self.version));
        };
        let param = (command.len() >= wire::REQ_HEADER_LEN + 2)
            .then(|| u16::from_be_bytes([command[10], command[11]]));

        if self.cancel.is_requested() && wire::is_cancelable(self.version, hdr.ordinal) {
            self.cancel.clear();
            let code = match self.version {
                TpmVersion::V2 => rc::TPM2_RC_CANCELED,
                TpmVersion::V12 => rc::FAIL,
            };
            return Ok(self.respond(hdr.ordinal, param, code));
        }

        let startup_ord = match self.version {
            TpmVersion::V2 => wire::TPM2_CC_STARTUP,
            TpmVersion::V12 => wire::TPM_ORD_STARTUP,
        };
        if hdr.ordinal == startup_ord {
            self.started = true;
            return Ok(self.respond(hdr.ordinal, param, rc::SUCCESS));
        }
        if self.version == TpmVersion::V2 && !self.started {
            return Ok(self.respond(hdr.ordinal, param, rc::TPM2_RC_INITIALIZE));
        }
        Ok(self.respond(hdr.ordinal, param, rc::SUCCESS))
    }

    fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn get_state(&mut self, name: BlobName) -> Result<Vec<u8>, DrvError> {
        if !self.running {
            return Err(DrvError::Engine("engine not initialized".into()));
        }
        match name {
            BlobName::PermAll => Ok(self.permanent.clone()),
            BlobName::VolatileState => {
                if self.volatile.is_empty() {
                    self.volatile = b"STUB1-VOLATILE".to_vec();
                }
                Ok(self.volatile.clone())
            }
            BlobName::SaveState => Ok(Vec::new()),
        }
    }

    fn set_state(&mut self, name: BlobName, data: &[u8]) -> Result<(), DrvError> {
        if data.is_empty() {
            self.pending.retain(|(n, _)| *n != name);
            return Ok(());
        }
        if name == BlobName::PermAll && !data.starts_with(PERM_MAGIC) {
            return Err(DrvError::Engine("foreign permanent state".into()));
        }
        self.pending.retain(|(n, _)| *n != name);
        self.pending.push((name, data.to_vec()));
        Ok(())
    }

    fn hash_start(&mut self) -> Result<(), DrvError> {
        self.established = true;
        Ok(())
    }

    fn hash_data(&mut self, _data: &[u8]) -> Result<(), DrvError> {
        Ok(())
    }

    fn hash_end(&mut self) -> Result<(), DrvError> {
        Ok(())
    }

    fn tpm_established(&self) -> bool {
        self.established
    }

    fn reset_established(&mut self) -> Result<(), DrvError> {
        self.established = false;
        Ok(())
    }

    fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    fn set_buffer_size(&mut self, wanted: u32) -> (u32, u32, u32) {
        if wanted != 0 {
            self.buffer_size = wanted.clamp(BUFSIZE_MIN, BUFSIZE_MAX);
        }
        (self.buffer_size, BUFSIZE_MIN, BUFSIZE_MAX)
    }

    fn was_manufactured(&self) -> bool {
        self.manufactured
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvstate::{KeyRegistry, StoreConfig};

    fn store(dir: &std::path::Path) -> Arc<NvStore> {
        Arc::new(
            NvStore::new(StoreConfig::new(format!("dir://{}", dir.display())), KeyRegistry::new())
                .unwrap(),
        )
    }

    #[test]
    fn first_init_manufactures_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StubEngine::new(store(dir.path()));
        engine.choose_version(TpmVersion::V2).unwrap();
        engine.main_init().unwrap();
        assert!(engine.was_manufactured());
        engine.terminate();

        let mut second = StubEngine::new(store(dir.path()));
        second.choose_version(TpmVersion::V2).unwrap();
        second.main_init().unwrap();
        assert!(!second.was_manufactured());
    }

    #[test]
    fn commands_before_startup_need_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StubEngine::new(store(dir.path()));
        engine.choose_version(TpmVersion::V2).unwrap();
        engine.main_init().unwrap();

        let getcap = {
            let mut cmd = wire::tpm2_shutdown_cmd(wire::TPM2_SU_STATE);
            cmd[6..10].copy_from_slice(&wire::TPM2_CC_GET_CAPABILITY.to_be_bytes());
            cmd
        };
        let resp = engine.process(&getcap, 0).unwrap();
        assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_INITIALIZE));

        let startup = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
        let resp = engine.process(&startup, 0).unwrap();
        assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
        let resp = engine.process(&getcap, 0).unwrap();
        assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
    }

    #[test]
    fn cancel_only_affects_cancelable_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = StubEngine::new(store(dir.path()));
        engine.choose_version(TpmVersion::V2).unwrap();
        engine.main_init().unwrap();
        engine
            .process(&wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap(), 0)
            .unwrap();

        let mut create = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
        create[6..10].copy_from_slice(&wire::TPM2_CC_CREATE.to_be_bytes());

        engine.canceller().cancel();
        let resp = engine.process(&create, 0).unwrap();
        assert_eq!(wire::response_code(&resp), Some(rc::TPM2_RC_CANCELED));

        // The flag was consumed; the next run goes through.
        let resp = engine.process(&create, 0).unwrap();
        assert_eq!(wire::response_code(&resp), Some(rc::SUCCESS));
    }
}
