//! Driver over the engine: startup with backup recovery, command dispatch
//! with concurrent cancellation, volatile snapshots, and the synthesized
//! shutdown on exit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvstate::{BlobName, NvStore};
use tracing::{debug, info, warn};

use crate::engine::{CancelHandle, TpmEngine};
use crate::wire::{self, rc, TpmVersion};
use crate::DrvError;

struct CancelShared {
    version: TpmVersion,
    in_flight: AtomicU32,
    handle: CancelHandle,
}

/// Cancel interface for the control task. Does not touch the engine mutex:
/// it reads the in-flight ordinal atomically and fires the engine's
/// lock-free cancel hook when that ordinal honors cancellation.
#[derive(Clone)]
pub struct Canceller(Arc<CancelShared>);

impl Canceller {
    /// Request cancellation. Returns whether a cancelable command was in
    /// flight and the request was forwarded.
    pub fn cancel(&self) -> bool {
        let ord = self.0.in_flight.load(Ordering::SeqCst);
        if wire::is_cancelable(self.0.version, ord) {
            self.0.handle.cancel();
            true
        } else {
            debug!(ordinal = format_args!("{ord:#x}"), "cancel ignored for ordinal");
            false
        }
    }
}

/// Adapter owning the engine and the persistence context.
pub struct TpmDriver<E: TpmEngine> {
    engine: E,
    store: Arc<NvStore>,
    version: TpmVersion,
    cancel: Arc<CancelShared>,
    last_command: u32,
    auto_shutdown: bool,
    running: bool,
}

impl<E: TpmEngine> TpmDriver<E> {
    /// Build a driver. `auto_shutdown` controls whether a missing
    /// `TPM2_Shutdown` is synthesized when the driver stops.
    pub fn new(engine: E, store: Arc<NvStore>, version: TpmVersion, auto_shutdown: bool) -> Self {
        let cancel = Arc::new(CancelShared {
            version,
            in_flight: AtomicU32::new(wire::TPM_ORDINAL_NONE),
            handle: engine.canceller(),
        });
        TpmDriver {
            engine,
            store,
            version,
            cancel,
            last_command: wire::TPM_ORDINAL_NONE,
            auto_shutdown,
            running: false,
        }
    }

    /// The emulated TPM family.
    pub fn version(&self) -> TpmVersion {
        self.version
    }

    /// Whether `start` has succeeded and `stop` has not been called.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The persistence context.
    pub fn store(&self) -> &Arc<NvStore> {
        &self.store
    }

    /// Read access to the engine behind the driver.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Cancel interface for the control task.
    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel.clone())
    }

    /// Bring the TPM up: choose the version, apply the profile, initialize
    /// from persisted state (falling back to the permanent-state backup
    /// once), lock storage, honor the delete-volatile init flag, and align
    /// the host crypto configuration with the profile.
    pub fn start(
        &mut self,
        profile: Option<&str>,
        lock_storage: bool,
        delete_volatile: bool,
    ) -> Result<(), DrvError> {
        self.engine.choose_version(self.version)?;
        if let (Some(json), TpmVersion::V2) = (profile, self.version) {
            self.engine.set_profile(json)?;
        }

        if let Err(first) = self.engine.main_init() {
            if !self.store.config().make_backup {
                return Err(first);
            }
            warn!(error = %first, "init failed, trying the permanent-state backup");
            self.store.restore_backup()?;
            if let Err(second) = self.engine.main_init() {
                // Revert the swap so the on-disk chain is as we found it.
                if let Err(e) = self.store.restore_backup() {
                    warn!(error = %e, "could not revert backup swap");
                }
                return Err(second);
            }
            info!("started from the permanent-state backup");
        }

        if profile.is_some() && self.version == TpmVersion::V2 && !self.engine.was_manufactured()
        {
            self.engine.terminate();
            return Err(DrvError::Profile(
                "profile cannot be applied to an existing instance".into(),
            ));
        }

        if lock_storage {
            if let Err(e) = self.store.lock_storage(0) {
                self.engine.terminate();
                return Err(e.into());
            }
        }

        if delete_volatile {
            if let Err(e) = self.store.delete(BlobName::VolatileState, false) {
                self.engine.terminate();
                return Err(e.into());
            }
        }

        if let Err(e) = crate::runtime::configure_crypto(&mut self.engine, self.version) {
            self.engine.terminate();
            return Err(e);
        }

        self.running = true;
        self.last_command = wire::TPM_ORDINAL_NONE;
        Ok(())
    }

    /// Dispatch one raw command, publishing its ordinal for the concurrent
    /// cancel path while the engine runs it.
    pub fn process(&mut self, command: &[u8], locality: u8) -> Result<Vec<u8>, DrvError> {
        let ord = wire::ordinal(command);
        self.cancel.in_flight.store(ord, Ordering::SeqCst);
        let res = self.engine.process(command, locality);
        self.cancel.in_flight.store(wire::TPM_ORDINAL_NONE, Ordering::SeqCst);
        self.cancel.handle.clear();
        if res.is_ok() {
            self.last_command = ord;
        }
        res
    }

    /// Snapshot the volatile state into the store.
    pub fn store_volatile(&mut self) -> Result<(), DrvError> {
        let bytes = self.engine.get_state(BlobName::VolatileState)?;
        self.store.store(BlobName::VolatileState, &bytes)?;
        Ok(())
    }

    /// Serialize one of the engine's state blobs.
    pub fn get_state(&mut self, name: BlobName) -> Result<Vec<u8>, DrvError> {
        self.engine.get_state(name)
    }

    /// Hand the engine a state blob for the next init.
    pub fn set_state(&mut self, name: BlobName, data: &[u8]) -> Result<(), DrvError> {
        self.engine.set_state(name, data)
    }

    /// Begin a locality-4 hash sequence.
    pub fn hash_start(&mut self) -> Result<(), DrvError> {
        self.engine.hash_start()
    }

    /// Feed the running hash sequence.
    pub fn hash_data(&mut self, data: &[u8]) -> Result<(), DrvError> {
        self.engine.hash_data(data)
    }

    /// Finish the hash sequence.
    pub fn hash_end(&mut self) -> Result<(), DrvError> {
        self.engine.hash_end()
    }

    /// Current value of the TPM-established bit.
    pub fn tpm_established(&self) -> bool {
        self.engine.tpm_established()
    }

    /// Clear the TPM-established bit.
    pub fn reset_established(&mut self) -> Result<(), DrvError> {
        self.engine.reset_established()
    }

    /// Current command buffer size.
    pub fn buffer_size(&self) -> u32 {
        self.engine.buffer_size()
    }

    /// Ask for a buffer size (`0` = query). Returns `(size, min, max)`.
    pub fn set_buffer_size(&mut self, wanted: u32) -> (u32, u32, u32) {
        self.engine.set_buffer_size(wanted)
    }

    /// A data connection went away. Commands may never arrive again, so the
    /// missing `TPM2_Shutdown` is synthesized now; the TPM stays up for the
    /// next client.
    pub fn connection_closed(&mut self) {
        if self.running {
            self.maybe_send_tpm2_shutdown();
        }
    }

    /// Stop the TPM: synthesize the missing `TPM2_Shutdown` when policy
    /// asks for it, then terminate the engine. Safe to call when already
    /// stopped.
    pub fn stop(&mut self) {
        if self.running {
            self.maybe_send_tpm2_shutdown();
            self.engine.terminate();
            self.running = false;
        }
    }

    /// Send `TPM2_Shutdown(SU_STATE)` if the last successful command was not
    /// already a shutdown, falling back to `SU_CLEAR` when the state variant
    /// fails. A TPM that never saw `Startup` answers `RC_INITIALIZE`; that
    /// ends the attempt.
    fn maybe_send_tpm2_shutdown(&mut self) {
        if self.version != TpmVersion::V2
            || !self.auto_shutdown
            || self.last_command == wire::TPM2_CC_SHUTDOWN
        {
            return;
        }
        for su in [wire::TPM2_SU_STATE, wire::TPM2_SU_CLEAR] {
            let cmd = wire::tpm2_shutdown_cmd(su);
            match self.engine.process(&cmd, 0) {
                Ok(resp) => match wire::response_code(&resp) {
                    Some(rc::SUCCESS) => {
                        self.last_command = wire::TPM2_CC_SHUTDOWN;
                        return;
                    }
                    Some(rc::TPM2_RC_INITIALIZE) => return,
                    code => {
                        debug!(?code, su, "synthesized shutdown refused, trying next type");
                    }
                },
                Err(e) => {
                    warn!(error = %e, "synthesized shutdown failed");
                    return;
                }
            }
        }
    }
}
