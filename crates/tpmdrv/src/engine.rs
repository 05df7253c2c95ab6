//! The engine seam: the TPM command library as a black box.
//!
//! The command surface is mutex-guarded by the serving layer; the cancel
//! surface is a separate lock-free handle so the control task can interrupt
//! a long-running primitive without touching the mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nvstate::BlobName;

use crate::wire::TpmVersion;
use crate::DrvError;

/// Lock-free cancellation flag shared with the engine.
///
/// The engine observes the flag between the internal steps of the few
/// ordinals that honor cancellation; everything else runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Fresh, unsignalled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the in-flight command.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the request; called when a command finishes.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The TPM command library.
///
/// All methods except [`TpmEngine::canceller`] are reached under the serving
/// layer's mutex. The handle returned by `canceller` must stay safe to fire
/// concurrently with `process`.
pub trait TpmEngine: Send {
    /// Select the emulated TPM family. Called once before `main_init`.
    fn choose_version(&mut self, version: TpmVersion) -> Result<(), DrvError>;

    /// Install a profile document. TPM 2 only; called before `main_init`.
    fn set_profile(&mut self, profile_json: &str) -> Result<(), DrvError>;

    /// First-time or resumed initialization from persisted state.
    fn main_init(&mut self) -> Result<(), DrvError>;

    /// Tear the instance down. State already persisted stays on disk.
    fn terminate(&mut self);

    /// Execute one raw command at the given locality, returning the
    /// response bytes verbatim.
    fn process(&mut self, command: &[u8], locality: u8) -> Result<Vec<u8>, DrvError>;

    /// The lock-free cancel handle the engine observes.
    fn canceller(&self) -> CancelHandle;

    /// Serialize one of the library's state blobs.
    fn get_state(&mut self, name: BlobName) -> Result<Vec<u8>, DrvError>;

    /// Hand the library a state blob to take effect at the next init.
    fn set_state(&mut self, name: BlobName, data: &[u8]) -> Result<(), DrvError>;

    /// Begin a locality-4 hash sequence; sets the TPM-established bit.
    fn hash_start(&mut self) -> Result<(), DrvError>;

    /// Feed data into the running hash sequence.
    fn hash_data(&mut self, data: &[u8]) -> Result<(), DrvError>;

    /// Finish the hash sequence.
    fn hash_end(&mut self) -> Result<(), DrvError>;

    /// Current value of the TPM-established bit.
    fn tpm_established(&self) -> bool;

    /// Clear the TPM-established bit.
    fn reset_established(&mut self) -> Result<(), DrvError>;

    /// Current command buffer size.
    fn buffer_size(&self) -> u32;

    /// Ask for a buffer size (`0` = query). Returns `(size, min, max)`.
    fn set_buffer_size(&mut self, wanted: u32) -> (u32, u32, u32);

    /// Whether the last `main_init` freshly manufactured the instance
    /// rather than resuming existing state. Profiles only apply to a fresh
    /// instance.
    fn was_manufactured(&self) -> bool;

    /// Runtime algorithm info as JSON, when the library exposes it.
    fn runtime_algorithms(&self) -> Option<String> {
        None
    }

    /// Runtime attribute info as JSON, when the library exposes it.
    fn runtime_attributes(&self) -> Option<String> {
        None
    }

    /// Drop FIPS mode in the backing crypto library.
    fn disable_fips(&mut self) -> Result<(), DrvError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_handle_is_shared() {
        let a = CancelHandle::new();
        let b = a.clone();
        assert!(!b.is_requested());
        a.cancel();
        assert!(b.is_requested());
        b.clear();
        assert!(!a.is_requested());
    }
}
