//! Adapter layer between the serving loops and the TPM command library.
//!
//! The library itself is a black box behind the [`TpmEngine`] trait: choose a
//! version, apply a profile, initialize, process raw commands, transfer
//! state. This crate owns everything around that box: startup with backup
//! recovery, the request pipeline with locality policy, concurrent
//! cancellation, and the synthesized shutdown on exit.

#![deny(unsafe_code)]

pub mod driver;
pub mod engine;
pub mod pipeline;
pub mod profile;
pub mod runtime;
pub mod stub;
pub mod wire;

pub use driver::{Canceller, TpmDriver};
pub use engine::{CancelHandle, TpmEngine};
pub use pipeline::{LocalityPolicy, RequestPipeline};
pub use profile::Profile;
pub use stub::StubEngine;
pub use wire::TpmVersion;

/// Errors surfaced by the driver layer.
#[derive(Debug, thiserror::Error)]
pub enum DrvError {
    /// Persistence failure bubbling up from the store.
    #[error("nvram: {0}")]
    Nv(#[from] nvstate::NvError),
    /// The engine refused or failed an operation.
    #[error("engine: {0}")]
    Engine(String),
    /// Profile could not be parsed or applied.
    #[error("profile: {0}")]
    Profile(String),
    /// Host crypto configuration cannot satisfy the profile.
    #[error("crypto runtime: {0}")]
    CryptoRuntime(String),
}
