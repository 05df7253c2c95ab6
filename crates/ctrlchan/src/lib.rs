//! Control channel and serving loops.
//!
//! Two cooperating tasks share one TPM instance: a data task carrying raw
//! TPM commands through the request pipeline, and a control task speaking
//! the framed `PTM_*` protocol (init, shutdown, state transfer, cancel).
//! Both serialize on a single mutex around the driver; cancellation and
//! run-state queries bypass it.

#![deny(unsafe_code)]

pub mod proto;
pub mod server;
pub mod state;

pub use proto::CtrlCommand;
pub use server::{ServeConfig, Service};
pub use state::{RunState, RunStateCell};
