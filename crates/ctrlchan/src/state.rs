//! The serving state machine, readable without the engine mutex.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where the serving loops are in the TPM lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Waiting for INIT; only control commands are accepted.
    NeedInit = 0,
    /// Initialized and idle.
    Ready = 1,
    /// A data command is with the engine.
    Processing = 2,
    /// Stopped for state transfer; INIT brings it back.
    Stopped = 3,
    /// Shutting down; nothing further is accepted.
    Terminating = 4,
}

/// Atomic cell holding a [`RunState`].
#[derive(Debug)]
pub struct RunStateCell(AtomicU8);

impl RunStateCell {
    /// Cell starting in `NEED_INIT`.
    pub fn new() -> Self {
        RunStateCell(AtomicU8::new(RunState::NeedInit as u8))
    }

    /// Current state.
    pub fn get(&self) -> RunState {
        match self.0.load(Ordering::SeqCst) {
            0 => RunState::NeedInit,
            1 => RunState::Ready,
            2 => RunState::Processing,
            3 => RunState::Stopped,
            _ => RunState::Terminating,
        }
    }

    /// Move to `state`. Terminating is sticky: once entered it is never
    /// left.
    pub fn set(&self, state: RunState) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            if cur == RunState::Terminating as u8 {
                None
            } else {
                Some(state as u8)
            }
        });
    }
}

impl Default for RunStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let cell = RunStateCell::new();
        assert_eq!(cell.get(), RunState::NeedInit);
        cell.set(RunState::Ready);
        assert_eq!(cell.get(), RunState::Ready);
        cell.set(RunState::Stopped);
        cell.set(RunState::Ready);
        assert_eq!(cell.get(), RunState::Ready);
    }

    #[test]
    fn terminating_is_sticky() {
        let cell = RunStateCell::new();
        cell.set(RunState::Terminating);
        cell.set(RunState::Ready);
        assert_eq!(cell.get(), RunState::Terminating);
    }
}
