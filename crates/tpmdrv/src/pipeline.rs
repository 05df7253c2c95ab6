//! Request pipeline: TCG transport-prefix stripping, locality policy, and
//! SetLocality interception in front of the engine.

use tracing::debug;

use crate::driver::TpmDriver;
use crate::engine::TpmEngine;
use crate::wire::{self, TpmVersion};

// TCG simulator transport prefix: opcode(u32) locality(u8) length(u32).
const TCG_PREFIX_LEN: usize = 9;
const TCG_SEND_COMMAND: u32 = 8;

/// Locality policy bits set at configuration time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalityPolicy {
    /// Whether the SetLocality ordinal is honored at all.
    pub allow_set_locality: bool,
    /// Whether locality 4 is refused even when SetLocality is allowed.
    pub reject_locality_4: bool,
}

/// Detect and strip the TCG `SEND_COMMAND` prefix.
///
/// A buffer that opens with a TPM 2 session tag is a raw command; otherwise,
/// if it is long enough and starts with the `SEND_COMMAND` opcode, the
/// embedded locality and the offset past the prefix are returned.
pub fn strip_tcg_prefix(command: &[u8]) -> Option<(usize, u8)> {
    if command.len() < wire::REQ_HEADER_LEN {
        return None;
    }
    let tag = u16::from_be_bytes([command[0], command[1]]);
    if tag == wire::TPM2_ST_NO_SESSIONS || tag == wire::TPM2_ST_SESSIONS {
        return None;
    }
    let opcode = u32::from_be_bytes([command[0], command[1], command[2], command[3]]);
    if opcode != TCG_SEND_COMMAND {
        return None;
    }
    Some((TCG_PREFIX_LEN, command[4]))
}

/// Per-connection command pipeline. Locality starts at 0 and persists until
/// an accepted SetLocality changes it; a TCG prefix overrides it for that
/// single command only.
pub struct RequestPipeline {
    version: TpmVersion,
    policy: LocalityPolicy,
    locality: u8,
}

impl RequestPipeline {
    /// Pipeline for one connection.
    pub fn new(version: TpmVersion, policy: LocalityPolicy) -> Self {
        RequestPipeline { version, policy, locality: 0 }
    }

    /// The current locality.
    pub fn locality(&self) -> u8 {
        self.locality
    }

    /// Set the locality from the control channel. The same policy bounds
    /// apply as for the in-band ordinal.
    pub fn set_locality(&mut self, new_locality: u8) -> Result<(), u8> {
        if Self::locality_refused(new_locality, self.policy) {
            return Err(self.locality);
        }
        self.locality = new_locality;
        Ok(())
    }

    fn locality_refused(new_locality: u8, policy: LocalityPolicy) -> bool {
        new_locality >= 5 || (new_locality == 4 && policy.reject_locality_4)
    }

    fn set_locality_ordinal(&self) -> u32 {
        match self.version {
            TpmVersion::V12 => wire::TPM_ORD_SET_LOCALITY,
            TpmVersion::V2 => wire::TPM2_CC_SET_LOCALITY,
        }
    }

    fn intercept_set_locality(&mut self, command: &[u8]) -> Vec<u8> {
        if command.len() < wire::REQ_HEADER_LEN + 1 {
            return wire::shortmsg_error_response(self.version);
        }
        if !self.policy.allow_set_locality {
            return wire::fatal_error_response(self.version);
        }
        let new_locality = command[wire::REQ_HEADER_LEN];
        if Self::locality_refused(new_locality, self.policy) {
            return wire::locality_error_response(self.version);
        }
        debug!(from = self.locality, to = new_locality, "locality changed");
        self.locality = new_locality;
        wire::success_response(self.version)
    }

    /// Run one inbound buffer through the pipeline: strip a transport
    /// prefix, enforce sizes, intercept SetLocality, forward the rest with
    /// the effective locality. Failures come back as in-band TPM responses.
    pub fn handle<E: TpmEngine>(&mut self, driver: &mut TpmDriver<E>, buffer: &[u8]) -> Vec<u8> {
        let (command, effective_locality) = match strip_tcg_prefix(buffer) {
            Some((offset, loc)) => (&buffer[offset..], loc),
            None => (buffer, self.locality),
        };

        if command.len() < wire::REQ_HEADER_LEN {
            return wire::shortmsg_error_response(self.version);
        }
        if wire::ordinal(command) == self.set_locality_ordinal() {
            return self.intercept_set_locality(command);
        }

        driver
            .process(command, effective_locality)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "command dispatch failed");
                wire::fatal_error_response(self.version)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tpm2_command_is_not_a_prefix() {
        let cmd = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
        assert!(strip_tcg_prefix(&cmd).is_none());
    }

    #[test]
    fn send_command_prefix_is_stripped() {
        let inner = wire::startup_cmd(TpmVersion::V2, wire::TPM_ST_CLEAR).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&TCG_SEND_COMMAND.to_be_bytes());
        buf.push(2); // locality
        buf.extend_from_slice(&(inner.len() as u32).to_be_bytes());
        buf.extend_from_slice(&inner);

        let (offset, locality) = strip_tcg_prefix(&buf).unwrap();
        assert_eq!(offset, TCG_PREFIX_LEN);
        assert_eq!(locality, 2);
        assert_eq!(&buf[offset..], &inner[..]);
    }

    #[test]
    fn short_buffers_are_not_prefixed() {
        assert!(strip_tcg_prefix(&[0u8; 8]).is_none());
    }
}
