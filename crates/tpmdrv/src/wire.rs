//! TPM wire-level constants and header helpers.
//!
//! Requests and responses share a 10-byte header: `tag(u16) size(u32)` plus
//! an ordinal (requests) or a result code (responses), all big-endian.

/// Emulated TPM family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmVersion {
    /// TPM 1.2
    V12,
    /// TPM 2.0
    V2,
}

/// Request/response header length.
pub const REQ_HEADER_LEN: usize = 10;

/// TPM 1.2 command tag.
pub const TPM_TAG_RQU_COMMAND: u16 = 0x00C1;
/// TPM 1.2 response tag.
pub const TPM_TAG_RSP_COMMAND: u16 = 0x00C4;
/// TPM 2 session-less command tag.
pub const TPM2_ST_NO_SESSIONS: u16 = 0x8001;
/// TPM 2 command tag with authorization sessions.
pub const TPM2_ST_SESSIONS: u16 = 0x8002;

/// TPM 1.2 ordinals this layer knows about.
pub const TPM_ORD_TAKE_OWNERSHIP: u32 = 0x0000_000D;
/// TPM 1.2 CreateWrapKey.
pub const TPM_ORD_CREATE_WRAP_KEY: u32 = 0x0000_001F;
/// TPM 1.2 Startup.
pub const TPM_ORD_STARTUP: u32 = 0x0000_0099;
/// Vendor ordinal the proxy front-end uses for SetLocality on a TPM 1.2.
pub const TPM_ORD_SET_LOCALITY: u32 = 0x2000_1000;

/// TPM 2 CreatePrimary.
pub const TPM2_CC_CREATE_PRIMARY: u32 = 0x0000_0131;
/// TPM 2 SetLocality interception ordinal.
pub const TPM2_CC_SET_LOCALITY: u32 = 0x0000_013B;
/// TPM 2 Startup.
pub const TPM2_CC_STARTUP: u32 = 0x0000_0144;
/// TPM 2 Shutdown.
pub const TPM2_CC_SHUTDOWN: u32 = 0x0000_0145;
/// TPM 2 Create.
pub const TPM2_CC_CREATE: u32 = 0x0000_0153;
/// TPM 2 GetCapability.
pub const TPM2_CC_GET_CAPABILITY: u32 = 0x0000_017A;

/// Marker for "no ordinal" (short request).
pub const TPM_ORDINAL_NONE: u32 = 0;

/// TPM 1.2 startup types.
pub const TPM_ST_CLEAR: u16 = 0x0001;
/// Resume saved state.
pub const TPM_ST_STATE: u16 = 0x0002;
/// Start deactivated (TPM 1.2 only).
pub const TPM_ST_DEACTIVATED: u16 = 0x0003;

/// TPM 2 startup/shutdown type: clear.
pub const TPM2_SU_CLEAR: u16 = 0x0000;
/// TPM 2 startup/shutdown type: preserve state.
pub const TPM2_SU_STATE: u16 = 0x0001;

/// Result codes kept numeric only at the wire and control boundaries.
pub mod rc {
    /// Success for both families.
    pub const SUCCESS: u32 = 0;
    /// TPM 1.2 bad parameter.
    pub const BAD_PARAMETER: u32 = 3;
    /// TPM 1.2 generic fatal failure.
    pub const FAIL: u32 = 9;
    /// TPM 1.2 key not found.
    pub const KEYNOTFOUND: u32 = 13;
    /// TPM 1.2 request shorter than its header claims.
    pub const BAD_PARAM_SIZE: u32 = 25;
    /// TPM 1.2 wrong decryption key.
    pub const DECRYPT_ERROR: u32 = 33;
    /// TPM 1.2 bad key property.
    pub const BAD_KEY_PROPERTY: u32 = 40;
    /// TPM 1.2 bad mode.
    pub const BAD_MODE: u32 = 44;
    /// TPM 1.2 version mismatch.
    pub const BAD_VERSION: u32 = 46;
    /// TPM 1.2 bad locality.
    pub const BAD_LOCALITY: u32 = 61;
    /// TPM 1.2 non-fatal retry (first boot).
    pub const RETRY: u32 = 0x800;

    /// TPM 2: command received before Startup.
    pub const TPM2_RC_INITIALIZE: u32 = 0x100;
    /// TPM 2 generic failure.
    pub const TPM2_RC_FAILURE: u32 = 0x101;
    /// TPM 2 insufficient bytes in request.
    pub const TPM2_RC_INSUFFICIENT: u32 = 0x09A;
    /// TPM 2 canceled.
    pub const TPM2_RC_CANCELED: u32 = 0x909;
    /// TPM 2 bad locality.
    pub const TPM2_RC_LOCALITY: u32 = 0x907;
}

/// Parsed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqHeader {
    /// Command tag.
    pub tag: u16,
    /// Declared total size.
    pub size: u32,
    /// Command ordinal.
    pub ordinal: u32,
}

/// Parse a request header; `None` for short buffers.
pub fn parse_req_header(buf: &[u8]) -> Option<ReqHeader> {
    if buf.len() < REQ_HEADER_LEN {
        return None;
    }
    Some(ReqHeader {
        tag: u16::from_be_bytes([buf[0], buf[1]]),
        size: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
        ordinal: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
    })
}

/// The ordinal of a request, or `TPM_ORDINAL_NONE` for short buffers.
pub fn ordinal(buf: &[u8]) -> u32 {
    parse_req_header(buf).map_or(TPM_ORDINAL_NONE, |h| h.ordinal)
}

/// Whether the driver forwards a cancel for this ordinal.
pub fn is_cancelable(version: TpmVersion, ord: u32) -> bool {
    match version {
        TpmVersion::V2 => ord == TPM2_CC_CREATE_PRIMARY || ord == TPM2_CC_CREATE,
        TpmVersion::V12 => ord == TPM_ORD_TAKE_OWNERSHIP || ord == TPM_ORD_CREATE_WRAP_KEY,
    }
}

/// Build a bare header-only response carrying `code`.
pub fn error_response(version: TpmVersion, code: u32) -> Vec<u8> {
    let tag = match version {
        TpmVersion::V12 => TPM_TAG_RSP_COMMAND,
        TpmVersion::V2 => TPM2_ST_NO_SESSIONS,
    };
    let mut out = Vec::with_capacity(REQ_HEADER_LEN);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&(REQ_HEADER_LEN as u32).to_be_bytes());
    out.extend_from_slice(&code.to_be_bytes());
    out
}

/// Version-correct generic fatal error.
pub fn fatal_error_response(version: TpmVersion) -> Vec<u8> {
    let code = match version {
        TpmVersion::V12 => rc::FAIL,
        TpmVersion::V2 => rc::TPM2_RC_FAILURE,
    };
    error_response(version, code)
}

/// Version-correct bad-locality error.
pub fn locality_error_response(version: TpmVersion) -> Vec<u8> {
    let code = match version {
        TpmVersion::V12 => rc::BAD_LOCALITY,
        TpmVersion::V2 => rc::TPM2_RC_LOCALITY,
    };
    error_response(version, code)
}

/// Version-correct short-message error.
pub fn shortmsg_error_response(version: TpmVersion) -> Vec<u8> {
    let code = match version {
        TpmVersion::V12 => rc::BAD_PARAM_SIZE,
        TpmVersion::V2 => rc::TPM2_RC_INSUFFICIENT,
    };
    error_response(version, code)
}

/// Header-only success response.
pub fn success_response(version: TpmVersion) -> Vec<u8> {
    error_response(version, rc::SUCCESS)
}

/// Result code of a response, or `None` for short buffers.
pub fn response_code(resp: &[u8]) -> Option<u32> {
    if resp.len() < REQ_HEADER_LEN {
        return None;
    }
    Some(u32::from_be_bytes([resp[6], resp[7], resp[8], resp[9]]))
}

/// Synthesize a version-correct Startup command. `None` when the startup
/// type does not exist for the version (deactivated on a TPM 2).
pub fn startup_cmd(version: TpmVersion, startup_type: u16) -> Option<Vec<u8>> {
    let (tag, ord, su) = match version {
        TpmVersion::V12 => (TPM_TAG_RQU_COMMAND, TPM_ORD_STARTUP, startup_type),
        TpmVersion::V2 => {
            let su = match startup_type {
                TPM_ST_CLEAR => TPM2_SU_CLEAR,
                TPM_ST_STATE => TPM2_SU_STATE,
                _ => return None,
            };
            (TPM2_ST_NO_SESSIONS, TPM2_CC_STARTUP, su)
        }
    };
    let mut out = Vec::with_capacity(REQ_HEADER_LEN + 2);
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&((REQ_HEADER_LEN + 2) as u32).to_be_bytes());
    out.extend_from_slice(&ord.to_be_bytes());
    out.extend_from_slice(&su.to_be_bytes());
    Some(out)
}

/// Synthesize a `TPM2_Shutdown` with the given shutdown type.
pub fn tpm2_shutdown_cmd(shutdown_type: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(REQ_HEADER_LEN + 2);
    out.extend_from_slice(&TPM2_ST_NO_SESSIONS.to_be_bytes());
    out.extend_from_slice(&((REQ_HEADER_LEN + 2) as u32).to_be_bytes());
    out.extend_from_slice(&TPM2_CC_SHUTDOWN.to_be_bytes());
    out.extend_from_slice(&shutdown_type.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let cmd = startup_cmd(TpmVersion::V2, TPM_ST_CLEAR).unwrap();
        let hdr = parse_req_header(&cmd).unwrap();
        assert_eq!(hdr.tag, TPM2_ST_NO_SESSIONS);
        assert_eq!(hdr.size as usize, cmd.len());
        assert_eq!(hdr.ordinal, TPM2_CC_STARTUP);
        assert_eq!(&cmd[10..12], &TPM2_SU_CLEAR.to_be_bytes());
    }

    #[test]
    fn tpm12_startup_deactivated_exists_only_there() {
        assert!(startup_cmd(TpmVersion::V12, TPM_ST_DEACTIVATED).is_some());
        assert!(startup_cmd(TpmVersion::V2, TPM_ST_DEACTIVATED).is_none());
    }

    #[test]
    fn error_responses_pick_version_codes() {
        assert_eq!(response_code(&fatal_error_response(TpmVersion::V12)), Some(rc::FAIL));
        assert_eq!(
            response_code(&fatal_error_response(TpmVersion::V2)),
            Some(rc::TPM2_RC_FAILURE)
        );
        assert_eq!(
            response_code(&locality_error_response(TpmVersion::V12)),
            Some(rc::BAD_LOCALITY)
        );
        assert_eq!(
            response_code(&shortmsg_error_response(TpmVersion::V2)),
            Some(rc::TPM2_RC_INSUFFICIENT)
        );
        let resp = fatal_error_response(TpmVersion::V12);
        assert_eq!(&resp[0..2], &TPM_TAG_RSP_COMMAND.to_be_bytes());
    }

    #[test]
    fn cancelable_sets_are_version_specific() {
        assert!(is_cancelable(TpmVersion::V2, TPM2_CC_CREATE_PRIMARY));
        assert!(is_cancelable(TpmVersion::V2, TPM2_CC_CREATE));
        assert!(!is_cancelable(TpmVersion::V2, TPM2_CC_GET_CAPABILITY));
        assert!(is_cancelable(TpmVersion::V12, TPM_ORD_TAKE_OWNERSHIP));
        assert!(!is_cancelable(TpmVersion::V12, TPM2_CC_CREATE));
    }

    #[test]
    fn shutdown_cmd_layout() {
        let cmd = tpm2_shutdown_cmd(TPM2_SU_STATE);
        assert_eq!(ordinal(&cmd), TPM2_CC_SHUTDOWN);
        assert_eq!(&cmd[10..12], &TPM2_SU_STATE.to_be_bytes());
    }
}
