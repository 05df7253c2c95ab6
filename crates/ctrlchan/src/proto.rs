//! Control-channel protocol: command codes, capability bits, flag words,
//! and the result-code mapping at the boundary.
//!
//! A request is a 4-byte big-endian command code followed by a
//! command-specific body; a response is a 4-byte big-endian TPM-style result
//! code (0 = success) followed by a body. These layouts are the
//! compatibility contract with front-ends and migration tooling.

use nvstate::{BlobName, NvError};
use tpmdrv::wire::rc;
use tpmdrv::DrvError;

/// Largest state-blob fragment carried in one frame.
pub const STATE_BLOB_CHUNK: usize = 3456;

/// Control commands. Codes 16 and 18 of the original numbering (descriptor
/// passing and info queries) are reserved and not served here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CtrlCommand {
    /// Report the capability mask.
    GetCapability = 1,
    /// (Re-)initialize the TPM.
    Init = 2,
    /// Terminate the process.
    Shutdown = 3,
    /// Read the TPM-established bit.
    GetTpmEstablished = 4,
    /// Set the data-channel locality.
    SetLocality = 5,
    /// Begin a locality-4 hash sequence.
    HashStart = 6,
    /// Feed the hash sequence.
    HashData = 7,
    /// End the hash sequence.
    HashEnd = 8,
    /// Cancel the in-flight TPM command.
    CancelTpmCmd = 9,
    /// Snapshot volatile state to storage.
    StoreVolatile = 10,
    /// Reset the TPM-established bit.
    ResetTpmEstablished = 11,
    /// Read a state blob, fragment by fragment.
    GetStateBlob = 12,
    /// Write a state blob, fragment by fragment.
    SetStateBlob = 13,
    /// Stop the TPM but keep the process for state transfer.
    Stop = 14,
    /// Report the key configuration.
    GetConfig = 15,
    /// Negotiate the command buffer size.
    SetBufferSize = 17,
    /// Take the storage lock.
    LockStorage = 19,
}

impl CtrlCommand {
    /// Decode a wire code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => CtrlCommand::GetCapability,
            2 => CtrlCommand::Init,
            3 => CtrlCommand::Shutdown,
            4 => CtrlCommand::GetTpmEstablished,
            5 => CtrlCommand::SetLocality,
            6 => CtrlCommand::HashStart,
            7 => CtrlCommand::HashData,
            8 => CtrlCommand::HashEnd,
            9 => CtrlCommand::CancelTpmCmd,
            10 => CtrlCommand::StoreVolatile,
            11 => CtrlCommand::ResetTpmEstablished,
            12 => CtrlCommand::GetStateBlob,
            13 => CtrlCommand::SetStateBlob,
            14 => CtrlCommand::Stop,
            15 => CtrlCommand::GetConfig,
            17 => CtrlCommand::SetBufferSize,
            19 => CtrlCommand::LockStorage,
            _ => return None,
        })
    }

    /// The wire code.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Capability bits, numbered as the original front-ends expect them.
pub mod caps {
    /// INIT supported.
    pub const INIT: u64 = 1 << 0;
    /// SHUTDOWN supported.
    pub const SHUTDOWN: u64 = 1 << 1;
    /// GET_TPMESTABLISHED supported.
    pub const GET_TPMESTABLISHED: u64 = 1 << 2;
    /// SET_LOCALITY supported.
    pub const SET_LOCALITY: u64 = 1 << 3;
    /// HASH_START/DATA/END supported.
    pub const HASHING: u64 = 1 << 4;
    /// CANCEL_TPM_CMD supported.
    pub const CANCEL_TPM_CMD: u64 = 1 << 5;
    /// STORE_VOLATILE supported.
    pub const STORE_VOLATILE: u64 = 1 << 6;
    /// RESET_TPMESTABLISHED supported.
    pub const RESET_TPMESTABLISHED: u64 = 1 << 7;
    /// GET_STATEBLOB supported.
    pub const GET_STATEBLOB: u64 = 1 << 8;
    /// SET_STATEBLOB supported.
    pub const SET_STATEBLOB: u64 = 1 << 9;
    /// STOP supported.
    pub const STOP: u64 = 1 << 10;
    /// GET_CONFIG supported.
    pub const GET_CONFIG: u64 = 1 << 11;
    /// SET_BUFFERSIZE supported.
    pub const SET_BUFFERSIZE: u64 = 1 << 13;
    /// LOCK_STORAGE supported.
    pub const LOCK_STORAGE: u64 = 1 << 16;

    /// Everything this implementation serves.
    pub const ALL: u64 = INIT
        | SHUTDOWN
        | GET_TPMESTABLISHED
        | SET_LOCALITY
        | HASHING
        | CANCEL_TPM_CMD
        | STORE_VOLATILE
        | RESET_TPMESTABLISHED
        | GET_STATEBLOB
        | SET_STATEBLOB
        | STOP
        | GET_CONFIG
        | SET_BUFFERSIZE
        | LOCK_STORAGE;
}

/// INIT flag: drop volatile state instead of resuming from it.
pub const INIT_FLAG_DELETE_VOLATILE: u32 = 0x1;

/// State-blob flag: caller wants / sent plaintext inner layer.
pub const STATE_FLAG_DECRYPTED: u32 = 0x1;
/// State-blob flag: inner layer is under the state key.
pub const STATE_FLAG_ENCRYPTED: u32 = 0x2;
/// State-blob flag: this fragment ends the transfer.
pub const STATE_FLAG_LAST: u32 = 0x4;

/// GET_CONFIG: a state key is installed.
pub const CONFIG_FLAG_FILE_KEY: u32 = 0x1;
/// GET_CONFIG: a migration key is installed.
pub const CONFIG_FLAG_MIGRATION_KEY: u32 = 0x2;

/// Wire blob type for permanent state.
pub const BLOB_TYPE_PERMANENT: u32 = 1;
/// Wire blob type for volatile state.
pub const BLOB_TYPE_VOLATILE: u32 = 2;
/// Wire blob type for save state.
pub const BLOB_TYPE_SAVESTATE: u32 = 3;

/// Map a wire blob type to its store name.
pub fn blob_name(blobtype: u32) -> Option<BlobName> {
    Some(match blobtype {
        BLOB_TYPE_PERMANENT => BlobName::PermAll,
        BLOB_TYPE_VOLATILE => BlobName::VolatileState,
        BLOB_TYPE_SAVESTATE => BlobName::SaveState,
        _ => return None,
    })
}

/// Numeric result code for a persistence error, used only at this boundary.
pub fn nv_result(err: &NvError) -> u32 {
    match err {
        NvError::Retry => rc::RETRY,
        NvError::BadParameter(_) => rc::BAD_PARAMETER,
        NvError::BadVersion { .. } => rc::BAD_VERSION,
        NvError::BadMode => rc::BAD_MODE,
        NvError::BadKeyProperty(_) => rc::BAD_KEY_PROPERTY,
        NvError::KeyNotFound => rc::KEYNOTFOUND,
        NvError::Decrypt => rc::DECRYPT_ERROR,
        NvError::Io(_) | NvError::Fail(_) => rc::FAIL,
    }
}

/// Numeric result code for a driver error.
pub fn drv_result(err: &DrvError) -> u32 {
    match err {
        DrvError::Nv(nv) => nv_result(nv),
        DrvError::Engine(_) | DrvError::Profile(_) | DrvError::CryptoRuntime(_) => rc::FAIL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for code in [1u32, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 17, 19] {
            let cmd = CtrlCommand::from_code(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert!(CtrlCommand::from_code(0).is_none());
        assert!(CtrlCommand::from_code(16).is_none());
        assert!(CtrlCommand::from_code(18).is_none());
        assert!(CtrlCommand::from_code(20).is_none());
    }

    #[test]
    fn blob_types_map() {
        assert_eq!(blob_name(1), Some(BlobName::PermAll));
        assert_eq!(blob_name(2), Some(BlobName::VolatileState));
        assert_eq!(blob_name(3), Some(BlobName::SaveState));
        assert_eq!(blob_name(4), None);
    }

    #[test]
    fn error_codes_at_the_boundary() {
        assert_eq!(nv_result(&NvError::Retry), 0x800);
        assert_eq!(nv_result(&NvError::KeyNotFound), 13);
        assert_eq!(nv_result(&NvError::Decrypt), 33);
        assert_eq!(
            nv_result(&NvError::BadVersion { required: 3, supported: 2 }),
            46
        );
        assert_eq!(drv_result(&DrvError::Engine("x".into())), 9);
    }
}
