//! NVRAM persistence layer for TPM state blobs.
//!
//! Overview
//! - Named blobs (`permall`, `volatilestate`, `savestate`) map to files in a
//!   state directory or to slots inside a single backing file.
//! - Blobs are self-describing: a fixed 10-byte big-endian header followed by
//!   a tag-length-value stream.
//! - Encryption at rest is AES-CBC with an HMAC-SHA-256 over the ciphertext,
//!   keyed by a process-wide state key; a second, independent migration key
//!   protects blobs in transit between emulator instances.
//! - Atomicity & durability: write to a temporary file, `fsync`, atomic
//!   rename, then directory `fsync` when fsync is enabled.
//! - Fail-closed: MAC verification precedes any interpretation of ciphertext;
//!   a mismatch reports a wrong key, never partial plaintext.
//!
//! Security Model
//! - Keys are installed once, before the store is first used, and are wiped
//!   from parse buffers and on drop.
//! - The same key feeds both the cipher and the MAC; the MAC covers the full
//!   `ENCRYPTED_DATA` value (IV prefix included).
//! - Legacy headerless blobs (written with a SHA-256 integrity prefix) are
//!   readable for compatibility but never written.

pub mod blob;
pub mod crypto;
pub mod keys;
pub mod store;
pub mod tlv;

mod backend;

pub use blob::{BLOB_FLAG_ENCRYPTED, BLOB_FLAG_MIGRATION_DATA, BLOB_FLAG_MIGRATION_ENCRYPTED};
pub use keys::{EncryptionMode, KdfId, KeyFormat, KeyRegistry, SymKey};
pub use store::{BlobName, NvStore, StoreConfig};

/// Errors emitted by the persistence layer.
///
/// `Retry` is the only non-fatal variant: it marks a blob that has never been
/// written, which is the normal first-boot situation.
#[derive(Debug, thiserror::Error)]
pub enum NvError {
    /// Blob not written yet; legitimate on first boot.
    #[error("state blob not written yet")]
    Retry,
    /// Malformed header, length mismatch, or unrecognized input.
    #[error("bad parameter: {0}")]
    BadParameter(String),
    /// Blob requires a newer reader.
    #[error("blob requires header version {required}, reader supports {supported}")]
    BadVersion {
        /// Minimum header version the blob demands.
        required: u8,
        /// Newest header version this reader understands.
        supported: u8,
    },
    /// Unknown or unsupported cipher mode.
    #[error("unknown or unsupported encryption mode")]
    BadMode,
    /// Key length or format does not match the cipher mode.
    #[error("bad key property: {0}")]
    BadKeyProperty(String),
    /// Blob is flagged encrypted but the matching key is not installed.
    #[error("blob is encrypted but no matching key is installed")]
    KeyNotFound,
    /// MAC mismatch; wrong key rather than corruption.
    #[error("mac verification failed; wrong key or tampered ciphertext")]
    Decrypt,
    /// Underlying I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Any other fatal failure.
    #[error("{0}")]
    Fail(String),
}
