//! Versioned blob headers and the wrap/unwrap/export/import pipeline.
//!
//! Every persisted blob opens with a fixed 10-byte big-endian header:
//! `version(u8) min_version(u8) hdrsize(u16) flags(u16) total_len(u32)`.
//! The payload behind the header is a TLV stream. Files that predate the
//! header (hdrversion 1) carry a SHA-256 integrity prefix instead and are
//! readable but never written.

use crate::crypto;
use crate::keys::{KeyRegistry, SymKey};
use crate::tlv::{self, TlvData};
use crate::NvError;

/// Current blob header version.
pub const HEADER_VERSION: u8 = 2;
/// Minimum reader version stamped into new blobs.
pub const HEADER_MIN_VERSION: u8 = 1;
/// Header size on the wire.
pub const HEADER_LEN: usize = 10;

/// Payload is encrypted with the state key.
pub const BLOB_FLAG_ENCRYPTED: u16 = 0x1;
/// Outer layer is encrypted with the migration key.
pub const BLOB_FLAG_MIGRATION_ENCRYPTED: u16 = 0x2;
/// Blob is a transfer envelope.
pub const BLOB_FLAG_MIGRATION_DATA: u16 = 0x4;

/// Parsed blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    /// Format version the writer used.
    pub version: u8,
    /// Minimum version a reader must understand.
    pub min_version: u8,
    /// Offset of the payload behind the header.
    pub hdrsize: u16,
    /// `BLOB_FLAG_*` bits.
    pub flags: u16,
    /// Header plus payload length.
    pub total_len: u32,
}

impl BlobHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.version;
        out[1] = self.min_version;
        out[2..4].copy_from_slice(&self.hdrsize.to_be_bytes());
        out[4..6].copy_from_slice(&self.flags.to_be_bytes());
        out[6..10].copy_from_slice(&self.total_len.to_be_bytes());
        out
    }

    fn decode(data: &[u8]) -> Result<Self, NvError> {
        if data.len() < HEADER_LEN {
            return Err(NvError::BadParameter(format!(
                "not enough bytes for blob header: {}",
                data.len()
            )));
        }
        Ok(BlobHeader {
            version: data[0],
            min_version: data[1],
            hdrsize: u16::from_be_bytes([data[2], data[3]]),
            flags: u16::from_be_bytes([data[4], data[5]]),
            total_len: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
        })
    }
}

/// Strictly validate the header of `data` and return
/// `(payload offset, flags, version)`.
///
/// Used on blobs whose provenance guarantees a header (state transfer). Disk
/// loads go through the quiet [`detect_header`] so that legacy files keep
/// working.
pub fn check_header(data: &[u8]) -> Result<(usize, u16, u8), NvError> {
    let hdr = BlobHeader::decode(data)?;
    if hdr.total_len as usize != data.len() {
        return Err(NvError::BadParameter(format!(
            "blob header total_len {} does not match blob length {}",
            hdr.total_len,
            data.len()
        )));
    }
    if hdr.min_version > HEADER_VERSION {
        return Err(NvError::BadVersion {
            required: hdr.min_version,
            supported: HEADER_VERSION,
        });
    }
    let offset = hdr.hdrsize as usize;
    if offset < HEADER_LEN || offset > data.len() {
        return Err(NvError::BadParameter(format!("bad header size {offset}")));
    }
    Ok((offset, hdr.flags, hdr.version))
}

/// Quiet header detection for disk loads. `None` means the bytes predate the
/// header format and must be read as a legacy (v1) payload.
fn detect_header(data: &[u8]) -> Option<(usize, u16, u8)> {
    check_header(data).ok()
}

fn prepend_header(payload: Vec<u8>, flags: u16) -> Vec<u8> {
    let hdr = BlobHeader {
        version: HEADER_VERSION,
        min_version: HEADER_MIN_VERSION,
        hdrsize: HEADER_LEN as u16,
        flags,
        total_len: (HEADER_LEN + payload.len()) as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&hdr.encode());
    out.extend_from_slice(&payload);
    out
}

/// Envelope-encrypt `plaintext` under `key`: a ciphertext record carrying
/// `IV || ct` plus an HMAC record over that value.
fn envelope_encrypt(
    key: &SymKey,
    tag_encrypted: u16,
    plaintext: &[u8],
) -> Result<[TlvData<'static>; 2], NvError> {
    let ct = crypto::encrypt(key, plaintext)?;
    let mac = crypto::hmac(key, &ct);
    Ok([TlvData::owned(tag_encrypted, ct), TlvData::owned(tlv::TAG_HMAC, mac)])
}

/// Locate the ciphertext and HMAC records in `stream`, verify, decrypt.
fn envelope_decrypt(key: &SymKey, stream: &[u8], tag_encrypted: u16) -> Result<Vec<u8>, NvError> {
    let mac = tlv::find_tag(stream, tlv::TAG_HMAC)
        .ok_or_else(|| NvError::Fail("missing hmac record".into()))?;
    let ct = tlv::find_tag(stream, tag_encrypted)
        .ok_or_else(|| NvError::Fail(format!("missing ciphertext record (tag {tag_encrypted})")))?;
    crypto::verify_hmac(key, &ct.value, &mac.value)?;
    crypto::decrypt(key, &ct.value)
}

/// Extract a plain record's value from `stream`.
fn plain_value(stream: &[u8], tag: u16) -> Result<Vec<u8>, NvError> {
    tlv::find_tag(stream, tag)
        .map(|rec| rec.value.into_owned())
        .ok_or_else(|| NvError::Fail(format!("missing plain record (tag {tag})")))
}

/// Read a legacy (v1) payload: `SHA-256(rest) || rest`, the whole body
/// AES-encrypted when a state key is in use.
fn unwrap_legacy(keys: &KeyRegistry, data: &[u8]) -> Result<Vec<u8>, NvError> {
    let body = match keys.state_key() {
        Some(key) => crypto::decrypt(key, data)?,
        None => data.to_vec(),
    };
    if body.len() < crypto::SHA256_LEN {
        return Err(NvError::BadParameter("legacy blob shorter than its digest".into()));
    }
    let (digest, rest) = body.split_at(crypto::SHA256_LEN);
    if crypto::sha256(rest) != digest {
        return Err(NvError::Fail("legacy blob digest mismatch".into()));
    }
    Ok(rest.to_vec())
}

/// Wrap `plaintext` for storage at rest. With `encrypt` requested and a
/// state key installed the payload is envelope-encrypted and the header
/// carries `BLOB_FLAG_ENCRYPTED`; otherwise it is a single plain record.
pub fn wrap(keys: &KeyRegistry, plaintext: &[u8], encrypt: bool) -> Result<Vec<u8>, NvError> {
    let mut flags = 0u16;
    let payload = match (encrypt, keys.state_key()) {
        (true, Some(key)) => {
            flags |= BLOB_FLAG_ENCRYPTED;
            let records = envelope_encrypt(key, tlv::TAG_ENCRYPTED_DATA, plaintext)?;
            tlv::append(&records)
        }
        _ => tlv::append(&[TlvData::borrowed(tlv::TAG_DATA, plaintext)]),
    };
    Ok(prepend_header(payload, flags))
}

/// Recover the plaintext of a stored blob, transparently handling the
/// legacy headerless format.
pub fn unwrap(keys: &KeyRegistry, data: &[u8]) -> Result<Vec<u8>, NvError> {
    let Some((offset, flags, _version)) = detect_header(data) else {
        return unwrap_legacy(keys, data);
    };
    let body = &data[offset..];
    if flags & BLOB_FLAG_ENCRYPTED != 0 {
        let key = keys.state_key().ok_or(NvError::KeyNotFound)?;
        envelope_decrypt(key, body, tlv::TAG_ENCRYPTED_DATA)
    } else {
        plain_value(body, tlv::TAG_DATA)
    }
}

/// Build a transfer envelope around already-loaded plaintext.
///
/// With `reencrypt` and a state key the inner layer goes back under the
/// state key; the whole inner stream is then wrapped in a migration record,
/// encrypted under the migration key when one is installed. Returns the blob
/// and whether the inner layer is encrypted.
pub fn export(
    keys: &KeyRegistry,
    plaintext: &[u8],
    reencrypt: bool,
) -> Result<(Vec<u8>, bool), NvError> {
    let mut flags = BLOB_FLAG_MIGRATION_DATA;

    let (inner, is_encrypted) = match (reencrypt, keys.state_key()) {
        (true, Some(key)) => {
            let records = envelope_encrypt(key, tlv::TAG_ENCRYPTED_DATA, plaintext)?;
            (tlv::append(&records), true)
        }
        _ => (tlv::append(&[TlvData::borrowed(tlv::TAG_DATA, plaintext)]), false),
    };
    if is_encrypted {
        flags |= BLOB_FLAG_ENCRYPTED;
    }

    let outer = match keys.migration_key() {
        Some(key) => {
            flags |= BLOB_FLAG_MIGRATION_ENCRYPTED;
            let records = envelope_encrypt(key, tlv::TAG_ENCRYPTED_MIGRATION_DATA, &inner)?;
            tlv::append(&records)
        }
        None => tlv::append(&[TlvData::owned(tlv::TAG_MIGRATION_DATA, inner)]),
    };

    Ok((prepend_header(outer, flags), is_encrypted))
}

/// Unpack a transfer envelope down to plaintext.
///
/// `caller_says_encrypted` covers blobs whose header predates the encrypted
/// flag but whose sender knows the inner layer is under the state key.
pub fn import(
    keys: &KeyRegistry,
    blob: &[u8],
    caller_says_encrypted: bool,
) -> Result<Vec<u8>, NvError> {
    let (offset, flags, _version) = check_header(blob)?;
    let body = &blob[offset..];
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let inner = if flags & BLOB_FLAG_MIGRATION_ENCRYPTED != 0 {
        let key = keys.migration_key().ok_or(NvError::KeyNotFound)?;
        envelope_decrypt(key, body, tlv::TAG_ENCRYPTED_MIGRATION_DATA)?
    } else {
        plain_value(body, tlv::TAG_MIGRATION_DATA)?
    };

    if caller_says_encrypted || flags & BLOB_FLAG_ENCRYPTED != 0 {
        let key = keys.state_key().ok_or(NvError::KeyNotFound)?;
        envelope_decrypt(key, &inner, tlv::TAG_ENCRYPTED_DATA)
    } else {
        plain_value(&inner, tlv::TAG_DATA)
    }
}
