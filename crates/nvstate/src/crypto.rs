//! AES-CBC + HMAC-SHA-256 envelope primitives and passphrase derivation.
//!
//! The encrypt side produces `IV || ciphertext` with PKCS#7 padding; the MAC
//! is computed over that whole value with the same key. Verification is
//! constant-time and always precedes decryption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::keys::{EncryptionMode, KdfId, SymKey};
use crate::NvError;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES block and IV size.
pub const IV_LEN: usize = 16;
/// HMAC-SHA-256 output size.
pub const HMAC_LEN: usize = 32;
/// SHA-256 output size (legacy blob integrity prefix).
pub const SHA256_LEN: usize = 32;

// PBKDF2 compatibility parameters; changing either breaks every key ever
// derived from a passphrase.
const PBKDF2_SALT: &[u8] = b"";
const PBKDF2_ITERATIONS: u32 = 1000;

/// Encrypt `plaintext`, returning `IV || ciphertext`.
pub fn encrypt(key: &SymKey, plaintext: &[u8]) -> Result<Vec<u8>, NvError> {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let ct = match key.mode() {
        EncryptionMode::Aes128Cbc => Aes128CbcEnc::new_from_slices(key.bytes(), &iv)
            .map_err(|_| NvError::BadMode)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        EncryptionMode::Aes256Cbc => Aes256CbcEnc::new_from_slices(key.bytes(), &iv)
            .map_err(|_| NvError::BadMode)?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    };

    let mut out = Vec::with_capacity(IV_LEN + ct.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `IV || ciphertext` and strip the padding.
///
/// Padding errors report `Fail`; the MAC must have been checked already, so
/// a bad pad here means a malformed blob rather than a wrong key.
pub fn decrypt(key: &SymKey, data: &[u8]) -> Result<Vec<u8>, NvError> {
    if data.len() < IV_LEN || (data.len() - IV_LEN) % IV_LEN != 0 {
        return Err(NvError::BadParameter("short or unaligned ciphertext".into()));
    }
    let (iv, ct) = data.split_at(IV_LEN);
    let pt = match key.mode() {
        EncryptionMode::Aes128Cbc => Aes128CbcDec::new_from_slices(key.bytes(), iv)
            .map_err(|_| NvError::BadMode)?
            .decrypt_padded_vec_mut::<Pkcs7>(ct),
        EncryptionMode::Aes256Cbc => Aes256CbcDec::new_from_slices(key.bytes(), iv)
            .map_err(|_| NvError::BadMode)?
            .decrypt_padded_vec_mut::<Pkcs7>(ct),
    };
    pt.map_err(|_| NvError::Fail("bad pkcs7 padding".into()))
}

/// HMAC-SHA-256 over `data` with the key's raw bytes.
pub fn hmac(key: &SymKey, data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key.bytes())
        .expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Verify a MAC in constant time. A mismatch reports `Decrypt`, marking a
/// wrong key rather than corruption.
pub fn verify_hmac(key: &SymKey, data: &[u8], expected: &[u8]) -> Result<(), NvError> {
    let computed = hmac(key, data);
    if computed.ct_eq(expected).into() {
        Ok(())
    } else {
        Err(NvError::Decrypt)
    }
}

/// SHA-256 digest; used by the legacy blob integrity prefix.
pub fn sha256(data: &[u8]) -> [u8; SHA256_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Derive `keylen` bytes from a passphrase.
pub fn kdf(passphrase: &[u8], keylen: usize, scheme: KdfId) -> Zeroizing<Vec<u8>> {
    match scheme {
        KdfId::Pbkdf2 => {
            let mut out = Zeroizing::new(vec![0u8; keylen]);
            pbkdf2::pbkdf2_hmac::<Sha512>(
                passphrase,
                PBKDF2_SALT,
                PBKDF2_ITERATIONS,
                out.as_mut_slice(),
            );
            out
        }
        KdfId::Sha512 => {
            let mut hasher = Sha512::new();
            hasher.update(passphrase);
            let digest = Zeroizing::new(hasher.finalize().to_vec());
            Zeroizing::new(digest[..keylen].to_vec())
        }
    }
}
