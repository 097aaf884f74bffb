//! AES-256-GCM bundles exchanged with the sync server.
//!
//! Wire format (all multi-byte integers are big-endian):
//!
//!   v0 (legacy): [0x00] [nonce(12)] [ciphertext...] [tag(16)]
//!   v1 (keyed):  [0x01] [key_version(2)] [nonce(12)] [ciphertext...] [tag(16)]
//!
//! No associated data is bound; the layout is shared byte-for-byte with the
//! other clients.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};

use crate::error::CryptoError;
use crate::keys::SymmetricKey;
use crate::nonce::{NONCE_SIZE, next_nonce};

pub const FORMAT_LEGACY: u8 = 0x00;
pub const FORMAT_KEYED: u8 = 0x01;

pub const TAG_SIZE: usize = 16;
pub const KEY_VERSION_SIZE: usize = 2;

/// version(1) + nonce(12) + tag(16)
pub const MIN_LEGACY_LEN: usize = 1 + NONCE_SIZE + TAG_SIZE;
/// version(1) + key_version(2) + nonce(12) + tag(16)
pub const MIN_KEYED_LEN: usize = 1 + KEY_VERSION_SIZE + NONCE_SIZE + TAG_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleVersion {
    V0,
    V1,
    Unknown,
}

/// Borrowed view over a serialized bundle. Parsing checks structure only;
/// nothing is decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBundle<'a> {
    pub key_version: Option<u16>,
    pub nonce: [u8; NONCE_SIZE],
    /// ciphertext followed by the 16-byte tag
    pub sealed: &'a [u8],
}

impl<'a> EncryptedBundle<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, CryptoError> {
        let Some(&format) = bytes.first() else {
            return Err(CryptoError::DecryptionFailed("empty bundle".into()));
        };

        let (key_version, header_len, min_len) = match format {
            FORMAT_LEGACY => (None, 1, MIN_LEGACY_LEN),
            FORMAT_KEYED => {
                let key_version = bytes
                    .get(1..1 + KEY_VERSION_SIZE)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]));
                (key_version, 1 + KEY_VERSION_SIZE, MIN_KEYED_LEN)
            }
            other => return Err(CryptoError::UnsupportedFormat(other)),
        };

        if bytes.len() < min_len {
            return Err(CryptoError::DecryptionFailed(format!(
                "bundle too short: {} bytes (need >= {})",
                bytes.len(),
                min_len
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[header_len..header_len + NONCE_SIZE]);

        Ok(Self {
            key_version,
            nonce,
            sealed: &bytes[header_len + NONCE_SIZE..],
        })
    }

    pub fn format_version(&self) -> u8 {
        match self.key_version {
            Some(_) => FORMAT_KEYED,
            None => FORMAT_LEGACY,
        }
    }

    pub fn ciphertext(&self) -> &'a [u8] {
        &self.sealed[..self.sealed.len() - TAG_SIZE]
    }

    pub fn tag(&self) -> &'a [u8] {
        &self.sealed[self.sealed.len() - TAG_SIZE..]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + KEY_VERSION_SIZE + NONCE_SIZE + self.sealed.len());
        out.push(self.format_version());
        if let Some(key_version) = self.key_version {
            out.extend_from_slice(&key_version.to_be_bytes());
        }
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(self.sealed);
        out
    }
}

/// Encrypt into a legacy v0 bundle.
pub fn encrypt(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    seal(plaintext, key, None)
}

/// Encrypt into a keyed v1 bundle tagged with `key_version`.
pub fn encrypt_with_key_version(
    plaintext: &[u8],
    key: &SymmetricKey,
    key_version: u16,
) -> Result<Vec<u8>, CryptoError> {
    seal(plaintext, key, Some(key_version))
}

fn seal(
    plaintext: &[u8],
    key: &SymmetricKey,
    key_version: Option<u16>,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = next_nonce();

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedBundle {
        key_version,
        nonce,
        sealed: &sealed,
    }
    .to_bytes())
}

/// Decrypt a v0 or v1 bundle. Unknown format bytes are rejected before any
/// cryptographic work.
pub fn decrypt(bundle: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
    let parsed = EncryptedBundle::parse(bundle)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(&parsed.nonce), parsed.sealed)
        .map_err(|_| {
            CryptoError::DecryptionFailed("authentication failed, data corrupted or tampered".into())
        })
}

/// Classify a bundle by its first byte without validating the rest.
pub fn detect_version(bundle: &[u8]) -> BundleVersion {
    match bundle.first() {
        Some(&FORMAT_LEGACY) => BundleVersion::V0,
        Some(&FORMAT_KEYED) => BundleVersion::V1,
        _ => BundleVersion::Unknown,
    }
}

/// Key version of a v1 bundle; `None` for anything else.
pub fn extract_key_version(bundle: &[u8]) -> Option<u16> {
    match bundle {
        [FORMAT_KEYED, hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
