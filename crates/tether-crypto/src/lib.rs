/// Tether Crypto Library
///
/// End-to-end encryption for everything that crosses the sync socket:
/// - X25519 + HKDF-SHA256 derivation of the shared session key
/// - AES-256-GCM bundles in two wire formats (v0 legacy, v1 keyed)
/// - Hybrid nonces (random prefix + process-wide counter)
///
/// The bundle layout and the key derivation parameters are shared with the
/// other clients and must not change.

pub mod bundle;
pub mod error;
pub mod keys;
pub mod nonce;

pub use bundle::{
    BundleVersion, EncryptedBundle, decrypt, detect_version, encrypt, encrypt_with_key_version,
    extract_key_version,
};
pub use error::CryptoError;
pub use keys::{KeyPair, SymmetricKey, derive_shared_key, key_from_base64, key_to_base64};
