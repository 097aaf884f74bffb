use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

pub const KEY_SIZE: usize = 32;

/// HKDF info string. Peers derive with the same value; changing it breaks
/// interoperability.
pub const KEY_DERIVATION_INFO: &[u8] = b"tether-sync-v1";

/// 256-bit AES key shared with the peer. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Short, non-reversible identifier for log correlation.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}

/// Local X25519 identity used to pair with a peer.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    pub fn secret_key(&self) -> [u8; KEY_SIZE] {
        self.secret.to_bytes()
    }
}

/// ECDH over X25519, then HKDF-SHA256 with an empty salt and
/// [`KEY_DERIVATION_INFO`]. Output must be byte-identical to the peers'.
pub fn derive_shared_key(
    secret_key: &[u8; KEY_SIZE],
    peer_public_key: &[u8; KEY_SIZE],
) -> Result<SymmetricKey, CryptoError> {
    let secret = StaticSecret::from(*secret_key);
    let peer = PublicKey::from(*peer_public_key);
    let shared = secret.diffie_hellman(&peer);

    // Low-order peer points collapse the secret to zero.
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }

    let salt: &[u8] = &[];
    let hk = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(KEY_DERIVATION_INFO, &mut okm)
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(SymmetricKey(okm))
}

/// Encode a key to base64 for storage/sharing.
pub fn key_to_base64(key: &[u8; KEY_SIZE]) -> String {
    BASE64.encode(key)
}

/// Decode a base64 key.
pub fn key_from_base64(encoded: &str) -> Result<[u8; KEY_SIZE], CryptoError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}
