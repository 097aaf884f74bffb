use std::sync::{PoisonError, RwLock};

use tether_crypto::keys::KEY_SIZE;
use tether_crypto::{SymmetricKey, derive_shared_key, key_from_base64};

use crate::error::SyncError;

/// Locally stored asymmetric keys: our X25519 secret and the paired peer's
/// public key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub secret_key: [u8; KEY_SIZE],
    pub peer_public_key: [u8; KEY_SIZE],
}

impl KeyMaterial {
    pub fn new(secret_key: [u8; KEY_SIZE], peer_public_key: [u8; KEY_SIZE]) -> Self {
        Self {
            secret_key,
            peer_public_key,
        }
    }

    pub fn from_base64(secret_key: &str, peer_public_key: &str) -> Result<Self, SyncError> {
        Ok(Self {
            secret_key: key_from_base64(secret_key)?,
            peer_public_key: key_from_base64(peer_public_key)?,
        })
    }

    pub fn derive(&self) -> Result<SymmetricKey, SyncError> {
        Ok(derive_shared_key(&self.secret_key, &self.peer_public_key)?)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Source of the bearer token and key material. Implemented by whatever owns
/// persistent credentials (keychain, settings file, tests).
pub trait CredentialStore: Send + Sync {
    fn auth_token(&self) -> Option<String>;
    fn key_material(&self) -> Option<KeyMaterial>;
}

/// In-memory credential store.
#[derive(Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    keys: RwLock<Option<KeyMaterial>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, keys: Option<KeyMaterial>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            keys: RwLock::new(keys),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn set_key_material(&self, keys: KeyMaterial) {
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = Some(keys);
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl CredentialStore for StaticCredentials {
    fn auth_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn key_material(&self) -> Option<KeyMaterial> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
