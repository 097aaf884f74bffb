use tether_crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by the sync service, either returned from calls or
/// published on the error stream. `Clone` so one error can reach every
/// subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No asymmetric keys stored; the device has to be paired again.
    #[error("encryption key missing")]
    EncryptionKeyMissing,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid key material")]
    InvalidKey,

    #[error("unsupported bundle format 0x{0:02x}")]
    UnsupportedFormat(u8),

    #[error("session revival failed for {session_id}: {reason}")]
    SessionRevivalFailed { session_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// True when retrying cannot help and the user has to re-pair.
    pub fn needs_repair(&self) -> bool {
        matches!(self, Self::EncryptionKeyMissing | Self::InvalidKey)
    }
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKey => Self::InvalidKey,
            CryptoError::DecryptionFailed(detail) => Self::DecryptionFailed(detail),
            CryptoError::UnsupportedFormat(version) => Self::UnsupportedFormat(version),
            CryptoError::EncryptionFailed(detail) => Self::SendFailed(detail),
        }
    }
}
