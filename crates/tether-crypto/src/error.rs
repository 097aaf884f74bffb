use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key material is malformed or yields a degenerate shared secret.
    /// Callers should re-pair rather than retry.
    #[error("invalid key material")]
    InvalidKey,

    /// Structural or authentication failure for a single bundle.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("unsupported bundle format 0x{0:02x}")]
    UnsupportedFormat(u8),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}
