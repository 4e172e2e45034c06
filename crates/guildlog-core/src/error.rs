//! Error types for the guild log core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Guild log core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hash mismatch (computed != transmitted id)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid private key material
    #[error("invalid private key")]
    InvalidPrivateKey,

    /// Number not representable in the canonical encoding
    #[error("non-finite number not allowed in canonical encoding")]
    NonFiniteNumber,

    /// Malformed hex input
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// AEAD encryption/decryption failure
    #[error("aead failure: {0}")]
    Aead(String),
}
