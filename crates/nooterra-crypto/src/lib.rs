//! Ed25519 signing, verification, and key registry for the Nooterra engine.
//!
//! # Security invariant
//!
//! **Private key material never leaves the `KeyRegistry`.** Callers only
//! ever see `KeyId`s and `PublicKey`s; signing happens inside the
//! registry.

pub mod keys;
pub mod pem;
pub mod registry;
pub mod signature;

pub use keys::*;
pub use registry::*;
pub use signature::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("key {0} cannot sign: {1}")]
    CannotSign(String, String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("vault error: {0}")]
    VaultError(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),
}

impl From<CryptoError> for nooterra_types::NooterraError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyNotFound(key_id) => nooterra_types::NooterraError::KeyNotFound { key_id },
            CryptoError::VerificationFailed(_) => nooterra_types::NooterraError::SignatureInvalid,
            CryptoError::CannotSign(key_id, reason) => nooterra_types::NooterraError::SignerCannotSign {
                key_id,
                reason,
            },
            other => nooterra_types::NooterraError::Serialization {
                message: other.to_string(),
            },
        }
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
