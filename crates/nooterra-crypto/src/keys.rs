//! Ed25519 key material.

use crate::pem::{self, PemError};
use crate::{CryptoError, CryptoResult};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// A key pair for signing operations. The signing key never serializes.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    pub fn public_key_pem(&self) -> String {
        pem::encode_public_key(self.verifying_key.as_bytes())
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Public key reference, safe to share and persist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub key_hex: String,
    pub algorithm: KeyAlgorithm,
}

impl PublicKey {
    pub fn from_keypair(keypair: &KeyPair) -> Self {
        Self {
            key_hex: keypair.public_key_hex(),
            algorithm: KeyAlgorithm::Ed25519,
        }
    }

    pub fn from_pem(pem_text: &str) -> CryptoResult<Self> {
        let bytes = pem::decode_public_key(pem_text).map_err(|e: PemError| {
            CryptoError::InvalidKeyFormat(e.to_string())
        })?;
        Ok(Self {
            key_hex: hex::encode(bytes),
            algorithm: KeyAlgorithm::Ed25519,
        })
    }

    pub fn to_pem(&self) -> CryptoResult<String> {
        let bytes = hex::decode(&self.key_hex)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;
        Ok(pem::encode_public_key(&bytes))
    }

    pub fn to_verifying_key(&self) -> CryptoResult<VerifyingKey> {
        let bytes = hex::decode(&self.key_hex)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))?;

        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyFormat(
                "public key must be 32 bytes".to_string(),
            ));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);

        VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Ed25519,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        Self::Ed25519
    }
}
