//! Signing and verification over hex-hash digests, tagged with a typed
//! purpose that is recorded alongside the signature for audit but never
//! mixed into the signed bytes themselves.
//!
//! The signed message is never an arbitrary byte string: callers pass a
//! `hashHex` - a SHA-256 hex digest - and this module signs its raw
//! 32-byte decode, matching the artifact/event hashes computed by
//! `nooterra-canon`. The signature itself is base64-encoded.

use crate::{CryptoError, CryptoResult, KeyPair, PublicKey};
use base64::Engine;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};

/// What a signature attests to. Audit-only metadata: changing a
/// signature's recorded purpose does not change what bytes were signed,
/// so purposes must never be compared as part of verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePurpose {
    EventAppend,
    ArtifactAttestation,
    VerificationReport,
    BundleHeadAttestation,
    ArbitrationVerdict,
    MarketplaceAcceptance,
    X402Authorization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signature_base64: String,
    pub public_key: PublicKey,
    pub purpose: SignaturePurpose,
    pub signed_at: chrono::DateTime<chrono::Utc>,
}

impl Signature {
    /// Sign `hash_hex`, a SHA-256 hex digest (64 lowercase hex chars).
    /// `hash_hex` is decoded to its raw 32 bytes before signing - the
    /// hex string itself is never the signed message.
    pub fn sign(keypair: &KeyPair, purpose: SignaturePurpose, hash_hex: &str) -> CryptoResult<Self> {
        let message = decode_hash_hex(hash_hex)
            .map_err(|e| CryptoError::SigningFailed(format!("invalid hashHex: {e}")))?;
        let signature = keypair
            .signing_key()
            .try_sign(&message)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

        Ok(Self {
            signature_base64: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
            public_key: PublicKey::from_keypair(keypair),
            purpose,
            signed_at: chrono::Utc::now(),
        })
    }

    /// Verify the signature against `hash_hex`. Only the cryptographic
    /// signature is checked here; purpose/tenant/key-status policy lives
    /// in `KeyRegistry::verify`.
    pub fn verify(&self, hash_hex: &str) -> CryptoResult<bool> {
        let message = decode_hash_hex(hash_hex)
            .map_err(|e| CryptoError::VerificationFailed(format!("invalid hashHex: {e}")))?;

        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.signature_base64)
            .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;

        if signature_bytes.len() != 64 {
            return Err(CryptoError::VerificationFailed(
                "signature must be 64 bytes".to_string(),
            ));
        }

        let mut sig_array = [0u8; 64];
        sig_array.copy_from_slice(&signature_bytes);

        let signature = Ed25519Signature::from_bytes(&sig_array);
        let verifying_key = self.public_key.to_verifying_key()?;

        Ok(verifying_key.verify(&message, &signature).is_ok())
    }
}

fn decode_hash_hex(hash_hex: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hash_hex).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|_| "hashHex must decode to 32 bytes".to_string())
}

/// Types with a `hashHex` - a SHA-256 hex digest - that can be signed.
pub trait Signable {
    fn hash_hex(&self) -> String;
}

pub fn sign<T: Signable>(
    keypair: &KeyPair,
    purpose: SignaturePurpose,
    item: &T,
) -> CryptoResult<Signature> {
    Signature::sign(keypair, purpose, &item.hash_hex())
}

pub fn verify<T: Signable>(signature: &Signature, item: &T) -> CryptoResult<bool> {
    signature.verify(&item.hash_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn hash_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = KeyPair::generate();
        let hash = hash_hex(b"acct_available:agent_1 -100");

        let signature = Signature::sign(&keypair, SignaturePurpose::EventAppend, &hash).unwrap();
        assert!(signature.verify(&hash).unwrap());
    }

    #[test]
    fn wrong_message_fails_verification() {
        let keypair = KeyPair::generate();
        let signature =
            Signature::sign(&keypair, SignaturePurpose::EventAppend, &hash_hex(b"original"))
                .unwrap();
        assert!(!signature.verify(&hash_hex(b"tampered")).unwrap());
    }

    #[test]
    fn changing_purpose_does_not_change_signed_bytes_validity() {
        let keypair = KeyPair::generate();
        let hash = hash_hex(b"payload");
        let signature = Signature::sign(&keypair, SignaturePurpose::EventAppend, &hash).unwrap();

        let relabeled = Signature {
            purpose: SignaturePurpose::ArtifactAttestation,
            ..signature
        };
        assert!(relabeled.verify(&hash).unwrap());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::generate();
        let hash = hash_hex(b"payload");

        let signature = Signature::sign(&keypair1, SignaturePurpose::EventAppend, &hash).unwrap();
        let tampered = Signature {
            public_key: PublicKey::from_keypair(&keypair2),
            ..signature
        };
        assert!(!tampered.verify(&hash).unwrap());
    }

    #[test]
    fn rejects_hash_that_is_not_32_bytes() {
        let keypair = KeyPair::generate();
        assert!(Signature::sign(&keypair, SignaturePurpose::EventAppend, "abcd").is_err());
    }
}
