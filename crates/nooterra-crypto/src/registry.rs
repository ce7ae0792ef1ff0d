//! In-memory key registry.
//!
//! **Security invariant: private key material never leaves the registry.**
//! Callers get back `KeyId`s and `PublicKey`s; signing happens inside
//! `KeyRegistry::sign`.
//!
//! Keys are scoped either to a single tenant or, for `KeyRole::Server`
//! keys only, globally (`tenant_id: None`). A global server key is an
//! explicit policy decision recorded on the key record itself - it is
//! never inferred by skipping a tenant filter.

use crate::{CryptoError, CryptoResult, KeyPair, PublicKey, Signature, SignaturePurpose};
use chrono::{DateTime, Utc};
use nooterra_types::ids::{KeyId, TenantId};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Robot,
    Operator,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Rotated,
    Revoked,
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyStatus::Active => "active",
            KeyStatus::Rotated => "rotated",
            KeyStatus::Revoked => "revoked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct KeyMetadata {
    pub role: KeyRole,
    pub status: KeyStatus,
    /// `None` only for a `KeyRole::Server` key - an explicit global scope.
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    /// A rotated key still verifies signatures produced before this time.
    pub valid_until: Option<DateTime<Utc>>,
}

impl KeyMetadata {
    pub fn is_global(&self) -> bool {
        matches!(self.role, KeyRole::Server) && self.tenant_id.is_none()
    }
}

struct RegistryEntry {
    keypair: KeyPair,
    metadata: KeyMetadata,
}

pub struct KeyRegistry {
    keys: RwLock<HashMap<KeyId, RegistryEntry>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    fn insert(
        &self,
        keypair: KeyPair,
        role: KeyRole,
        tenant_id: Option<TenantId>,
    ) -> CryptoResult<(KeyId, PublicKey)> {
        if !matches!(role, KeyRole::Server) && tenant_id.is_none() {
            return Err(CryptoError::InvalidKeyFormat(
                "only server-role keys may be tenant-less (global)".to_string(),
            ));
        }

        let public_key = PublicKey::from_keypair(&keypair);
        let key_id = KeyId::new();

        let entry = RegistryEntry {
            keypair,
            metadata: KeyMetadata {
                role,
                status: KeyStatus::Active,
                tenant_id,
                created_at: Utc::now(),
                rotated_at: None,
                valid_until: None,
            },
        };

        self.keys
            .write()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?
            .insert(key_id.clone(), entry);

        Ok((key_id, public_key))
    }

    pub fn generate_tenant_key(
        &self,
        role: KeyRole,
        tenant_id: TenantId,
    ) -> CryptoResult<(KeyId, PublicKey)> {
        self.insert(KeyPair::generate(), role, Some(tenant_id))
    }

    /// Generate a global server key. This is the only role allowed to
    /// bypass tenant scoping, and only through this explicit entry point.
    pub fn generate_global_server_key(&self) -> CryptoResult<(KeyId, PublicKey)> {
        self.insert(KeyPair::generate(), KeyRole::Server, None)
    }

    pub fn get_public_key(&self, key_id: &KeyId) -> CryptoResult<PublicKey> {
        let keys = self
            .keys
            .read()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;
        Ok(PublicKey::from_keypair(&entry.keypair))
    }

    pub fn get_metadata(&self, key_id: &KeyId) -> CryptoResult<KeyMetadata> {
        let keys = self
            .keys
            .read()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;
        Ok(entry.metadata.clone())
    }

    /// Sign `hash_hex` (a SHA-256 hex digest) on behalf of `tenant_id`
    /// using `key_id`. Fails if the key is revoked, or if it is
    /// tenant-scoped to a different tenant.
    pub fn sign(
        &self,
        key_id: &KeyId,
        tenant_id: &TenantId,
        purpose: SignaturePurpose,
        hash_hex: &str,
    ) -> CryptoResult<Signature> {
        let keys = self
            .keys
            .read()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;

        match entry.metadata.status {
            KeyStatus::Revoked => {
                return Err(CryptoError::CannotSign(key_id.to_string(), "key is revoked".to_string()))
            }
            KeyStatus::Rotated => {
                return Err(CryptoError::CannotSign(
                    key_id.to_string(),
                    "key has been rotated and can only verify historical signatures".to_string(),
                ))
            }
            KeyStatus::Active => {}
        }

        if let Some(owner) = &entry.metadata.tenant_id {
            if owner != tenant_id {
                return Err(CryptoError::CannotSign(
                    key_id.to_string(),
                    format!("key is scoped to a different tenant ({owner})"),
                ));
            }
        }

        Signature::sign(&entry.keypair, purpose, hash_hex)
    }

    /// Verify a signature was produced by `key_id` and that the key is
    /// usable for `tenant_id` - either because it is scoped to that
    /// tenant, or because it is an explicitly global server key.
    pub fn verify_for_tenant(
        &self,
        key_id: &KeyId,
        tenant_id: &TenantId,
        signature: &Signature,
        hash_hex: &str,
    ) -> CryptoResult<bool> {
        let keys = self
            .keys
            .read()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;

        let scoped_ok = match &entry.metadata.tenant_id {
            Some(owner) => owner == tenant_id,
            None => entry.metadata.is_global(),
        };
        if !scoped_ok {
            return Ok(false);
        }

        if entry.metadata.status == KeyStatus::Revoked {
            return Ok(false);
        }

        if let (KeyStatus::Rotated, Some(valid_until)) =
            (entry.metadata.status, entry.metadata.valid_until)
        {
            if signature.signed_at > valid_until {
                return Ok(false);
            }
        }

        signature.verify(hash_hex)
    }

    pub fn rotate(&self, key_id: &KeyId, valid_until: DateTime<Utc>) -> CryptoResult<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;
        entry.metadata.status = KeyStatus::Rotated;
        entry.metadata.rotated_at = Some(Utc::now());
        entry.metadata.valid_until = Some(valid_until);
        Ok(())
    }

    pub fn revoke(&self, key_id: &KeyId) -> CryptoResult<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))?;
        entry.metadata.status = KeyStatus::Revoked;
        Ok(())
    }

    pub fn list_for_tenant(&self, tenant_id: &TenantId) -> CryptoResult<Vec<(KeyId, KeyMetadata)>> {
        let keys = self
            .keys
            .read()
            .map_err(|e| CryptoError::VaultError(e.to_string()))?;
        Ok(keys
            .iter()
            .filter(|(_, e)| {
                e.metadata
                    .tenant_id
                    .as_ref()
                    .map(|t| t == tenant_id)
                    .unwrap_or(e.metadata.is_global())
            })
            .map(|(id, e)| (id.clone(), e.metadata.clone()))
            .collect())
    }
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide default registry, a convenience singleton. Production
/// call sites should prefer an explicitly
/// constructed, injected `KeyRegistry` - this exists only as a default for
/// small tools and tests.
static DEFAULT_REGISTRY: std::sync::OnceLock<KeyRegistry> = std::sync::OnceLock::new();

pub fn default_registry() -> &'static KeyRegistry {
    DEFAULT_REGISTRY.get_or_init(KeyRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn hash_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[test]
    fn tenant_scoped_key_signs_and_verifies_for_its_tenant() {
        let registry = KeyRegistry::new();
        let tenant = TenantId::new();
        let (key_id, _) = registry.generate_tenant_key(KeyRole::Robot, tenant.clone()).unwrap();

        let hash = hash_hex(b"evt:stream_1:seq:1");
        let signature = registry
            .sign(&key_id, &tenant, SignaturePurpose::EventAppend, &hash)
            .unwrap();

        assert!(registry
            .verify_for_tenant(&key_id, &tenant, &signature, &hash)
            .unwrap());
    }

    #[test]
    fn tenant_scoped_key_rejected_for_other_tenant() {
        let registry = KeyRegistry::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let (key_id, _) = registry
            .generate_tenant_key(KeyRole::Robot, tenant_a.clone())
            .unwrap();

        assert!(registry
            .sign(&key_id, &tenant_b, SignaturePurpose::EventAppend, &hash_hex(b"x"))
            .is_err());
    }

    #[test]
    fn global_server_key_is_valid_for_any_tenant() {
        let registry = KeyRegistry::new();
        let (key_id, _) = registry.generate_global_server_key().unwrap();

        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let hash = hash_hex(b"server-issued attestation");

        let signature = registry
            .sign(&key_id, &tenant_a, SignaturePurpose::BundleHeadAttestation, &hash)
            .unwrap();

        assert!(registry
            .verify_for_tenant(&key_id, &tenant_a, &signature, &hash)
            .unwrap());
        assert!(registry
            .verify_for_tenant(&key_id, &tenant_b, &signature, &hash)
            .unwrap());
    }

    #[test]
    fn non_server_role_cannot_be_global() {
        let registry = KeyRegistry::new();
        let err = registry.insert(KeyPair::generate(), KeyRole::Robot, None);
        assert!(err.is_err());
    }

    #[test]
    fn revoked_key_fails_verification() {
        let registry = KeyRegistry::new();
        let tenant = TenantId::new();
        let (key_id, _) = registry.generate_tenant_key(KeyRole::Operator, tenant.clone()).unwrap();
        let hash = hash_hex(b"payload");
        let signature = registry
            .sign(&key_id, &tenant, SignaturePurpose::EventAppend, &hash)
            .unwrap();

        registry.revoke(&key_id).unwrap();
        assert!(!registry
            .verify_for_tenant(&key_id, &tenant, &signature, &hash)
            .unwrap());
    }

    #[test]
    fn revoked_key_cannot_sign() {
        let registry = KeyRegistry::new();
        let tenant = TenantId::new();
        let (key_id, _) = registry.generate_tenant_key(KeyRole::Operator, tenant.clone()).unwrap();
        registry.revoke(&key_id).unwrap();

        let err = registry
            .sign(&key_id, &tenant, SignaturePurpose::EventAppend, &hash_hex(b"payload"))
            .unwrap_err();
        let err: nooterra_types::NooterraError = err.into();
        assert_eq!(err.code(), "SIGNER_CANNOT_SIGN");
    }

    #[test]
    fn rotated_key_still_verifies_within_validity_window() {
        let registry = KeyRegistry::new();
        let tenant = TenantId::new();
        let (key_id, _) = registry.generate_tenant_key(KeyRole::Operator, tenant.clone()).unwrap();
        let hash = hash_hex(b"payload");
        let signature = registry
            .sign(&key_id, &tenant, SignaturePurpose::EventAppend, &hash)
            .unwrap();

        registry.rotate(&key_id, Utc::now() + chrono::Duration::hours(1)).unwrap();
        assert!(registry
            .verify_for_tenant(&key_id, &tenant, &signature, &hash)
            .unwrap());
    }
}
