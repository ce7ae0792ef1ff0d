//! Content-addressed, immutable artifact registry.
//!
//! An artifact is "proof that something happened": a verification report,
//! a marketplace agreement, an arbitration verdict. Each is addressed by
//! the SHA-256 of its canonical body, so insertion is naturally
//! idempotent - a caller that resubmits the same body gets the same
//! artifact back rather than a duplicate: a stable, replayable record of
//! why an action was authorized rather than a mutable log line.

use nooterra_canon::content_hash;
use nooterra_store::{Store, WriteOp};
use nooterra_types::ids::{ArtifactId, ContentHash, TenantId};
use nooterra_types::types::{Artifact, ArtifactSignature};
use nooterra_types::NooterraError;
use std::sync::Arc;

pub struct ArtifactRegistry {
    store: Arc<dyn Store>,
}

impl ArtifactRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Insert `body` as an artifact of `artifact_type`, attaching any
    /// signatures gathered so far. If an artifact with the same content
    /// hash already exists for this tenant, the existing artifact is
    /// returned unchanged - the caller's signatures are not merged in,
    /// since an identical body should already carry whatever signatures
    /// accompanied its first insertion.
    pub async fn insert(
        &self,
        tenant_id: &TenantId,
        artifact_type: &str,
        body: serde_json::Value,
        signatures: Vec<ArtifactSignature>,
    ) -> Result<Artifact, NooterraError> {
        let hash = ContentHash::new(content_hash(&body)?);

        if let Some(existing) = self.store.get_artifact(tenant_id, &hash).await? {
            return Ok(existing);
        }

        let artifact = Artifact {
            artifact_id: ArtifactId::new(),
            tenant_id: tenant_id.clone(),
            artifact_hash: hash.clone(),
            artifact_type: artifact_type.to_string(),
            body,
            signatures,
            created_at: chrono::Utc::now(),
        };

        self.store
            .commit_tx(tenant_id, vec![WriteOp::PutArtifactIfAbsent(artifact.clone())])
            .await?;

        self.store
            .get_artifact(tenant_id, &hash)
            .await?
            .ok_or_else(|| NooterraError::ArtifactNotFound {
                hash: hash.to_string(),
            })
    }

    pub async fn lookup(
        &self,
        tenant_id: &TenantId,
        hash: &ContentHash,
    ) -> Result<Artifact, NooterraError> {
        self.store
            .get_artifact(tenant_id, hash)
            .await?
            .ok_or_else(|| NooterraError::ArtifactNotFound {
                hash: hash.to_string(),
            })
    }

    /// Verify that an artifact's stored hash is still the hash of its
    /// current body - guards against an in-process bug that mutated a
    /// supposedly immutable record rather than inserting a new one.
    pub fn verify_integrity(artifact: &Artifact) -> Result<(), NooterraError> {
        let recomputed = ContentHash::new(content_hash(&artifact.body)?);
        if recomputed != artifact.artifact_hash {
            return Err(NooterraError::ArtifactHashMismatch {
                computed: recomputed.to_string(),
                expected: artifact.artifact_hash.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;

    #[tokio::test]
    async fn insert_is_idempotent_on_body_hash() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = ArtifactRegistry::new(store);
        let tenant = TenantId::new();
        let body = serde_json::json!({"kind": "verification_report", "passed": true});

        let a1 = registry
            .insert(&tenant, "verification_report", body.clone(), vec![])
            .await
            .unwrap();
        let a2 = registry
            .insert(&tenant, "verification_report", body, vec![])
            .await
            .unwrap();

        assert_eq!(a1.artifact_id, a2.artifact_id);
        assert_eq!(a1.artifact_hash, a2.artifact_hash);
    }

    #[tokio::test]
    async fn different_bodies_get_different_hashes() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let registry = ArtifactRegistry::new(store);
        let tenant = TenantId::new();

        let a1 = registry
            .insert(&tenant, "t", serde_json::json!({"v": 1}), vec![])
            .await
            .unwrap();
        let a2 = registry
            .insert(&tenant, "t", serde_json::json!({"v": 2}), vec![])
            .await
            .unwrap();

        assert_ne!(a1.artifact_hash, a2.artifact_hash);
    }

    #[test]
    fn verify_integrity_detects_tampering() {
        let artifact = Artifact {
            artifact_id: ArtifactId::new(),
            tenant_id: TenantId::new(),
            artifact_hash: ContentHash::new("not-the-real-hash"),
            artifact_type: "t".to_string(),
            body: serde_json::json!({"v": 1}),
            signatures: vec![],
            created_at: chrono::Utc::now(),
        };
        assert!(ArtifactRegistry::verify_integrity(&artifact).is_err());
    }
}
