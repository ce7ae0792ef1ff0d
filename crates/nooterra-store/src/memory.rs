//! In-memory `Store` implementation, the default backend for tests and
//! single-process deployments: an `Arc<RwLock<HashMap<...>>>` guarded by a
//! single lock for the whole mutation, scoped per tenant.

use crate::{ProjectionRow, Store, WriteOp};
use async_trait::async_trait;
use nooterra_types::ids::{ContentHash, IdempotencyKey, StreamId, TenantId};
use nooterra_types::types::{Artifact, Event, IdempotencyRecord};
use nooterra_types::NooterraError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct TenantState {
    streams: HashMap<StreamId, Vec<Event>>,
    artifacts: HashMap<ContentHash, Artifact>,
    projections: HashMap<(String, String), serde_json::Value>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
}

pub struct InMemoryStore {
    tenants: Arc<RwLock<HashMap<TenantId, TenantState>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tenants: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn commit_tx(
        &self,
        tenant_id: &TenantId,
        ops: Vec<WriteOp>,
    ) -> Result<(), NooterraError> {
        let mut tenants = self.tenants.write().await;
        let state = tenants.entry(tenant_id.clone()).or_default();

        // Validate the whole batch before mutating anything, so a failure
        // partway through never leaves a partial write visible.
        for op in &ops {
            match op {
                WriteOp::AppendEvent(event) => {
                    let head = state.streams.get(&event.stream_id).and_then(|v| v.last());
                    let expected = head.map(|e| e.chain_hash.clone());
                    if expected != event.prev_chain_hash {
                        return Err(NooterraError::ChainHashMismatch {
                            stream_id: event.stream_id.to_string(),
                            sequence: event.sequence,
                        });
                    }
                }
                WriteOp::PutIdempotency(record) => {
                    if let Some(existing) = state.idempotency.get(&record.key) {
                        if existing.fingerprint != record.fingerprint {
                            return Err(NooterraError::IdempotencyKeyReusedWithDifferentBody {
                                key: record.key.to_string(),
                            });
                        }
                    }
                }
                WriteOp::UpsertProjection {
                    kind,
                    key,
                    expected_revision: Some(expected),
                    ..
                } => {
                    let current = state
                        .projections
                        .get(&(kind.clone(), key.clone()))
                        .and_then(|v| v.get("revision"))
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    if current != *expected {
                        return Err(NooterraError::RevisionConflict {
                            kind: kind.clone(),
                            key: key.clone(),
                            expected: *expected,
                            actual: current,
                        });
                    }
                }
                WriteOp::PutArtifactIfAbsent(_) | WriteOp::UpsertProjection { .. } => {}
            }
        }

        for op in ops {
            match op {
                WriteOp::AppendEvent(event) => {
                    state.streams.entry(event.stream_id.clone()).or_default().push(event);
                }
                WriteOp::PutArtifactIfAbsent(artifact) => {
                    state
                        .artifacts
                        .entry(artifact.artifact_hash.clone())
                        .or_insert(artifact);
                }
                WriteOp::UpsertProjection { kind, key, value, .. } => {
                    state.projections.insert((kind, key), value);
                }
                WriteOp::PutIdempotency(record) => {
                    state.idempotency.entry(record.key.clone()).or_insert(record);
                }
            }
        }

        Ok(())
    }

    async fn get_stream_head(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Option<Event>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .and_then(|s| s.streams.get(stream_id))
            .and_then(|v| v.last())
            .cloned())
    }

    async fn get_events(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Vec<Event>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .and_then(|s| s.streams.get(stream_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_artifact(
        &self,
        tenant_id: &TenantId,
        hash: &ContentHash,
    ) -> Result<Option<Artifact>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(tenant_id).and_then(|s| s.artifacts.get(hash)).cloned())
    }

    async fn get_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .and_then(|s| s.projections.get(&(kind.to_string(), key.to_string())))
            .cloned())
    }

    async fn list_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
    ) -> Result<Vec<ProjectionRow>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(tenant_id)
            .map(|s| {
                s.projections
                    .iter()
                    .filter(|((k, _), _)| k == kind)
                    .map(|((_, key), value)| ProjectionRow {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn lookup_idempotent(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, NooterraError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(tenant_id).and_then(|s| s.idempotency.get(key)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_types::ids::EventId;
    use nooterra_types::types::Event;

    fn sample_event(stream_id: &StreamId, seq: u64, prev: Option<ContentHash>) -> Event {
        let payload = serde_json::json!({"seq": seq});
        Event {
            v: 1,
            event_id: EventId::new(),
            tenant_id: TenantId::from("tenant_1"),
            stream_id: stream_id.clone(),
            sequence: seq,
            event_type: "test.event".to_string(),
            actor: "test".to_string(),
            payload_hash: ContentHash::new(format!("payload_hash_{seq}")),
            payload,
            prev_chain_hash: prev,
            chain_hash: ContentHash::new(format!("hash_{seq}")),
            recorded_at: chrono::Utc::now(),
            signature: None,
        }
    }

    #[tokio::test]
    async fn append_enforces_cas_on_prev_chain_hash() {
        let store = InMemoryStore::new();
        let tenant = TenantId::from("tenant_1");
        let stream = StreamId::from("stream_1");

        let e1 = sample_event(&stream, 1, None);
        store
            .commit_tx(&tenant, vec![WriteOp::AppendEvent(e1.clone())])
            .await
            .unwrap();

        // Wrong predecessor hash should fail.
        let e2_wrong = sample_event(&stream, 2, Some(ContentHash::new("wrong")));
        assert!(store
            .commit_tx(&tenant, vec![WriteOp::AppendEvent(e2_wrong)])
            .await
            .is_err());

        // Correct predecessor succeeds.
        let e2 = sample_event(&stream, 2, Some(e1.chain_hash.clone()));
        store
            .commit_tx(&tenant, vec![WriteOp::AppendEvent(e2)])
            .await
            .unwrap();

        let events = store.get_events(&tenant, &stream).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn idempotency_reuse_with_different_fingerprint_fails() {
        let store = InMemoryStore::new();
        let tenant = TenantId::from("tenant_1");
        let key = IdempotencyKey::new("req-1");

        let record1 = IdempotencyRecord {
            tenant_id: tenant.clone(),
            key: key.clone(),
            fingerprint: ContentHash::new("fp1"),
            response: serde_json::json!({"ok": true}),
            created_at: chrono::Utc::now(),
        };
        store
            .commit_tx(&tenant, vec![WriteOp::PutIdempotency(record1)])
            .await
            .unwrap();

        let record2 = IdempotencyRecord {
            tenant_id: tenant.clone(),
            key: key.clone(),
            fingerprint: ContentHash::new("fp2"),
            response: serde_json::json!({"ok": true}),
            created_at: chrono::Utc::now(),
        };
        let err = store
            .commit_tx(&tenant, vec![WriteOp::PutIdempotency(record2)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_BODY");
    }

    #[tokio::test]
    async fn projection_upsert_enforces_expected_revision() {
        let store = InMemoryStore::new();
        let tenant = TenantId::from("tenant_1");

        store
            .commit_tx(
                &tenant,
                vec![WriteOp::UpsertProjection {
                    kind: "wallet".to_string(),
                    key: "agent_1".to_string(),
                    value: serde_json::json!({"revision": 1, "available_cents": 100}),
                    expected_revision: Some(0),
                }],
            )
            .await
            .unwrap();

        // Stale caller still thinks revision is 0; must fail.
        let err = store
            .commit_tx(
                &tenant,
                vec![WriteOp::UpsertProjection {
                    kind: "wallet".to_string(),
                    key: "agent_1".to_string(),
                    value: serde_json::json!({"revision": 2, "available_cents": 200}),
                    expected_revision: Some(0),
                }],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REVISION_CONFLICT");

        // Correct predecessor revision succeeds.
        store
            .commit_tx(
                &tenant,
                vec![WriteOp::UpsertProjection {
                    kind: "wallet".to_string(),
                    key: "agent_1".to_string(),
                    value: serde_json::json!({"revision": 2, "available_cents": 200}),
                    expected_revision: Some(1),
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn artifact_insert_is_idempotent_on_hash() {
        let store = InMemoryStore::new();
        let tenant = TenantId::from("tenant_1");
        let hash = ContentHash::new("hash_abc");

        let artifact = Artifact {
            artifact_id: nooterra_types::ids::ArtifactId::new(),
            tenant_id: tenant.clone(),
            artifact_hash: hash.clone(),
            artifact_type: "test".to_string(),
            body: serde_json::json!({}),
            signatures: vec![],
            created_at: chrono::Utc::now(),
        };

        store
            .commit_tx(&tenant, vec![WriteOp::PutArtifactIfAbsent(artifact.clone())])
            .await
            .unwrap();
        store
            .commit_tx(&tenant, vec![WriteOp::PutArtifactIfAbsent(artifact)])
            .await
            .unwrap();

        assert!(store.get_artifact(&tenant, &hash).await.unwrap().is_some());
    }
}
