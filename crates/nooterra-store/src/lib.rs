//! Transactional store abstraction.
//!
//! Every tenant-visible resource in this engine is written through a
//! single `commit_tx` call: a batch of ops that either all apply or none
//! do. Callers (the chain engine, the ledger, run/marketplace/dispute
//! reducers) compute the *new* state - including any hash-chain linkage -
//! before calling in; the store's only job is to apply the batch
//! atomically and enforce the uniqueness/CAS constraints the spec assigns
//! to its indices: `(tenantId, idempotencyKey)`, `(streamId,
//! prevChainHash)`, and `(tenantId, artifactHash)`.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod pg;

use async_trait::async_trait;
use nooterra_types::ids::{ContentHash, IdempotencyKey, StreamId, TenantId};
use nooterra_types::types::{Artifact, Event, IdempotencyRecord};
use nooterra_types::NooterraError;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryStore;

/// One write against the store. A `commit_tx` batch is a list of these,
/// applied atomically.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Append an event to a stream. `event.sequence` and `event.chain_hash`
    /// must already be computed by the caller (see `nooterra-chain`);
    /// the store only checks that `event.prev_chain_hash` matches the
    /// stream's current head, failing the whole batch with
    /// `ChainHashMismatch` if another writer got there first.
    AppendEvent(Event),
    /// Insert an artifact if its hash is not already present. A hash that
    /// already exists is treated as a successful no-op (dedupe), never an
    /// error, since content addressing guarantees equal hash implies
    /// equal body.
    PutArtifactIfAbsent(Artifact),
    /// Upsert an arbitrary projection row, keyed by an opaque `(kind,
    /// key)` pair within the tenant. Used by the ledger, run, marketplace,
    /// and dispute reducers to persist their read models alongside the
    /// event that produced them.
    ///
    /// `expected_revision` is the spec's CAS over a projection row: `Some(n)`
    /// requires the currently stored row's `"revision"` field to equal `n`
    /// (a missing row counts as revision `0`, so `Some(0)` is "create, must
    /// not already exist"). `None` skips the check entirely. A mismatch
    /// fails the whole batch with `RevisionConflict`.
    UpsertProjection {
        kind: String,
        key: String,
        value: serde_json::Value,
        expected_revision: Option<u64>,
    },
    /// Record a successful idempotent write. Fails the batch with
    /// `IdempotencyKeyReusedWithDifferentBody` if the key was already
    /// recorded with a different fingerprint.
    PutIdempotency(IdempotencyRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRow {
    pub key: String,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Apply `ops` atomically for `tenant_id`. On any failure, no op in
    /// the batch is visible to subsequent reads.
    async fn commit_tx(
        &self,
        tenant_id: &TenantId,
        ops: Vec<WriteOp>,
    ) -> Result<(), NooterraError>;

    async fn get_stream_head(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Option<Event>, NooterraError>;

    async fn get_events(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Vec<Event>, NooterraError>;

    async fn get_artifact(
        &self,
        tenant_id: &TenantId,
        hash: &ContentHash,
    ) -> Result<Option<Artifact>, NooterraError>;

    /// Batch lookup; missing hashes are simply absent from the result
    /// rather than failing the whole call.
    async fn get_artifacts(
        &self,
        tenant_id: &TenantId,
        hashes: &[ContentHash],
    ) -> Result<std::collections::HashMap<ContentHash, Artifact>, NooterraError> {
        let mut out = std::collections::HashMap::new();
        for hash in hashes {
            if let Some(artifact) = self.get_artifact(tenant_id, hash).await? {
                out.insert(hash.clone(), artifact);
            }
        }
        Ok(out)
    }

    async fn get_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, NooterraError>;

    async fn list_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
    ) -> Result<Vec<ProjectionRow>, NooterraError>;

    async fn lookup_idempotent(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, NooterraError>;
}
