//! The idempotent write pipeline every mutating operation in this engine
//! goes through: `BuildOps -> ValidateOps -> CommitTx ->
//! RenderResponse`.
//!
//! `BuildOps`/`ValidateOps` are the caller's business logic - a closure
//! that either fails validation before touching the store, or returns the
//! response to hand back plus the write batch needed to produce it. This
//! pipeline's job is only the idempotency envelope around that: fingerprint
//! the request, replay a prior response on a key reuse with the same body,
//! reject a key reuse with a different body, and otherwise commit the
//! batch together with the `IDEMPOTENCY_STORE` record in the same
//! transaction so a crash between committing and recording idempotency is
//! impossible.

use std::future::Future;

use nooterra_canon::content_hash;
use nooterra_store::{Store, WriteOp};
use nooterra_types::ids::{ContentHash, IdempotencyKey, TenantId};
use nooterra_types::types::IdempotencyRecord;
use nooterra_types::NooterraError;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Serialize)]
struct RequestFingerprint<'a> {
    method: &'a str,
    path: &'a str,
    body: &'a serde_json::Value,
}

/// Hash the request's identity the way a repeated call with the same
/// idempotency key must reproduce exactly, so a client retrying the exact
/// same write gets the exact same fingerprint back.
pub fn fingerprint(method: &str, path: &str, body: &serde_json::Value) -> Result<String, NooterraError> {
    content_hash(&RequestFingerprint { method, path, body }).map_err(NooterraError::from)
}

pub struct WritePipeline {
    store: Arc<dyn Store>,
}

impl WritePipeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run `build` under the idempotency envelope for `(tenant_id, key)`.
    ///
    /// `build` is the `BuildOps -> ValidateOps` half: it runs the business
    /// operation and returns `(response, ops)` without committing
    /// anything. This method adds the `PutIdempotency` record to that
    /// batch and commits it as a single `CommitTx`, then returns the
    /// response as `RenderResponse`. On a replayed key with a matching
    /// fingerprint, `build` never runs at all - the stored response is
    /// returned directly.
    pub async fn execute<F, Fut>(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
        method: &str,
        path: &str,
        body: &serde_json::Value,
        build: F,
    ) -> Result<serde_json::Value, NooterraError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(serde_json::Value, Vec<WriteOp>), NooterraError>>,
    {
        let fp = fingerprint(method, path, body)?;

        if let Some(existing) = self.store.lookup_idempotent(tenant_id, key).await? {
            if existing.fingerprint.as_str() == fp {
                debug!("replaying cached response for idempotency key {}", key);
                return Ok(existing.response);
            }
            warn!("idempotency key {} reused with a different request body", key);
            return Err(NooterraError::IdempotencyKeyReusedWithDifferentBody {
                key: key.to_string(),
            });
        }

        let (response, mut ops) = build().await?;

        ops.push(WriteOp::PutIdempotency(IdempotencyRecord {
            tenant_id: tenant_id.clone(),
            key: key.clone(),
            fingerprint: ContentHash::new(fp),
            response: response.clone(),
            created_at: Utc::now(),
        }));

        self.store.commit_tx(tenant_id, ops).await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline() -> WritePipeline {
        WritePipeline::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn replays_cached_response_without_rerunning_build() {
        let pipeline = pipeline();
        let tenant = TenantId::new();
        let key = IdempotencyKey::new("idem-key-1");
        let body = serde_json::json!({"agentId": "agent_1", "amountCents": 100});
        let calls = AtomicUsize::new(0);

        let run = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, NooterraError>((serde_json::json!({"runId": "run_1"}), vec![]))
        };

        let first = pipeline
            .execute(&tenant, &key, "POST", "/v1/runs", &body, run)
            .await
            .unwrap();

        let run_again = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, NooterraError>((serde_json::json!({"runId": "run_2"}), vec![]))
        };
        let second = pipeline
            .execute(&tenant, &key, "POST", "/v1/runs", &body, run_again)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_same_key_with_different_body() {
        let pipeline = pipeline();
        let tenant = TenantId::new();
        let key = IdempotencyKey::new("idem-key-1");
        let body_a = serde_json::json!({"amountCents": 100});
        let body_b = serde_json::json!({"amountCents": 200});

        pipeline
            .execute(&tenant, &key, "POST", "/v1/runs", &body_a, || async {
                Ok::<_, NooterraError>((serde_json::json!({"ok": true}), vec![]))
            })
            .await
            .unwrap();

        let err = pipeline
            .execute(&tenant, &key, "POST", "/v1/runs", &body_b, || async {
                Ok::<_, NooterraError>((serde_json::json!({"ok": true}), vec![]))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_BODY");
    }

    #[tokio::test]
    async fn build_failure_never_reaches_the_store() {
        let pipeline = pipeline();
        let tenant = TenantId::new();
        let key = IdempotencyKey::new("idem-key-1");
        let body = serde_json::json!({});

        let err = pipeline
            .execute(&tenant, &key, "POST", "/v1/runs", &body, || async {
                Err::<(serde_json::Value, Vec<WriteOp>), _>(NooterraError::PayloadRequired)
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_REQUIRED");

        assert!(pipeline.store.lookup_idempotent(&tenant, &key).await.unwrap().is_none());
    }
}
