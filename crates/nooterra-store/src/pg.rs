//! PostgreSQL-backed `Store`.
//!
//! DDL for the backing tables (`events`, `artifacts`, `projections`,
//! `idempotency_keys`) is an external collaborator's responsibility, the
//! same way the rest of this engine treats SQL migrations as out of
//! scope. This module only issues DML: a single `pool.begin()`
//! transaction per call, row locks via `SELECT ... FOR UPDATE` to
//! serialize concurrent writers on
//! the same stream, and an explicit `tx.commit()` at the end.

use crate::{ProjectionRow, Store, WriteOp};
use async_trait::async_trait;
use nooterra_types::ids::{ContentHash, IdempotencyKey, StreamId, TenantId};
use nooterra_types::types::{Artifact, Event, IdempotencyRecord};
use nooterra_types::NooterraError;
use sqlx::PgPool;
use tracing::warn;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_err(e: sqlx::Error) -> NooterraError {
    NooterraError::Storage {
        message: e.to_string(),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn commit_tx(
        &self,
        tenant_id: &TenantId,
        ops: Vec<WriteOp>,
    ) -> Result<(), NooterraError> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for op in ops {
            match op {
                WriteOp::AppendEvent(event) => {
                    // Lock the stream's current head row (if any) to
                    // serialize concurrent appenders, the same way
                    // WalletRepo locks a balance row before mutating it.
                    let head_hash: Option<String> = sqlx::query_scalar(
                        "SELECT chain_hash FROM events \
                         WHERE tenant_id = $1 AND stream_id = $2 \
                         ORDER BY sequence DESC LIMIT 1 FOR UPDATE",
                    )
                    .bind(tenant_id.as_str())
                    .bind(event.stream_id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage_err)?;

                    let expected = event.prev_chain_hash.as_ref().map(|h| h.to_string());
                    if head_hash != expected {
                        warn!("chain hash mismatch appending to stream {}", event.stream_id);
                        return Err(NooterraError::ChainHashMismatch {
                            stream_id: event.stream_id.to_string(),
                            sequence: event.sequence,
                        });
                    }

                    sqlx::query(
                        "INSERT INTO events \
                         (event_id, tenant_id, stream_id, sequence, event_type, actor, payload, \
                          payload_hash, prev_chain_hash, chain_hash, recorded_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                    )
                    .bind(event.event_id.as_str())
                    .bind(tenant_id.as_str())
                    .bind(event.stream_id.as_str())
                    .bind(event.sequence as i64)
                    .bind(&event.event_type)
                    .bind(&event.actor)
                    .bind(&event.payload)
                    .bind(event.payload_hash.to_string())
                    .bind(event.prev_chain_hash.as_ref().map(|h| h.to_string()))
                    .bind(event.chain_hash.to_string())
                    .bind(event.recorded_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                WriteOp::PutArtifactIfAbsent(artifact) => {
                    sqlx::query(
                        "INSERT INTO artifacts \
                         (artifact_id, tenant_id, artifact_hash, artifact_type, body, created_at) \
                         VALUES ($1, $2, $3, $4, $5, $6) \
                         ON CONFLICT (tenant_id, artifact_hash) DO NOTHING",
                    )
                    .bind(artifact.artifact_id.as_str())
                    .bind(tenant_id.as_str())
                    .bind(artifact.artifact_hash.to_string())
                    .bind(&artifact.artifact_type)
                    .bind(&artifact.body)
                    .bind(artifact.created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                WriteOp::UpsertProjection {
                    kind,
                    key,
                    value,
                    expected_revision,
                } => {
                    if let Some(expected) = expected_revision {
                        // Lock the row (if any) before comparing, the same
                        // way WalletRepo locks a balance row before mutating
                        // it, so two racing writers can't both pass the
                        // check.
                        let current_revision: Option<i64> = sqlx::query_scalar(
                            "SELECT (value->>'revision')::bigint FROM projections \
                             WHERE tenant_id = $1 AND kind = $2 AND key = $3 FOR UPDATE",
                        )
                        .bind(tenant_id.as_str())
                        .bind(&kind)
                        .bind(&key)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(storage_err)?;

                        let actual = current_revision.unwrap_or(0) as u64;
                        if actual != expected {
                            warn!("revision conflict on {}/{}: expected {}, found {}", kind, key, expected, actual);
                            return Err(NooterraError::RevisionConflict {
                                kind: kind.clone(),
                                key: key.clone(),
                                expected,
                                actual,
                            });
                        }
                    }

                    sqlx::query(
                        "INSERT INTO projections (tenant_id, kind, key, value) \
                         VALUES ($1, $2, $3, $4) \
                         ON CONFLICT (tenant_id, kind, key) DO UPDATE SET value = EXCLUDED.value",
                    )
                    .bind(tenant_id.as_str())
                    .bind(&kind)
                    .bind(&key)
                    .bind(&value)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                WriteOp::PutIdempotency(record) => {
                    let existing: Option<String> = sqlx::query_scalar(
                        "SELECT fingerprint FROM idempotency_keys \
                         WHERE tenant_id = $1 AND key = $2 FOR UPDATE",
                    )
                    .bind(tenant_id.as_str())
                    .bind(record.key.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage_err)?;

                    if let Some(existing_fp) = existing {
                        if existing_fp != record.fingerprint.to_string() {
                            return Err(NooterraError::IdempotencyKeyReusedWithDifferentBody {
                                key: record.key.to_string(),
                            });
                        }
                    } else {
                        sqlx::query(
                            "INSERT INTO idempotency_keys \
                             (tenant_id, key, fingerprint, response, created_at) \
                             VALUES ($1, $2, $3, $4, $5)",
                        )
                        .bind(tenant_id.as_str())
                        .bind(record.key.as_str())
                        .bind(record.fingerprint.to_string())
                        .bind(&record.response)
                        .bind(record.created_at)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                    }
                }
            }
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_stream_head(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Option<Event>, NooterraError> {
        let events = self.get_events(tenant_id, stream_id).await?;
        Ok(events.into_iter().last())
    }

    async fn get_events(
        &self,
        tenant_id: &TenantId,
        stream_id: &StreamId,
    ) -> Result<Vec<Event>, NooterraError> {
        let rows: Vec<(
            String,
            i64,
            String,
            String,
            serde_json::Value,
            String,
            Option<String>,
            String,
            chrono::DateTime<chrono::Utc>,
        )> = sqlx::query_as(
            "SELECT event_id, sequence, event_type, actor, payload, payload_hash, \
             prev_chain_hash, chain_hash, recorded_at \
             FROM events WHERE tenant_id = $1 AND stream_id = $2 ORDER BY sequence ASC",
        )
        .bind(tenant_id.as_str())
        .bind(stream_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(
                |(event_id, sequence, event_type, actor, payload, payload_hash, prev_chain_hash, chain_hash, recorded_at)| {
                    Event {
                        v: 1,
                        event_id: event_id.into(),
                        tenant_id: tenant_id.clone(),
                        stream_id: stream_id.clone(),
                        sequence: sequence as u64,
                        event_type,
                        actor,
                        payload,
                        payload_hash: ContentHash::new(payload_hash),
                        prev_chain_hash: prev_chain_hash.map(ContentHash::new),
                        chain_hash: ContentHash::new(chain_hash),
                        recorded_at,
                        signature: None,
                    }
                },
            )
            .collect())
    }

    async fn get_artifact(
        &self,
        tenant_id: &TenantId,
        hash: &ContentHash,
    ) -> Result<Option<Artifact>, NooterraError> {
        let row: Option<(String, String, serde_json::Value, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as(
                "SELECT artifact_id, artifact_type, body, created_at \
                 FROM artifacts WHERE tenant_id = $1 AND artifact_hash = $2",
            )
            .bind(tenant_id.as_str())
            .bind(hash.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|(artifact_id, artifact_type, body, created_at)| Artifact {
            artifact_id: artifact_id.into(),
            tenant_id: tenant_id.clone(),
            artifact_hash: hash.clone(),
            artifact_type,
            body,
            signatures: vec![],
            created_at,
        }))
    }

    async fn get_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, NooterraError> {
        let value: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT value FROM projections WHERE tenant_id = $1 AND kind = $2 AND key = $3",
        )
        .bind(tenant_id.as_str())
        .bind(kind)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(value)
    }

    async fn list_projection(
        &self,
        tenant_id: &TenantId,
        kind: &str,
    ) -> Result<Vec<ProjectionRow>, NooterraError> {
        let rows: Vec<(String, serde_json::Value)> = sqlx::query_as(
            "SELECT key, value FROM projections WHERE tenant_id = $1 AND kind = $2",
        )
        .bind(tenant_id.as_str())
        .bind(kind)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows
            .into_iter()
            .map(|(key, value)| ProjectionRow { key, value })
            .collect())
    }

    async fn lookup_idempotent(
        &self,
        tenant_id: &TenantId,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, NooterraError> {
        let row: Option<(String, serde_json::Value, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            "SELECT fingerprint, response, created_at \
             FROM idempotency_keys WHERE tenant_id = $1 AND key = $2",
        )
        .bind(tenant_id.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|(fingerprint, response, created_at)| IdempotencyRecord {
            tenant_id: tenant_id.clone(),
            key: key.clone(),
            fingerprint: ContentHash::new(fingerprint),
            response,
            created_at,
        }))
    }
}
