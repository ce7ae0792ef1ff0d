//! x402 payment gate: binds a quote and execution intent to at most one
//! payment authorization and at most one verification.
//!
//! A gate opened with `binding_mode == strict` records the SHA-256 of the
//! authorizing request body at creation time; `authorize_payment` must be
//! given the same body back or it fails `X402_REQUEST_MISMATCH`.
//! `verify_payment` records the response body's hash the same way. Later,
//! closing a dispute or opening arbitration over a run with an x402 gate
//! must supply evidence refs (`http:request_sha256:<hex>`,
//! `http:response_sha256:<hex>`) that match those stored hashes - see
//! [`check_dispute_close_binding_evidence`] and
//! [`check_arbitration_open_binding_evidence`].

use nooterra_canon::sha256_hex;
use nooterra_ledger::WalletLedger;
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{AgentId, GateId, RunId, TenantId};
use nooterra_types::types::{BindingMode, GateStatus, X402Gate};
use nooterra_types::NooterraError;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

const PROJECTION_GATE: &str = "x402_gate";

const EVIDENCE_REQUEST_PREFIX: &str = "http:request_sha256:";
const EVIDENCE_RESPONSE_PREFIX: &str = "http:response_sha256:";

pub struct X402Engine {
    store: Arc<dyn Store>,
    ledger: WalletLedger,
}

impl X402Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let ledger = WalletLedger::new(store.clone());
        Self { store, ledger }
    }

    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }

    pub async fn get_gate(
        &self,
        tenant_id: &TenantId,
        gate_id: &GateId,
    ) -> Result<Option<X402Gate>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_GATE, gate_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from))
            .transpose()
    }

    pub async fn list_gates(&self, tenant_id: &TenantId) -> Result<Vec<X402Gate>, NooterraError> {
        let rows = self.store.list_projection(tenant_id, PROJECTION_GATE).await?;
        rows.into_iter()
            .map(|ProjectionRow { value, .. }| serde_json::from_value(value).map_err(NooterraError::from))
            .collect()
    }

    async fn require_gate(
        &self,
        tenant_id: &TenantId,
        gate_id: &GateId,
    ) -> Result<X402Gate, NooterraError> {
        self.get_gate(tenant_id, gate_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "x402_gate".to_string(),
                id: gate_id.to_string(),
            })
    }

    fn gate_op(gate: &X402Gate) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_GATE.to_string(),
            key: gate.gate_id.as_str().to_string(),
            value: serde_json::to_value(gate)?,
            expected_revision: Some(gate.revision.saturating_sub(1)),
        })
    }

    /// Open a gate for `run_id`. `request_body` is the bytes of the
    /// request that will go on to authorize payment; it is required
    /// exactly when `binding_mode == Strict`, and its hash is what every
    /// later call against this gate is checked against.
    pub async fn create_gate(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        quote: serde_json::Value,
        execution_intent: serde_json::Value,
        binding_mode: BindingMode,
        request_body: Option<&[u8]>,
        amount_cents: i64,
    ) -> Result<X402Gate, NooterraError> {
        let gate_id = GateId::new();
        let request_binding_sha256 = match binding_mode {
            BindingMode::Strict => {
                let body = request_body.ok_or_else(|| NooterraError::X402IntentInvalid {
                    gate_id: gate_id.to_string(),
                    reason: "strict binding mode requires a request body".to_string(),
                })?;
                Some(sha256_hex(body))
            }
            BindingMode::None => None,
        };

        let now = Utc::now();
        let gate = X402Gate {
            gate_id,
            tenant_id: tenant_id.clone(),
            run_id: run_id.clone(),
            quote,
            execution_intent,
            binding_mode,
            request_binding_sha256,
            response_binding_sha256: None,
            status: GateStatus::Pending,
            amount_cents,
            settlement_id: None,
            revision: 1,
            created_at: now,
            updated_at: now,
        };

        self.store
            .commit_tx(tenant_id, vec![Self::gate_op(&gate)?])
            .await?;
        info!("x402 gate {} opened for run {} ({:?} binding)", gate.gate_id, run_id, gate.binding_mode);
        Ok(gate)
    }

    /// Authorize payment against a pending gate, locking `amount_cents`
    /// of escrow from `payer` against `payee`. At most one authorization
    /// ever succeeds per gate since a second call finds `status !=
    /// Pending`.
    pub async fn authorize_payment(
        &self,
        tenant_id: &TenantId,
        gate_id: &GateId,
        payer: &AgentId,
        payee: &AgentId,
        request_body: Option<&[u8]>,
    ) -> Result<X402Gate, NooterraError> {
        let mut gate = self.require_gate(tenant_id, gate_id).await?;
        if gate.status != GateStatus::Pending {
            return Err(NooterraError::X402IntentInvalid {
                gate_id: gate_id.to_string(),
                reason: format!("gate is not pending (status={:?})", gate.status),
            });
        }

        if let Some(expected) = &gate.request_binding_sha256 {
            let body = request_body.ok_or_else(|| NooterraError::X402IntentInvalid {
                gate_id: gate_id.to_string(),
                reason: "strict binding mode requires a request body".to_string(),
            })?;
            let computed = sha256_hex(body);
            if &computed != expected {
                return Err(NooterraError::X402RequestMismatch {
                    expected: expected.clone(),
                    computed,
                });
            }
        }

        let (_, mut ops) = self
            .ledger
            .build_lock_escrow(tenant_id, payer, payee, gate.amount_cents, gate_id.as_str())
            .await?;

        gate.status = GateStatus::Authorized;
        gate.revision += 1;
        gate.updated_at = Utc::now();
        ops.push(Self::gate_op(&gate)?);

        self.store.commit_tx(tenant_id, ops).await?;
        info!("x402 gate {} authorized, {} cents locked", gate.gate_id, gate.amount_cents);
        Ok(gate)
    }

    /// Deny a pending gate outright, with no escrow movement.
    pub async fn deny_payment(
        &self,
        tenant_id: &TenantId,
        gate_id: &GateId,
    ) -> Result<X402Gate, NooterraError> {
        let mut gate = self.require_gate(tenant_id, gate_id).await?;
        if gate.status != GateStatus::Pending {
            return Err(NooterraError::X402IntentInvalid {
                gate_id: gate_id.to_string(),
                reason: format!("gate is not pending (status={:?})", gate.status),
            });
        }
        gate.status = GateStatus::Denied;
        gate.revision += 1;
        gate.updated_at = Utc::now();

        self.store
            .commit_tx(tenant_id, vec![Self::gate_op(&gate)?])
            .await?;
        warn!("x402 gate {} denied", gate.gate_id);
        Ok(gate)
    }

    /// Verify an authorized gate, releasing escrow at `release_rate_pct`.
    /// `response_body` is required under strict binding and its hash is
    /// recorded as `response_binding_sha256` for later evidence checks.
    pub async fn verify_payment(
        &self,
        tenant_id: &TenantId,
        gate_id: &GateId,
        payer: &AgentId,
        payee: &AgentId,
        response_body: Option<&[u8]>,
        release_rate_pct: u8,
    ) -> Result<X402Gate, NooterraError> {
        let mut gate = self.require_gate(tenant_id, gate_id).await?;
        if gate.status != GateStatus::Authorized {
            return Err(NooterraError::X402PaymentNotAuthorized {
                gate_id: gate_id.to_string(),
            });
        }

        let response_binding_sha256 = match gate.binding_mode {
            BindingMode::Strict => {
                let body = response_body.ok_or_else(|| NooterraError::X402IntentInvalid {
                    gate_id: gate_id.to_string(),
                    reason: "strict binding mode requires a response body".to_string(),
                })?;
                Some(sha256_hex(body))
            }
            BindingMode::None => None,
        };

        let (_, _, mut ops) = self
            .ledger
            .build_release_escrow(
                tenant_id,
                payer,
                payee,
                gate.amount_cents,
                release_rate_pct,
                gate_id.as_str(),
            )
            .await?;

        gate.status = GateStatus::Verified;
        gate.response_binding_sha256 = response_binding_sha256;
        gate.revision += 1;
        gate.updated_at = Utc::now();
        ops.push(Self::gate_op(&gate)?);

        self.store.commit_tx(tenant_id, ops).await?;
        info!("x402 gate {} verified at {}% release", gate.gate_id, release_rate_pct);
        Ok(gate)
    }
}

fn find_evidence<'a>(evidence_refs: &'a [String], prefix: &str) -> Option<&'a str> {
    evidence_refs
        .iter()
        .find_map(|r| r.strip_prefix(prefix))
}

/// Closing a dispute over a run gated by x402 must present request/response
/// evidence refs matching the gate's stored bindings. Missing evidence
/// fails `X402_DISPUTE_CLOSE_BINDING_EVIDENCE_REQUIRED`; a present but
/// non-matching value fails `X402_DISPUTE_CLOSE_BINDING_EVIDENCE_MISMATCH`.
pub fn check_dispute_close_binding_evidence(
    gate: &X402Gate,
    evidence_refs: &[String],
) -> Result<(), NooterraError> {
    check_binding_evidence(gate, evidence_refs, true)
}

/// Same evidence check as [`check_dispute_close_binding_evidence`], for
/// opening arbitration on a run gated by x402.
pub fn check_arbitration_open_binding_evidence(
    gate: &X402Gate,
    evidence_refs: &[String],
) -> Result<(), NooterraError> {
    check_binding_evidence(gate, evidence_refs, false)
}

fn check_binding_evidence(
    gate: &X402Gate,
    evidence_refs: &[String],
    is_dispute_close: bool,
) -> Result<(), NooterraError> {
    if gate.binding_mode == BindingMode::None {
        return Ok(());
    }

    let required = |field: &'static str| -> NooterraError {
        if is_dispute_close {
            NooterraError::X402DisputeCloseBindingEvidenceRequired {
                gate_id: gate.gate_id.to_string(),
            }
        } else {
            let _ = field;
            NooterraError::X402ArbitrationOpenBindingEvidenceRequired {
                gate_id: gate.gate_id.to_string(),
            }
        }
    };
    let mismatch = |expected: String, actual: String| -> NooterraError {
        if is_dispute_close {
            NooterraError::X402DisputeCloseBindingEvidenceMismatch {
                gate_id: gate.gate_id.to_string(),
                expected,
                actual,
            }
        } else {
            NooterraError::X402ArbitrationOpenBindingEvidenceMismatch {
                gate_id: gate.gate_id.to_string(),
                expected,
                actual,
            }
        }
    };

    if let Some(expected) = &gate.request_binding_sha256 {
        let found = find_evidence(evidence_refs, EVIDENCE_REQUEST_PREFIX)
            .ok_or_else(|| required("request"))?;
        if found != expected {
            return Err(mismatch(expected.clone(), found.to_string()));
        }
    }
    if let Some(expected) = &gate.response_binding_sha256 {
        let found = find_evidence(evidence_refs, EVIDENCE_RESPONSE_PREFIX)
            .ok_or_else(|| required("response"))?;
        if found != expected {
            return Err(mismatch(expected.clone(), found.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;

    fn engine() -> X402Engine {
        X402Engine::new(Arc::new(InMemoryStore::new()))
    }

    async fn fund(engine: &X402Engine, tenant: &TenantId, agent: &AgentId, cents: i64) {
        engine.ledger().open_wallet(tenant, agent, "USD").await.unwrap();
        if cents > 0 {
            engine
                .ledger()
                .credit(tenant, agent, cents, "top_up", "c0")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn strict_gate_rejects_mismatched_request_body() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        fund(&engine, &tenant, &payer, 1000).await;
        fund(&engine, &tenant, &payee, 0).await;

        let gate = engine
            .create_gate(
                &tenant,
                &run,
                serde_json::json!({"priceCents": 500}),
                serde_json::json!({"action": "compute"}),
                BindingMode::Strict,
                Some(b"GET /v1/run HTTP/1.1"),
                500,
            )
            .await
            .unwrap();

        let err = engine
            .authorize_payment(&tenant, &gate.gate_id, &payer, &payee, Some(b"GET /v1/other"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "X402_REQUEST_MISMATCH");
    }

    #[tokio::test]
    async fn authorize_then_verify_moves_escrow_and_records_evidence_bindings() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        fund(&engine, &tenant, &payer, 1000).await;
        fund(&engine, &tenant, &payee, 0).await;

        let request_body = b"GET /v1/run HTTP/1.1";
        let response_body = b"HTTP/1.1 200 OK";

        let gate = engine
            .create_gate(
                &tenant,
                &run,
                serde_json::json!({"priceCents": 500}),
                serde_json::json!({"action": "compute"}),
                BindingMode::Strict,
                Some(request_body),
                500,
            )
            .await
            .unwrap();

        let gate = engine
            .authorize_payment(&tenant, &gate.gate_id, &payer, &payee, Some(request_body))
            .await
            .unwrap();
        assert_eq!(gate.status, GateStatus::Authorized);

        let gate = engine
            .verify_payment(&tenant, &gate.gate_id, &payer, &payee, Some(response_body), 100)
            .await
            .unwrap();
        assert_eq!(gate.status, GateStatus::Verified);

        let payee_wallet = engine.ledger().get_wallet(&tenant, &payee).await.unwrap().unwrap();
        assert_eq!(payee_wallet.available_cents, 500);

        let evidence = vec![
            format!("http:request_sha256:{}", sha256_hex(request_body)),
            format!("http:response_sha256:{}", sha256_hex(response_body)),
        ];
        check_dispute_close_binding_evidence(&gate, &evidence).unwrap();

        let bad_evidence = vec![format!("http:request_sha256:{}", sha256_hex(request_body))];
        let err = check_arbitration_open_binding_evidence(&gate, &bad_evidence).unwrap_err();
        assert_eq!(err.code(), "X402_ARBITRATION_OPEN_BINDING_EVIDENCE_REQUIRED");
    }

    #[tokio::test]
    async fn verify_before_authorize_is_rejected() {
        let engine = engine();
        let tenant = TenantId::new();
        let run = RunId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        fund(&engine, &tenant, &payer, 1000).await;
        fund(&engine, &tenant, &payee, 0).await;

        let gate = engine
            .create_gate(
                &tenant,
                &run,
                serde_json::json!({}),
                serde_json::json!({}),
                BindingMode::None,
                None,
                200,
            )
            .await
            .unwrap();

        let err = engine
            .verify_payment(&tenant, &gate.gate_id, &payer, &payee, None, 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "X402_PAYMENT_NOT_AUTHORIZED");
    }
}
