//! Dispute lifecycle and arbitration.
//!
//! A dispute is attached to a `RunSettlement`: opening it flips the
//! settlement's `dispute_status` to `open` (the settlement itself stays
//! `locked`), evidence accumulates while open, and closing it requires a
//! signed `ArbitrationVerdict.v1` plus a `SettlementAdjustment.v1` that
//! moves escrow and marks the settlement as resolved by arbitration
//! override. Escalation is monotonic - counterparty, then
//! arbiter, then external - mirroring the run engine's own
//! build-then-commit shape so opening/closing a dispute folds the
//! settlement mutation into the same transaction as the dispute's own
//! projection write.

use chrono::Utc;
use nooterra_artifacts::ArtifactRegistry;
use nooterra_canon::content_hash;
use nooterra_crypto::{KeyRegistry, SignaturePurpose};
use nooterra_runs::RunEngine;
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{AgentId, ContentHash, DisputeId, KeyId, RunId, SettlementId, TenantId};
use nooterra_types::types::{Dispute, DisputeStatus, EscalationLevel, SettlementAdjustmentKind, VerdictOutcome};
use nooterra_types::NooterraError;
use std::sync::Arc;
use tracing::{info, warn};

const PROJECTION_DISPUTE: &str = "dispute";

pub struct DisputeEngine {
    store: Arc<dyn Store>,
    artifacts: ArtifactRegistry,
    runs: RunEngine,
}

impl DisputeEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            artifacts: ArtifactRegistry::new(store.clone()),
            runs: RunEngine::new(store.clone()),
            store,
        }
    }

    pub fn runs(&self) -> &RunEngine {
        &self.runs
    }

    pub async fn get_dispute(&self, tenant_id: &TenantId, dispute_id: &DisputeId) -> Result<Option<Dispute>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_DISPUTE, dispute_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    async fn require_dispute(&self, tenant_id: &TenantId, dispute_id: &DisputeId) -> Result<Dispute, NooterraError> {
        self.get_dispute(tenant_id, dispute_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "dispute".to_string(),
                id: dispute_id.to_string(),
            })
    }

    pub async fn list_disputes_for_settlement(
        &self,
        tenant_id: &TenantId,
        settlement_id: &SettlementId,
    ) -> Result<Vec<Dispute>, NooterraError> {
        let rows: Vec<ProjectionRow> = self.store.list_projection(tenant_id, PROJECTION_DISPUTE).await?;
        let mut disputes = Vec::new();
        for row in rows {
            let dispute: Dispute = serde_json::from_value(row.value)?;
            if &dispute.settlement_id == settlement_id {
                disputes.push(dispute);
            }
        }
        Ok(disputes)
    }

    fn dispute_op(dispute: &Dispute) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_DISPUTE.to_string(),
            key: dispute.dispute_id.as_str().to_string(),
            value: serde_json::to_value(dispute)?,
            expected_revision: Some(dispute.revision.saturating_sub(1)),
        })
    }

    /// Open a dispute against a run's settlement. Fails if the
    /// settlement's dispute window has already closed, or a dispute is
    /// already open against it.
    #[allow(clippy::too_many_arguments)]
    pub async fn open_dispute(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        opened_by_agent_id: &AgentId,
        dispute_type: &str,
        dispute_priority: &str,
        dispute_channel: &str,
        escalation_level: EscalationLevel,
        evidence_refs: Vec<String>,
    ) -> Result<(Dispute, nooterra_types::types::RunSettlement), NooterraError> {
        let settlement = self
            .runs
            .get_settlement_for_run(tenant_id, run_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "settlement".to_string(),
                id: run_id.to_string(),
            })?;

        if settlement.dispute_status != DisputeStatus::None {
            return Err(NooterraError::DisputeInvalidTransition {
                dispute_id: settlement.settlement_id.to_string(),
                current: format!("{:?}", settlement.dispute_status),
            });
        }
        if !settlement.is_dispute_window_open(Utc::now()) {
            return Err(NooterraError::DisputeWindowClosed {
                dispute_id: settlement.settlement_id.to_string(),
            });
        }

        let now = Utc::now();
        let dispute = Dispute {
            dispute_id: DisputeId::new(),
            tenant_id: tenant_id.clone(),
            settlement_id: settlement.settlement_id.clone(),
            run_id: run_id.clone(),
            opened_by_agent_id: opened_by_agent_id.clone(),
            dispute_type: dispute_type.to_string(),
            dispute_priority: dispute_priority.to_string(),
            dispute_channel: dispute_channel.to_string(),
            escalation_level,
            status: DisputeStatus::Open,
            evidence_refs,
            verdict_artifact_hash: None,
            adjustment_artifact_hash: None,
            revision: 1,
            opened_at: now,
            closed_at: None,
        };

        let (settlement, settlement_op) = RunEngine::build_open_dispute(settlement)?;
        self.store
            .commit_tx(tenant_id, vec![settlement_op, Self::dispute_op(&dispute)?])
            .await?;
        warn!("dispute {} opened against settlement {} by agent {}", dispute.dispute_id, dispute.settlement_id, opened_by_agent_id);
        Ok((dispute, settlement))
    }

    /// Append an evidence reference while the dispute is open.
    pub async fn add_evidence(
        &self,
        tenant_id: &TenantId,
        dispute_id: &DisputeId,
        evidence_ref: &str,
    ) -> Result<Dispute, NooterraError> {
        let mut dispute = self.require_dispute(tenant_id, dispute_id).await?;
        if dispute.status != DisputeStatus::Open {
            return Err(NooterraError::DisputeInvalidTransition {
                dispute_id: dispute_id.to_string(),
                current: format!("{:?}", dispute.status),
            });
        }
        dispute.evidence_refs.push(evidence_ref.to_string());
        dispute.revision += 1;
        self.store.commit_tx(tenant_id, vec![Self::dispute_op(&dispute)?]).await?;
        Ok(dispute)
    }

    /// Escalate to the next level. Escalation may only move forward (spec
    /// §4.9, §8 invariant - mirrors `EscalationLevel::can_escalate_to`).
    pub async fn escalate(
        &self,
        tenant_id: &TenantId,
        dispute_id: &DisputeId,
        next_level: EscalationLevel,
    ) -> Result<Dispute, NooterraError> {
        let mut dispute = self.require_dispute(tenant_id, dispute_id).await?;
        if dispute.status != DisputeStatus::Open {
            return Err(NooterraError::DisputeInvalidTransition {
                dispute_id: dispute_id.to_string(),
                current: format!("{:?}", dispute.status),
            });
        }
        if !dispute.escalation_level.can_escalate_to(next_level) {
            return Err(NooterraError::DisputeInvalidTransition {
                dispute_id: dispute_id.to_string(),
                current: format!("{:?}", dispute.escalation_level),
            });
        }
        dispute.escalation_level = next_level;
        dispute.revision += 1;
        self.store.commit_tx(tenant_id, vec![Self::dispute_op(&dispute)?]).await?;
        info!("dispute {} escalated to {:?}", dispute.dispute_id, dispute.escalation_level);
        Ok(dispute)
    }

    /// Close an open dispute with a signed arbitration verdict: signs and
    /// inserts `ArbitrationVerdict.v1`, inserts the accompanying
    /// `SettlementAdjustment.v1`, moves escrow per `release_rate_pct`, and
    /// marks the settlement's `arbitration_override` so future policy
    /// replays treat it as resolved by arbitration.
    #[allow(clippy::too_many_arguments)]
    pub async fn close_with_verdict(
        &self,
        tenant_id: &TenantId,
        dispute_id: &DisputeId,
        keys: &KeyRegistry,
        arbiter_key_id: &KeyId,
        outcome: VerdictOutcome,
        adjustment_kind: SettlementAdjustmentKind,
        release_rate_pct: u8,
        rationale: &str,
    ) -> Result<(Dispute, nooterra_types::types::RunSettlement), NooterraError> {
        let mut dispute = self.require_dispute(tenant_id, dispute_id).await?;
        if dispute.status != DisputeStatus::Open {
            return Err(NooterraError::DisputeInvalidTransition {
                dispute_id: dispute_id.to_string(),
                current: format!("{:?}", dispute.status),
            });
        }

        let settlement = self
            .runs
            .get_settlement(tenant_id, &dispute.settlement_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "settlement".to_string(),
                id: dispute.settlement_id.to_string(),
            })?;

        let verdict_body = serde_json::json!({
            "disputeId": dispute.dispute_id.as_str(),
            "settlementId": dispute.settlement_id.as_str(),
            "runId": dispute.run_id.as_str(),
            "outcome": outcome,
            "releaseRatePct": release_rate_pct,
            "rationale": rationale,
        });
        let verdict_hash_hex = content_hash(&verdict_body)?;
        let signature = keys.sign(arbiter_key_id, tenant_id, SignaturePurpose::ArbitrationVerdict, &verdict_hash_hex)?;
        let verdict_artifact = self
            .artifacts
            .insert(
                tenant_id,
                "ArbitrationVerdict.v1",
                verdict_body,
                vec![nooterra_types::types::ArtifactSignature {
                    key_id: arbiter_key_id.to_string(),
                    purpose: "arbitration_verdict".to_string(),
                    signature_base64: signature.signature_base64,
                }],
            )
            .await?;

        let adjustment_body = serde_json::json!({
            "disputeId": dispute.dispute_id.as_str(),
            "settlementId": dispute.settlement_id.as_str(),
            "kind": adjustment_kind,
            "releaseRatePct": release_rate_pct,
            "amountCents": settlement.amount_cents,
        });
        let adjustment_artifact = self
            .artifacts
            .insert(tenant_id, "SettlementAdjustment.v1", adjustment_body, vec![])
            .await?;

        let (settlement, mut ops) = self
            .runs
            .build_close_dispute_with_verdict(tenant_id, settlement, release_rate_pct, dispute_id.as_str())
            .await?;

        dispute.status = DisputeStatus::Closed;
        dispute.verdict_artifact_hash = Some(verdict_artifact.artifact_hash);
        dispute.adjustment_artifact_hash = Some(adjustment_artifact.artifact_hash);
        dispute.revision += 1;
        dispute.closed_at = Some(Utc::now());
        ops.push(Self::dispute_op(&dispute)?);

        self.store.commit_tx(tenant_id, ops).await?;
        info!("dispute {} closed with verdict {:?} ({}% release)", dispute.dispute_id, outcome, release_rate_pct);
        Ok((dispute, settlement))
    }

    /// Recompute an `ArbitrationVerdict.v1` / `SettlementAdjustment.v1`
    /// pair's content hashes and compare them against the hashes stored on
    /// the (closed) dispute. A mismatch means the artifacts were altered
    /// after the dispute was closed (`CLOSEPACK_BINDING_VERDICT_HASH_MISMATCH`).
    pub fn replay_verdict_binding(
        dispute: &Dispute,
        verdict_body: &serde_json::Value,
        adjustment_body: &serde_json::Value,
    ) -> Result<(), NooterraError> {
        let verdict_hash = ContentHash::new(nooterra_canon::content_hash(verdict_body)?);
        let adjustment_hash = ContentHash::new(nooterra_canon::content_hash(adjustment_body)?);

        let stored_verdict = dispute.verdict_artifact_hash.as_ref();
        let stored_adjustment = dispute.adjustment_artifact_hash.as_ref();

        if stored_verdict != Some(&verdict_hash) || stored_adjustment != Some(&adjustment_hash) {
            return Err(NooterraError::ClosepackBindingVerdictHashMismatch {
                dispute_id: dispute.dispute_id.to_string(),
                stored: format!(
                    "{}/{}",
                    stored_verdict.map(|h| h.as_str()).unwrap_or(""),
                    stored_adjustment.map(|h| h.as_str()).unwrap_or("")
                ),
                recomputed: format!("{}/{}", verdict_hash.as_str(), adjustment_hash.as_str()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_crypto::KeyRole;
    use nooterra_ledger::WalletLedger;
    use nooterra_runs::{InlineSettlement, SettlementPolicy};
    use nooterra_store::InMemoryStore;

    async fn setup() -> (DisputeEngine, TenantId, AgentId, AgentId) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = DisputeEngine::new(store);
        let tenant = TenantId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        engine.runs().ledger().open_wallet(&tenant, &payer, "USD").await.unwrap();
        engine.runs().ledger().open_wallet(&tenant, &payee, "USD").await.unwrap();
        engine
            .runs()
            .ledger()
            .credit(&tenant, &payer, 10_000, "top_up", "seed")
            .await
            .unwrap();
        (engine, tenant, payer, payee)
    }

    #[tokio::test]
    async fn dispute_open_close_adjusts_settlement_and_wallets() {
        let (engine, tenant, payer, payee) = setup().await;
        let (run, _) = engine
            .runs()
            .create_run(
                &tenant,
                &payee,
                serde_json::json!({}),
                Some(InlineSettlement {
                    payer_agent_id: payer.clone(),
                    amount_cents: 1000,
                    currency: "USD".to_string(),
                    dispute_window_days: 7,
                    decision_policy_hash: None,
                }),
            )
            .await
            .unwrap();

        let policy = SettlementPolicy::default();
        let (_, run, _) = engine
            .runs()
            .append_event(&tenant, &run.run_id, "RUN_STARTED", serde_json::json!({}), run.last_chain_hash.as_ref(), None, &policy)
            .await
            .unwrap();
        let (_, run, settlement) = engine
            .runs()
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_COMPLETED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                Some(nooterra_types::types::VerificationStatus::Amber),
                &policy,
            )
            .await
            .unwrap();
        let settlement = settlement.unwrap();
        assert_eq!(settlement.decision_status, nooterra_types::types::DecisionStatus::ManualReviewRequired);
        let _ = run;

        let (dispute, settlement) = engine
            .open_dispute(
                &tenant,
                &settlement.run_id,
                &payee,
                "quality",
                "high",
                "in_app",
                EscalationLevel::L1Counterparty,
                vec!["evidence://run/output.json".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(settlement.dispute_status, DisputeStatus::Open);

        let dispute = engine.escalate(&tenant, &dispute.dispute_id, EscalationLevel::L2Arbiter).await.unwrap();

        let keys = KeyRegistry::new();
        let (arbiter_key, _) = keys.generate_tenant_key(KeyRole::Operator, tenant.clone()).unwrap();

        let (dispute, settlement) = engine
            .close_with_verdict(
                &tenant,
                &dispute.dispute_id,
                &keys,
                &arbiter_key,
                VerdictOutcome::Partial,
                SettlementAdjustmentKind::HoldbackRelease,
                75,
                "partial release after review",
            )
            .await
            .unwrap();

        assert_eq!(dispute.status, DisputeStatus::Closed);
        assert!(settlement.arbitration_override);
        assert_eq!(settlement.released_amount_cents, 750);

        let payee_wallet = engine.runs().ledger().get_wallet(&tenant, &payee).await.unwrap().unwrap();
        assert_eq!(payee_wallet.available_cents, 750);
    }

    #[tokio::test]
    async fn escalation_cannot_move_backward() {
        let (engine, tenant, payer, payee) = setup().await;
        let (run, _) = engine
            .runs()
            .create_run(
                &tenant,
                &payee,
                serde_json::json!({}),
                Some(InlineSettlement {
                    payer_agent_id: payer.clone(),
                    amount_cents: 500,
                    currency: "USD".to_string(),
                    dispute_window_days: 7,
                    decision_policy_hash: None,
                }),
            )
            .await
            .unwrap();

        let (dispute, _) = engine
            .open_dispute(
                &tenant,
                &run.run_id,
                &payee,
                "quality",
                "low",
                "email",
                EscalationLevel::L2Arbiter,
                vec![],
            )
            .await
            .unwrap();

        let err = engine
            .escalate(&tenant, &dispute.dispute_id, EscalationLevel::L1Counterparty)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DISPUTE_INVALID_TRANSITION");
    }
}
