//! Run lifecycle and settlement state machine.
//!
//! A run is a hash-chained event stream (`run:<runId>`) whose shape is
//! fixed by the spec's lifecycle grammar:
//!
//! ```text
//! RUN_CREATED -> RUN_STARTED -> (RUN_HEARTBEAT | EVIDENCE_ADDED)* -> (RUN_COMPLETED | RUN_FAILED)
//! ```
//!
//! `RUN_CREATED` may carry an inline settlement, which locks escrow in the
//! same transaction that appends the event. `RUN_COMPLETED`
//! triggers policy evaluation: the stored policy (or the tenant default)
//! is replayed against the run's last-known verification status to decide
//! `released` vs `refunded` vs `manual_review_required`, mirroring an
//! escrow condition-evaluation shape and an atomic-batch settlement
//! executor idiom, generalized from a single escrow object into a full
//! append-and-settle pipeline built on
//! `nooterra-chain` + `nooterra-ledger`.

use chrono::{Duration, Utc};
use nooterra_canon::content_hash;
use nooterra_chain::ChainEngine;
use nooterra_ledger::WalletLedger;
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{AgentId, ContentHash as HashId, RunId, SettlementId, StreamId, TenantId};
use nooterra_types::types::{
    AgentRun, DecisionStatus, Event, PolicyDecision, RunSettlement, RunStatus, SettlementState,
    VerificationStatus,
};
use nooterra_types::NooterraError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const PROJECTION_RUN: &str = "run";
const PROJECTION_SETTLEMENT: &str = "settlement";

pub fn run_stream_id(run_id: &RunId) -> StreamId {
    StreamId::from(format!("run:{run_id}"))
}

/// The settlement terms a caller may attach inline to `RUN_CREATED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineSettlement {
    pub payer_agent_id: AgentId,
    pub amount_cents: i64,
    pub currency: String,
    pub dispute_window_days: u32,
    pub decision_policy_hash: Option<HashId>,
}

/// The release plan for each verification traffic-light color. Either the
/// stored `TenantSettlementPolicy.v1` / `MarketplaceAgreementPolicyBinding.v2`
/// artifact body deserializes into this shape, or the tenant default
/// applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementPolicy {
    pub green_release_rate_pct: u8,
    pub amber_requires_manual_review: bool,
    pub amber_release_rate_pct: u8,
    pub red_release_rate_pct: u8,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            green_release_rate_pct: 100,
            amber_requires_manual_review: true,
            amber_release_rate_pct: 50,
            red_release_rate_pct: 0,
        }
    }
}

impl SettlementPolicy {
    /// Evaluate this policy against `status`, producing the decision a
    /// policy replay should find - before any arbitration override is
    /// taken into account.
    pub fn evaluate(&self, status: VerificationStatus, amount_cents: i64) -> PolicyDecision {
        let (decision_status, release_rate_pct) = match status {
            VerificationStatus::Green => (DecisionStatus::AutoResolved, self.green_release_rate_pct),
            VerificationStatus::Red => (DecisionStatus::AutoResolved, self.red_release_rate_pct),
            VerificationStatus::Amber if self.amber_requires_manual_review => {
                (DecisionStatus::ManualReviewRequired, self.amber_release_rate_pct)
            }
            VerificationStatus::Amber => (DecisionStatus::AutoResolved, self.amber_release_rate_pct),
        };
        let released = amount_cents * release_rate_pct as i64 / 100;
        PolicyDecision {
            decision_status,
            release_rate_pct,
            released_amount_cents: released,
            refunded_amount_cents: amount_cents - released,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyReplayResult {
    pub replay: PolicyDecision,
    pub stored: PolicyDecision,
    pub matches_stored_decision: bool,
}

pub struct RunEngine {
    store: Arc<dyn Store>,
    chain: ChainEngine,
    ledger: WalletLedger,
}

impl RunEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            chain: ChainEngine::new(store.clone()),
            ledger: WalletLedger::new(store.clone()),
            store,
        }
    }

    pub async fn get_run(&self, tenant_id: &TenantId, run_id: &RunId) -> Result<Option<AgentRun>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_RUN, run_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    pub async fn get_settlement(
        &self,
        tenant_id: &TenantId,
        settlement_id: &SettlementId,
    ) -> Result<Option<RunSettlement>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_SETTLEMENT, settlement_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    pub async fn get_settlement_for_run(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
    ) -> Result<Option<RunSettlement>, NooterraError> {
        let run = self.get_run(tenant_id, run_id).await?;
        match run.and_then(|r| r.settlement_id) {
            Some(settlement_id) => self.get_settlement(tenant_id, &settlement_id).await,
            None => Ok(None),
        }
    }

    async fn require_run(&self, tenant_id: &TenantId, run_id: &RunId) -> Result<AgentRun, NooterraError> {
        self.get_run(tenant_id, run_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "run".to_string(),
                id: run_id.to_string(),
            })
    }

    fn run_op(run: &AgentRun) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_RUN.to_string(),
            key: run.run_id.as_str().to_string(),
            value: serde_json::to_value(run)?,
            expected_revision: Some(run.revision.saturating_sub(1)),
        })
    }

    fn settlement_op(settlement: &RunSettlement) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_SETTLEMENT.to_string(),
            key: settlement.settlement_id.as_str().to_string(),
            value: serde_json::to_value(settlement)?,
            expected_revision: Some(settlement.revision.saturating_sub(1)),
        })
    }

    /// Create a run, optionally locking an inline settlement atomically
    /// with `RUN_CREATED`. If the payer wallet lacks sufficient funds,
    /// nothing is appended.
    pub async fn create_run(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        input: serde_json::Value,
        settlement: Option<InlineSettlement>,
    ) -> Result<(AgentRun, Option<RunSettlement>), NooterraError> {
        let (run, settlement, ops) = self
            .build_create_run(tenant_id, agent_id, input, settlement, None)
            .await?;
        self.store.commit_tx(tenant_id, ops).await?;
        Ok((run, settlement))
    }

    /// Same as `create_run`, but returns the ops instead of committing
    /// them, so a caller (e.g. `nooterra-marketplace` accepting a bid) can
    /// fold run creation into a larger atomic batch alongside its own
    /// projection updates (atomic creation of: the accepted
    /// bid projection, the agreement, a corresponding run + inline
    /// settlement, and the escrow lock"). `run_id` lets a caller pre-allocate
    /// the id so it can be embedded in a signed artifact (e.g. an
    /// acceptance signature) before the run itself is committed.
    pub async fn build_create_run(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        input: serde_json::Value,
        settlement: Option<InlineSettlement>,
        run_id: Option<RunId>,
    ) -> Result<(AgentRun, Option<RunSettlement>, Vec<WriteOp>), NooterraError> {
        let run_id = run_id.unwrap_or_else(RunId::new);
        let stream_id = run_stream_id(&run_id);
        let now = Utc::now();

        let settlement_payload = settlement
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let payload = serde_json::json!({ "input": input, "settlement": settlement_payload });

        let event = self
            .chain
            .prepare_append(tenant_id, &stream_id, "RUN_CREATED", agent_id.to_string(), payload, None)
            .await?;

        let mut ops = vec![WriteOp::AppendEvent(event.clone())];

        let mut run_settlement = None;
        if let Some(spec) = &settlement {
            let (_, escrow_ops) = self
                .ledger
                .build_lock_escrow(tenant_id, &spec.payer_agent_id, agent_id, spec.amount_cents, run_id.as_str())
                .await?;
            ops.extend(escrow_ops);

            let settlement_id = SettlementId::new();
            let s = RunSettlement {
                settlement_id: settlement_id.clone(),
                tenant_id: tenant_id.clone(),
                run_id: run_id.clone(),
                payer_agent_id: spec.payer_agent_id.clone(),
                payee_agent_id: agent_id.clone(),
                amount_cents: spec.amount_cents,
                currency: spec.currency.clone(),
                state: SettlementState::Locked,
                dispute_window_days: spec.dispute_window_days,
                dispute_window_ends_at: now + Duration::days(spec.dispute_window_days as i64),
                dispute_status: nooterra_types::types::DisputeStatus::None,
                decision_status: DecisionStatus::Pending,
                release_rate_pct: 0,
                released_amount_cents: 0,
                refunded_amount_cents: 0,
                decision_policy_hash: spec.decision_policy_hash.clone(),
                decision_trace: None,
                arbitration_override: false,
                revision: 1,
                created_at: now,
                updated_at: now,
            };
            ops.push(Self::settlement_op(&s)?);
            run_settlement = Some((settlement_id, s));
        }

        let run = AgentRun {
            run_id: run_id.clone(),
            tenant_id: tenant_id.clone(),
            agent_id: agent_id.clone(),
            status: RunStatus::Created,
            input: event.payload.get("input").cloned().unwrap_or(serde_json::Value::Null),
            output: None,
            stream_id: stream_id.clone(),
            last_event_id: Some(event.event_id.clone()),
            last_chain_hash: Some(event.chain_hash.clone()),
            settlement_id: run_settlement.as_ref().map(|(id, _)| id.clone()),
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        ops.push(Self::run_op(&run)?);

        info!("run {} created for agent {} ({} locked)", run_id, agent_id, settlement.is_some());
        Ok((run, run_settlement.map(|(_, s)| s), ops))
    }

    fn event_type_transition(event_type: &str, current: RunStatus) -> Result<Option<RunStatus>, NooterraError> {
        let invalid = || NooterraError::RunInvalidTransition {
            run_id: String::new(),
            current: format!("{current:?}"),
        };
        match event_type {
            "RUN_STARTED" => {
                if current != RunStatus::Created {
                    return Err(invalid());
                }
                Ok(Some(RunStatus::Running))
            }
            "RUN_HEARTBEAT" | "EVIDENCE_ADDED" => {
                if current != RunStatus::Running {
                    return Err(invalid());
                }
                Ok(None)
            }
            "RUN_COMPLETED" => {
                if current != RunStatus::Running {
                    return Err(invalid());
                }
                Ok(Some(RunStatus::Completed))
            }
            "RUN_FAILED" => {
                if current != RunStatus::Running {
                    return Err(invalid());
                }
                Ok(Some(RunStatus::Failed))
            }
            other => Err(NooterraError::SchemaInvalid {
                reason: format!("unknown run event type: {other}"),
            }),
        }
    }

    /// Append one event to a run's stream, enforcing both the lifecycle
    /// grammar and the caller-supplied `expected_prev_chain_hash` (spec
    /// §4.7 - "every append requires expectedPrevChainHash from the
    /// caller; mismatch => 409"). `RUN_COMPLETED` additionally evaluates
    /// the settlement policy and folds the resulting ledger movement into
    /// the same commit.
    pub async fn append_event(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        event_type: &str,
        payload: serde_json::Value,
        expected_prev_chain_hash: Option<&HashId>,
        verification_status: Option<VerificationStatus>,
        policy: &SettlementPolicy,
    ) -> Result<(Event, AgentRun, Option<RunSettlement>), NooterraError> {
        let mut run = self.require_run(tenant_id, run_id).await?;
        let next_status = Self::event_type_transition(event_type, run.status).map_err(|_| {
            NooterraError::RunInvalidTransition {
                run_id: run_id.to_string(),
                current: format!("{:?}", run.status),
            }
        })?;

        let head = self.store.get_stream_head(tenant_id, &run.stream_id).await?;
        let current_head_hash = head.as_ref().map(|e| e.chain_hash.clone());
        if current_head_hash != expected_prev_chain_hash.cloned() {
            return Err(NooterraError::ChainHashMismatch {
                stream_id: run.stream_id.to_string(),
                sequence: head.map(|e| e.sequence + 1).unwrap_or(1),
            });
        }

        let event = self
            .chain
            .prepare_append(tenant_id, &run.stream_id, event_type, run.agent_id.to_string(), payload, None)
            .await?;
        let mut ops = vec![WriteOp::AppendEvent(event.clone())];

        run.revision += 1;
        run.last_event_id = Some(event.event_id.clone());
        run.last_chain_hash = Some(event.chain_hash.clone());
        run.updated_at = Utc::now();
        if let Some(status) = next_status {
            run.status = status;
        }

        let mut settlement_out = None;
        if matches!(event_type, "RUN_COMPLETED" | "RUN_FAILED") {
            if let Some(settlement_id) = run.settlement_id.clone() {
                let settlement = self
                    .get_settlement(tenant_id, &settlement_id)
                    .await?
                    .ok_or_else(|| NooterraError::NotFound {
                        resource: "settlement".to_string(),
                        id: settlement_id.to_string(),
                    })?;

                let (updated, settlement_ops) = if event_type == "RUN_FAILED" {
                    self.build_full_refund(tenant_id, settlement, run_id.as_str()).await?
                } else {
                    let status = verification_status.unwrap_or(VerificationStatus::Green);
                    self.build_policy_settle(tenant_id, settlement, status, policy, run_id.as_str())
                        .await?
                };
                ops.extend(settlement_ops);
                settlement_out = Some(updated);
            }
        }

        ops.push(Self::run_op(&run)?);
        self.store.commit_tx(tenant_id, ops).await?;
        info!("run {} appended {} (status now {:?})", run_id, event_type, run.status);
        Ok((event, run, settlement_out))
    }

    async fn build_full_refund(
        &self,
        tenant_id: &TenantId,
        mut settlement: RunSettlement,
        correlation_id: &str,
    ) -> Result<(RunSettlement, Vec<WriteOp>), NooterraError> {
        let (_, ops) = self
            .ledger
            .build_refund_escrow(tenant_id, &settlement.payer_agent_id, settlement.amount_cents, correlation_id)
            .await?;
        settlement.state = SettlementState::Refunded;
        settlement.decision_status = DecisionStatus::AutoResolved;
        settlement.release_rate_pct = 0;
        settlement.released_amount_cents = 0;
        settlement.refunded_amount_cents = settlement.amount_cents;
        settlement.revision += 1;
        settlement.updated_at = Utc::now();
        let mut ops = ops;
        ops.push(Self::settlement_op(&settlement)?);
        warn!("settlement {} fully refunded after run failure", settlement.settlement_id);
        Ok((settlement, ops))
    }

    async fn build_policy_settle(
        &self,
        tenant_id: &TenantId,
        mut settlement: RunSettlement,
        status: VerificationStatus,
        policy: &SettlementPolicy,
        correlation_id: &str,
    ) -> Result<(RunSettlement, Vec<WriteOp>), NooterraError> {
        let decision = policy.evaluate(status, settlement.amount_cents);

        settlement.decision_status = decision.decision_status;
        settlement.release_rate_pct = decision.release_rate_pct;
        settlement.released_amount_cents = decision.released_amount_cents;
        settlement.refunded_amount_cents = decision.refunded_amount_cents;
        settlement.decision_trace = Some(serde_json::json!({"verificationStatus": status}));
        settlement.revision += 1;
        settlement.updated_at = Utc::now();

        if decision.decision_status == DecisionStatus::ManualReviewRequired {
            // Stays locked; no funds move until a human resolves it.
            warn!("settlement {} requires manual review (amber)", settlement.settlement_id);
            return Ok((settlement.clone(), vec![Self::settlement_op(&settlement)?]));
        }

        let (_, _, mut ops) = self
            .ledger
            .build_release_escrow(
                tenant_id,
                &settlement.payer_agent_id,
                &settlement.payee_agent_id,
                settlement.amount_cents,
                decision.release_rate_pct,
                correlation_id,
            )
            .await?;

        settlement.state = if decision.release_rate_pct == 0 {
            SettlementState::Refunded
        } else {
            SettlementState::Released
        };
        ops.push(Self::settlement_op(&settlement)?);
        info!(
            "settlement {} policy-settled: {} released of {} cents",
            settlement.settlement_id, decision.released_amount_cents, settlement.amount_cents
        );
        Ok((settlement, ops))
    }

    /// Recompute the policy decision from the stored policy and the
    /// latest verification status, and compare it against the persisted
    /// decision. An arbitration override always
    /// "matches" since it supersedes any auto-policy result.
    pub fn replay_policy(
        settlement: &RunSettlement,
        status: VerificationStatus,
        policy: &SettlementPolicy,
    ) -> PolicyReplayResult {
        let replay = policy.evaluate(status, settlement.amount_cents);
        let stored = PolicyDecision {
            decision_status: settlement.decision_status,
            release_rate_pct: settlement.release_rate_pct,
            released_amount_cents: settlement.released_amount_cents,
            refunded_amount_cents: settlement.refunded_amount_cents,
        };
        let matches_stored_decision = settlement.arbitration_override
            || (replay.decision_status == stored.decision_status
                && replay.release_rate_pct == stored.release_rate_pct);
        PolicyReplayResult {
            replay,
            stored,
            matches_stored_decision,
        }
    }

    /// Manual resolution of a `manual_review_required` settlement (spec
    /// §6 - `POST /runs/{runId}/settlement/resolve`).
    pub async fn resolve_settlement_manually(
        &self,
        tenant_id: &TenantId,
        run_id: &RunId,
        release_rate_pct: u8,
        correlation_id: &str,
    ) -> Result<RunSettlement, NooterraError> {
        let settlement = self
            .get_settlement_for_run(tenant_id, run_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "settlement".to_string(),
                id: run_id.to_string(),
            })?;

        if settlement.decision_status != DecisionStatus::ManualReviewRequired {
            return Err(NooterraError::SettlementAlreadyDecided {
                settlement_id: settlement.settlement_id.to_string(),
                decision: format!("{:?}", settlement.decision_status),
            });
        }

        let mut settlement = settlement;
        let released = settlement.amount_cents * release_rate_pct as i64 / 100;
        let (_, _, mut ops) = self
            .ledger
            .build_release_escrow(
                tenant_id,
                &settlement.payer_agent_id,
                &settlement.payee_agent_id,
                settlement.amount_cents,
                release_rate_pct,
                correlation_id,
            )
            .await?;

        settlement.decision_status = DecisionStatus::ManualResolved;
        settlement.release_rate_pct = release_rate_pct;
        settlement.released_amount_cents = released;
        settlement.refunded_amount_cents = settlement.amount_cents - released;
        settlement.state = if release_rate_pct == 0 {
            SettlementState::Refunded
        } else {
            SettlementState::Released
        };
        settlement.revision += 1;
        settlement.updated_at = Utc::now();
        ops.push(Self::settlement_op(&settlement)?);

        self.store.commit_tx(tenant_id, ops).await?;
        info!("settlement {} manually resolved at {}% release", settlement.settlement_id, release_rate_pct);
        Ok(settlement)
    }

    /// Open a dispute against a locked settlement: keeps `state` at
    /// `Locked` (the machine's "still locked because disputed" branch) and
    /// flips `dispute_status` to `Open`. Building the op, not committing
    /// it, lets `nooterra-disputes` bundle this with the dispute
    /// projection and any evidence artifact in one transaction.
    pub fn build_open_dispute(mut settlement: RunSettlement) -> Result<(RunSettlement, WriteOp), NooterraError> {
        settlement.dispute_status = nooterra_types::types::DisputeStatus::Open;
        settlement.revision += 1;
        settlement.updated_at = Utc::now();
        let op = Self::settlement_op(&settlement)?;
        Ok((settlement, op))
    }

    /// Close a dispute with an arbitration verdict, moving escrow per
    /// `release_rate_pct` and marking the override so future policy
    /// replays treat this settlement as resolved by arbitration rather
    /// than by auto-policy.
    pub async fn build_close_dispute_with_verdict(
        &self,
        tenant_id: &TenantId,
        mut settlement: RunSettlement,
        release_rate_pct: u8,
        correlation_id: &str,
    ) -> Result<(RunSettlement, Vec<WriteOp>), NooterraError> {
        let released = settlement.amount_cents * release_rate_pct as i64 / 100;
        let (_, _, mut ops) = self
            .ledger
            .build_release_escrow(
                tenant_id,
                &settlement.payer_agent_id,
                &settlement.payee_agent_id,
                settlement.amount_cents,
                release_rate_pct,
                correlation_id,
            )
            .await?;

        settlement.dispute_status = nooterra_types::types::DisputeStatus::Closed;
        settlement.arbitration_override = true;
        settlement.decision_status = DecisionStatus::ManualResolved;
        settlement.release_rate_pct = release_rate_pct;
        settlement.released_amount_cents = released;
        settlement.refunded_amount_cents = settlement.amount_cents - released;
        settlement.state = if release_rate_pct == 0 {
            SettlementState::Refunded
        } else {
            SettlementState::Released
        };
        settlement.revision += 1;
        settlement.updated_at = Utc::now();
        ops.push(Self::settlement_op(&settlement)?);
        info!(
            "settlement {} resolved by arbitration verdict at {}% release",
            settlement.settlement_id, release_rate_pct
        );
        Ok((settlement, ops))
    }

    pub async fn list_runs(&self, tenant_id: &TenantId) -> Result<Vec<AgentRun>, NooterraError> {
        let rows: Vec<ProjectionRow> = self.store.list_projection(tenant_id, PROJECTION_RUN).await?;
        rows.into_iter()
            .map(|r| serde_json::from_value(r.value).map_err(NooterraError::from))
            .collect()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }
}

/// Hash a settlement policy body the same way an artifact's content
/// address is computed, so a binding's `policyHash` can be checked
/// against a candidate policy document (tie-breaks: the policy version
/// whose policyHash equals the binding wins).
pub fn policy_hash(policy: &SettlementPolicy) -> Result<HashId, NooterraError> {
    Ok(HashId::new(content_hash(policy)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;

    async fn setup() -> (RunEngine, TenantId, AgentId, AgentId) {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = RunEngine::new(store);
        let tenant = TenantId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        engine.ledger().open_wallet(&tenant, &payer, "USD").await.unwrap();
        engine.ledger().open_wallet(&tenant, &payee, "USD").await.unwrap();
        engine
            .ledger()
            .credit(&tenant, &payer, 10_000, "top_up", "seed")
            .await
            .unwrap();
        (engine, tenant, payer, payee)
    }

    #[tokio::test]
    async fn s1_first_verified_run_releases_in_full() {
        let (engine, tenant, payer, payee) = setup().await;

        let (run, settlement) = engine
            .create_run(
                &tenant,
                &payee,
                serde_json::json!({"task": "summarize"}),
                Some(InlineSettlement {
                    payer_agent_id: payer.clone(),
                    amount_cents: 650,
                    currency: "USD".to_string(),
                    dispute_window_days: 3,
                    decision_policy_hash: None,
                }),
            )
            .await
            .unwrap();
        let settlement = settlement.unwrap();
        assert_eq!(settlement.state, SettlementState::Locked);

        let policy = SettlementPolicy::default();
        let (_, run, _) = engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_STARTED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await
            .unwrap();

        let (_, run, _) = engine
            .append_event(
                &tenant,
                &run.run_id,
                "EVIDENCE_ADDED",
                serde_json::json!({"evidenceRef": format!("evidence://{}/output.json", run.run_id)}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await
            .unwrap();

        let (_, _run, settlement) = engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_COMPLETED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                Some(VerificationStatus::Green),
                &policy,
            )
            .await
            .unwrap();

        let settlement = settlement.unwrap();
        assert_eq!(settlement.state, SettlementState::Released);

        let payer_wallet = engine.ledger().get_wallet(&tenant, &payer).await.unwrap().unwrap();
        let payee_wallet = engine.ledger().get_wallet(&tenant, &payee).await.unwrap().unwrap();
        assert_eq!(payer_wallet.available_cents, 10_000 - 650);
        assert_eq!(payee_wallet.available_cents, 650);

        let replay = RunEngine::replay_policy(&settlement, VerificationStatus::Green, &policy);
        assert!(replay.matches_stored_decision);
    }

    #[tokio::test]
    async fn s2_chain_hash_mismatch_on_racing_append() {
        let (engine, tenant, _payer, payee) = setup().await;
        let (run, _) = engine
            .create_run(&tenant, &payee, serde_json::json!({}), None)
            .await
            .unwrap();
        let policy = SettlementPolicy::default();

        engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_STARTED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await
            .unwrap();

        // Both clients think the head is still the RUN_CREATED hash.
        let first = engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_HEARTBEAT",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await;
        assert!(first.is_err());
        assert_eq!(first.unwrap_err().code(), "CHAIN_HASH_MISMATCH");
    }

    #[tokio::test]
    async fn run_failed_refunds_locked_settlement() {
        let (engine, tenant, payer, payee) = setup().await;
        let (run, settlement) = engine
            .create_run(
                &tenant,
                &payee,
                serde_json::json!({}),
                Some(InlineSettlement {
                    payer_agent_id: payer.clone(),
                    amount_cents: 400,
                    currency: "USD".to_string(),
                    dispute_window_days: 1,
                    decision_policy_hash: None,
                }),
            )
            .await
            .unwrap();
        assert!(settlement.is_some());
        let policy = SettlementPolicy::default();

        let (_, run, _) = engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_STARTED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await
            .unwrap();

        let (_, _, settlement) = engine
            .append_event(
                &tenant,
                &run.run_id,
                "RUN_FAILED",
                serde_json::json!({}),
                run.last_chain_hash.as_ref(),
                None,
                &policy,
            )
            .await
            .unwrap();

        let settlement = settlement.unwrap();
        assert_eq!(settlement.state, SettlementState::Refunded);
        let payer_wallet = engine.ledger().get_wallet(&tenant, &payer).await.unwrap().unwrap();
        assert_eq!(payer_wallet.available_cents, 10_000);
        assert_eq!(payer_wallet.escrow_cents, 0);
    }
}
