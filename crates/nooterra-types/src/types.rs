//! The shared data model, carried across every engine crate without
//! duplicating field definitions. Dynamic payloads (event bodies, artifact
//! bodies, bid terms) are `serde_json::Value` rather than a closed Rust
//! enum, matching the spec's "typed envelope + open payload" shape.

use crate::ids::{
    AgentId, ArtifactId, BidId, ContentHash, DelegationId, DisputeId, EventId, GateId,
    IdempotencyKey, RfqId, RunId, SettlementId, StreamId, TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tenant: the isolation boundary for every other resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub status: TenantStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// One entry in a per-stream, append-only, hash-chained event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub v: u32,
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub stream_id: StreamId,
    pub sequence: u64,
    pub event_type: String,
    pub actor: String,
    pub payload: serde_json::Value,
    /// `sha256(canonical(payload))`, re-derived by `ChainEngine::verify_stream`
    /// rather than trusted at face value.
    pub payload_hash: ContentHash,
    pub prev_chain_hash: Option<ContentHash>,
    pub chain_hash: ContentHash,
    pub recorded_at: DateTime<Utc>,
    pub signature: Option<EventSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSignature {
    pub key_id: String,
    pub signature_base64: String,
}

/// A content-addressed, immutable signed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: ArtifactId,
    pub tenant_id: TenantId,
    pub artifact_hash: ContentHash,
    pub artifact_type: String,
    pub body: serde_json::Value,
    pub signatures: Vec<ArtifactSignature>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSignature {
    pub key_id: String,
    pub purpose: String,
    pub signature_base64: String,
}

/// An autonomous agent's identity within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    pub tenant_id: TenantId,
    pub display_name: String,
    pub owner_type: String,
    pub owner_id: String,
    pub key_id: crate::ids::KeyId,
    pub public_key_pem: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `active -> suspended -> revoked`, one direction only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Suspended,
    Revoked,
}

impl AgentStatus {
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        matches!(
            (self, next),
            (AgentStatus::Active, AgentStatus::Suspended)
                | (AgentStatus::Active, AgentStatus::Revoked)
                | (AgentStatus::Suspended, AgentStatus::Revoked)
        )
    }
}

/// A wallet's account balances, as a read model over the ledger's postings.
///
/// Invariant: `available_cents + escrow_cents == total_credited_cents
/// - total_debited_cents`, and every field is >= 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWallet {
    pub wallet_id: crate::ids::WalletId,
    pub agent_id: AgentId,
    pub tenant_id: TenantId,
    pub currency: String,
    pub available_cents: i64,
    pub escrow_cents: i64,
    pub total_debited_cents: i64,
    pub total_credited_cents: i64,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl AgentWallet {
    pub fn new(tenant_id: TenantId, agent_id: AgentId, currency: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            wallet_id: crate::ids::WalletId::new(),
            agent_id,
            tenant_id,
            currency: currency.into(),
            available_cents: 0,
            escrow_cents: 0,
            total_debited_cents: 0,
            total_credited_cents: 0,
            revision: 0,
            updated_at: now,
        }
    }

    /// The spec's conservation invariant, checked after every mutation.
    pub fn is_balanced(&self) -> bool {
        self.available_cents >= 0
            && self.escrow_cents >= 0
            && self.available_cents + self.escrow_cents
                == self.total_credited_cents - self.total_debited_cents
    }
}

/// One leg of a balanced double-entry posting set. A `WALLET_POST` batch
/// (see `nooterra-ledger`) is a `Vec<LedgerPosting>` whose `amount_cents`
/// sum to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub entry_id: crate::ids::LedgerEntryId,
    pub account: String,
    /// Positive is a credit to `account`, negative is a debit.
    pub amount_cents: i64,
    pub reason: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

/// The lifecycle state of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Created, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub stream_id: StreamId,
    pub last_event_id: Option<EventId>,
    pub last_chain_hash: Option<ContentHash>,
    pub settlement_id: Option<SettlementId>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Settlement state for a single run's escrowed payment. The spec's
/// `locked -> released | refunded` machine, with `locked` reused to mean
/// "still locked because a dispute is open".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    Locked,
    Released,
    Refunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    None,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    AutoResolved,
    ManualReviewRequired,
    ManualResolved,
}

/// Traffic-light verification status feeding the policy replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Green,
    Amber,
    Red,
}

/// The outcome of evaluating a `TenantSettlementPolicy.v1` /
/// `MarketplaceAgreementPolicyBinding.v2` against a verification status.
/// Produced fresh by every policy replay and compared against the value
/// last persisted on the settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub decision_status: DecisionStatus,
    pub release_rate_pct: u8,
    pub released_amount_cents: i64,
    pub refunded_amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettlement {
    pub settlement_id: SettlementId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub payer_agent_id: AgentId,
    pub payee_agent_id: AgentId,
    pub amount_cents: i64,
    pub currency: String,
    pub state: SettlementState,
    pub dispute_window_days: u32,
    pub dispute_window_ends_at: DateTime<Utc>,
    pub dispute_status: DisputeStatus,
    /// The currently stored decision. Recomputed by `getRunSettlementPolicyReplay`
    /// and compared against this value, unless `arbitration_override` is set.
    pub decision_status: DecisionStatus,
    pub release_rate_pct: u8,
    pub released_amount_cents: i64,
    pub refunded_amount_cents: i64,
    pub decision_policy_hash: Option<ContentHash>,
    pub decision_trace: Option<serde_json::Value>,
    pub arbitration_override: bool,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSettlement {
    pub fn is_dispute_window_open(&self, now: DateTime<Utc>) -> bool {
        now < self.dispute_window_ends_at
    }
}

/// A marketplace request for quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rfq {
    pub rfq_id: RfqId,
    pub tenant_id: TenantId,
    pub requester_agent_id: AgentId,
    pub terms: serde_json::Value,
    pub status: RfqStatus,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RfqStatus {
    pub fn can_transition_to(&self, next: RfqStatus) -> bool {
        matches!(
            (self, next),
            (RfqStatus::Open, RfqStatus::Assigned)
                | (RfqStatus::Open, RfqStatus::Cancelled)
                | (RfqStatus::Open, RfqStatus::Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfqStatus {
    Open,
    Assigned,
    Cancelled,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub rfq_id: RfqId,
    pub tenant_id: TenantId,
    pub bidder_agent_id: AgentId,
    pub terms: serde_json::Value,
    pub price_cents: i64,
    pub status: BidStatus,
    /// Hash of the latest accepted `BidProposal`; acceptance must always
    /// target this value, the latest one.
    pub latest_proposal_hash: ContentHash,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn can_transition_to(&self, next: BidStatus) -> bool {
        matches!(
            (self, next),
            (BidStatus::Pending, BidStatus::Accepted) | (BidStatus::Pending, BidStatus::Rejected)
        )
    }
}

/// One entry in a bid's counter-offer chain (`MarketplaceBidProposal.v1`).
/// `prev_proposal_hash` links it to the proposal it supersedes, mirroring
/// the event chain's `prevChainHash` linkage at a smaller scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidProposal {
    pub proposal_id: crate::ids::ProposalId,
    pub bid_id: BidId,
    pub proposed_by_agent_id: AgentId,
    pub terms: serde_json::Value,
    pub price_cents: i64,
    pub prev_proposal_hash: Option<ContentHash>,
    pub proposal_hash: ContentHash,
    pub created_at: DateTime<Utc>,
}

/// The result of a negotiation: a bilateral agreement, valid once the
/// accepting agent's acceptance signature and the policy binding are both
/// attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    pub agreement_id: crate::ids::AgreementId,
    pub tenant_id: TenantId,
    pub rfq_id: RfqId,
    pub bid_id: BidId,
    pub run_id: Option<RunId>,
    pub terms: serde_json::Value,
    pub price_cents: i64,
    pub task_agreement_artifact_hash: Option<ContentHash>,
    pub acceptance_artifact_hash: Option<ContentHash>,
    pub policy_binding_artifact_hash: Option<ContentHash>,
    pub created_at: DateTime<Utc>,
}

impl Agreement {
    pub fn is_accepted(&self) -> bool {
        self.task_agreement_artifact_hash.is_some()
            && self.acceptance_artifact_hash.is_some()
            && self.policy_binding_artifact_hash.is_some()
    }
}

/// A bounded delegation of authority from one agent to another (or to an
/// operator), scoped by an explicit action allowlist and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegation_id: DelegationId,
    pub tenant_id: TenantId,
    pub grantor_agent_id: AgentId,
    pub grantee_agent_id: AgentId,
    pub allowed_actions: Vec<String>,
    pub max_amount_cents: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Delegation {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    pub fn permits(&self, action: &str) -> bool {
        self.allowed_actions.iter().any(|a| a == action)
    }
}

/// Dispute lifecycle attached to a `RunSettlement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    L1Counterparty,
    L2Arbiter,
    L3External,
}

impl EscalationLevel {
    /// Escalation may only move forward.
    pub fn can_escalate_to(&self, next: EscalationLevel) -> bool {
        self.rank() < next.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            EscalationLevel::L1Counterparty => 0,
            EscalationLevel::L2Arbiter => 1,
            EscalationLevel::L3External => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: DisputeId,
    pub tenant_id: TenantId,
    pub settlement_id: SettlementId,
    pub run_id: RunId,
    pub opened_by_agent_id: AgentId,
    pub dispute_type: String,
    pub dispute_priority: String,
    pub dispute_channel: String,
    pub escalation_level: EscalationLevel,
    pub status: DisputeStatus,
    pub evidence_refs: Vec<String>,
    pub verdict_artifact_hash: Option<ContentHash>,
    pub adjustment_artifact_hash: Option<ContentHash>,
    pub revision: u64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Outcome recorded on an `ArbitrationVerdict.v1` artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Upheld,
    Partial,
    Overturned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementAdjustmentKind {
    HoldbackRelease,
    HoldbackRefund,
}

/// An x402 payment gate guarding one execution intent. Binds a quote and
/// `ExecutionIntent` to at most one payment authorization and, later, one
/// verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct X402Gate {
    pub gate_id: GateId,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub quote: serde_json::Value,
    pub execution_intent: serde_json::Value,
    pub binding_mode: BindingMode,
    /// SHA-256 hex of the request body recorded at gate-create time when
    /// `binding_mode == Strict`. A later call presenting a different value
    /// fails `X402_REQUEST_MISMATCH`.
    pub request_binding_sha256: Option<String>,
    pub response_binding_sha256: Option<String>,
    pub status: GateStatus,
    pub amount_cents: i64,
    pub settlement_id: Option<SettlementId>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingMode {
    Strict,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Authorized,
    Verified,
    Denied,
}

/// A stored idempotent-write record: fingerprint of the originating
/// request plus the response that was committed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub key: IdempotencyKey,
    pub fingerprint: ContentHash,
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Ordered map alias used for canonical encoding inputs and artifact/event
/// payload construction where key order must be controlled explicitly.
pub type OrderedMap = BTreeMap<String, serde_json::Value>;
