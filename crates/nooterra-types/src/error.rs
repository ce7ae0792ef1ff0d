//! Error taxonomy for the Nooterra engine.
//!
//! Every variant carries a stable `code()` string matching the wire error
//! codes a tenant-facing API layer would surface, and a `retryable()` flag
//! the write pipeline (`nooterra-pipeline`) uses to decide whether a caller
//! may safely retry with the same idempotency key. All errors fail closed:
//! when a check cannot be completed, the operation is denied rather than
//! allowed.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NooterraError {
    // --- canonicalization (C1) ---
    #[error("value is not representable in canonical JSON: {reason}")]
    SchemaInvalid { reason: String },

    // --- signing/verification (C2) ---
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("key {key_id} not found")]
    KeyNotFound { key_id: String },

    #[error("key {key_id} is not active (status: {status})")]
    KeyNotActive { key_id: String, status: String },

    #[error("key {key_id} is scoped to tenant {owner} and cannot be used for tenant {requested}")]
    KeyTenantMismatch {
        key_id: String,
        owner: String,
        requested: String,
    },

    #[error("key {key_id} cannot sign: {reason}")]
    SignerCannotSign { key_id: String, reason: String },

    // --- store / concurrency (C3) ---
    #[error("revision conflict on {kind}/{key}: expected {expected}, found {actual}")]
    RevisionConflict {
        kind: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: String },

    // --- event chain (C4) ---
    #[error("chain hash mismatch on stream {stream_id} at sequence {sequence}")]
    ChainHashMismatch { stream_id: String, sequence: u64 },

    #[error("event not found: {event_id}")]
    EventNotFound { event_id: String },

    // --- artifacts (C5) ---
    #[error("artifact not found: {hash}")]
    ArtifactNotFound { hash: String },

    #[error("artifact hash mismatch: computed {computed}, expected {expected}")]
    ArtifactHashMismatch { computed: String, expected: String },

    // --- ledger / wallet (C6) ---
    #[error("agent {agent_id} is not in a state that permits this transition (current: {current})")]
    AgentInvalidTransition { agent_id: String, current: String },

    #[error("wallet has insufficient funds: available {available}, requested {requested}")]
    WalletInsufficientFunds { available: i64, requested: i64 },

    #[error("ledger postings do not sum to zero (delta {delta} cents)")]
    LedgerUnbalanced { delta: i64 },

    #[error("wallet account not found: {account}")]
    WalletAccountNotFound { account: String },

    #[error("wallet currency mismatch: expected {expected}, got {actual}")]
    WalletCurrencyMismatch { expected: String, actual: String },

    // --- run lifecycle / settlement (C7) ---
    #[error("run {run_id} is not in a state that permits this transition (current: {current})")]
    RunInvalidTransition { run_id: String, current: String },

    #[error("settlement {settlement_id} already decided as {decision}")]
    SettlementAlreadyDecided {
        settlement_id: String,
        decision: String,
    },

    #[error("policy replay mismatch for settlement {settlement_id}: stored {stored}, recomputed {recomputed}")]
    PolicyReplayMismatch {
        settlement_id: String,
        stored: String,
        recomputed: String,
    },

    // --- marketplace (C8) ---
    #[error("rfq {rfq_id} is closed and no longer accepts bids")]
    RfqClosed { rfq_id: String },

    #[error("bid {bid_id} not found on rfq {rfq_id}")]
    BidNotFound { rfq_id: String, bid_id: String },

    #[error("bid {bid_id} is not in a state that permits this transition (current: {current})")]
    BidInvalidTransition { bid_id: String, current: String },

    #[error("agreement {agreement_id} requires acceptance signatures from both parties")]
    AgreementUnaccepted { agreement_id: String },

    // --- disputes/arbitration (C9) ---
    #[error("dispute {dispute_id} window has closed")]
    DisputeWindowClosed { dispute_id: String },

    #[error("dispute {dispute_id} is not in a state that accepts this operation (current: {current})")]
    DisputeInvalidTransition { dispute_id: String, current: String },

    #[error("arbitration verdict hash mismatch for dispute {dispute_id}: stored {stored}, recomputed {recomputed}")]
    ClosepackBindingVerdictHashMismatch {
        dispute_id: String,
        stored: String,
        recomputed: String,
    },

    // --- x402 gate (C10) ---
    #[error("x402 request binding mismatch: expected {expected}, computed {computed}")]
    X402RequestMismatch { expected: String, computed: String },

    #[error("x402 gate {gate_id} execution intent is invalid: {reason}")]
    X402IntentInvalid { gate_id: String, reason: String },

    #[error("x402 gate {gate_id} payment was not authorized")]
    X402PaymentNotAuthorized { gate_id: String },

    #[error("x402 dispute-close binding evidence required for gate {gate_id}")]
    X402DisputeCloseBindingEvidenceRequired { gate_id: String },

    #[error("x402 dispute-close binding evidence mismatch for gate {gate_id}: expected {expected}, got {actual}")]
    X402DisputeCloseBindingEvidenceMismatch {
        gate_id: String,
        expected: String,
        actual: String,
    },

    #[error("x402 arbitration-open binding evidence required for gate {gate_id}")]
    X402ArbitrationOpenBindingEvidenceRequired { gate_id: String },

    #[error("x402 arbitration-open binding evidence mismatch for gate {gate_id}: expected {expected}, got {actual}")]
    X402ArbitrationOpenBindingEvidenceMismatch {
        gate_id: String,
        expected: String,
        actual: String,
    },

    // --- idempotent write pipeline (C11) ---
    #[error("idempotency key {key} was reused with a different request body")]
    IdempotencyKeyReusedWithDifferentBody { key: String },

    #[error("tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: String },

    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("payload is required")]
    PayloadRequired,

    #[error("field {field} is not a valid sha256 hex digest")]
    Sha256FieldInvalid { field: String },

    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("storage backend error: {message}")]
    Storage { message: String },
}

impl NooterraError {
    /// Stable wire error code, independent of the `Display` message.
    pub fn code(&self) -> &'static str {
        match self {
            NooterraError::SchemaInvalid { .. } => "SCHEMA_INVALID",
            NooterraError::SignatureInvalid => "SIGNATURE_INVALID",
            NooterraError::KeyNotFound { .. } => "KEY_NOT_FOUND",
            NooterraError::KeyNotActive { .. } => "KEY_NOT_ACTIVE",
            NooterraError::KeyTenantMismatch { .. } => "KEY_TENANT_MISMATCH",
            NooterraError::SignerCannotSign { .. } => "SIGNER_CANNOT_SIGN",
            NooterraError::RevisionConflict { .. } => "REVISION_CONFLICT",
            NooterraError::TransactionAborted { .. } => "TRANSACTION_ABORTED",
            NooterraError::ChainHashMismatch { .. } => "CHAIN_HASH_MISMATCH",
            NooterraError::EventNotFound { .. } => "EVENT_NOT_FOUND",
            NooterraError::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            NooterraError::ArtifactHashMismatch { .. } => "ARTIFACT_HASH_MISMATCH",
            NooterraError::AgentInvalidTransition { .. } => "AGENT_INVALID_TRANSITION",
            NooterraError::WalletInsufficientFunds { .. } => "WALLET_INSUFFICIENT_FUNDS",
            NooterraError::LedgerUnbalanced { .. } => "LEDGER_UNBALANCED",
            NooterraError::WalletAccountNotFound { .. } => "WALLET_ACCOUNT_NOT_FOUND",
            NooterraError::WalletCurrencyMismatch { .. } => "WALLET_CURRENCY_MISMATCH",
            NooterraError::RunInvalidTransition { .. } => "RUN_INVALID_TRANSITION",
            NooterraError::SettlementAlreadyDecided { .. } => "SETTLEMENT_ALREADY_DECIDED",
            NooterraError::PolicyReplayMismatch { .. } => "POLICY_REPLAY_MISMATCH",
            NooterraError::RfqClosed { .. } => "RFQ_CLOSED",
            NooterraError::BidNotFound { .. } => "BID_NOT_FOUND",
            NooterraError::BidInvalidTransition { .. } => "BID_INVALID_TRANSITION",
            NooterraError::AgreementUnaccepted { .. } => "AGREEMENT_UNACCEPTED",
            NooterraError::DisputeWindowClosed { .. } => "DISPUTE_WINDOW_CLOSED",
            NooterraError::DisputeInvalidTransition { .. } => "DISPUTE_INVALID_TRANSITION",
            NooterraError::ClosepackBindingVerdictHashMismatch { .. } => {
                "CLOSEPACK_BINDING_VERDICT_HASH_MISMATCH"
            }
            NooterraError::X402RequestMismatch { .. } => "X402_REQUEST_MISMATCH",
            NooterraError::X402IntentInvalid { .. } => "X402_EXECUTION_INTENT_INVALID",
            NooterraError::X402PaymentNotAuthorized { .. } => "X402_PAYMENT_NOT_AUTHORIZED",
            NooterraError::X402DisputeCloseBindingEvidenceRequired { .. } => {
                "X402_DISPUTE_CLOSE_BINDING_EVIDENCE_REQUIRED"
            }
            NooterraError::X402DisputeCloseBindingEvidenceMismatch { .. } => {
                "X402_DISPUTE_CLOSE_BINDING_EVIDENCE_MISMATCH"
            }
            NooterraError::X402ArbitrationOpenBindingEvidenceRequired { .. } => {
                "X402_ARBITRATION_OPEN_BINDING_EVIDENCE_REQUIRED"
            }
            NooterraError::X402ArbitrationOpenBindingEvidenceMismatch { .. } => {
                "X402_ARBITRATION_OPEN_BINDING_EVIDENCE_MISMATCH"
            }
            NooterraError::IdempotencyKeyReusedWithDifferentBody { .. } => {
                "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_BODY"
            }
            NooterraError::TenantNotFound { .. } => "TENANT_NOT_FOUND",
            NooterraError::NotFound { .. } => "NOT_FOUND",
            NooterraError::RequiredFieldMissing { .. } => "REQUIRED_FIELD_MISSING",
            NooterraError::PayloadRequired => "PAYLOAD_REQUIRED",
            NooterraError::Sha256FieldInvalid { .. } => "SHA256_FIELD_INVALID",
            NooterraError::Serialization { .. } => "SERIALIZATION_ERROR",
            NooterraError::Storage { .. } => "STORAGE_ERROR",
        }
    }

    /// Whether a caller may retry the same operation (same idempotency key,
    /// same body) and expect a different outcome. Concurrency conflicts and
    /// storage errors are retryable; everything that reflects a durable
    /// business-rule violation is not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            NooterraError::TransactionAborted { .. } | NooterraError::Storage { .. }
        )
    }
}

impl From<serde_json::Error> for NooterraError {
    fn from(e: serde_json::Error) -> Self {
        NooterraError::Serialization {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NooterraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        let err = NooterraError::WalletInsufficientFunds {
            available: 10,
            requested: 100,
        };
        assert_eq!(err.code(), "WALLET_INSUFFICIENT_FUNDS");
        assert!(!err.retryable());
    }

    #[test]
    fn chain_hash_mismatch_is_not_retryable() {
        let err = NooterraError::ChainHashMismatch {
            stream_id: "stream_1".into(),
            sequence: 2,
        };
        assert_eq!(err.code(), "CHAIN_HASH_MISMATCH");
        assert!(!err.retryable());
    }
}
