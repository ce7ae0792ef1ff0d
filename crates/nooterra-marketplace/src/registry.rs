//! RFQ, bid negotiation, and agreement acceptance.
//!
//! An RFQ collects competing bids, bids counter-offer through a
//! hash-chained proposal history, and accepting one atomically produces a
//! signed agreement, a run, an inline settlement, and an escrow lock - all
//! in one `commit_tx` batch.

use chrono::{DateTime, Utc};
use nooterra_artifacts::ArtifactRegistry;
use nooterra_canon::{canonicalize, content_hash, sha256_hex};
use nooterra_crypto::{KeyRegistry, SignaturePurpose};
use nooterra_runs::{policy_hash, InlineSettlement, RunEngine, SettlementPolicy};
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{
    AgentId, ArtifactId, AgreementId, BidId, ContentHash, KeyId, ProposalId, RfqId, RunId, TenantId,
};
use nooterra_types::types::{
    AgentRun, Agreement, Artifact, ArtifactSignature, Bid, BidProposal, BidStatus, Rfq, RfqStatus,
    RunSettlement,
};
use nooterra_types::NooterraError;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

const PROJECTION_RFQ: &str = "rfq";
const PROJECTION_BID: &str = "bid";
const PROJECTION_PROPOSAL: &str = "bid_proposal";
const PROJECTION_AGREEMENT: &str = "agreement";

#[derive(Serialize)]
struct ProposalLinkage<'a> {
    bid_id: &'a str,
    proposed_by_agent_id: &'a str,
    terms: &'a serde_json::Value,
    price_cents: i64,
    prev_proposal_hash: Option<&'a str>,
}

pub struct MarketplaceEngine {
    store: Arc<dyn Store>,
    artifacts: ArtifactRegistry,
    runs: RunEngine,
}

impl MarketplaceEngine {
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

    async fn require_rfq(&self, tenant_id: &TenantId, rfq_id: &RfqId) -> Result<Rfq, NooterraError> {
        self.get_rfq(tenant_id, rfq_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "rfq".to_string(),
                id: rfq_id.to_string(),
            })
    }

    async fn require_bid(&self, tenant_id: &TenantId, rfq_id: &RfqId, bid_id: &BidId) -> Result<Bid, NooterraError> {
        let bid = self
            .get_bid(tenant_id, bid_id)
            .await?
            .ok_or_else(|| NooterraError::BidNotFound {
                rfq_id: rfq_id.to_string(),
                bid_id: bid_id.to_string(),
            })?;
        if &bid.rfq_id != rfq_id {
            return Err(NooterraError::BidNotFound {
                rfq_id: rfq_id.to_string(),
                bid_id: bid_id.to_string(),
            });
        }
        Ok(bid)
    }

    pub async fn get_rfq(&self, tenant_id: &TenantId, rfq_id: &RfqId) -> Result<Option<Rfq>, NooterraError> {
        let row = self.store.get_projection(tenant_id, PROJECTION_RFQ, rfq_id.as_str()).await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    pub async fn get_bid(&self, tenant_id: &TenantId, bid_id: &BidId) -> Result<Option<Bid>, NooterraError> {
        let row = self.store.get_projection(tenant_id, PROJECTION_BID, bid_id.as_str()).await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    pub async fn get_agreement(
        &self,
        tenant_id: &TenantId,
        agreement_id: &AgreementId,
    ) -> Result<Option<Agreement>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_AGREEMENT, agreement_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from)).transpose()
    }

    pub async fn list_bids_for_rfq(&self, tenant_id: &TenantId, rfq_id: &RfqId) -> Result<Vec<Bid>, NooterraError> {
        let rows: Vec<ProjectionRow> = self.store.list_projection(tenant_id, PROJECTION_BID).await?;
        let mut bids = Vec::new();
        for row in rows {
            let bid: Bid = serde_json::from_value(row.value)?;
            if &bid.rfq_id == rfq_id {
                bids.push(bid);
            }
        }
        Ok(bids)
    }

    fn rfq_op(rfq: &Rfq) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_RFQ.to_string(),
            key: rfq.rfq_id.as_str().to_string(),
            value: serde_json::to_value(rfq)?,
            expected_revision: Some(rfq.revision.saturating_sub(1)),
        })
    }

    fn bid_op(bid: &Bid) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_BID.to_string(),
            key: bid.bid_id.as_str().to_string(),
            value: serde_json::to_value(bid)?,
            expected_revision: Some(bid.revision.saturating_sub(1)),
        })
    }

    fn proposal_op(proposal: &BidProposal) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_PROPOSAL.to_string(),
            key: proposal.proposal_id.as_str().to_string(),
            value: serde_json::to_value(proposal)?,
            expected_revision: Some(0),
        })
    }

    fn agreement_op(agreement: &Agreement) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_AGREEMENT.to_string(),
            key: agreement.agreement_id.as_str().to_string(),
            value: serde_json::to_value(agreement)?,
            expected_revision: Some(0),
        })
    }

    fn proposal_hash(
        bid_id: &BidId,
        proposed_by: &AgentId,
        terms: &serde_json::Value,
        price_cents: i64,
        prev: Option<&str>,
    ) -> Result<String, NooterraError> {
        let linkage = ProposalLinkage {
            bid_id: bid_id.as_str(),
            proposed_by_agent_id: proposed_by.as_str(),
            terms,
            price_cents,
            prev_proposal_hash: prev,
        };
        Ok(sha256_hex(&canonicalize(&linkage)?))
    }

    pub async fn create_rfq(
        &self,
        tenant_id: &TenantId,
        requester_agent_id: &AgentId,
        terms: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<Rfq, NooterraError> {
        let rfq = Rfq {
            rfq_id: RfqId::new(),
            tenant_id: tenant_id.clone(),
            requester_agent_id: requester_agent_id.clone(),
            terms,
            status: RfqStatus::Open,
            revision: 1,
            created_at: Utc::now(),
            expires_at,
        };
        self.store.commit_tx(tenant_id, vec![Self::rfq_op(&rfq)?]).await?;
        info!("rfq {} opened by agent {}", rfq.rfq_id, requester_agent_id);
        Ok(rfq)
    }

    async fn transition_rfq(
        &self,
        tenant_id: &TenantId,
        rfq_id: &RfqId,
        next: RfqStatus,
    ) -> Result<Rfq, NooterraError> {
        let mut rfq = self.require_rfq(tenant_id, rfq_id).await?;
        if !rfq.status.can_transition_to(next) {
            return Err(NooterraError::RfqClosed { rfq_id: rfq_id.to_string() });
        }
        rfq.status = next;
        rfq.revision += 1;
        self.store.commit_tx(tenant_id, vec![Self::rfq_op(&rfq)?]).await?;
        Ok(rfq)
    }

    pub async fn cancel_rfq(&self, tenant_id: &TenantId, rfq_id: &RfqId) -> Result<Rfq, NooterraError> {
        self.transition_rfq(tenant_id, rfq_id, RfqStatus::Cancelled).await
    }

    pub async fn close_rfq(&self, tenant_id: &TenantId, rfq_id: &RfqId) -> Result<Rfq, NooterraError> {
        self.transition_rfq(tenant_id, rfq_id, RfqStatus::Closed).await
    }

    /// Submit the opening bid on an open RFQ, seeding its proposal chain.
    pub async fn submit_bid(
        &self,
        tenant_id: &TenantId,
        rfq_id: &RfqId,
        bidder_agent_id: &AgentId,
        terms: serde_json::Value,
        price_cents: i64,
    ) -> Result<Bid, NooterraError> {
        let rfq = self.require_rfq(tenant_id, rfq_id).await?;
        if rfq.status != RfqStatus::Open {
            return Err(NooterraError::RfqClosed { rfq_id: rfq_id.to_string() });
        }

        let bid_id = BidId::new();
        let hash = Self::proposal_hash(&bid_id, bidder_agent_id, &terms, price_cents, None)?;
        let now = Utc::now();
        let proposal = BidProposal {
            proposal_id: ProposalId::new(),
            bid_id: bid_id.clone(),
            proposed_by_agent_id: bidder_agent_id.clone(),
            terms: terms.clone(),
            price_cents,
            prev_proposal_hash: None,
            proposal_hash: nooterra_types::ids::ContentHash::new(hash.clone()),
            created_at: now,
        };
        let bid = Bid {
            bid_id,
            rfq_id: rfq_id.clone(),
            tenant_id: tenant_id.clone(),
            bidder_agent_id: bidder_agent_id.clone(),
            terms,
            price_cents,
            status: BidStatus::Pending,
            latest_proposal_hash: nooterra_types::ids::ContentHash::new(hash),
            revision: 1,
            created_at: now,
            updated_at: now,
        };

        self.store
            .commit_tx(tenant_id, vec![Self::bid_op(&bid)?, Self::proposal_op(&proposal)?])
            .await?;
        info!("bid {} submitted on rfq {} by agent {}", bid.bid_id, rfq_id, bidder_agent_id);
        Ok(bid)
    }

    /// Append a counter-offer, chaining it off the bid's current latest
    /// proposal hash. Acceptance must always target the latest revision.
    pub async fn counter_offer(
        &self,
        tenant_id: &TenantId,
        rfq_id: &RfqId,
        bid_id: &BidId,
        proposed_by_agent_id: &AgentId,
        terms: serde_json::Value,
        price_cents: i64,
    ) -> Result<Bid, NooterraError> {
        let rfq = self.require_rfq(tenant_id, rfq_id).await?;
        if rfq.status != RfqStatus::Open {
            return Err(NooterraError::RfqClosed { rfq_id: rfq_id.to_string() });
        }
        let mut bid = self.require_bid(tenant_id, rfq_id, bid_id).await?;
        if bid.status != BidStatus::Pending {
            return Err(NooterraError::BidInvalidTransition {
                bid_id: bid_id.to_string(),
                current: format!("{:?}", bid.status),
            });
        }

        let prev = bid.latest_proposal_hash.as_str().to_string();
        let hash = Self::proposal_hash(bid_id, proposed_by_agent_id, &terms, price_cents, Some(&prev))?;
        let now = Utc::now();
        let proposal = BidProposal {
            proposal_id: ProposalId::new(),
            bid_id: bid_id.clone(),
            proposed_by_agent_id: proposed_by_agent_id.clone(),
            terms: terms.clone(),
            price_cents,
            prev_proposal_hash: Some(bid.latest_proposal_hash.clone()),
            proposal_hash: nooterra_types::ids::ContentHash::new(hash.clone()),
            created_at: now,
        };

        bid.terms = terms;
        bid.price_cents = price_cents;
        bid.latest_proposal_hash = nooterra_types::ids::ContentHash::new(hash);
        bid.revision += 1;
        bid.updated_at = now;

        self.store
            .commit_tx(tenant_id, vec![Self::bid_op(&bid)?, Self::proposal_op(&proposal)?])
            .await?;
        info!("bid {} countered by agent {} at {} cents", bid_id, proposed_by_agent_id, price_cents);
        Ok(bid)
    }

    pub async fn reject_bid(&self, tenant_id: &TenantId, rfq_id: &RfqId, bid_id: &BidId) -> Result<Bid, NooterraError> {
        let mut bid = self.require_bid(tenant_id, rfq_id, bid_id).await?;
        if !bid.status.can_transition_to(BidStatus::Rejected) {
            return Err(NooterraError::BidInvalidTransition {
                bid_id: bid_id.to_string(),
                current: format!("{:?}", bid.status),
            });
        }
        bid.status = BidStatus::Rejected;
        bid.revision += 1;
        bid.updated_at = Utc::now();
        self.store.commit_tx(tenant_id, vec![Self::bid_op(&bid)?]).await?;
        Ok(bid)
    }

    /// Accept a pending bid: sign and insert the two required artifacts,
    /// then atomically mark the bid accepted, assign the RFQ, create the
    /// agreement, and spin up a run with an inline settlement that locks
    /// escrow for the bid's price.
    #[allow(clippy::too_many_arguments)]
    pub async fn accept_bid(
        &self,
        tenant_id: &TenantId,
        rfq_id: &RfqId,
        bid_id: &BidId,
        keys: &KeyRegistry,
        acceptance_key_id: &KeyId,
        currency: &str,
        dispute_window_days: u32,
        verification_method: &str,
        policy_ref: &str,
        policy: &SettlementPolicy,
        run_input: serde_json::Value,
    ) -> Result<(Agreement, AgentRun, Option<RunSettlement>), NooterraError> {
        let mut rfq = self.require_rfq(tenant_id, rfq_id).await?;
        if rfq.status != RfqStatus::Open {
            return Err(NooterraError::RfqClosed { rfq_id: rfq_id.to_string() });
        }
        let mut bid = self.require_bid(tenant_id, rfq_id, bid_id).await?;
        if bid.status != BidStatus::Pending {
            return Err(NooterraError::BidInvalidTransition {
                bid_id: bid_id.to_string(),
                current: format!("{:?}", bid.status),
            });
        }

        let agreement_id = AgreementId::new();
        let run_id = RunId::new();
        let offer_chain_hash = content_hash(&rfq.terms)?;

        let acceptance_body = serde_json::json!({
            "agreementId": agreement_id.as_str(),
            "rfqId": rfq_id.as_str(),
            "runId": run_id.as_str(),
            "bidId": bid_id.as_str(),
            "acceptedByAgentId": rfq.requester_agent_id.as_str(),
            "acceptedProposalHash": bid.latest_proposal_hash.as_str(),
            "offerChainHash": offer_chain_hash,
        });
        let acceptance_hash_hex = content_hash(&acceptance_body)?;
        let signature = keys.sign(
            acceptance_key_id,
            tenant_id,
            SignaturePurpose::MarketplaceAcceptance,
            &acceptance_hash_hex,
        )?;
        let acceptance_artifact = self
            .artifacts
            .insert(
                tenant_id,
                "MarketplaceAgreementAcceptanceSignature.v2",
                acceptance_body,
                vec![ArtifactSignature {
                    key_id: acceptance_key_id.to_string(),
                    purpose: "marketplace_acceptance".to_string(),
                    signature_base64: signature.signature_base64,
                }],
            )
            .await?;

        let policy_hash_value = policy_hash(policy)?;
        let policy_binding_body = serde_json::json!({
            "termsHash": content_hash(&bid.terms)?,
            "policyHash": policy_hash_value.as_str(),
            "verificationMethodHash": sha256_hex(verification_method.as_bytes()),
            "policyRefHash": sha256_hex(policy_ref.as_bytes()),
        });
        let policy_binding_artifact = self
            .artifacts
            .insert(tenant_id, "MarketplaceAgreementPolicyBinding.v2", policy_binding_body, vec![])
            .await?;

        let (run, settlement, mut ops) = self
            .runs
            .build_create_run(
                tenant_id,
                &bid.bidder_agent_id,
                run_input,
                Some(InlineSettlement {
                    payer_agent_id: rfq.requester_agent_id.clone(),
                    amount_cents: bid.price_cents,
                    currency: currency.to_string(),
                    dispute_window_days,
                    decision_policy_hash: Some(policy_hash_value),
                }),
                Some(run_id.clone()),
            )
            .await?;

        bid.status = BidStatus::Accepted;
        bid.revision += 1;
        bid.updated_at = Utc::now();
        ops.push(Self::bid_op(&bid)?);

        rfq.status = RfqStatus::Assigned;
        rfq.revision += 1;
        ops.push(Self::rfq_op(&rfq)?);

        // The agreement artifact itself, binding terms, price, and both
        // parties to this one run - built here rather than through
        // `ArtifactRegistry::insert` so it lands in the same `commit_tx`
        // batch as the bid/RFQ/run/escrow mutations instead of a separate
        // round trip.
        let task_agreement_body = serde_json::json!({
            "agreementId": agreement_id.as_str(),
            "rfqId": rfq_id.as_str(),
            "bidId": bid_id.as_str(),
            "runId": run_id.as_str(),
            "requesterAgentId": rfq.requester_agent_id.as_str(),
            "bidderAgentId": bid.bidder_agent_id.as_str(),
            "terms": bid.terms.clone(),
            "priceCents": bid.price_cents,
            "currency": currency,
            "acceptedProposalHash": bid.latest_proposal_hash.as_str(),
            "acceptanceArtifactHash": acceptance_artifact.artifact_hash.as_str(),
            "policyBindingArtifactHash": policy_binding_artifact.artifact_hash.as_str(),
        });
        let task_agreement_hash = ContentHash::new(content_hash(&task_agreement_body)?);
        let task_agreement_artifact = Artifact {
            artifact_id: ArtifactId::new(),
            tenant_id: tenant_id.clone(),
            artifact_hash: task_agreement_hash.clone(),
            artifact_type: "MarketplaceTaskAgreement.v2".to_string(),
            body: task_agreement_body,
            signatures: vec![],
            created_at: Utc::now(),
        };
        ops.push(WriteOp::PutArtifactIfAbsent(task_agreement_artifact));

        let agreement = Agreement {
            agreement_id,
            tenant_id: tenant_id.clone(),
            rfq_id: rfq_id.clone(),
            bid_id: bid_id.clone(),
            run_id: Some(run_id),
            terms: bid.terms.clone(),
            price_cents: bid.price_cents,
            task_agreement_artifact_hash: Some(task_agreement_hash),
            acceptance_artifact_hash: Some(acceptance_artifact.artifact_hash),
            policy_binding_artifact_hash: Some(policy_binding_artifact.artifact_hash),
            created_at: Utc::now(),
        };
        ops.push(Self::agreement_op(&agreement)?);

        self.store.commit_tx(tenant_id, ops).await?;
        info!("bid {} accepted on rfq {}, agreement {} created", bid_id, rfq_id, agreement.agreement_id);
        Ok((agreement, run, settlement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_crypto::KeyRole;
    use nooterra_ledger::WalletLedger;
    use nooterra_store::InMemoryStore;

    #[tokio::test]
    async fn accept_bid_locks_escrow_and_requires_both_artifacts() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let market = MarketplaceEngine::new(store.clone());
        let ledger = WalletLedger::new(store.clone());
        let keys = KeyRegistry::new();

        let tenant = TenantId::new();
        let requester = AgentId::new();
        let bidder = AgentId::new();
        ledger.open_wallet(&tenant, &requester, "USD").await.unwrap();
        ledger.open_wallet(&tenant, &bidder, "USD").await.unwrap();
        ledger.credit(&tenant, &requester, 5_000, "top_up", "seed").await.unwrap();

        let (key_id, _) = keys.generate_tenant_key(KeyRole::Operator, tenant.clone()).unwrap();

        let rfq = market
            .create_rfq(
                &tenant,
                &requester,
                serde_json::json!({"task": "translate"}),
                Utc::now() + chrono::Duration::days(7),
            )
            .await
            .unwrap();

        let bid = market
            .submit_bid(&tenant, &rfq.rfq_id, &bidder, serde_json::json!({"turnaround": "24h"}), 1200)
            .await
            .unwrap();

        let countered = market
            .counter_offer(&tenant, &rfq.rfq_id, &bid.bid_id, &requester, serde_json::json!({"turnaround": "12h"}), 1500)
            .await
            .unwrap();
        assert_ne!(countered.latest_proposal_hash, bid.latest_proposal_hash);

        let (agreement, run, settlement) = market
            .accept_bid(
                &tenant,
                &rfq.rfq_id,
                &bid.bid_id,
                &keys,
                &key_id,
                "USD",
                3,
                "manual_review.v1",
                "policy://default",
                &SettlementPolicy::default(),
                serde_json::json!({"task": "translate"}),
            )
            .await
            .unwrap();

        assert!(agreement.is_accepted());
        let task_agreement_hash = agreement.task_agreement_artifact_hash.clone().unwrap();
        let task_agreement = store.get_artifact(&tenant, &task_agreement_hash).await.unwrap().unwrap();
        assert_eq!(task_agreement.artifact_type, "MarketplaceTaskAgreement.v2");
        assert_eq!(run.agent_id, bidder);
        let settlement = settlement.unwrap();
        assert_eq!(settlement.amount_cents, 1500);

        let requester_wallet = ledger.get_wallet(&tenant, &requester).await.unwrap().unwrap();
        assert_eq!(requester_wallet.available_cents, 5_000 - 1500);
        assert_eq!(requester_wallet.escrow_cents, 1500);

        let rfq_after = market.get_rfq(&tenant, &rfq.rfq_id).await.unwrap().unwrap();
        assert_eq!(rfq_after.status, RfqStatus::Assigned);
    }

    #[tokio::test]
    async fn submitting_a_bid_on_a_closed_rfq_fails() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let market = MarketplaceEngine::new(store);
        let tenant = TenantId::new();
        let requester = AgentId::new();
        let bidder = AgentId::new();

        let rfq = market
            .create_rfq(&tenant, &requester, serde_json::json!({}), Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        market.close_rfq(&tenant, &rfq.rfq_id).await.unwrap();

        let err = market
            .submit_bid(&tenant, &rfq.rfq_id, &bidder, serde_json::json!({}), 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RFQ_CLOSED");
    }
}
