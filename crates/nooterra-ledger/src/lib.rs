//! Double-entry agent wallet ledger and agent identity registry.
//!
//! Every balance change is a set of `LedgerPosting`s that nets to zero
//! cents, committed atomically alongside the wallet projection it
//! produces - the same "compute new state, then hand it to the store in
//! one batch" shape an in-process `Arc<RwLock<HashMap>>` ledger would use,
//! generalized here to go through
//! `nooterra-store` so it participates in the same transaction as events
//! and artifacts.
//!
//! # Accounts
//!
//! - `acct_available:<agentId>` / `acct_escrow:<agentId>` - per-agent.
//! - `acct_platform_suspense`, `acct_coverage_reserve`,
//!   `acct_insurer_receivable` - tenant-wide system accounts.
//!
//! Balances themselves are not separately stored per account; the wallet
//! projection (`available_cents`, `escrow_cents`, running totals) is the
//! read model, and the posting list is the audit trail proving how it got
//! there. `credit`/`lock_escrow`/`release_escrow`/`refund_escrow` are the
//! only ways to move cents, and each one asserts the posting set sums to
//! zero before it ever reaches the store.

pub mod agent;

pub use agent::AgentRegistry;

use chrono::Utc;
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{AgentId, LedgerEntryId, TenantId};
use nooterra_types::types::{AgentWallet, LedgerPosting};
use nooterra_types::NooterraError;
use std::sync::Arc;
use tracing::info;

const PROJECTION_WALLET: &str = "wallet";
const PROJECTION_LEDGER_ENTRY: &str = "ledger_entry";

pub fn account_available(agent_id: &AgentId) -> String {
    format!("acct_available:{agent_id}")
}

pub fn account_escrow(agent_id: &AgentId) -> String {
    format!("acct_escrow:{agent_id}")
}

pub const ACCT_PLATFORM_SUSPENSE: &str = "acct_platform_suspense";
pub const ACCT_COVERAGE_RESERVE: &str = "acct_coverage_reserve";
pub const ACCT_INSURER_RECEIVABLE: &str = "acct_insurer_receivable";

pub struct WalletLedger {
    store: Arc<dyn Store>,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn get_wallet(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
    ) -> Result<Option<AgentWallet>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_WALLET, agent_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from))
            .transpose()
    }

    pub async fn list_wallets(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<AgentWallet>, NooterraError> {
        let rows = self.store.list_projection(tenant_id, PROJECTION_WALLET).await?;
        rows.into_iter()
            .map(|ProjectionRow { value, .. }| serde_json::from_value(value).map_err(NooterraError::from))
            .collect()
    }

    /// Open a zero-balance wallet for `agent_id`, failing if one already
    /// exists. Registration time, not first-credit time, is when the
    /// projection row is created, so CAS against it is always well-defined.
    pub async fn open_wallet(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        currency: &str,
    ) -> Result<AgentWallet, NooterraError> {
        let wallet = AgentWallet::new(tenant_id.clone(), agent_id.clone(), currency);
        self.store
            .commit_tx(
                tenant_id,
                vec![WriteOp::UpsertProjection {
                    kind: PROJECTION_WALLET.to_string(),
                    key: agent_id.as_str().to_string(),
                    value: serde_json::to_value(&wallet)?,
                    expected_revision: Some(0),
                }],
            )
            .await?;
        info!("wallet opened for agent {} ({})", agent_id, currency);
        Ok(wallet)
    }

    async fn require_wallet(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
    ) -> Result<AgentWallet, NooterraError> {
        self.get_wallet(tenant_id, agent_id)
            .await?
            .ok_or_else(|| NooterraError::WalletAccountNotFound {
                account: account_available(agent_id),
            })
    }

    fn posting(account: impl Into<String>, amount_cents: i64, reason: &str, correlation_id: &str) -> LedgerPosting {
        LedgerPosting {
            entry_id: LedgerEntryId::new(),
            account: account.into(),
            amount_cents,
            reason: reason.to_string(),
            correlation_id: correlation_id.to_string(),
            created_at: Utc::now(),
        }
    }

    fn assert_balanced(postings: &[LedgerPosting]) -> Result<(), NooterraError> {
        let delta: i64 = postings.iter().map(|p| p.amount_cents).sum();
        if delta != 0 {
            return Err(NooterraError::LedgerUnbalanced { delta });
        }
        Ok(())
    }

    fn wallet_op(wallet: &AgentWallet) -> Result<WriteOp, NooterraError> {
        if !wallet.is_balanced() {
            return Err(NooterraError::LedgerUnbalanced {
                delta: wallet.available_cents + wallet.escrow_cents
                    - (wallet.total_credited_cents - wallet.total_debited_cents),
            });
        }
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_WALLET.to_string(),
            key: wallet.agent_id.as_str().to_string(),
            value: serde_json::to_value(wallet)?,
            expected_revision: Some(wallet.revision - 1),
        })
    }

    fn posting_op(tenant_id: &TenantId, posting: &LedgerPosting) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_LEDGER_ENTRY.to_string(),
            key: format!("{tenant_id}:{}", posting.entry_id),
            value: serde_json::to_value(posting)?,
            expected_revision: Some(0),
        })
    }

    /// Build the ops for a credit to `agent_id`'s available balance (e.g.
    /// an operator top-up), without committing them - so callers can fold
    /// these into a larger `commit_tx` batch alongside events or
    /// idempotency records for the same write.
    pub async fn build_credit(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        cents: i64,
        reason: &str,
        correlation_id: &str,
    ) -> Result<(AgentWallet, Vec<WriteOp>), NooterraError> {
        let mut wallet = self.require_wallet(tenant_id, agent_id).await?;
        let postings = vec![
            Self::posting(ACCT_PLATFORM_SUSPENSE, -cents, reason, correlation_id),
            Self::posting(account_available(agent_id), cents, reason, correlation_id),
        ];
        Self::assert_balanced(&postings)?;

        wallet.available_cents += cents;
        wallet.total_credited_cents += cents;
        wallet.revision += 1;
        wallet.updated_at = Utc::now();

        let mut ops = vec![Self::wallet_op(&wallet)?];
        for posting in &postings {
            ops.push(Self::posting_op(tenant_id, posting)?);
        }
        info!("credited {} cents to agent {} ({})", cents, agent_id, reason);
        Ok((wallet, ops))
    }

    pub async fn credit(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        cents: i64,
        reason: &str,
        correlation_id: &str,
    ) -> Result<AgentWallet, NooterraError> {
        let (wallet, ops) = self
            .build_credit(tenant_id, agent_id, cents, reason, correlation_id)
            .await?;
        self.store.commit_tx(tenant_id, ops).await?;
        Ok(wallet)
    }

    /// Move `cents` from the payer's available balance into the payer's
    /// escrow account (`lockEscrow(payer, payee, cents)`). The
    /// payee is recorded on the posting reason for audit but does not
    /// receive funds until `release_escrow`.
    pub async fn build_lock_escrow(
        &self,
        tenant_id: &TenantId,
        payer: &AgentId,
        payee: &AgentId,
        cents: i64,
        correlation_id: &str,
    ) -> Result<(AgentWallet, Vec<WriteOp>), NooterraError> {
        let mut wallet = self.require_wallet(tenant_id, payer).await?;
        if wallet.available_cents < cents {
            return Err(NooterraError::WalletInsufficientFunds {
                available: wallet.available_cents,
                requested: cents,
            });
        }

        let reason = format!("escrow_lock:payee={payee}");
        let postings = vec![
            Self::posting(account_available(payer), -cents, &reason, correlation_id),
            Self::posting(account_escrow(payer), cents, &reason, correlation_id),
        ];
        Self::assert_balanced(&postings)?;

        wallet.available_cents -= cents;
        wallet.escrow_cents += cents;
        wallet.revision += 1;
        wallet.updated_at = Utc::now();

        let mut ops = vec![Self::wallet_op(&wallet)?];
        for posting in &postings {
            ops.push(Self::posting_op(tenant_id, posting)?);
        }
        info!("locked {} cents escrow for payer {} (payee {})", cents, payer, payee);
        Ok((wallet, ops))
    }

    /// Release escrowed funds from `payer` to `payee`, split by
    /// `release_rate_pct` (0-100). The released share moves to the payee's
    /// available balance; the remainder is refunded to the payer. Both
    /// sides are posted in the same batch so escrow either fully clears or
    /// the whole release fails.
    pub async fn build_release_escrow(
        &self,
        tenant_id: &TenantId,
        payer: &AgentId,
        payee: &AgentId,
        locked_cents: i64,
        release_rate_pct: u8,
        correlation_id: &str,
    ) -> Result<(AgentWallet, AgentWallet, Vec<WriteOp>), NooterraError> {
        let released = locked_cents * release_rate_pct as i64 / 100;
        let refunded = locked_cents - released;

        let mut payer_wallet = self.require_wallet(tenant_id, payer).await?;
        if payer_wallet.escrow_cents < locked_cents {
            return Err(NooterraError::WalletInsufficientFunds {
                available: payer_wallet.escrow_cents,
                requested: locked_cents,
            });
        }
        let mut payee_wallet = self.require_wallet(tenant_id, payee).await?;

        let reason = format!("escrow_release:rate={release_rate_pct}");
        let mut postings = vec![Self::posting(
            account_escrow(payer),
            -locked_cents,
            &reason,
            correlation_id,
        )];
        if released > 0 {
            postings.push(Self::posting(
                account_available(payee),
                released,
                &reason,
                correlation_id,
            ));
        }
        if refunded > 0 {
            postings.push(Self::posting(
                account_available(payer),
                refunded,
                &reason,
                correlation_id,
            ));
        }
        Self::assert_balanced(&postings)?;

        payer_wallet.escrow_cents -= locked_cents;
        payer_wallet.available_cents += refunded;
        payer_wallet.total_debited_cents += locked_cents - refunded;
        payer_wallet.revision += 1;
        payer_wallet.updated_at = Utc::now();

        payee_wallet.available_cents += released;
        payee_wallet.total_credited_cents += released;
        payee_wallet.revision += 1;
        payee_wallet.updated_at = Utc::now();

        let mut ops = vec![Self::wallet_op(&payer_wallet)?, Self::wallet_op(&payee_wallet)?];
        for posting in &postings {
            ops.push(Self::posting_op(tenant_id, posting)?);
        }
        info!(
            "released escrow for payer {}: {} to payee {}, {} refunded",
            payer, released, payee, refunded
        );
        Ok((payer_wallet, payee_wallet, ops))
    }

    /// Refund the full locked amount back to the payer's available
    /// balance. Equivalent to `build_release_escrow` with
    /// `release_rate_pct == 0`, kept separate because a pure refund never
    /// needs the payee's wallet at all.
    pub async fn build_refund_escrow(
        &self,
        tenant_id: &TenantId,
        payer: &AgentId,
        locked_cents: i64,
        correlation_id: &str,
    ) -> Result<(AgentWallet, Vec<WriteOp>), NooterraError> {
        let mut wallet = self.require_wallet(tenant_id, payer).await?;
        if wallet.escrow_cents < locked_cents {
            return Err(NooterraError::WalletInsufficientFunds {
                available: wallet.escrow_cents,
                requested: locked_cents,
            });
        }

        let reason = "escrow_refund";
        let postings = vec![
            Self::posting(account_escrow(payer), -locked_cents, reason, correlation_id),
            Self::posting(account_available(payer), locked_cents, reason, correlation_id),
        ];
        Self::assert_balanced(&postings)?;

        wallet.escrow_cents -= locked_cents;
        wallet.available_cents += locked_cents;
        wallet.revision += 1;
        wallet.updated_at = Utc::now();

        let mut ops = vec![Self::wallet_op(&wallet)?];
        for posting in &postings {
            ops.push(Self::posting_op(tenant_id, posting)?);
        }
        info!("refunded {} cents of escrow back to payer {}", locked_cents, payer);
        Ok((wallet, ops))
    }

    pub async fn list_postings(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<LedgerPosting>, NooterraError> {
        let rows = self
            .store
            .list_projection(tenant_id, PROJECTION_LEDGER_ENTRY)
            .await?;
        rows.into_iter()
            .map(|ProjectionRow { value, .. }| serde_json::from_value(value).map_err(NooterraError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;

    fn ledger() -> WalletLedger {
        WalletLedger::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn credit_increases_available_balance() {
        let ledger = ledger();
        let tenant = TenantId::new();
        let agent = AgentId::new();
        ledger.open_wallet(&tenant, &agent, "USD").await.unwrap();

        let wallet = ledger
            .credit(&tenant, &agent, 500, "top_up", "corr-1")
            .await
            .unwrap();

        assert_eq!(wallet.available_cents, 500);
        assert_eq!(wallet.total_credited_cents, 500);
        assert!(wallet.is_balanced());
    }

    #[tokio::test]
    async fn lock_escrow_fails_on_insufficient_funds() {
        let ledger = ledger();
        let tenant = TenantId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        ledger.open_wallet(&tenant, &payer, "USD").await.unwrap();
        ledger.open_wallet(&tenant, &payee, "USD").await.unwrap();

        let err = ledger
            .build_lock_escrow(&tenant, &payer, &payee, 100, "corr-1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WALLET_INSUFFICIENT_FUNDS");
    }

    #[tokio::test]
    async fn lock_then_full_release_moves_funds_to_payee() {
        let ledger = ledger();
        let tenant = TenantId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        ledger.open_wallet(&tenant, &payer, "USD").await.unwrap();
        ledger.open_wallet(&tenant, &payee, "USD").await.unwrap();
        ledger.credit(&tenant, &payer, 1000, "top_up", "c0").await.unwrap();

        let (_, ops) = ledger
            .build_lock_escrow(&tenant, &payer, &payee, 650, "c1")
            .await
            .unwrap();
        ledger.store().commit_tx(&tenant, ops).await.unwrap();

        let payer_wallet = ledger.get_wallet(&tenant, &payer).await.unwrap().unwrap();
        assert_eq!(payer_wallet.available_cents, 350);
        assert_eq!(payer_wallet.escrow_cents, 650);

        let (_, _, ops) = ledger
            .build_release_escrow(&tenant, &payer, &payee, 650, 100, "c2")
            .await
            .unwrap();
        ledger.store().commit_tx(&tenant, ops).await.unwrap();

        let payer_wallet = ledger.get_wallet(&tenant, &payer).await.unwrap().unwrap();
        let payee_wallet = ledger.get_wallet(&tenant, &payee).await.unwrap().unwrap();
        assert_eq!(payer_wallet.escrow_cents, 0);
        assert_eq!(payee_wallet.available_cents, 650);
        assert!(payer_wallet.is_balanced());
        assert!(payee_wallet.is_balanced());
    }

    #[tokio::test]
    async fn partial_release_splits_between_payee_and_payer_refund() {
        let ledger = ledger();
        let tenant = TenantId::new();
        let payer = AgentId::new();
        let payee = AgentId::new();
        ledger.open_wallet(&tenant, &payer, "USD").await.unwrap();
        ledger.open_wallet(&tenant, &payee, "USD").await.unwrap();
        ledger.credit(&tenant, &payer, 1000, "top_up", "c0").await.unwrap();

        let (_, ops) = ledger
            .build_lock_escrow(&tenant, &payer, &payee, 1000, "c1")
            .await
            .unwrap();
        ledger.store().commit_tx(&tenant, ops).await.unwrap();

        let (_, _, ops) = ledger
            .build_release_escrow(&tenant, &payer, &payee, 1000, 50, "c2")
            .await
            .unwrap();
        ledger.store().commit_tx(&tenant, ops).await.unwrap();

        let payer_wallet = ledger.get_wallet(&tenant, &payer).await.unwrap().unwrap();
        let payee_wallet = ledger.get_wallet(&tenant, &payee).await.unwrap().unwrap();
        assert_eq!(payee_wallet.available_cents, 500);
        assert_eq!(payer_wallet.available_cents, 500);
        assert_eq!(payer_wallet.escrow_cents, 0);
    }
}
