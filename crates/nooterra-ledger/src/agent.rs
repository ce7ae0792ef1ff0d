//! Agent identity registration and status management.
//!
//! Registration is idempotent on `public_key_pem` (spec §6 -
//! `POST /agents/register` - "idempotent on `publicKeyPem`"): registering
//! twice with the same key returns the same identity rather than erroring
//! or creating a duplicate. Status only ever moves forward along
//! `active -> suspended -> revoked` (`AgentStatus::can_transition_to`).

use chrono::Utc;
use nooterra_store::{ProjectionRow, Store, WriteOp};
use nooterra_types::ids::{AgentId, KeyId, TenantId};
use nooterra_types::types::{AgentIdentity, AgentStatus};
use nooterra_types::NooterraError;
use std::sync::Arc;
use tracing::info;

const PROJECTION_AGENT: &str = "agent";

pub struct AgentRegistry {
    store: Arc<dyn Store>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get_agent(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
    ) -> Result<Option<AgentIdentity>, NooterraError> {
        let row = self
            .store
            .get_projection(tenant_id, PROJECTION_AGENT, agent_id.as_str())
            .await?;
        row.map(|v| serde_json::from_value(v).map_err(NooterraError::from))
            .transpose()
    }

    pub async fn list_agents(&self, tenant_id: &TenantId) -> Result<Vec<AgentIdentity>, NooterraError> {
        let rows = self.store.list_projection(tenant_id, PROJECTION_AGENT).await?;
        rows.into_iter()
            .map(|ProjectionRow { value, .. }| serde_json::from_value(value).map_err(NooterraError::from))
            .collect()
    }

    async fn find_by_public_key(
        &self,
        tenant_id: &TenantId,
        public_key_pem: &str,
    ) -> Result<Option<AgentIdentity>, NooterraError> {
        let agents = self.list_agents(tenant_id).await?;
        Ok(agents.into_iter().find(|a| a.public_key_pem == public_key_pem))
    }

    async fn require_agent(&self, tenant_id: &TenantId, agent_id: &AgentId) -> Result<AgentIdentity, NooterraError> {
        self.get_agent(tenant_id, agent_id)
            .await?
            .ok_or_else(|| NooterraError::NotFound {
                resource: "agent".to_string(),
                id: agent_id.to_string(),
            })
    }

    fn agent_op(agent: &AgentIdentity) -> Result<WriteOp, NooterraError> {
        Ok(WriteOp::UpsertProjection {
            kind: PROJECTION_AGENT.to_string(),
            key: agent.agent_id.as_str().to_string(),
            value: serde_json::to_value(agent)?,
            expected_revision: Some(agent.revision.saturating_sub(1)),
        })
    }

    /// Register a new agent identity, or return the existing one if
    /// `public_key_pem` was already registered for this tenant.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        tenant_id: &TenantId,
        display_name: &str,
        owner_type: &str,
        owner_id: &str,
        key_id: KeyId,
        public_key_pem: &str,
        capabilities: Vec<String>,
    ) -> Result<AgentIdentity, NooterraError> {
        if let Some(existing) = self.find_by_public_key(tenant_id, public_key_pem).await? {
            info!("agent registration replayed for existing key, returning agent {}", existing.agent_id);
            return Ok(existing);
        }

        let now = Utc::now();
        let agent = AgentIdentity {
            agent_id: AgentId::new(),
            tenant_id: tenant_id.clone(),
            display_name: display_name.to_string(),
            owner_type: owner_type.to_string(),
            owner_id: owner_id.to_string(),
            key_id,
            public_key_pem: public_key_pem.to_string(),
            capabilities,
            status: AgentStatus::Active,
            revision: 1,
            created_at: now,
            updated_at: now,
        };

        self.store.commit_tx(tenant_id, vec![Self::agent_op(&agent)?]).await?;
        info!("agent {} registered for tenant {}", agent.agent_id, tenant_id);
        Ok(agent)
    }

    async fn transition(
        &self,
        tenant_id: &TenantId,
        agent_id: &AgentId,
        next: AgentStatus,
    ) -> Result<AgentIdentity, NooterraError> {
        let mut agent = self.require_agent(tenant_id, agent_id).await?;
        if !agent.status.can_transition_to(next) {
            return Err(NooterraError::AgentInvalidTransition {
                agent_id: agent_id.to_string(),
                current: format!("{:?}", agent.status),
            });
        }
        agent.status = next;
        agent.revision += 1;
        agent.updated_at = Utc::now();
        self.store.commit_tx(tenant_id, vec![Self::agent_op(&agent)?]).await?;
        info!("agent {} transitioned to {:?}", agent_id, agent.status);
        Ok(agent)
    }

    pub async fn suspend(&self, tenant_id: &TenantId, agent_id: &AgentId) -> Result<AgentIdentity, NooterraError> {
        self.transition(tenant_id, agent_id, AgentStatus::Suspended).await
    }

    pub async fn revoke(&self, tenant_id: &TenantId, agent_id: &AgentId) -> Result<AgentIdentity, NooterraError> {
        self.transition(tenant_id, agent_id, AgentStatus::Revoked).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nooterra_store::InMemoryStore;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn register_is_idempotent_on_public_key() {
        let registry = registry();
        let tenant = TenantId::new();

        let first = registry
            .register(&tenant, "summarizer", "user", "u_1", KeyId::new(), "pem-abc", vec!["summarize".to_string()])
            .await
            .unwrap();

        let second = registry
            .register(&tenant, "summarizer-renamed", "user", "u_1", KeyId::new(), "pem-abc", vec![])
            .await
            .unwrap();

        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(second.display_name, "summarizer");

        let all = registry.list_agents(&tenant).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn status_moves_forward_only() {
        let registry = registry();
        let tenant = TenantId::new();
        let agent = registry
            .register(&tenant, "worker", "org", "org_1", KeyId::new(), "pem-xyz", vec![])
            .await
            .unwrap();

        let suspended = registry.suspend(&tenant, &agent.agent_id).await.unwrap();
        assert_eq!(suspended.status, AgentStatus::Suspended);

        let revoked = registry.revoke(&tenant, &agent.agent_id).await.unwrap();
        assert_eq!(revoked.status, AgentStatus::Revoked);

        let err = registry.suspend(&tenant, &agent.agent_id).await.unwrap_err();
        assert_eq!(err.code(), "AGENT_INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn active_cannot_jump_straight_to_revoked_is_allowed_by_design() {
        // active -> revoked is a valid direct transition (can_transition_to
        // permits both active->suspended and active->revoked); only the
        // reverse direction is blocked.
        let registry = registry();
        let tenant = TenantId::new();
        let agent = registry
            .register(&tenant, "worker", "org", "org_1", KeyId::new(), "pem-direct", vec![])
            .await
            .unwrap();
        let revoked = registry.revoke(&tenant, &agent.agent_id).await.unwrap();
        assert_eq!(revoked.status, AgentStatus::Revoked);
    }
}
