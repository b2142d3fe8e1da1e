//! Agent and payout address lookup.

use async_trait::async_trait;
use cashbridge_common::{Agent, LedgerAddress, PartyId, Result};
use dashmap::DashMap;

/// Read-mostly view of agents and parties' payout addresses.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn agent(&self, id: &PartyId) -> Result<Option<Agent>>;

    /// Where refunds to `party` are paid.
    async fn payout_address(&self, party: &PartyId) -> Result<Option<LedgerAddress>>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    agents: DashMap<PartyId, Agent>,
    payout_addresses: DashMap<PartyId, LedgerAddress>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, agent: Agent) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn set_active(&self, id: &PartyId, active: bool) {
        if let Some(mut agent) = self.agents.get_mut(id) {
            agent.active = active;
        }
    }

    pub fn set_payout_address(&self, party: PartyId, address: LedgerAddress) {
        self.payout_addresses.insert(party, address);
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn agent(&self, id: &PartyId) -> Result<Option<Agent>> {
        Ok(self.agents.get(id).map(|a| a.value().clone()))
    }

    async fn payout_address(&self, party: &PartyId) -> Result<Option<LedgerAddress>> {
        Ok(self.payout_addresses.get(party).map(|a| a.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup() {
        let directory = InMemoryDirectory::new();
        let id = PartyId::new("agent_1");
        directory.add_agent(Agent::new(id.clone(), LedgerAddress::new("agent-wallet")));

        let agent = directory.agent(&id).await.unwrap().unwrap();
        assert!(agent.active);

        directory.set_active(&id, false);
        assert!(!directory.agent(&id).await.unwrap().unwrap().active);

        assert!(directory
            .payout_address(&PartyId::new("requester"))
            .await
            .unwrap()
            .is_none());
    }
}
