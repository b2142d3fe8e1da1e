//! Simulated cash agents.

use cashbridge_common::{Agent, LedgerAddress, PartyId};
use cashbridge_fees::{AccessibilityClass, Location};

/// An agent with a storefront location.
pub struct SimulatedAgent {
    pub agent: Agent,
    pub name: String,
    pub location: Location,
}

impl SimulatedAgent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, location: Location) -> Self {
        let id = id.into();
        let wallet = LedgerAddress::new(format!("{id}-wallet"));
        Self {
            agent: Agent::new(PartyId::new(id), wallet),
            name: name.into(),
            location,
        }
    }

    pub fn id(&self) -> &PartyId {
        &self.agent.id
    }

    pub fn wallet(&self) -> &LedgerAddress {
        &self.agent.settlement_address
    }
}

/// Builds the simulated agent network.
pub struct AgentFactory;

impl AgentFactory {
    /// Create `count` agents spread from central Nairobi out to remote areas.
    pub fn create_agents(count: usize) -> Vec<SimulatedAgent> {
        let storefronts = [
            ("agent_cbd", "Moi Avenue Kiosk", -1.2864, 36.8172, AccessibilityClass::Urban),
            ("agent_kiambu", "Kiambu Mobile Shop", -1.1714, 36.8356, AccessibilityClass::Suburban),
            ("agent_naivasha", "Naivasha Traders", -0.7172, 36.4310, AccessibilityClass::Rural),
            ("agent_marsabit", "Marsabit Supplies", 2.3284, 37.9899, AccessibilityClass::Remote),
            ("agent_westlands", "Westlands Forex", -1.2676, 36.8108, AccessibilityClass::Urban),
            ("agent_thika", "Thika Road Duka", -1.0333, 37.0693, AccessibilityClass::Suburban),
        ];

        (0..count)
            .map(|i| match storefronts.get(i) {
                Some(&(id, name, lat, lng, class)) => {
                    SimulatedAgent::new(id, name, Location::new(lat, lng, class))
                }
                None => {
                    // Extra agents fan out around the city centre
                    let offset = 0.01 * i as f64;
                    SimulatedAgent::new(
                        format!("agent_{}", i + 1),
                        format!("Agent {}", i + 1),
                        Location::new(-1.2864 + offset, 36.8172 - offset, AccessibilityClass::Urban),
                    )
                }
            })
            .collect()
    }
}
