//! Simulation scenarios.

use cashbridge_fees::{AccessibilityClass, Location, Urgency};
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub description: String,
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario. Escrows are referred to by label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Price a conversion and open an escrow with agent number `agent`.
    OpenEscrow {
        label: String,
        requester: String,
        agent: usize,
        amount: String,
        currency: String,
        urgency: Urgency,
        location: Location,
    },
    /// Deposit the full amount and poll for funding.
    Fund { label: String },
    /// Present the code as the assigned agent.
    Verify { label: String },
    /// Present the code from several tasks at once.
    VerifyConcurrently { label: String, attempts: usize },
    AdvanceClock { hours: i64 },
    Sweep,
    InjectFault { target: FaultTarget, kind: FaultKind },
    ClearFaults,
    /// Send a peer-to-peer transfer from the simulator wallet.
    Transfer { sats: u64, with_invoice: bool },
    Assert { condition: AssertCondition },
}

/// Which collaborator to break.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FaultTarget {
    LedgerSend,
    LedgerBalance,
    LedgerAddress,
    InstantChannel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum FaultKind {
    Fail,
    Hang,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    EscrowStatus { label: String, status: String },
    AgentPaid { label: String },
    RequesterRefunded { label: String },
    LastTransferMethod { method: String },
}

impl Scenario {
    pub const NAMES: [&'static str; 5] = [
        "happy-path",
        "expiry-refund",
        "dispute",
        "concurrent-release",
        "routing",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "happy-path" => Ok(Self::happy_path()),
            "expiry-refund" => Ok(Self::expiry_refund()),
            "dispute" => Ok(Self::dispute()),
            "concurrent-release" => Ok(Self::concurrent_release()),
            "routing" => Ok(Self::routing()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {}, or all)",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Every named scenario, in order.
    pub fn all() -> Vec<Self> {
        vec![
            Self::happy_path(),
            Self::expiry_refund(),
            Self::dispute(),
            Self::concurrent_release(),
            Self::routing(),
        ]
    }

    fn happy_path() -> Self {
        Self {
            name: "happy-path".to_string(),
            description: "Price, open, fund and release one exchange".to_string(),
            steps: vec![
                open("lunch-money", "requester_1", 0, "10000"),
                ScenarioStep::Fund {
                    label: "lunch-money".to_string(),
                },
                ScenarioStep::Verify {
                    label: "lunch-money".to_string(),
                },
                status("lunch-money", "completed"),
                ScenarioStep::Assert {
                    condition: AssertCondition::AgentPaid {
                        label: "lunch-money".to_string(),
                    },
                },
            ],
        }
    }

    fn expiry_refund() -> Self {
        Self {
            name: "expiry-refund".to_string(),
            description: "Unfunded escrow expires, funded escrow is refunded".to_string(),
            steps: vec![
                open("never-funded", "requester_1", 1, "5000"),
                open("agent-no-show", "requester_2", 2, "20000"),
                ScenarioStep::Fund {
                    label: "agent-no-show".to_string(),
                },
                ScenarioStep::AdvanceClock { hours: 25 },
                ScenarioStep::Sweep,
                status("never-funded", "expired"),
                status("agent-no-show", "refunded"),
                ScenarioStep::Assert {
                    condition: AssertCondition::RequesterRefunded {
                        label: "agent-no-show".to_string(),
                    },
                },
                // A second sweep must leave both records alone
                ScenarioStep::Sweep,
                status("agent-no-show", "refunded"),
            ],
        }
    }

    fn dispute() -> Self {
        Self {
            name: "dispute".to_string(),
            description: "Ledger failure during release escalates to manual review".to_string(),
            steps: vec![
                open("flaky-node", "requester_3", 0, "15000"),
                ScenarioStep::Fund {
                    label: "flaky-node".to_string(),
                },
                ScenarioStep::InjectFault {
                    target: FaultTarget::LedgerSend,
                    kind: FaultKind::Hang,
                },
                ScenarioStep::Verify {
                    label: "flaky-node".to_string(),
                },
                ScenarioStep::ClearFaults,
                status("flaky-node", "disputed"),
            ],
        }
    }

    fn concurrent_release() -> Self {
        Self {
            name: "concurrent-release".to_string(),
            description: "Several tasks race to release one escrow".to_string(),
            steps: vec![
                open("race", "requester_4", 3, "8000"),
                ScenarioStep::Fund {
                    label: "race".to_string(),
                },
                ScenarioStep::VerifyConcurrently {
                    label: "race".to_string(),
                    attempts: 5,
                },
                status("race", "completed"),
                ScenarioStep::Assert {
                    condition: AssertCondition::AgentPaid {
                        label: "race".to_string(),
                    },
                },
            ],
        }
    }

    fn routing() -> Self {
        Self {
            name: "routing".to_string(),
            description: "Dust, small and large transfers take different channels".to_string(),
            steps: vec![
                ScenarioStep::Transfer {
                    sats: 10,
                    with_invoice: true,
                },
                transfer_method("direct"),
                ScenarioStep::Transfer {
                    sats: 10_000,
                    with_invoice: true,
                },
                transfer_method("instant"),
                ScenarioStep::Transfer {
                    sats: 10_000,
                    with_invoice: false,
                },
                transfer_method("direct"),
                ScenarioStep::Transfer {
                    sats: 500_000,
                    with_invoice: true,
                },
                transfer_method("direct"),
            ],
        }
    }
}

fn open(label: &str, requester: &str, agent: usize, amount: &str) -> ScenarioStep {
    ScenarioStep::OpenEscrow {
        label: label.to_string(),
        requester: requester.to_string(),
        agent,
        amount: amount.to_string(),
        currency: "KES".to_string(),
        urgency: Urgency::Standard,
        location: Location::new(-1.2921, 36.8219, AccessibilityClass::Urban),
    }
}

fn status(label: &str, status: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::EscrowStatus {
            label: label.to_string(),
            status: status.to_string(),
        },
    }
}

fn transfer_method(method: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LastTransferMethod {
            method: method.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_known_scenarios() {
        for name in Scenario::NAMES {
            assert_eq!(Scenario::load(name).unwrap().name, name);
        }
        assert!(Scenario::load("bank-run").is_err());
    }

    #[test]
    fn test_scenarios_serialize() {
        let json = serde_json::to_string(&Scenario::all()).unwrap();
        let back: Vec<Scenario> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), Scenario::NAMES.len());
    }
}
