//! USD threshold rule table.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Settlement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMethod {
    /// Sub-second, low-fee channel for small amounts.
    Instant,
    /// On-chain settlement.
    Direct,
}

impl RoutingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMethod::Instant => "instant",
            RoutingMethod::Direct => "direct",
        }
    }
}

impl fmt::Display for RoutingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected time to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatedTime {
    SubSecond,
    TenMinutes,
    HalfHourToHour,
}

impl fmt::Display for EstimatedTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EstimatedTime::SubSecond => "<1 second",
            EstimatedTime::TenMinutes => "10 minutes",
            EstimatedTime::HalfHourToHour => "30-60 minutes",
        })
    }
}

/// One row of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRule {
    /// Exclusive USD upper bound; `None` matches everything.
    pub below_usd: Option<Decimal>,
    pub method: RoutingMethod,
    pub reason: &'static str,
}

/// Ordered rules; the first whose bound exceeds the USD value wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<RoutingRule>,
}

impl RuleTable {
    pub fn new(dust_threshold_usd: Decimal, instant_limit_usd: Decimal) -> Self {
        Self {
            rules: vec![
                RoutingRule {
                    below_usd: Some(dust_threshold_usd),
                    method: RoutingMethod::Direct,
                    reason: "too small for instant channel (dust)",
                },
                RoutingRule {
                    below_usd: Some(instant_limit_usd),
                    method: RoutingMethod::Instant,
                    reason: "small transfer, instant channel is cheapest",
                },
                RoutingRule {
                    below_usd: None,
                    method: RoutingMethod::Direct,
                    reason: "large transfer, direct settlement",
                },
            ],
        }
    }

    pub fn select(&self, usd_value: Decimal) -> &RoutingRule {
        self.rules
            .iter()
            .find(|rule| rule.below_usd.map_or(true, |bound| usd_value < bound))
            .unwrap_or(&Self::CATCH_ALL)
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    const CATCH_ALL: RoutingRule = RoutingRule {
        below_usd: None,
        method: RoutingMethod::Direct,
        reason: "large transfer, direct settlement",
    };
}
