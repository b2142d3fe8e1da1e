//! CashBridge Routing
//!
//! Picks a settlement channel for a peer-to-peer transfer: the instant channel
//! for small amounts, direct on-chain settlement for dust and large amounts.

pub mod config;
pub mod decider;
pub mod rules;
pub mod transfer;

pub use config::RoutingConfig;
pub use decider::{RoutingDecider, RoutingDecision, TransferUrgency};
pub use rules::{EstimatedTime, RoutingMethod, RoutingRule, RuleTable};
pub use transfer::{TransferRecord, TransferRequest, TransferStatus};
