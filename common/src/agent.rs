//! Liquidity agents as seen by the money-movement engine.

use serde::{Deserialize, Serialize};

use crate::{LedgerAddress, PartyId};

/// Pricing tier an agent operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeTier {
    Standard,
    Premium,
    Community,
}

/// Summary of an agent's history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub completed_exchanges: u64,
    pub disputed_exchanges: u64,
    /// Average rating out of 5.
    pub rating: Option<f32>,
}

impl TrackRecord {
    /// Share of finished exchanges that ended in dispute.
    pub fn dispute_rate(&self) -> f64 {
        let total = self.completed_exchanges + self.disputed_exchanges;
        if total == 0 {
            return 0.0;
        }
        self.disputed_exchanges as f64 / total as f64
    }
}

/// A human liquidity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: PartyId,
    /// Where released escrow funds are paid.
    pub settlement_address: LedgerAddress,
    pub fee_tier: FeeTier,
    pub active: bool,
    pub track_record: TrackRecord,
}

impl Agent {
    pub fn new(id: PartyId, settlement_address: LedgerAddress) -> Self {
        Self {
            id,
            settlement_address,
            fee_tier: FeeTier::Standard,
            active: true,
            track_record: TrackRecord::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispute_rate() {
        let record = TrackRecord {
            completed_exchanges: 9,
            disputed_exchanges: 1,
            rating: Some(4.5),
        };
        assert!((record.dispute_rate() - 0.1).abs() < f64::EPSILON);
        assert_eq!(TrackRecord::default().dispute_rate(), 0.0);
    }
}
