//! Itemised fee quotes.

use cashbridge_common::{Currency, Money};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::time_bucket::TimeBucket;

/// One line of a fee quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeComponent {
    pub description: String,
    /// Fraction of the gross amount (may be negative for discounts).
    pub percentage: Decimal,
    /// Amount in the request currency, rounded to its minor unit.
    pub amount: Decimal,
}

/// Full fee quote for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Components in computation order.
    pub components: Vec<FeeComponent>,
    pub total_fee_percentage: Decimal,
    pub total_fee_amount: Decimal,
    pub agent_share: Decimal,
    pub platform_share: Decimal,
    /// Gross amount the fee was computed on.
    pub gross_amount: Decimal,
    pub currency: Currency,
    pub distance_km: f64,
    pub time_bucket: TimeBucket,
}

impl FeeBreakdown {
    /// Sum of component percentages; equals the total after clamping.
    pub fn component_percentage_sum(&self) -> Decimal {
        self.components.iter().map(|c| c.percentage).sum()
    }

    /// Total fee as `Money`.
    pub fn total_fee(&self) -> Money {
        Money::new(self.total_fee_amount, self.currency.clone())
    }

    /// What the requester receives after fees, in local currency.
    pub fn net_local_amount(&self) -> Money {
        Money::new(self.gross_amount - self.total_fee_amount, self.currency.clone())
    }

    /// Find a component by description prefix.
    pub fn component(&self, prefix: &str) -> Option<&FeeComponent> {
        self.components
            .iter()
            .find(|c| c.description.starts_with(prefix))
    }
}
