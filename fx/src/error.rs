//! Rate lookup failures.

use cashbridge_common::{CashBridgeError, CurrencyPair, Money};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FxError {
    /// Nobody quotes this pair, directly or through USD.
    #[error("No rate for {0}")]
    NoRate(CurrencyPair),

    /// The quote's validity window has passed.
    #[error("Quote for {0} is stale")]
    Stale(CurrencyPair),

    #[error("Rate lookup for {0} timed out")]
    Timeout(CurrencyPair),

    /// The provider answered with something unusable.
    #[error("Rate provider failed: {0}")]
    Provider(String),

    /// The converted amount does not fit in a `Decimal`.
    #[error("Amount {0} is out of range for conversion")]
    Overflow(Money),

    #[error("Spread on {pair} is {spread_bps} bps, limit {max_bps} bps")]
    SpreadTooWide {
        pair: CurrencyPair,
        spread_bps: u32,
        max_bps: u32,
    },

    /// Aggregated providers quote too far apart to trust any of them.
    #[error("Providers disagree on {pair} by {deviation_bps} bps")]
    ProvidersDisagree {
        pair: CurrencyPair,
        deviation_bps: u32,
    },
}

pub type FxResult<T> = Result<T, FxError>;

impl From<FxError> for CashBridgeError {
    fn from(err: FxError) -> Self {
        CashBridgeError::RateUnavailable(err.to_string())
    }
}
