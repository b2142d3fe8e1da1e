//! FX engine: cached rate lookup and USD valuation.

use std::sync::Arc;
use std::time::Duration;

use cashbridge_common::{Currency, CurrencyPair, FxRate, Money};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::cache::{RateCache, RateCacheConfig};
use crate::error::{FxError, FxResult};
use crate::provider::RateProvider;

#[derive(Debug, Clone)]
pub struct FxEngineConfig {
    pub cache: RateCacheConfig,
    /// Quotes wider than this are refused.
    pub max_spread_bps: u32,
    pub use_cache: bool,
    /// Upper bound on a single provider call.
    pub provider_timeout: Duration,
}

impl Default for FxEngineConfig {
    fn default() -> Self {
        Self {
            cache: RateCacheConfig::default(),
            max_spread_bps: 200,
            use_cache: true,
            provider_timeout: Duration::from_secs(2),
        }
    }
}

/// Rate lookup with caching, spread validation and USD cross rates.
pub struct FxEngine {
    provider: Arc<dyn RateProvider>,
    cache: RateCache,
    config: FxEngineConfig,
}

impl FxEngine {
    pub fn new(provider: Arc<dyn RateProvider>, config: FxEngineConfig) -> Self {
        Self {
            provider,
            cache: RateCache::with_config(config.cache.clone()),
            config,
        }
    }

    /// Quote for `pair`, served from cache while fresh.
    #[instrument(skip_all, fields(pair = %pair))]
    pub async fn get_rate(&self, pair: &CurrencyPair) -> FxResult<FxRate> {
        if self.config.use_cache {
            if let Some(cached) = self.cache.get(pair) {
                debug!("Using cached rate");
                return Ok(cached);
            }
        }

        let rate = tokio::time::timeout(self.config.provider_timeout, self.provider.quote(pair))
            .await
            .map_err(|_| FxError::Timeout(pair.clone()))??;

        if !rate.is_valid() {
            return Err(FxError::Stale(pair.clone()));
        }
        self.validate_spread(&rate)?;

        if self.config.use_cache {
            self.cache.insert(rate.clone());
        }

        Ok(rate)
    }

    /// Price of one unit of `currency` in USD.
    ///
    /// Uses the `currency/USD` pair when the provider quotes it, otherwise
    /// inverts `USD/currency`.
    pub async fn usd_price(&self, currency: &Currency) -> FxResult<Decimal> {
        if *currency == Currency::usd() {
            return Ok(Decimal::ONE);
        }

        let direct = CurrencyPair::to_usd(currency.clone());
        if self.provider.quotes(&direct) {
            return Ok(self.get_rate(&direct).await?.mid);
        }

        let inverse = direct.inverse();
        if self.provider.quotes(&inverse) {
            let rate = self.get_rate(&inverse).await?;
            if rate.mid.is_zero() {
                return Err(FxError::Provider(format!("Zero rate for {inverse}")));
            }
            return Decimal::ONE
                .checked_div(rate.mid)
                .ok_or_else(|| FxError::Provider(format!("Rate for {inverse} out of range")));
        }

        Err(FxError::NoRate(direct))
    }

    /// Value of `amount` in USD, unrounded.
    pub async fn usd_value(&self, amount: &Money) -> FxResult<Money> {
        let price = self.usd_price(&amount.currency).await?;
        let value = amount
            .value
            .checked_mul(price)
            .ok_or_else(|| FxError::Overflow(amount.clone()))?;
        Ok(Money::new(value, Currency::usd()))
    }

    /// Convert `amount` into `to` through USD, rounded to the target minor unit.
    #[instrument(skip_all, fields(from = %amount.currency, to = %to))]
    pub async fn convert(&self, amount: &Money, to: Currency) -> FxResult<Money> {
        if amount.currency == to {
            return Ok(amount.clone());
        }

        let from_price = self.usd_price(&amount.currency).await?;
        let to_price = self.usd_price(&to).await?;
        if to_price.is_zero() {
            return Err(FxError::NoRate(CurrencyPair::to_usd(to)));
        }

        let value = amount
            .value
            .checked_mul(from_price)
            .and_then(|usd| usd.checked_div(to_price))
            .ok_or_else(|| FxError::Overflow(amount.clone()))?
            .round_dp(to.decimal_places());
        Ok(Money::new(value, to))
    }

    fn validate_spread(&self, rate: &FxRate) -> FxResult<()> {
        let spread_bps = rate.spread_bps().trunc().to_u32().unwrap_or(u32::MAX);

        if spread_bps > self.config.max_spread_bps {
            return Err(FxError::SpreadTooWide {
                pair: rate.pair.clone(),
                spread_bps,
                max_bps: self.config.max_spread_bps,
            });
        }

        Ok(())
    }
}
