//! Where quotes come from.

use std::sync::Arc;

use async_trait::async_trait;
use cashbridge_common::{Currency, CurrencyPair, FxRate};
use dashmap::DashMap;
use futures::future::join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::{FxError, FxResult};

/// A source of two-sided quotes.
#[async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn quote(&self, pair: &CurrencyPair) -> FxResult<FxRate>;

    /// Whether `quote` can answer for this pair at all.
    fn quotes(&self, pair: &CurrencyPair) -> bool;
}

const AGGREGATED: &str = "aggregated";

/// Asks every provider that quotes a pair and returns the median.
///
/// Failed or stale answers are skipped; the result is refused when fewer
/// than `min_providers` answered or the answers are too far apart.
pub struct AggregatedRateProvider {
    providers: Vec<Arc<dyn RateProvider>>,
    min_providers: usize,
    max_deviation_bps: u32,
}

impl AggregatedRateProvider {
    pub fn new(providers: Vec<Arc<dyn RateProvider>>) -> Self {
        Self {
            providers,
            min_providers: 1,
            max_deviation_bps: 200,
        }
    }

    pub fn with_min_providers(mut self, min: usize) -> Self {
        self.min_providers = min.max(1);
        self
    }

    pub fn with_max_deviation(mut self, bps: u32) -> Self {
        self.max_deviation_bps = bps;
        self
    }

    fn median(mut quotes: Vec<FxRate>) -> FxRate {
        quotes.sort_by(|a, b| a.mid.cmp(&b.mid));
        let upper = quotes.len() / 2;

        let mut median = quotes[upper].clone();
        if quotes.len() % 2 == 0 {
            let lower = &quotes[upper - 1];
            median.bid = (lower.bid + median.bid) / Decimal::TWO;
            median.ask = (lower.ask + median.ask) / Decimal::TWO;
            median.mid = (lower.mid + median.mid) / Decimal::TWO;
            median.valid_until = median.valid_until.min(lower.valid_until);
        }
        median.source = AGGREGATED.to_string();
        median
    }

    fn deviation_bps(quotes: &[FxRate]) -> FxResult<u32> {
        let lowest = quotes.iter().map(|q| q.mid).min().unwrap_or_default();
        let highest = quotes.iter().map(|q| q.mid).max().unwrap_or_default();

        if lowest <= Decimal::ZERO {
            return Err(FxError::Provider("non-positive quote".to_string()));
        }

        Ok(((highest - lowest) / lowest * Decimal::from(10_000))
            .trunc()
            .to_u32()
            .unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl RateProvider for AggregatedRateProvider {
    fn name(&self) -> &str {
        AGGREGATED
    }

    async fn quote(&self, pair: &CurrencyPair) -> FxResult<FxRate> {
        let asked: Vec<_> = self.providers.iter().filter(|p| p.quotes(pair)).collect();
        let answers = join_all(asked.iter().map(|p| p.quote(pair))).await;

        let mut quotes = Vec::with_capacity(answers.len());
        for (provider, answer) in asked.iter().zip(answers) {
            match answer {
                Ok(quote) if quote.is_valid() => {
                    debug!(provider = provider.name(), pair = %pair, mid = %quote.mid, "Quote received");
                    quotes.push(quote);
                }
                Ok(_) => warn!(provider = provider.name(), pair = %pair, "Stale quote skipped"),
                Err(e) => warn!(provider = provider.name(), pair = %pair, error = %e, "Provider failed"),
            }
        }

        if quotes.is_empty() || quotes.len() < self.min_providers {
            return Err(FxError::NoRate(pair.clone()));
        }

        let deviation_bps = Self::deviation_bps(&quotes)?;
        if deviation_bps > self.max_deviation_bps {
            return Err(FxError::ProvidersDisagree {
                pair: pair.clone(),
                deviation_bps,
            });
        }

        Ok(Self::median(quotes))
    }

    fn quotes(&self, pair: &CurrencyPair) -> bool {
        self.providers.iter().any(|p| p.quotes(pair))
    }
}

/// Fixed table of mid rates, adjustable at runtime to model market moves.
pub struct StaticRateProvider {
    name: String,
    mids: DashMap<CurrencyPair, Decimal>,
    valid_for_seconds: i64,
}

impl StaticRateProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mids: DashMap::new(),
            valid_for_seconds: 60,
        }
    }

    /// One `currency` costs `usd_price` dollars.
    pub fn with_usd_rate(self, currency: Currency, usd_price: Decimal) -> Self {
        self.set_rate(CurrencyPair::to_usd(currency), usd_price);
        self
    }

    pub fn set_rate(&self, pair: CurrencyPair, mid: Decimal) {
        self.mids.insert(pair, mid);
    }

    pub fn remove_rate(&self, pair: &CurrencyPair) {
        self.mids.remove(pair);
    }
}

#[async_trait]
impl RateProvider for StaticRateProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn quote(&self, pair: &CurrencyPair) -> FxResult<FxRate> {
        let mid = self
            .mids
            .get(pair)
            .map(|mid| *mid)
            .ok_or_else(|| FxError::NoRate(pair.clone()))?;
        Ok(FxRate::flat(pair.clone(), mid, self.valid_for_seconds, &self.name))
    }

    fn quotes(&self, pair: &CurrencyPair) -> bool {
        self.mids.contains_key(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_usd() -> CurrencyPair {
        CurrencyPair::to_usd(Currency::btc())
    }

    fn desk(name: &str, btc: Decimal) -> Arc<dyn RateProvider> {
        Arc::new(StaticRateProvider::new(name).with_usd_rate(Currency::btc(), btc))
    }

    #[tokio::test]
    async fn test_static_provider() {
        let provider = StaticRateProvider::new("desk").with_usd_rate(Currency::btc(), dec!(60000));

        let quote = provider.quote(&btc_usd()).await.unwrap();
        assert_eq!(quote.mid, dec!(60000));
        assert_eq!(quote.source, "desk");

        provider.remove_rate(&btc_usd());
        assert!(!provider.quotes(&btc_usd()));
        assert!(matches!(provider.quote(&btc_usd()).await, Err(FxError::NoRate(_))));
    }

    #[tokio::test]
    async fn test_median_of_odd_count() {
        let aggregated = AggregatedRateProvider::new(vec![
            desk("a", dec!(59900)),
            desk("b", dec!(60100)),
            desk("c", dec!(60000)),
        ]);

        let quote = aggregated.quote(&btc_usd()).await.unwrap();
        assert_eq!(quote.mid, dec!(60000));
        assert_eq!(quote.source, AGGREGATED);
    }

    #[tokio::test]
    async fn test_median_of_even_count_averages() {
        let aggregated =
            AggregatedRateProvider::new(vec![desk("a", dec!(60000)), desk("b", dec!(60200))]);

        assert_eq!(aggregated.quote(&btc_usd()).await.unwrap().mid, dec!(60100));
    }

    #[tokio::test]
    async fn test_disagreement_is_refused() {
        let aggregated =
            AggregatedRateProvider::new(vec![desk("a", dec!(50000)), desk("b", dec!(60000))])
                .with_max_deviation(100);

        assert!(matches!(
            aggregated.quote(&btc_usd()).await,
            Err(FxError::ProvidersDisagree { .. })
        ));
    }

    #[tokio::test]
    async fn test_too_few_answers() {
        let silent: Arc<dyn RateProvider> = Arc::new(StaticRateProvider::new("silent"));
        let aggregated =
            AggregatedRateProvider::new(vec![desk("a", dec!(60000)), silent]).with_min_providers(2);

        assert!(matches!(aggregated.quote(&btc_usd()).await, Err(FxError::NoRate(_))));
    }
}
