//! Short-lived cache of USD quotes.

use cashbridge_common::{CurrencyPair, FxRate};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    /// How long after fetching a quote may be served, capped by its own
    /// validity window.
    pub ttl: Duration,
    /// Stale entries are purged on insert once the cache holds this many.
    pub max_entries: usize,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(30),
            max_entries: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct Cached {
    rate: FxRate,
    fetched_at: DateTime<Utc>,
}

impl Cached {
    fn servable(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now < self.rate.valid_until && now - self.fetched_at < ttl
    }
}

pub struct RateCache {
    quotes: DashMap<CurrencyPair, Cached>,
    config: RateCacheConfig,
}

impl RateCache {
    pub fn new() -> Self {
        Self::with_config(RateCacheConfig::default())
    }

    pub fn with_config(config: RateCacheConfig) -> Self {
        Self {
            quotes: DashMap::new(),
            config,
        }
    }

    /// A servable quote for `pair`. A stale one is dropped on the way out.
    pub fn get(&self, pair: &CurrencyPair) -> Option<FxRate> {
        let now = Utc::now();
        let ttl = self.config.ttl;

        if let Some(cached) = self.quotes.get(pair) {
            if cached.servable(ttl, now) {
                return Some(cached.rate.clone());
            }
        }

        if self
            .quotes
            .remove_if(pair, |_, cached| !cached.servable(ttl, now))
            .is_some()
        {
            debug!(pair = %pair, "Dropped stale quote");
        }
        None
    }

    pub fn insert(&self, rate: FxRate) {
        if self.quotes.len() >= self.config.max_entries {
            self.evict_expired();
        }

        let fetched_at = Utc::now();
        self.quotes
            .insert(rate.pair.clone(), Cached { rate, fetched_at });
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn evict_expired(&self) {
        let now = Utc::now();
        let ttl = self.config.ttl;
        self.quotes.retain(|_, cached| cached.servable(ttl, now));
    }
}

impl Default for RateCache {
    fn default() -> Self {
        Self::new()
    }
}
