//! Routing configuration.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Below this USD value a transfer is dust and settles directly.
    pub dust_threshold_usd: Decimal,
    /// Instant channel handles transfers below this USD value.
    pub instant_limit_usd: Decimal,
    /// Variable part of the instant channel fee.
    pub instant_fee_rate: Decimal,
    /// Direct fee as a fraction of the amount when no network estimate can be priced.
    pub fallback_direct_fee_rate: Decimal,
    /// Deadline for the USD rate lookup.
    pub rate_timeout: Duration,
    /// Deadline for each ledger or instant channel call.
    pub channel_timeout: Duration,
    /// Confirmations after which a direct transfer counts as completed.
    pub confirmation_target: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dust_threshold_usd: dec!(0.01),
            instant_limit_usd: dec!(50),
            instant_fee_rate: dec!(0.0001),
            fallback_direct_fee_rate: dec!(0.002),
            rate_timeout: Duration::from_secs(1),
            channel_timeout: Duration::from_secs(10),
            confirmation_target: 1,
        }
    }
}

impl RoutingConfig {
    /// Load configuration from `CASHBRIDGE_ROUTING_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<Decimal>("CASHBRIDGE_ROUTING_DUST_USD") {
            config.dust_threshold_usd = v;
        }

        if let Some(v) = env_parse::<Decimal>("CASHBRIDGE_ROUTING_INSTANT_LIMIT_USD") {
            config.instant_limit_usd = v;
        }

        if let Some(v) = env_parse::<Decimal>("CASHBRIDGE_ROUTING_FALLBACK_FEE_RATE") {
            config.fallback_direct_fee_rate = v;
        }

        if let Some(ms) = env_parse::<u64>("CASHBRIDGE_ROUTING_RATE_TIMEOUT_MS") {
            config.rate_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("CASHBRIDGE_ROUTING_CHANNEL_TIMEOUT_MS") {
            config.channel_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = env_parse::<u32>("CASHBRIDGE_ROUTING_CONFIRMATIONS") {
            config.confirmation_target = n;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.dust_threshold_usd < Decimal::ZERO {
            return Err("Dust threshold cannot be negative".to_string());
        }

        if self.dust_threshold_usd >= self.instant_limit_usd {
            return Err("Dust threshold must be below the instant limit".to_string());
        }

        if self.instant_fee_rate < Decimal::ZERO || self.fallback_direct_fee_rate < Decimal::ZERO {
            return Err("Fee rates cannot be negative".to_string());
        }

        if self.rate_timeout.is_zero() || self.channel_timeout.is_zero() {
            return Err("Timeouts cannot be 0".to_string());
        }

        if self.confirmation_target == 0 {
            return Err("Confirmation target cannot be 0".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
