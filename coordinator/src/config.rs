//! Coordinator configuration.

use std::time::Duration;

use cashbridge_common::constants;
use cashbridge_common::DurationExt;

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Lifetime of a new escrow.
    pub escrow_ttl: chrono::Duration,
    /// Deadline for every ledger call.
    pub ledger_timeout: Duration,
    /// Deadline for a single notification.
    pub notification_timeout: Duration,
    /// How many codes to try before giving up on a collision streak.
    pub code_attempts: u32,
    /// Age after which a settling claim is considered abandoned.
    pub stale_claim_after: chrono::Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Postgres URL for the record store; in-memory when unset.
    pub database_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            escrow_ttl: constants::escrow_ttl(),
            ledger_timeout: constants::ledger_call_timeout().as_std(),
            notification_timeout: constants::notification_timeout().as_std(),
            code_attempts: 5,
            stale_claim_after: constants::stale_claim_after(),
            sweep_interval: constants::sweep_interval().as_std(),
            database_url: None,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from `CASHBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<i64>("CASHBRIDGE_ESCROW_TTL_SECS") {
            config.escrow_ttl = chrono::Duration::seconds(secs);
        }

        if let Some(ms) = env_parse::<u64>("CASHBRIDGE_LEDGER_TIMEOUT_MS") {
            config.ledger_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("CASHBRIDGE_NOTIFICATION_TIMEOUT_MS") {
            config.notification_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = env_parse::<u32>("CASHBRIDGE_CODE_ATTEMPTS") {
            config.code_attempts = attempts;
        }

        if let Some(secs) = env_parse::<i64>("CASHBRIDGE_STALE_CLAIM_SECS") {
            config.stale_claim_after = chrono::Duration::seconds(secs);
        }

        if let Some(secs) = env_parse::<u64>("CASHBRIDGE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.escrow_ttl <= chrono::Duration::zero() {
            return Err("Escrow TTL must be positive".to_string());
        }

        if self.ledger_timeout.is_zero() {
            return Err("Ledger timeout cannot be 0".to_string());
        }

        if self.code_attempts == 0 {
            return Err("Code attempts cannot be 0".to_string());
        }

        if self.stale_claim_after.to_std().unwrap_or_default() <= self.ledger_timeout {
            return Err("Stale claim window must exceed the ledger timeout".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("Sweep interval cannot be 0".to_string());
        }

        if matches!(&self.database_url, Some(url) if url.is_empty()) {
            return Err("Database URL cannot be empty".to_string());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
