//! Time utilities and constants for CashBridge.

use chrono::{DateTime, Duration, Utc};

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// How long an escrow stays open (24 hours).
    pub fn escrow_ttl() -> Duration {
        Duration::hours(24)
    }

    /// Deadline for a single ledger call (10 seconds).
    pub fn ledger_call_timeout() -> Duration {
        Duration::seconds(10)
    }

    /// Deadline for an exchange-rate lookup (2 seconds).
    pub fn rate_lookup_timeout() -> Duration {
        Duration::seconds(2)
    }

    /// Deadline for delivering a notification (2 seconds).
    pub fn notification_timeout() -> Duration {
        Duration::seconds(2)
    }

    /// Age after which a settling claim is treated as abandoned (15 minutes).
    pub fn stale_claim_after() -> Duration {
        Duration::minutes(15)
    }

    /// Expiry sweep interval (1 minute).
    pub fn sweep_interval() -> Duration {
        Duration::minutes(1)
    }
}

/// A timestamp with timezone (always UTC for stored records).
pub type Timestamp = DateTime<Utc>;

/// Source of the current time.
///
/// Components that compare against expiry times take a clock so tests can pin
/// or advance time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}
