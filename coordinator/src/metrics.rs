//! Escrow counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinator metrics.
#[derive(Default)]
pub struct Metrics {
    pub escrows_created: AtomicU64,
    pub escrows_funded: AtomicU64,
    pub escrows_completed: AtomicU64,
    pub escrows_expired: AtomicU64,
    pub escrows_refunded: AtomicU64,
    pub escrows_disputed: AtomicU64,
    /// Lost compare-and-swap races.
    pub cas_conflicts: AtomicU64,
    pub ledger_timeouts: AtomicU64,
    pub notification_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn escrow_created(&self) {
        self.escrows_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escrow_funded(&self) {
        self.escrows_funded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escrow_completed(&self) {
        self.escrows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escrow_expired(&self) {
        self.escrows_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escrow_refunded(&self) {
        self.escrows_refunded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escrow_disputed(&self) {
        self.escrows_disputed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cas_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ledger_timeout(&self) {
        self.ledger_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_failed(&self) {
        self.notification_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            escrows_created: self.escrows_created.load(Ordering::Relaxed),
            escrows_funded: self.escrows_funded.load(Ordering::Relaxed),
            escrows_completed: self.escrows_completed.load(Ordering::Relaxed),
            escrows_expired: self.escrows_expired.load(Ordering::Relaxed),
            escrows_refunded: self.escrows_refunded.load(Ordering::Relaxed),
            escrows_disputed: self.escrows_disputed.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
            ledger_timeouts: self.ledger_timeouts.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("escrows_created", "Escrows opened", s.escrows_created),
            ("escrows_funded", "Escrows observed funded", s.escrows_funded),
            ("escrows_completed", "Escrows released to agents", s.escrows_completed),
            ("escrows_expired", "Pending escrows expired", s.escrows_expired),
            ("escrows_refunded", "Funded escrows refunded", s.escrows_refunded),
            ("escrows_disputed", "Escrows sent to manual review", s.escrows_disputed),
            ("cas_conflicts", "Lost compare-and-swap writes", s.cas_conflicts),
            ("ledger_timeouts", "Ledger calls that timed out", s.ledger_timeouts),
            ("notification_failures", "Undelivered notifications", s.notification_failures),
        ];

        counters
            .iter()
            .map(|(name, help, value)| {
                format!(
                    "# HELP cashbridge_{name} {help}\n# TYPE cashbridge_{name} counter\ncashbridge_{name} {value}\n"
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub escrows_created: u64,
    pub escrows_funded: u64,
    pub escrows_completed: u64,
    pub escrows_expired: u64,
    pub escrows_refunded: u64,
    pub escrows_disputed: u64,
    pub cas_conflicts: u64,
    pub ledger_timeouts: u64,
    pub notification_failures: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.escrow_created();
        metrics.escrow_created();
        metrics.escrow_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.escrows_created, 2);
        assert_eq!(snapshot.escrows_completed, 1);
        assert_eq!(snapshot.escrows_disputed, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.escrow_created();

        let output = metrics.to_prometheus();
        assert!(output.contains("cashbridge_escrows_created 1"));
        assert!(output.contains("# TYPE cashbridge_cas_conflicts counter"));
    }
}
