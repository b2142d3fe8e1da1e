//! Simulation metrics.

use std::collections::VecDeque;

use cashbridge_coordinator::SweepReport;
use cashbridge_routing::{RoutingMethod, TransferRecord, TransferStatus};

#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    pub escrows_opened: u64,
    pub escrows_completed: u64,
    pub escrows_refunded: u64,
    pub escrows_expired: u64,
    pub escrows_disputed: u64,
    /// Expired escrows still holding a short deposit.
    pub stranded_deposits: u64,
    /// Release attempts rejected because another worker got there first.
    pub conflicts: u64,
    pub failures: u64,
    pub instant_transfers: u64,
    pub direct_transfers: u64,
    pub failed_transfers: u64,
    /// Release latency samples (ms).
    latency_samples: VecDeque<u64>,
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            escrows_opened: 0,
            escrows_completed: 0,
            escrows_refunded: 0,
            escrows_expired: 0,
            escrows_disputed: 0,
            stranded_deposits: 0,
            conflicts: 0,
            failures: 0,
            instant_transfers: 0,
            direct_transfers: 0,
            failed_transfers: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    pub fn record_opened(&mut self) {
        self.escrows_opened += 1;
    }

    /// Record a successful release.
    pub fn record_completion(&mut self, latency_ms: u64) {
        self.escrows_completed += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    pub fn record_conflict(&mut self) {
        self.conflicts += 1;
    }

    pub fn record_dispute(&mut self) {
        self.escrows_disputed += 1;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn record_sweep(&mut self, report: &SweepReport) {
        self.escrows_expired += report.expired as u64;
        self.escrows_refunded += report.refunded as u64;
        self.escrows_disputed += report.disputed as u64;
        self.conflicts += report.conflicts as u64;
        self.stranded_deposits += report.stranded_deposits as u64;
    }

    pub fn record_transfer(&mut self, record: &TransferRecord) {
        if record.status == TransferStatus::Failed {
            self.failed_transfers += 1;
            return;
        }
        match record.method {
            RoutingMethod::Instant => self.instant_transfers += 1,
            RoutingMethod::Direct => self.direct_transfers += 1,
        }
    }

    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of opened escrows that were released to the agent.
    pub fn completion_rate(&self) -> f64 {
        if self.escrows_opened == 0 {
            return 0.0;
        }

        self.escrows_completed as f64 / self.escrows_opened as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
