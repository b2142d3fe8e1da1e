//! Background expiry sweeps.

use std::sync::Arc;
use std::time::Duration;

use cashbridge_common::Clock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::coordinator::EscrowCoordinator;

/// Runs [`EscrowCoordinator::sweep_expired`] on a fixed interval.
pub struct SweepScheduler {
    coordinator: Arc<EscrowCoordinator>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl SweepScheduler {
    pub fn new(coordinator: Arc<EscrowCoordinator>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            coordinator,
            clock,
            interval,
        }
    }

    /// Start sweeping in the background. The first sweep runs immediately.
    pub fn spawn(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeps = 0u64;

            info!(interval_ms = self.interval.as_millis() as u64, "Sweep scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.coordinator.sweep_expired(self.clock.now()).await {
                            error!(error = %e, "Expiry sweep failed");
                        }
                        sweeps += 1;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }

            info!(sweeps, "Sweep scheduler stopped");
            sweeps
        });

        SweepHandle { shutdown_tx, task }
    }
}

/// Handle to a running [`SweepScheduler`].
pub struct SweepHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<u64>,
}

impl SweepHandle {
    /// Stop after the in-flight sweep and return how many sweeps ran.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown_tx.send(()).await;
        self.task.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::directory::InMemoryDirectory;
    use crate::notification::LoggingNotifier;
    use crate::store::InMemoryRecordStore;
    use cashbridge_common::{Agent, Currency, EscrowStatus, LedgerAddress, ManualClock, PartyId, Satoshis};
    use cashbridge_ledger::InMemoryLedger;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_scheduler_expires_records() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 11, 9, 0, 0).unwrap(),
        ));
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_agent(Agent::new(
            PartyId::new("agent_1"),
            LedgerAddress::new("agent-wallet"),
        ));

        let coordinator = Arc::new(
            EscrowCoordinator::new(
                CoordinatorConfig::default(),
                Arc::new(InMemoryLedger::new()),
                Arc::new(InMemoryRecordStore::new()),
                Arc::new(LoggingNotifier),
                directory,
            )
            .with_clock(clock.clone()),
        );

        let record = coordinator
            .create_escrow(
                PartyId::new("requester_1"),
                PartyId::new("agent_1"),
                Satoshis::new(10_000),
                dec!(500),
                Currency::kes(),
            )
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(25));
        let handle = SweepScheduler::new(coordinator.clone(), clock, Duration::from_millis(10)).spawn();

        let mut status = EscrowStatus::Pending;
        for _ in 0..100 {
            status = coordinator.get_escrow(record.id).await.unwrap().status;
            if status != EscrowStatus::Pending {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(status, EscrowStatus::Expired);
        assert!(handle.stop().await >= 1);
    }
}
