//! CashBridge Coordinator
//!
//! The coordinator holds bitcoin in per-exchange escrow addresses while a
//! requester and an agent meet to swap cash. It releases funds to the agent on
//! a valid exchange code and refunds the requester when the escrow expires.

pub mod code;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod metrics;
pub mod notification;
pub mod postgres;
pub mod scheduler;
pub mod store;

pub use code::{CodeSource, RandomCodes};
pub use config::CoordinatorConfig;
pub use coordinator::{EscrowCoordinator, SweepOutcome, SweepReport};
pub use directory::{AgentDirectory, InMemoryDirectory};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use notification::{
    ChannelNotifier, EscrowEvent, LoggingNotifier, Notification, NotificationPort, NotifyError,
};
pub use postgres::PgRecordStore;
pub use scheduler::{SweepHandle, SweepScheduler};
pub use store::{InMemoryRecordStore, RecordStore, StoreError, StoreResult};
