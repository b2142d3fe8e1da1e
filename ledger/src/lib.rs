//! CashBridge Ledger
//!
//! Ports to the bitcoin ledger and the instant payment channel, plus
//! in-memory reference implementations with a journal and fault injection
//! for tests and the simulator.

pub mod client;
pub mod error;
pub mod instant;
pub mod journal;
pub mod memory;

pub use client::{ConfirmationTarget, LedgerClient, SendReceipt};
pub use error::{LedgerError, LedgerResult};
pub use instant::{InMemoryInstantChannel, InstantChannelClient, InstantPayment, Invoice, PaymentStatus};
pub use journal::{EntryType, JournalEntry};
pub use memory::{Fault, InMemoryLedger};
