//! CashBridge Common Types
//!
//! Shared types for the CashBridge money-movement engine: identifiers,
//! monetary amounts, the escrow record and its status machine, agents and the
//! error taxonomy.

pub mod agent;
pub mod escrow;
pub mod error;
pub mod identifiers;
pub mod monetary;
pub mod time;

pub use agent::*;
pub use escrow::*;
pub use error::*;
pub use identifiers::*;
pub use monetary::*;
pub use time::*;
