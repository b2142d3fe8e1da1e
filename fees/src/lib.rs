//! CashBridge Fee Engine
//!
//! Prices cash/bitcoin conversions from distance, accessibility, urgency,
//! local time of day and a demand adjustment. The result is an itemised
//! [`FeeBreakdown`] whose total is clamped to the schedule's floor and cap and
//! split between agent and platform.

pub mod breakdown;
pub mod engine;
pub mod geo;
pub mod request;
pub mod schedule;
pub mod time_bucket;

pub use breakdown::{FeeBreakdown, FeeComponent};
pub use engine::FeeEngine;
pub use geo::distance_km;
pub use request::{AccessibilityClass, ConversionRequest, Direction, Location, Urgency};
pub use schedule::FeeSchedule;
pub use time_bucket::{DayKind, DayPeriod, TimeBucket};
