//! Fee schedule configuration.
//!
//! All rates are fractions of the gross amount (`0.015` = 1.5%).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::request::{AccessibilityClass, Urgency};
use crate::time_bucket::{DayKind, DayPeriod};

/// One distance band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistanceTier {
    /// Inclusive upper bound in kilometres.
    pub max_km: f64,
    pub rate: Decimal,
}

/// Multipliers per accessibility class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityMultipliers {
    pub urban: Decimal,
    pub suburban: Decimal,
    pub rural: Decimal,
    pub remote: Decimal,
}

impl AccessibilityMultipliers {
    pub fn for_class(&self, class: AccessibilityClass) -> Decimal {
        match class {
            AccessibilityClass::Urban => self.urban,
            AccessibilityClass::Suburban => self.suburban,
            AccessibilityClass::Rural => self.rural,
            AccessibilityClass::Remote => self.remote,
        }
    }
}

/// Multipliers per urgency level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UrgencyMultipliers {
    pub standard: Decimal,
    pub express: Decimal,
    pub emergency: Decimal,
}

impl UrgencyMultipliers {
    pub fn for_urgency(&self, urgency: Urgency) -> Decimal {
        match urgency {
            Urgency::Standard => self.standard,
            Urgency::Express => self.express,
            Urgency::Emergency => self.emergency,
        }
    }
}

/// Multipliers per part of day, plus the weekend factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeMultipliers {
    pub morning: Decimal,
    pub afternoon: Decimal,
    pub evening: Decimal,
    pub night: Decimal,
    pub weekend: Decimal,
}

impl TimeMultipliers {
    pub fn for_period(&self, period: DayPeriod) -> Decimal {
        match period {
            DayPeriod::Morning => self.morning,
            DayPeriod::Afternoon => self.afternoon,
            DayPeriod::Evening => self.evening,
            DayPeriod::Night => self.night,
        }
    }

    pub fn for_day(&self, day: DayKind) -> Decimal {
        match day {
            DayKind::Weekday => Decimal::ONE,
            DayKind::Weekend => self.weekend,
        }
    }
}

/// Flat demand adjustment keyed on the requester's accessibility class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemandAdjustments {
    pub urban: Decimal,
    pub suburban: Decimal,
    pub rural: Decimal,
    pub remote: Decimal,
}

impl DemandAdjustments {
    pub fn for_class(&self, class: AccessibilityClass) -> Decimal {
        match class {
            AccessibilityClass::Urban => self.urban,
            AccessibilityClass::Suburban => self.suburban,
            AccessibilityClass::Rural => self.rural,
            AccessibilityClass::Remote => self.remote,
        }
    }
}

/// Complete pricing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub base_rate: Decimal,
    /// Bands ordered by `max_km`, smallest first.
    pub distance_tiers: Vec<DistanceTier>,
    /// Rate beyond the last band.
    pub beyond_last_tier_rate: Decimal,
    pub accessibility: AccessibilityMultipliers,
    pub urgency: UrgencyMultipliers,
    pub time: TimeMultipliers,
    pub demand: DemandAdjustments,
    pub min_total_rate: Decimal,
    pub max_total_rate: Decimal,
    /// Agent's cut of the total fee; the platform keeps the rest.
    pub agent_share: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            base_rate: dec!(0.015),
            distance_tiers: vec![
                DistanceTier { max_km: 5.0, rate: dec!(0.005) },
                DistanceTier { max_km: 20.0, rate: dec!(0.01) },
                DistanceTier { max_km: 50.0, rate: dec!(0.02) },
                DistanceTier { max_km: 100.0, rate: dec!(0.035) },
            ],
            beyond_last_tier_rate: dec!(0.05),
            accessibility: AccessibilityMultipliers {
                urban: dec!(1.0),
                suburban: dec!(1.2),
                rural: dec!(1.5),
                remote: dec!(2.0),
            },
            urgency: UrgencyMultipliers {
                standard: dec!(1.0),
                express: dec!(1.3),
                emergency: dec!(1.8),
            },
            time: TimeMultipliers {
                morning: dec!(1.0),
                afternoon: dec!(1.0),
                evening: dec!(1.1),
                night: dec!(1.4),
                weekend: dec!(1.15),
            },
            demand: DemandAdjustments {
                urban: dec!(-0.005),
                suburban: Decimal::ZERO,
                rural: Decimal::ZERO,
                remote: dec!(0.01),
            },
            min_total_rate: dec!(0.02),
            max_total_rate: dec!(0.12),
            agent_share: dec!(0.70),
        }
    }
}

impl FeeSchedule {
    /// Distance band for a distance: the first band whose bound covers it.
    pub fn distance_tier(&self, distance_km: f64) -> (Option<f64>, Decimal) {
        self.distance_tiers
            .iter()
            .find(|tier| distance_km <= tier.max_km)
            .map(|tier| (Some(tier.max_km), tier.rate))
            .unwrap_or((None, self.beyond_last_tier_rate))
    }

    /// Defaults overridden by `CASHBRIDGE_FEE_*` environment variables.
    ///
    /// Only the flat rates are tunable this way; tiers and multipliers come
    /// from a serialized schedule.
    pub fn from_env() -> Self {
        let mut schedule = Self::default();

        if let Some(v) = env_decimal("CASHBRIDGE_FEE_BASE_RATE") {
            schedule.base_rate = v;
        }
        if let Some(v) = env_decimal("CASHBRIDGE_FEE_MIN_TOTAL_RATE") {
            schedule.min_total_rate = v;
        }
        if let Some(v) = env_decimal("CASHBRIDGE_FEE_MAX_TOTAL_RATE") {
            schedule.max_total_rate = v;
        }
        if let Some(v) = env_decimal("CASHBRIDGE_FEE_AGENT_SHARE") {
            schedule.agent_share = v;
        }

        schedule
    }

    /// Validate the schedule.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_rate < Decimal::ZERO {
            return Err("Base rate cannot be negative".to_string());
        }

        if self
            .distance_tiers
            .windows(2)
            .any(|pair| pair[0].max_km >= pair[1].max_km)
        {
            return Err("Distance tiers must be strictly ascending".to_string());
        }

        if self.min_total_rate > self.max_total_rate {
            return Err("Minimum total rate cannot exceed maximum".to_string());
        }

        if self.agent_share < Decimal::ZERO || self.agent_share > Decimal::ONE {
            return Err("Agent share must be between 0 and 1".to_string());
        }

        Ok(())
    }
}

fn env_decimal(key: &str) -> Option<Decimal> {
    std::env::var(key).ok()?.parse().ok()
}
