//! Time-of-day and day-of-week buckets used for pricing.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};

/// Part of the day, in the requester's local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayPeriod {
    /// 06:00 to 11:59.
    Morning,
    /// 12:00 to 17:59.
    Afternoon,
    /// 18:00 to 21:59.
    Evening,
    /// 22:00 to 05:59.
    Night,
}

impl DayPeriod {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => DayPeriod::Morning,
            12..=17 => DayPeriod::Afternoon,
            18..=21 => DayPeriod::Evening,
            _ => DayPeriod::Night,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DayPeriod::Morning => "morning",
            DayPeriod::Afternoon => "afternoon",
            DayPeriod::Evening => "evening",
            DayPeriod::Night => "night",
        }
    }
}

/// Weekday or weekend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayKind {
    Weekday,
    Weekend,
}

impl DayKind {
    pub fn from_weekday(day: Weekday) -> Self {
        match day {
            Weekday::Sat | Weekday::Sun => DayKind::Weekend,
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri => {
                DayKind::Weekday
            }
        }
    }
}

/// The pricing-relevant part of a point in time.
///
/// Two instants in the same bucket price identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub period: DayPeriod,
    pub day: DayKind,
}

impl TimeBucket {
    pub fn new(period: DayPeriod, day: DayKind) -> Self {
        Self { period, day }
    }

    /// Bucket for a local wall-clock time.
    pub fn at<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            period: DayPeriod::from_hour(now.hour()),
            day: DayKind::from_weekday(now.weekday()),
        }
    }

    pub fn is_weekend(&self) -> bool {
        self.day == DayKind::Weekend
    }
}
