//! Dynamic fee calculation.

use cashbridge_common::{CashBridgeError, Result};
use chrono::{DateTime, TimeZone};
use rust_decimal::Decimal;

use crate::breakdown::{FeeBreakdown, FeeComponent};
use crate::geo;
use crate::request::{ConversionRequest, Location};
use crate::schedule::FeeSchedule;
use crate::time_bucket::{DayKind, TimeBucket};

/// Prices conversions from a [`FeeSchedule`].
///
/// The engine is pure: it reads no clock, performs no I/O and holds no mutable
/// state, so one instance can be shared freely across tasks.
#[derive(Debug, Clone, Default)]
pub struct FeeEngine {
    schedule: FeeSchedule,
}

impl FeeEngine {
    /// Create an engine, rejecting an inconsistent schedule.
    pub fn new(schedule: FeeSchedule) -> Result<Self> {
        schedule
            .validate()
            .map_err(CashBridgeError::Configuration)?;
        Ok(Self { schedule })
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    /// Price a conversion at the requester's local time `now`.
    pub fn compute_fee<Tz: TimeZone>(
        &self,
        request: &ConversionRequest,
        provider_distance_km: f64,
        provider_location: &Location,
        now: &DateTime<Tz>,
    ) -> Result<FeeBreakdown> {
        self.compute_fee_in_bucket(
            request,
            provider_distance_km,
            provider_location,
            TimeBucket::at(now),
        )
    }

    /// Price a conversion against a provider, deriving the distance from
    /// coordinates.
    pub fn compute_fee_for_provider<Tz: TimeZone>(
        &self,
        request: &ConversionRequest,
        provider_location: &Location,
        now: &DateTime<Tz>,
    ) -> Result<FeeBreakdown> {
        provider_location.validate("provider_location")?;
        request.location.validate("location")?;
        let distance = geo::distance_km(&request.location, provider_location);
        self.compute_fee(request, distance, provider_location, now)
    }

    /// Price a conversion in an explicit time bucket.
    pub fn compute_fee_in_bucket(
        &self,
        request: &ConversionRequest,
        provider_distance_km: f64,
        provider_location: &Location,
        bucket: TimeBucket,
    ) -> Result<FeeBreakdown> {
        request.validate()?;
        provider_location.validate("provider_location")?;
        if !provider_distance_km.is_finite() || provider_distance_km < 0.0 {
            return Err(CashBridgeError::validation(
                "provider_distance_km",
                format!("distance {provider_distance_km} must be a non-negative number"),
            ));
        }

        let schedule = &self.schedule;
        let accessibility = request.location.accessibility;
        let mut lines = Lines::new(request);

        // 1. Base
        let base = schedule.base_rate;
        lines.push("Base fee".to_string(), base);

        // 2. Distance band
        let (band, distance_rate) = schedule.distance_tier(provider_distance_km);
        let band_label = match band {
            Some(max_km) => format!("Distance fee (up to {max_km} km)"),
            None => format!(
                "Distance fee (over {} km)",
                schedule
                    .distance_tiers
                    .last()
                    .map(|tier| tier.max_km)
                    .unwrap_or_default()
            ),
        };
        lines.push(band_label, distance_rate);

        // 3. Accessibility scales the distance fee only
        let accessibility_rate =
            distance_rate * (schedule.accessibility.for_class(accessibility) - Decimal::ONE);
        lines.push(
            format!("Accessibility surcharge ({})", accessibility.as_str()),
            accessibility_rate,
        );

        // 4, 5. Urgency and time scale base + distance
        let core = base + distance_rate;

        let urgency_rate =
            core * (schedule.urgency.for_urgency(request.urgency) - Decimal::ONE);
        lines.push(
            format!("Urgency surcharge ({})", request.urgency.as_str()),
            urgency_rate,
        );

        let time_factor =
            schedule.time.for_period(bucket.period) * schedule.time.for_day(bucket.day);
        let time_rate = core * (time_factor - Decimal::ONE);
        let time_label = match bucket.day {
            DayKind::Weekday => format!("Time surcharge ({})", bucket.period.as_str()),
            DayKind::Weekend => format!("Time surcharge ({}, weekend)", bucket.period.as_str()),
        };
        lines.push(time_label, time_rate);

        // 6. Demand
        lines.push(
            format!("Demand adjustment ({})", accessibility.as_str()),
            schedule.demand.for_class(accessibility),
        );

        let raw_total = lines.percentage_sum();
        let total = raw_total.clamp(schedule.min_total_rate, schedule.max_total_rate);
        if total > raw_total {
            lines.push("Minimum fee floor".to_string(), total - raw_total);
        } else if total < raw_total {
            lines.push("Maximum fee cap".to_string(), total - raw_total);
        }

        let places = request.currency.decimal_places();
        let total_fee_amount = (request.amount * total).round_dp(places);
        let agent_share = (total_fee_amount * schedule.agent_share).round_dp(places);
        let platform_share = total_fee_amount - agent_share;

        Ok(FeeBreakdown {
            components: lines.components,
            total_fee_percentage: total,
            total_fee_amount,
            agent_share,
            platform_share,
            gross_amount: request.amount,
            currency: request.currency.clone(),
            distance_km: provider_distance_km,
            time_bucket: bucket,
        })
    }
}

/// Accumulates non-zero components against the gross amount.
struct Lines {
    amount: Decimal,
    places: u32,
    components: Vec<FeeComponent>,
}

impl Lines {
    fn new(request: &ConversionRequest) -> Self {
        Self {
            amount: request.amount,
            places: request.currency.decimal_places(),
            components: Vec::with_capacity(7),
        }
    }

    fn push(&mut self, description: String, percentage: Decimal) {
        if percentage.is_zero() {
            return;
        }
        self.components.push(FeeComponent {
            description,
            percentage: percentage.normalize(),
            amount: (self.amount * percentage).round_dp(self.places),
        });
    }

    fn percentage_sum(&self) -> Decimal {
        self.components.iter().map(|c| c.percentage).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AccessibilityClass, Direction, Urgency};
    use crate::time_bucket::DayPeriod;
    use cashbridge_common::Currency;
    use chrono::{FixedOffset, Utc};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn request(
        amount: Decimal,
        accessibility: AccessibilityClass,
        urgency: Urgency,
    ) -> ConversionRequest {
        ConversionRequest::new(
            amount,
            Currency::kes(),
            Direction::CashToBitcoin,
            Location::new(-0.5, 37.4, accessibility),
            urgency,
        )
    }

    fn provider() -> Location {
        Location::new(-0.6, 37.5, AccessibilityClass::Suburban)
    }

    fn weekday_afternoon() -> TimeBucket {
        TimeBucket::new(DayPeriod::Afternoon, DayKind::Weekday)
    }

    #[test]
    fn test_rural_weekday_afternoon_quote() {
        let engine = FeeEngine::default();
        let req = request(dec!(100000), AccessibilityClass::Rural, Urgency::Standard);

        let quote = engine
            .compute_fee_in_bucket(&req, 25.0, &provider(), weekday_afternoon())
            .unwrap();

        assert_eq!(quote.total_fee_percentage, dec!(0.045));
        assert_eq!(quote.total_fee_amount, dec!(4500));
        assert_eq!(quote.agent_share, dec!(3150));
        assert_eq!(quote.platform_share, dec!(1350));

        let lines: Vec<(&str, Decimal)> = quote
            .components
            .iter()
            .map(|c| (c.description.as_str(), c.amount))
            .collect();
        assert_eq!(
            lines,
            vec![
                ("Base fee", dec!(1500)),
                ("Distance fee (up to 50 km)", dec!(2000)),
                ("Accessibility surcharge (rural)", dec!(1000)),
            ]
        );
    }

    #[test]
    fn test_same_quote_from_local_timestamp() {
        let engine = FeeEngine::default();
        let req = request(dec!(100000), AccessibilityClass::Rural, Urgency::Standard);
        // Tuesday 2024-06-11 15:00 at UTC+3
        let now = FixedOffset::east_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 11, 15, 0, 0)
            .unwrap();

        let by_time = engine.compute_fee(&req, 25.0, &provider(), &now).unwrap();
        let by_bucket = engine
            .compute_fee_in_bucket(&req, 25.0, &provider(), weekday_afternoon())
            .unwrap();

        assert_eq!(by_time, by_bucket);
    }

    #[test]
    fn test_urgency_and_time_surcharges() {
        let engine = FeeEngine::default();
        let req = request(dec!(10000), AccessibilityClass::Suburban, Urgency::Express);
        let bucket = TimeBucket::new(DayPeriod::Evening, DayKind::Weekend);

        let quote = engine
            .compute_fee_in_bucket(&req, 10.0, &provider(), bucket)
            .unwrap();

        // core = 1.5% + 1% = 2.5%
        let urgency = quote.component("Urgency surcharge").unwrap();
        assert_eq!(urgency.percentage, dec!(0.0075));
        let time = quote.component("Time surcharge (evening, weekend)").unwrap();
        // 2.5% * (1.1 * 1.15 - 1) = 2.5% * 0.265
        assert_eq!(time.percentage, dec!(0.006625));
        let accessibility = quote.component("Accessibility surcharge").unwrap();
        assert_eq!(accessibility.percentage, dec!(0.002));
        assert!(quote.component("Demand adjustment").is_none());

        assert_eq!(quote.total_fee_percentage, dec!(0.041125));
        assert_eq!(quote.total_fee_amount, dec!(411.25));
    }

    #[test]
    fn test_floor_applies_to_cheap_urban_quote() {
        let engine = FeeEngine::default();
        let req = request(dec!(5000), AccessibilityClass::Urban, Urgency::Standard);

        let quote = engine
            .compute_fee_in_bucket(&req, 2.0, &provider(), weekday_afternoon())
            .unwrap();

        // 1.5% + 0.5% - 0.5% = 1.5%, raised to the 2% floor
        assert_eq!(quote.total_fee_percentage, dec!(0.02));
        let demand = quote.component("Demand adjustment (urban)").unwrap();
        assert_eq!(demand.percentage, dec!(-0.005));
        let floor = quote.components.last().unwrap();
        assert_eq!(floor.description, "Minimum fee floor");
        assert_eq!(floor.percentage, dec!(0.005));
        assert_eq!(quote.component_percentage_sum(), quote.total_fee_percentage);
    }

    #[test]
    fn test_cap_applies_to_remote_emergency_night() {
        let engine = FeeEngine::default();
        let req = request(dec!(20000), AccessibilityClass::Remote, Urgency::Emergency);
        let bucket = TimeBucket::new(DayPeriod::Night, DayKind::Weekend);

        let quote = engine
            .compute_fee_in_bucket(&req, 140.0, &provider(), bucket)
            .unwrap();

        assert_eq!(quote.total_fee_percentage, dec!(0.12));
        assert_eq!(quote.total_fee_amount, dec!(2400));
        assert_eq!(quote.components.last().unwrap().description, "Maximum fee cap");
        assert_eq!(quote.component_percentage_sum(), dec!(0.12));
        assert!(quote.component("Distance fee (over 100 km)").is_some());
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let engine = FeeEngine::default();
        let req = request(dec!(1000), AccessibilityClass::Rural, Urgency::Standard);

        for distance in [-1.0, f64::NAN, f64::INFINITY] {
            let err = engine
                .compute_fee_in_bucket(&req, distance, &provider(), weekday_afternoon())
                .unwrap_err();
            assert!(matches!(err, CashBridgeError::Validation { .. }));
        }

        let negative = request(dec!(-5), AccessibilityClass::Rural, Urgency::Standard);
        assert!(engine
            .compute_fee_in_bucket(&negative, 1.0, &provider(), weekday_afternoon())
            .is_err());

        let bad_provider = Location::new(0.0, 200.0, AccessibilityClass::Urban);
        assert!(engine
            .compute_fee_in_bucket(&req, 1.0, &bad_provider, weekday_afternoon())
            .is_err());
    }

    #[test]
    fn test_fee_for_provider_uses_coordinates() {
        let engine = FeeEngine::default();
        let req = request(dec!(100000), AccessibilityClass::Rural, Urgency::Standard);
        let now = Utc::now();

        let quote = engine
            .compute_fee_for_provider(&req, &req.location, &now)
            .unwrap();

        assert_eq!(quote.distance_km, 0.0);
        assert!(quote.component("Distance fee (up to 5 km)").is_some());
    }

    #[test]
    fn test_net_local_amount() {
        let engine = FeeEngine::default();
        let req = request(dec!(100000), AccessibilityClass::Rural, Urgency::Standard);
        let quote = engine
            .compute_fee_in_bucket(&req, 25.0, &provider(), weekday_afternoon())
            .unwrap();

        assert_eq!(quote.net_local_amount().value, dec!(95500));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let mut schedule = FeeSchedule::default();
        schedule.agent_share = dec!(1.5);
        assert!(matches!(
            FeeEngine::new(schedule),
            Err(CashBridgeError::Configuration(_))
        ));
    }

    fn accessibility_strategy() -> impl Strategy<Value = AccessibilityClass> {
        prop_oneof![
            Just(AccessibilityClass::Urban),
            Just(AccessibilityClass::Suburban),
            Just(AccessibilityClass::Rural),
            Just(AccessibilityClass::Remote),
        ]
    }

    fn urgency_strategy() -> impl Strategy<Value = Urgency> {
        prop_oneof![
            Just(Urgency::Standard),
            Just(Urgency::Express),
            Just(Urgency::Emergency),
        ]
    }

    fn bucket_strategy() -> impl Strategy<Value = TimeBucket> {
        (0u32..24, any::<bool>()).prop_map(|(hour, weekend)| {
            TimeBucket::new(
                DayPeriod::from_hour(hour),
                if weekend { DayKind::Weekend } else { DayKind::Weekday },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_total_within_bounds_and_shares_sum(
            cents in 1i64..10_000_000_000,
            distance in 0.0f64..500.0,
            accessibility in accessibility_strategy(),
            urgency in urgency_strategy(),
            bucket in bucket_strategy(),
        ) {
            let engine = FeeEngine::default();
            let req = request(Decimal::new(cents, 2), accessibility, urgency);

            let quote = engine
                .compute_fee_in_bucket(&req, distance, &provider(), bucket)
                .unwrap();

            prop_assert!(quote.total_fee_percentage >= dec!(0.02));
            prop_assert!(quote.total_fee_percentage <= dec!(0.12));
            let exact = req.amount * quote.total_fee_percentage;
            prop_assert!((quote.total_fee_amount - exact).abs() <= dec!(0.005));
            prop_assert_eq!(quote.agent_share + quote.platform_share, quote.total_fee_amount);
            prop_assert_eq!(quote.component_percentage_sum(), quote.total_fee_percentage);
            prop_assert!(quote.components.iter().all(|c| !c.percentage.is_zero()));
        }

        #[test]
        fn prop_deterministic_within_bucket(
            cents in 1i64..1_000_000_000,
            distance in 0.0f64..200.0,
            accessibility in accessibility_strategy(),
            urgency in urgency_strategy(),
            bucket in bucket_strategy(),
        ) {
            let engine = FeeEngine::default();
            let req = request(Decimal::new(cents, 2), accessibility, urgency);

            let first = engine.compute_fee_in_bucket(&req, distance, &provider(), bucket).unwrap();
            let second = engine.compute_fee_in_bucket(&req, distance, &provider(), bucket).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
