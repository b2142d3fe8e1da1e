//! Conversion request types.

use cashbridge_common::{CashBridgeError, Currency, Money, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Remoteness of a location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessibilityClass {
    Urban,
    Suburban,
    Rural,
    Remote,
}

impl AccessibilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessibilityClass::Urban => "urban",
            AccessibilityClass::Suburban => "suburban",
            AccessibilityClass::Rural => "rural",
            AccessibilityClass::Remote => "remote",
        }
    }
}

/// How quickly the requester needs the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Standard,
    Express,
    Emergency,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Standard => "standard",
            Urgency::Express => "express",
            Urgency::Emergency => "emergency",
        }
    }
}

/// Which way value flows through the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Requester hands over cash and receives bitcoin.
    CashToBitcoin,
    /// Requester escrows bitcoin and receives cash.
    BitcoinToCash,
}

/// A point on the map with its accessibility class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub accessibility: AccessibilityClass,
}

impl Location {
    pub fn new(lat: f64, lng: f64, accessibility: AccessibilityClass) -> Self {
        Self {
            lat,
            lng,
            accessibility,
        }
    }

    /// Reject coordinates outside the valid lat/lng ranges.
    pub fn validate(&self, field: &str) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(CashBridgeError::validation(
                format!("{field}.lat"),
                format!("latitude {} out of range", self.lat),
            ));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(CashBridgeError::validation(
                format!("{field}.lng"),
                format!("longitude {} out of range", self.lng),
            ));
        }
        Ok(())
    }
}

/// A request to price one cash/bitcoin conversion. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Gross amount in local currency.
    pub amount: Decimal,
    pub currency: Currency,
    pub direction: Direction,
    pub location: Location,
    pub urgency: Urgency,
    pub timestamp: DateTime<Utc>,
}

impl ConversionRequest {
    pub fn new(
        amount: Decimal,
        currency: Currency,
        direction: Direction,
        location: Location,
        urgency: Urgency,
    ) -> Self {
        Self {
            amount,
            currency,
            direction,
            location,
            urgency,
            timestamp: Utc::now(),
        }
    }

    /// Gross amount as `Money`.
    pub fn gross(&self) -> Money {
        Money::new(self.amount, self.currency.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.amount <= Decimal::ZERO {
            return Err(CashBridgeError::validation(
                "amount",
                "amount must be greater than zero",
            ));
        }
        self.location.validate("location")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_location_validation() {
        assert!(Location::new(-1.29, 36.82, AccessibilityClass::Urban)
            .validate("location")
            .is_ok());
        assert!(Location::new(91.0, 0.0, AccessibilityClass::Urban)
            .validate("location")
            .is_err());
        assert!(Location::new(0.0, f64::NAN, AccessibilityClass::Remote)
            .validate("location")
            .is_err());
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let location = Location::new(0.0, 0.0, AccessibilityClass::Rural);
        let request = ConversionRequest::new(
            dec!(0),
            Currency::kes(),
            Direction::CashToBitcoin,
            location,
            Urgency::Standard,
        );

        let err = request.validate().unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }
}
