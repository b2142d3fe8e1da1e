//! Amounts, currencies and exchange rates.
//!
//! Fiat is carried as `Money` (a `Decimal` plus its currency code). Bitcoin
//! committed to an escrow is carried as whole `Satoshis` so ledger arithmetic
//! never rounds.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// A decimal amount in some currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub value: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    /// Same amount rounded half-even to the currency's minor unit.
    pub fn rounded(&self) -> Self {
        Self::new(
            self.value.round_dp(self.currency.decimal_places()),
            self.currency.clone(),
        )
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Upper-cased currency code. `BTC` is treated as a currency with eight
/// decimal places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// Digits after the decimal point in the smallest unit.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "BTC" => 8,
            // Shillings and francs in the markets we serve have no coins in use
            "UGX" | "RWF" | "TZS" | "BIF" | "XOF" | "XAF" | "JPY" => 0,
            _ => 2,
        }
    }

    /// Smallest representable unit (1 satoshi for BTC, 1 cent for KES).
    pub fn minor_unit(&self) -> Decimal {
        Decimal::new(1, self.decimal_places())
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn btc() -> Self {
        Self::new("BTC")
    }

    pub fn kes() -> Self {
        Self::new("KES")
    }

    pub fn ngn() -> Self {
        Self::new("NGN")
    }

    pub fn ugx() -> Self {
        Self::new("UGX")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whole satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Satoshis(u64);

impl Satoshis {
    pub const ZERO: Satoshis = Satoshis(0);

    pub const fn new(sats: u64) -> Self {
        Self(sats)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, other: Satoshis) -> Option<Satoshis> {
        self.0.checked_sub(other.0).map(Satoshis)
    }

    pub fn to_btc(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(SATS_PER_BTC)
    }

    pub fn to_money(&self) -> Money {
        Money::new(self.to_btc(), Currency::btc())
    }

    /// Whole satoshis in a BTC amount; fractions of a satoshi are dropped.
    pub fn from_btc(btc: Decimal) -> Option<Self> {
        if btc.is_sign_negative() {
            return None;
        }
        u64::try_from((btc * Decimal::from(SATS_PER_BTC)).trunc())
            .ok()
            .map(Satoshis)
    }
}

impl fmt::Display for Satoshis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.0)
    }
}

/// Ordered pair; a rate on it prices one `base` in `quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: Currency,
    pub quote: Currency,
}

impl CurrencyPair {
    pub fn new(base: Currency, quote: Currency) -> Self {
        Self { base, quote }
    }

    /// `base`/USD, the shape every rate source quotes.
    pub fn to_usd(base: Currency) -> Self {
        Self::new(base, Currency::usd())
    }

    pub fn inverse(&self) -> Self {
        Self::new(self.quote.clone(), self.base.clone())
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// A two-sided quote with a validity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxRate {
    pub pair: CurrencyPair,
    pub bid: Decimal,
    pub ask: Decimal,
    pub mid: Decimal,
    pub quoted_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Name of the provider that quoted it.
    pub source: String,
}

impl FxRate {
    pub fn new(
        pair: CurrencyPair,
        bid: Decimal,
        ask: Decimal,
        valid_for_seconds: i64,
        source: impl Into<String>,
    ) -> Self {
        let quoted_at = Utc::now();
        Self {
            pair,
            bid,
            ask,
            mid: (bid + ask) / Decimal::TWO,
            quoted_at,
            valid_until: quoted_at + Duration::seconds(valid_for_seconds),
            source: source.into(),
        }
    }

    /// Quote with bid equal to ask.
    pub fn flat(pair: CurrencyPair, rate: Decimal, valid_for_seconds: i64, source: impl Into<String>) -> Self {
        Self::new(pair, rate, rate, valid_for_seconds, source)
    }

    pub fn is_valid(&self) -> bool {
        Utc::now() < self.valid_until
    }

    /// (ask - bid) / mid, in basis points.
    pub fn spread_bps(&self) -> Decimal {
        if self.mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / self.mid * Decimal::from(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_units() {
        assert_eq!(Currency::btc().minor_unit(), dec!(0.00000001));
        assert_eq!(Currency::kes().minor_unit(), dec!(0.01));
        assert_eq!(Currency::ugx().minor_unit(), dec!(1));
        assert_eq!(Currency::new("kes"), Currency::kes());
    }

    #[test]
    fn test_rounded_to_minor_unit() {
        let kes = Money::new(dec!(123.455), Currency::kes());
        assert_eq!(kes.rounded().value, dec!(123.46));

        let ugx = Money::new(dec!(1500.5), Currency::ugx());
        assert_eq!(ugx.rounded().value, dec!(1500));
    }

    #[test]
    fn test_satoshi_conversions() {
        let sats = Satoshis::new(150_000);
        assert_eq!(sats.to_btc(), dec!(0.0015));
        assert_eq!(Satoshis::from_btc(dec!(0.0015)), Some(sats));
        assert_eq!(Satoshis::from_btc(dec!(0.000000019)), Some(Satoshis::new(1)));
        assert_eq!(Satoshis::from_btc(dec!(-1)), None);
        assert_eq!(sats.checked_sub(Satoshis::new(200_000)), None);
        assert_eq!(sats.to_money().currency, Currency::btc());
    }

    #[test]
    fn test_spread() {
        let rate = FxRate::new(
            CurrencyPair::to_usd(Currency::kes()),
            dec!(0.0076),
            dec!(0.0078),
            30,
            "desk",
        );

        assert_eq!(rate.mid, dec!(0.0077));
        assert!(rate.is_valid());
        assert!(rate.spread_bps() > dec!(259) && rate.spread_bps() < dec!(260));
        assert_eq!(rate.pair.inverse().base, Currency::usd());
    }
}
