//! Routing decisions.

use std::sync::Arc;

use cashbridge_common::{CashBridgeError, Currency, Money, Result, Satoshis};
use cashbridge_fx::{FxEngine, FxError};
use cashbridge_ledger::{ConfirmationTarget, InstantChannelClient, LedgerClient};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::RoutingConfig;
use crate::rules::{EstimatedTime, RoutingMethod, RuleTable};

/// How quickly the sender wants the transfer to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferUrgency {
    #[default]
    Standard,
    Instant,
}

/// Channel choice with its cost and speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub method: RoutingMethod,
    pub reason: String,
    /// In the transfer's currency.
    pub estimated_fee: Money,
    pub estimated_time: EstimatedTime,
    /// `estimated_fee / amount`.
    pub fee_percentage: Decimal,
    /// Absent when no rate was available.
    pub usd_equivalent: Option<Decimal>,
}

pub struct RoutingDecider {
    pub(crate) fx: Arc<FxEngine>,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) instant: Arc<dyn InstantChannelClient>,
    pub(crate) rules: RuleTable,
    pub(crate) config: RoutingConfig,
}

impl RoutingDecider {
    pub fn new(
        fx: Arc<FxEngine>,
        ledger: Arc<dyn LedgerClient>,
        instant: Arc<dyn InstantChannelClient>,
        config: RoutingConfig,
    ) -> Result<Self> {
        config.validate().map_err(CashBridgeError::Configuration)?;

        Ok(Self {
            fx,
            ledger,
            instant,
            rules: RuleTable::new(config.dust_threshold_usd, config.instant_limit_usd),
            config,
        })
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Choose a channel for `amount` and estimate what it costs.
    #[instrument(skip_all, fields(amount = %amount, urgency = ?urgency))]
    pub async fn decide_routing(
        &self,
        amount: &Money,
        urgency: TransferUrgency,
    ) -> Result<RoutingDecision> {
        if !amount.is_positive() {
            return Err(CashBridgeError::validation("amount", "amount must be greater than zero"));
        }

        let usd = match tokio::time::timeout(self.config.rate_timeout, self.fx.usd_value(amount)).await
        {
            Ok(Ok(usd)) => usd.value,
            Ok(Err(FxError::Overflow(_))) => {
                return Err(CashBridgeError::validation("amount", "amount is too large to price"));
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Rate lookup failed, defaulting to direct settlement");
                return Ok(self
                    .direct(amount, urgency, None, "exchange rate unavailable, defaulting to direct")
                    .await);
            }
            Err(_) => {
                warn!("Rate lookup timed out, defaulting to direct settlement");
                return Ok(self
                    .direct(amount, urgency, None, "exchange rate lookup timed out, defaulting to direct")
                    .await);
            }
        };

        let rule = self.rules.select(usd);
        debug!(usd = %usd, method = %rule.method, "Routing rule matched");

        let decision = match rule.method {
            RoutingMethod::Instant => self.instant(amount, usd, rule.reason),
            RoutingMethod::Direct => self.direct(amount, urgency, Some(usd), rule.reason).await,
        };

        info!(
            method = %decision.method,
            fee = %decision.estimated_fee,
            usd = %usd,
            "Routing decided"
        );
        Ok(decision)
    }

    fn instant(&self, amount: &Money, usd: Decimal, reason: &str) -> RoutingDecision {
        let currency = &amount.currency;
        let fee = Money::new(
            currency.minor_unit() + amount.value * self.config.instant_fee_rate,
            currency.clone(),
        )
        .rounded();

        RoutingDecision {
            method: RoutingMethod::Instant,
            reason: reason.to_string(),
            fee_percentage: fee.value / amount.value,
            estimated_fee: fee,
            estimated_time: EstimatedTime::SubSecond,
            usd_equivalent: Some(usd),
        }
    }

    async fn direct(
        &self,
        amount: &Money,
        urgency: TransferUrgency,
        usd: Option<Decimal>,
        reason: &str,
    ) -> RoutingDecision {
        let (target, estimated_time) = match urgency {
            TransferUrgency::Instant => (ConfirmationTarget::Fast, EstimatedTime::TenMinutes),
            TransferUrgency::Standard => {
                (ConfirmationTarget::Economy, EstimatedTime::HalfHourToHour)
            }
        };

        let fee = match self.network_fee(target, &amount.currency).await {
            Some(fee) => fee,
            None => (amount.value * self.config.fallback_direct_fee_rate)
                .round_dp(amount.currency.decimal_places()),
        };

        RoutingDecision {
            method: RoutingMethod::Direct,
            reason: reason.to_string(),
            estimated_fee: Money::new(fee, amount.currency.clone()),
            estimated_time,
            fee_percentage: fee / amount.value,
            usd_equivalent: usd,
        }
    }

    /// Network fee estimate priced in `currency`, if both lookups succeed in time.
    async fn network_fee(&self, target: ConfirmationTarget, currency: &Currency) -> Option<Decimal> {
        let sats: Satoshis =
            match tokio::time::timeout(self.config.channel_timeout, self.ledger.estimate_fee(target))
                .await
            {
                Ok(Ok(sats)) => sats,
                Ok(Err(e)) => {
                    warn!(error = %e, "Fee estimate failed, using fallback rate");
                    return None;
                }
                Err(_) => {
                    warn!("Fee estimate timed out, using fallback rate");
                    return None;
                }
            };

        match tokio::time::timeout(
            self.config.rate_timeout,
            self.fx.convert(&sats.to_money(), currency.clone()),
        )
        .await
        {
            Ok(Ok(fee)) => Some(fee.value),
            Ok(Err(e)) => {
                warn!(error = %e, "Could not price network fee, using fallback rate");
                None
            }
            Err(_) => {
                warn!("Pricing network fee timed out, using fallback rate");
                None
            }
        }
    }
}
