//! Instant payment channel port.

use async_trait::async_trait;
use cashbridge_common::Satoshis;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::memory::Fault;

/// A request to be paid over the instant channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Encoded payment request handed to the payer.
    pub payment_request: String,
    pub amount: Satoshis,
    pub description: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome reported by the channel for a payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    /// Routed but not yet settled.
    InFlight,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstantPayment {
    pub status: PaymentStatus,
    pub fee: Satoshis,
}

/// Access to the instant, low-fee settlement channel.
#[async_trait]
pub trait InstantChannelClient: Send + Sync {
    async fn create_invoice(&self, amount: Satoshis, description: &str) -> LedgerResult<Invoice>;

    /// Decode a payment request into the invoice it encodes.
    async fn lookup_invoice(&self, payment_request: &str) -> LedgerResult<Invoice>;

    async fn pay_invoice(&self, payment_request: &str) -> LedgerResult<InstantPayment>;
}

#[derive(Debug, Clone)]
struct InvoiceState {
    invoice: Invoice,
    paid: bool,
}

/// Instant channel that settles invoices it issued itself.
pub struct InMemoryInstantChannel {
    invoices: DashMap<String, InvoiceState>,
    routing_fee: Satoshis,
    invoice_ttl: Duration,
    forced_status: Mutex<Option<PaymentStatus>>,
    fault: Mutex<Fault>,
}

impl InMemoryInstantChannel {
    pub fn new() -> Self {
        Self {
            invoices: DashMap::new(),
            routing_fee: Satoshis::new(1),
            invoice_ttl: Duration::hours(1),
            forced_status: Mutex::new(None),
            fault: Mutex::new(Fault::None),
        }
    }

    pub fn with_routing_fee(mut self, fee: Satoshis) -> Self {
        self.routing_fee = fee;
        self
    }

    /// Report this status for every payment instead of settling.
    pub fn force_status(&self, status: Option<PaymentStatus>) {
        *self.forced_status.lock() = status;
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    pub fn is_paid(&self, payment_request: &str) -> bool {
        self.invoices
            .get(payment_request)
            .map(|s| s.paid)
            .unwrap_or(false)
    }
}

impl Default for InMemoryInstantChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstantChannelClient for InMemoryInstantChannel {
    async fn create_invoice(&self, amount: Satoshis, description: &str) -> LedgerResult<Invoice> {
        let fault = *self.fault.lock();
        fault.apply("create_invoice").await?;

        if amount.is_zero() {
            return Err(LedgerError::Rejected("invoice amount must be positive".to_string()));
        }

        let invoice = Invoice {
            payment_request: format!("lnbcrt{}n1{}", amount.as_u64(), Uuid::now_v7().simple()),
            amount,
            description: description.to_string(),
            expires_at: Utc::now() + self.invoice_ttl,
        };
        self.invoices.insert(
            invoice.payment_request.clone(),
            InvoiceState {
                invoice: invoice.clone(),
                paid: false,
            },
        );

        debug!(amount = %amount, "Invoice created");
        Ok(invoice)
    }

    async fn lookup_invoice(&self, payment_request: &str) -> LedgerResult<Invoice> {
        let fault = *self.fault.lock();
        fault.apply("lookup_invoice").await?;

        self.invoices
            .get(payment_request)
            .map(|state| state.invoice.clone())
            .ok_or_else(|| LedgerError::InvalidPaymentRequest(payment_request.to_string()))
    }

    async fn pay_invoice(&self, payment_request: &str) -> LedgerResult<InstantPayment> {
        let fault = *self.fault.lock();
        fault.apply("pay_invoice").await?;

        let forced = *self.forced_status.lock();
        if let Some(status) = forced {
            return Ok(InstantPayment {
                status,
                fee: Satoshis::ZERO,
            });
        }

        let mut state = self
            .invoices
            .get_mut(payment_request)
            .ok_or_else(|| LedgerError::InvalidPaymentRequest(payment_request.to_string()))?;

        if state.paid || state.invoice.expires_at <= Utc::now() {
            return Ok(InstantPayment {
                status: PaymentStatus::Failed,
                fee: Satoshis::ZERO,
            });
        }

        state.paid = true;
        info!(amount = %state.invoice.amount, "Instant payment settled");

        Ok(InstantPayment {
            status: PaymentStatus::Succeeded,
            fee: self.routing_fee,
        })
    }
}
