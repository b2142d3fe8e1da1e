//! Transfer execution over the chosen channel.

use cashbridge_common::{CashBridgeError, LedgerAddress, Result, Satoshis, TransferId, TxRef};
use cashbridge_ledger::{Invoice, LedgerError, PaymentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::decider::{RoutingDecider, TransferUrgency};
use crate::rules::RoutingMethod;

/// A peer-to-peer bitcoin transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source: LedgerAddress,
    pub destination: LedgerAddress,
    /// Recipient's instant-channel payment request, if they supplied one.
    pub payment_request: Option<String>,
    pub amount: Satoshis,
    pub urgency: TransferUrgency,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Outcome of [`RoutingDecider::execute_transfer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub method: RoutingMethod,
    pub amount: Satoshis,
    /// Fee actually charged, once known.
    pub fee: Option<Satoshis>,
    pub status: TransferStatus,
    /// Payment request or transaction reference.
    pub channel_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    fn new(method: RoutingMethod, amount: Satoshis) -> Self {
        let now = Utc::now();
        Self {
            id: TransferId::new(),
            method,
            amount,
            fee: None,
            status: TransferStatus::Pending,
            channel_ref: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn update(&mut self, status: TransferStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.update(TransferStatus::Failed);
    }
}

impl RoutingDecider {
    /// Route and send a transfer.
    ///
    /// Channel failures come back as a `Failed` record; a failed instant
    /// payment is never retried on the direct channel.
    #[instrument(skip_all, fields(amount = %request.amount))]
    pub async fn execute_transfer(&self, request: &TransferRequest) -> Result<TransferRecord> {
        if request.amount.is_zero() {
            return Err(CashBridgeError::validation("amount", "amount must be greater than zero"));
        }
        if request.source == request.destination {
            return Err(CashBridgeError::validation(
                "destination",
                "source and destination must differ",
            ));
        }

        if let Some(pr) = request.payment_request.as_deref() {
            self.check_invoice(pr, request.amount).await?;
        }

        let decision = self
            .decide_routing(&request.amount.to_money(), request.urgency)
            .await?;

        let payment_request = match (decision.method, request.payment_request.as_deref()) {
            (RoutingMethod::Instant, Some(pr)) => Some(pr),
            (RoutingMethod::Instant, None) => {
                info!("No payment request supplied, settling directly");
                None
            }
            (RoutingMethod::Direct, _) => None,
        };

        let record = match payment_request {
            Some(pr) => self.pay_instant(request, pr).await,
            None => self.send_direct(request).await,
        };

        info!(
            transfer_id = %record.id,
            method = %record.method,
            status = ?record.status,
            "Transfer executed"
        );
        Ok(record)
    }

    /// Re-check a processing direct transfer against the confirmation target.
    pub async fn refresh_transfer(&self, record: &TransferRecord) -> Result<TransferRecord> {
        let mut refreshed = record.clone();
        let tx_ref = match (record.method, record.status, &record.channel_ref) {
            (RoutingMethod::Direct, TransferStatus::Processing, Some(tx_ref)) => {
                TxRef::new(tx_ref.clone())
            }
            _ => return Ok(refreshed),
        };

        let confirmations = tokio::time::timeout(
            self.config.channel_timeout,
            self.ledger.get_confirmations(&tx_ref),
        )
        .await
        .map_err(|_| CashBridgeError::LedgerTimeout {
            operation: "get_confirmations".to_string(),
        })??;

        if confirmations >= self.config.confirmation_target {
            refreshed.update(TransferStatus::Completed);
            info!(transfer_id = %record.id, confirmations, "Transfer confirmed");
        }

        Ok(refreshed)
    }

    /// Create an invoice for receiving funds on the instant channel.
    pub async fn request_payment(&self, amount: Satoshis, description: &str) -> Result<Invoice> {
        if amount.is_zero() {
            return Err(CashBridgeError::validation("amount", "amount must be greater than zero"));
        }

        let invoice = tokio::time::timeout(
            self.config.channel_timeout,
            self.instant.create_invoice(amount, description),
        )
        .await
        .map_err(|_| CashBridgeError::LedgerTimeout {
            operation: "create_invoice".to_string(),
        })??;

        Ok(invoice)
    }

    /// The invoice behind `payment_request` must be for exactly `amount`.
    async fn check_invoice(&self, payment_request: &str, amount: Satoshis) -> Result<()> {
        let invoice = tokio::time::timeout(
            self.config.channel_timeout,
            self.instant.lookup_invoice(payment_request),
        )
        .await
        .map_err(|_| CashBridgeError::LedgerTimeout {
            operation: "lookup_invoice".to_string(),
        })?
        .map_err(|e| match e {
            LedgerError::InvalidPaymentRequest(_) => {
                CashBridgeError::validation("payment_request", e.to_string())
            }
            other => other.into(),
        })?;

        if invoice.amount != amount {
            warn!(invoice_amount = %invoice.amount, amount = %amount, "Invoice amount mismatch");
            return Err(CashBridgeError::validation(
                "payment_request",
                format!("invoice is for {}, transfer is for {}", invoice.amount, amount),
            ));
        }
        Ok(())
    }

    async fn pay_instant(&self, request: &TransferRequest, payment_request: &str) -> TransferRecord {
        let mut record = TransferRecord::new(RoutingMethod::Instant, request.amount);
        record.channel_ref = Some(payment_request.to_string());

        match tokio::time::timeout(
            self.config.channel_timeout,
            self.instant.pay_invoice(payment_request),
        )
        .await
        {
            Ok(Ok(payment)) => {
                record.fee = Some(payment.fee);
                match payment.status {
                    PaymentStatus::Succeeded => record.update(TransferStatus::Completed),
                    PaymentStatus::InFlight => record.update(TransferStatus::Processing),
                    PaymentStatus::Failed => record.fail("instant payment failed"),
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Instant payment rejected");
                record.fail(format!("instant payment failed: {e}"));
            }
            Err(_) => {
                error!("Instant payment timed out");
                record.fail("instant payment timed out; outcome unknown, reconcile before retry");
            }
        }

        record
    }

    async fn send_direct(&self, request: &TransferRequest) -> TransferRecord {
        let mut record = TransferRecord::new(RoutingMethod::Direct, request.amount);

        match tokio::time::timeout(
            self.config.channel_timeout,
            self.ledger
                .send(&request.source, &request.destination, request.amount),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                record.fee = Some(receipt.fee);
                record.channel_ref = Some(receipt.tx_ref.to_string());
                record.update(TransferStatus::Processing);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Direct transfer rejected");
                record.fail(format!("direct transfer failed: {e}"));
            }
            Err(_) => {
                error!("Direct transfer timed out");
                record.fail("direct transfer timed out; outcome unknown, reconcile before retry");
            }
        }

        record
    }
}
