//! Ledger error types.

use cashbridge_common::{CashBridgeError, LedgerAddress, Satoshis, TxRef};
use thiserror::Error;

/// Errors returned by ledger and instant-channel adapters.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds at {address}: available {available}, requested {requested}")]
    InsufficientFunds {
        address: LedgerAddress,
        available: Satoshis,
        requested: Satoshis,
    },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxRef),

    #[error("Invalid payment request: {0}")]
    InvalidPaymentRequest(String),

    /// The backend could not be reached or refused to serve.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the operation.
    #[error("Rejected by ledger: {0}")]
    Rejected(String),
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<LedgerError> for CashBridgeError {
    fn from(err: LedgerError) -> Self {
        CashBridgeError::Ledger(err.to_string())
    }
}
