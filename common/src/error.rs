//! Error types for CashBridge.

use crate::{EscrowId, EscrowStatus, PartyId};
use thiserror::Error;

/// Main error type for CashBridge operations.
#[derive(Error, Debug)]
pub enum CashBridgeError {
    /// Malformed or out-of-range input, rejected before any state change.
    #[error("Invalid input: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Escrow address could not be allocated; no record was created.
    #[error("Address allocation failed: {0}")]
    Allocation(String),

    /// No escrow matches the presented code.
    #[error("Invalid exchange code")]
    InvalidCode,

    /// The code belongs to an escrow assigned to another agent.
    #[error("Agent {agent_id} is not assigned to escrow {escrow_id}")]
    Unauthorized {
        agent_id: PartyId,
        escrow_id: EscrowId,
    },

    /// The escrow is not in the funded state.
    #[error("Escrow {escrow_id} is not funded (status {status})")]
    NotFunded {
        escrow_id: EscrowId,
        status: EscrowStatus,
    },

    /// The escrow passed its expiry time.
    #[error("Escrow {0} has expired")]
    Expired(EscrowId),

    /// An external call exceeded its deadline.
    #[error("Ledger call timed out: {operation}")]
    LedgerTimeout { operation: String },

    /// An external ledger or channel call failed.
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Lost a compare-and-swap race; re-read state before acting again.
    #[error("Escrow {escrow_id} changed concurrently (expected {expected})")]
    Conflict {
        escrow_id: EscrowId,
        expected: EscrowStatus,
    },

    /// The record moved to disputed and awaits manual review.
    #[error("Escrow {escrow_id} is pending manual review: {reason}")]
    Disputed { escrow_id: EscrowId, reason: String },

    /// Escrow not found.
    #[error("Escrow not found: {0}")]
    EscrowNotFound(EscrowId),

    /// Record store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// No usable exchange rate.
    #[error("Exchange rate unavailable: {0}")]
    RateUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CashBridgeError {
    /// Shorthand for a validation error on a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CashBridgeError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only errors raised before any fund movement qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CashBridgeError::Allocation(_)
                | CashBridgeError::LedgerTimeout { .. }
                | CashBridgeError::Ledger(_)
                | CashBridgeError::Store(_)
                | CashBridgeError::RateUnavailable(_)
        )
    }

    /// Whether the failure was escalated for a human to resolve.
    pub fn requires_manual_review(&self) -> bool {
        matches!(self, CashBridgeError::Disputed { .. })
    }

    /// Whether this is an immediate rejection of the caller's input or identity.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CashBridgeError::Validation { .. }
                | CashBridgeError::InvalidCode
                | CashBridgeError::Unauthorized { .. }
                | CashBridgeError::NotFunded { .. }
                | CashBridgeError::Expired(_)
        )
    }

    /// Get a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CashBridgeError::Validation { .. } => "VALIDATION_ERROR",
            CashBridgeError::Allocation(_) => "ALLOCATION_ERROR",
            CashBridgeError::InvalidCode => "INVALID_CODE",
            CashBridgeError::Unauthorized { .. } => "UNAUTHORIZED",
            CashBridgeError::NotFunded { .. } => "NOT_FUNDED",
            CashBridgeError::Expired(_) => "EXPIRED",
            CashBridgeError::LedgerTimeout { .. } => "LEDGER_TIMEOUT",
            CashBridgeError::Ledger(_) => "LEDGER_ERROR",
            CashBridgeError::Conflict { .. } => "CONFLICT",
            CashBridgeError::Disputed { .. } => "PENDING_MANUAL_REVIEW",
            CashBridgeError::EscrowNotFound(_) => "ESCROW_NOT_FOUND",
            CashBridgeError::Store(_) => "STORE_ERROR",
            CashBridgeError::RateUnavailable(_) => "RATE_UNAVAILABLE",
            CashBridgeError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for CashBridge operations.
pub type Result<T> = std::result::Result<T, CashBridgeError>;
