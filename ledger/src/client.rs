//! Bitcoin ledger port.

use async_trait::async_trait;
use cashbridge_common::{LedgerAddress, Satoshis, TxRef};
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;

/// Confirmation target for network fee estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationTarget {
    /// Next block or two.
    Fast,
    /// Within a few hours.
    Economy,
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub tx_ref: TxRef,
    /// Network fee paid by the sender.
    pub fee: Satoshis,
}

/// Access to the on-chain ledger.
///
/// Implementations must not retry a `send` internally: a send that fails
/// after broadcast would otherwise pay twice.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Allocate a fresh, single-use receive address.
    async fn generate_address(&self) -> LedgerResult<LedgerAddress>;

    /// Confirmed balance held at an address.
    async fn get_balance(&self, address: &LedgerAddress) -> LedgerResult<Satoshis>;

    /// Move `amount` from one address to another.
    async fn send(
        &self,
        from: &LedgerAddress,
        to: &LedgerAddress,
        amount: Satoshis,
    ) -> LedgerResult<SendReceipt>;

    async fn get_confirmations(&self, tx_ref: &TxRef) -> LedgerResult<u32>;

    /// Estimated network fee for a typical transfer at the given target.
    async fn estimate_fee(&self, target: ConfirmationTarget) -> LedgerResult<Satoshis>;
}
