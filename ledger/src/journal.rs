//! Journal of balance movements recorded by the in-memory ledger.

use cashbridge_common::{LedgerAddress, Satoshis, TxRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a journal entry relative to its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Funds left the address.
    Debit,
    /// Funds arrived at the address.
    Credit,
}

/// A single balance movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    /// Transaction this movement belongs to; deposits carry their own ref.
    pub tx_ref: TxRef,
    pub address: LedgerAddress,
    pub entry_type: EntryType,
    pub amount: Satoshis,
    pub balance_after: Satoshis,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn debit(tx_ref: TxRef, address: LedgerAddress, amount: Satoshis, balance_after: Satoshis) -> Self {
        Self::new(tx_ref, address, EntryType::Debit, amount, balance_after)
    }

    pub fn credit(tx_ref: TxRef, address: LedgerAddress, amount: Satoshis, balance_after: Satoshis) -> Self {
        Self::new(tx_ref, address, EntryType::Credit, amount, balance_after)
    }

    fn new(
        tx_ref: TxRef,
        address: LedgerAddress,
        entry_type: EntryType,
        amount: Satoshis,
        balance_after: Satoshis,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tx_ref,
            address,
            entry_type,
            amount,
            balance_after,
            created_at: Utc::now(),
        }
    }

    /// Signed amount from the address's point of view.
    pub fn signed_amount(&self) -> i128 {
        match self.entry_type {
            EntryType::Debit => -i128::from(self.amount.as_u64()),
            EntryType::Credit => i128::from(self.amount.as_u64()),
        }
    }
}

/// Verify that the entries of one transaction balance (debits == credits).
pub fn is_balanced(entries: &[JournalEntry]) -> bool {
    entries.iter().map(JournalEntry::signed_amount).sum::<i128>() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_entries_balance() {
        let tx = TxRef::new("tx-1");
        let entries = vec![
            JournalEntry::debit(tx.clone(), LedgerAddress::new("a"), Satoshis::new(500), Satoshis::new(0)),
            JournalEntry::credit(tx, LedgerAddress::new("b"), Satoshis::new(500), Satoshis::new(500)),
        ];

        assert!(is_balanced(&entries));
        assert!(!is_balanced(&entries[..1]));
    }
}
