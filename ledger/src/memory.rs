//! In-memory reference ledger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cashbridge_common::{LedgerAddress, Satoshis, TxRef};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ConfirmationTarget, LedgerClient, SendReceipt};
use crate::error::{LedgerError, LedgerResult};
use crate::journal::JournalEntry;

/// Injected behaviour for one ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Return `LedgerError::Unavailable`.
    Fail,
    /// Never complete; the caller's timeout decides.
    Hang,
}

impl Fault {
    pub(crate) async fn apply(self, operation: &str) -> LedgerResult<()> {
        match self {
            Fault::None => Ok(()),
            Fault::Fail => {
                warn!(operation, "Injected ledger failure");
                Err(LedgerError::Unavailable(format!("injected failure in {operation}")))
            }
            Fault::Hang => {
                warn!(operation, "Injected ledger hang");
                std::future::pending::<LedgerResult<()>>().await
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FaultPlan {
    generate_address: Fault,
    get_balance: Fault,
    send: Fault,
    estimate_fee: Fault,
}

/// Ledger that keeps balances in memory and journals every movement.
///
/// Network fees are reported on the receipt but not debited, so an escrow
/// holding exactly its committed amount can always be released.
pub struct InMemoryLedger {
    balances: DashMap<LedgerAddress, Satoshis>,
    confirmations: DashMap<TxRef, u32>,
    fee_estimates: DashMap<ConfirmationTarget, Satoshis>,
    journal: Mutex<Vec<JournalEntry>>,
    faults: Mutex<FaultPlan>,
    send_delay: Mutex<Option<Duration>>,
    sends: AtomicU64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        let fee_estimates = DashMap::new();
        fee_estimates.insert(ConfirmationTarget::Fast, Satoshis::new(2_500));
        fee_estimates.insert(ConfirmationTarget::Economy, Satoshis::new(800));

        Self {
            balances: DashMap::new(),
            confirmations: DashMap::new(),
            fee_estimates,
            journal: Mutex::new(Vec::new()),
            faults: Mutex::new(FaultPlan::default()),
            send_delay: Mutex::new(None),
            sends: AtomicU64::new(0),
        }
    }

    /// Credit an address from outside the ledger, as a payer would.
    pub fn deposit(&self, address: &LedgerAddress, amount: Satoshis) -> TxRef {
        let tx_ref = Self::next_tx_ref();
        let balance_after = {
            let mut balance = self.balances.entry(address.clone()).or_insert(Satoshis::ZERO);
            *balance = Satoshis::new(balance.as_u64().saturating_add(amount.as_u64()));
            *balance
        };

        self.journal.lock().push(JournalEntry::credit(
            tx_ref.clone(),
            address.clone(),
            amount,
            balance_after,
        ));
        self.confirmations.insert(tx_ref.clone(), 1);

        debug!(address = %address, amount = %amount, "Deposit recorded");
        tx_ref
    }

    /// Current balance without going through the async port.
    pub fn balance_of(&self, address: &LedgerAddress) -> Satoshis {
        self.balances
            .get(address)
            .map(|b| *b)
            .unwrap_or(Satoshis::ZERO)
    }

    /// Set the confirmation count of a transaction.
    pub fn confirm(&self, tx_ref: &TxRef, confirmations: u32) {
        self.confirmations.insert(tx_ref.clone(), confirmations);
    }

    pub fn set_fee_estimate(&self, target: ConfirmationTarget, fee: Satoshis) {
        self.fee_estimates.insert(target, fee);
    }

    pub fn set_address_fault(&self, fault: Fault) {
        self.faults.lock().generate_address = fault;
    }

    pub fn set_balance_fault(&self, fault: Fault) {
        self.faults.lock().get_balance = fault;
    }

    pub fn set_send_fault(&self, fault: Fault) {
        self.faults.lock().send = fault;
    }

    pub fn set_fee_fault(&self, fault: Fault) {
        self.faults.lock().estimate_fee = fault;
    }

    /// Delay every send, widening race windows in concurrency tests.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock() = delay;
    }

    /// Number of sends that moved funds.
    pub fn send_count(&self) -> u64 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    /// Journal entries belonging to one transaction.
    pub fn entries_for(&self, tx_ref: &TxRef) -> Vec<JournalEntry> {
        self.journal
            .lock()
            .iter()
            .filter(|e| &e.tx_ref == tx_ref)
            .cloned()
            .collect()
    }

    fn next_tx_ref() -> TxRef {
        TxRef::new(Uuid::now_v7().simple().to_string())
    }

    fn fee_for(&self, target: ConfirmationTarget) -> Satoshis {
        self.fee_estimates
            .get(&target)
            .map(|f| *f)
            .unwrap_or(Satoshis::ZERO)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn generate_address(&self) -> LedgerResult<LedgerAddress> {
        let fault = self.faults.lock().generate_address;
        fault.apply("generate_address").await?;

        let address = LedgerAddress::new(format!("bcrt1q{}", Uuid::now_v7().simple()));
        self.balances.insert(address.clone(), Satoshis::ZERO);
        Ok(address)
    }

    async fn get_balance(&self, address: &LedgerAddress) -> LedgerResult<Satoshis> {
        let fault = self.faults.lock().get_balance;
        fault.apply("get_balance").await?;

        Ok(self.balance_of(address))
    }

    async fn send(
        &self,
        from: &LedgerAddress,
        to: &LedgerAddress,
        amount: Satoshis,
    ) -> LedgerResult<SendReceipt> {
        let fault = self.faults.lock().send;
        fault.apply("send").await?;

        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if amount.is_zero() {
            return Err(LedgerError::Rejected("amount must be positive".to_string()));
        }

        let tx_ref = Self::next_tx_ref();

        // Debit under the source entry guard; release it before touching the
        // destination so both keys never lock together.
        let from_after = {
            let mut balance = self
                .balances
                .get_mut(from)
                .ok_or_else(|| LedgerError::InsufficientFunds {
                    address: from.clone(),
                    available: Satoshis::ZERO,
                    requested: amount,
                })?;
            let remaining =
                balance
                    .checked_sub(amount)
                    .ok_or_else(|| LedgerError::InsufficientFunds {
                        address: from.clone(),
                        available: *balance,
                        requested: amount,
                    })?;
            *balance = remaining;
            remaining
        };

        let to_after = {
            let mut balance = self.balances.entry(to.clone()).or_insert(Satoshis::ZERO);
            *balance = Satoshis::new(balance.as_u64().saturating_add(amount.as_u64()));
            *balance
        };

        {
            let mut journal = self.journal.lock();
            journal.push(JournalEntry::debit(tx_ref.clone(), from.clone(), amount, from_after));
            journal.push(JournalEntry::credit(tx_ref.clone(), to.clone(), amount, to_after));
        }
        self.confirmations.insert(tx_ref.clone(), 0);
        self.sends.fetch_add(1, Ordering::SeqCst);

        let fee = self.fee_for(ConfirmationTarget::Economy);
        info!(
            tx_ref = %tx_ref,
            from = %from,
            to = %to,
            amount = %amount,
            "Ledger send broadcast"
        );

        Ok(SendReceipt { tx_ref, fee })
    }

    async fn get_confirmations(&self, tx_ref: &TxRef) -> LedgerResult<u32> {
        self.confirmations
            .get(tx_ref)
            .map(|c| *c)
            .ok_or_else(|| LedgerError::UnknownTransaction(tx_ref.clone()))
    }

    async fn estimate_fee(&self, target: ConfirmationTarget) -> LedgerResult<Satoshis> {
        let fault = self.faults.lock().estimate_fee;
        fault.apply("estimate_fee").await?;

        Ok(self.fee_for(target))
    }
}
