//! Escrow coordinator: the per-exchange custody state machine.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use cashbridge_common::{
    CashBridgeError, Clock, Currency, EscrowId, EscrowRecord, EscrowStatus, ExchangeCode,
    InvalidTransition, Money, PartyId, Result, Satoshis, SettlingKind, SystemClock, Timestamp,
};
use cashbridge_ledger::{LedgerClient, LedgerResult, SendReceipt};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::code::{CodeSource, RandomCodes};
use crate::config::CoordinatorConfig;
use crate::directory::AgentDirectory;
use crate::metrics::{Metrics, SharedMetrics};
use crate::notification::{EscrowEvent, NotificationPort};
use crate::store::{RecordStore, StoreError};

/// What the sweep did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Expired,
    /// Expired while the escrow address held less than the full amount.
    ExpiredWithDeposit,
    Refunded,
    Disputed,
    /// Another worker changed the record first.
    Conflict,
    /// Left untouched for a later sweep.
    Skipped,
}

/// Counts from one expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub refunded: usize,
    pub disputed: usize,
    pub conflicts: usize,
    pub skipped: usize,
    /// Expired escrows left holding a partial deposit that needs an operator.
    pub stranded_deposits: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: SweepOutcome) {
        self.examined += 1;
        match outcome {
            SweepOutcome::Expired => self.expired += 1,
            SweepOutcome::ExpiredWithDeposit => {
                self.expired += 1;
                self.stranded_deposits += 1;
            }
            SweepOutcome::Refunded => self.refunded += 1,
            SweepOutcome::Disputed => self.disputed += 1,
            SweepOutcome::Conflict => self.conflicts += 1,
            SweepOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Owns the escrow lifecycle.
///
/// Every state change is a conditional write on the status and revision that
/// were read, and every fund movement out of an escrow address is preceded by
/// a persisted settling claim. A worker that loses either race stops with
/// [`CashBridgeError::Conflict`] before touching the ledger.
pub struct EscrowCoordinator {
    config: CoordinatorConfig,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn RecordStore>,
    notifier: Arc<dyn NotificationPort>,
    directory: Arc<dyn AgentDirectory>,
    codes: Arc<dyn CodeSource>,
    clock: Arc<dyn Clock>,
    metrics: SharedMetrics,
}

impl EscrowCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn NotificationPort>,
        directory: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            config,
            ledger,
            store,
            notifier,
            directory,
            codes: Arc::new(RandomCodes),
            clock: Arc::new(SystemClock),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_code_source(mut self, codes: Arc<dyn CodeSource>) -> Self {
        self.codes = codes;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Open a pending escrow between a requester and an agent.
    #[instrument(skip_all, fields(requester = %requester_id, agent = %agent_id, amount = %bitcoin_amount))]
    pub async fn create_escrow(
        &self,
        requester_id: PartyId,
        agent_id: PartyId,
        bitcoin_amount: Satoshis,
        local_amount: Decimal,
        currency: Currency,
    ) -> Result<EscrowRecord> {
        if !requester_id.is_valid() {
            return Err(CashBridgeError::validation("requester_id", "malformed party id"));
        }
        if bitcoin_amount.is_zero() {
            return Err(CashBridgeError::validation(
                "bitcoin_amount",
                "bitcoin amount must be greater than zero",
            ));
        }
        if local_amount <= Decimal::ZERO {
            return Err(CashBridgeError::validation(
                "local_amount",
                "local amount must be greater than zero",
            ));
        }

        let agent = self.directory.agent(&agent_id).await?.ok_or_else(|| {
            CashBridgeError::validation("agent_id", format!("unknown agent {agent_id}"))
        })?;
        if !agent.active {
            return Err(CashBridgeError::validation(
                "agent_id",
                format!("agent {agent_id} is not active"),
            ));
        }

        let escrow_address = self
            .ledger_call("generate_address", self.ledger.generate_address())
            .await
            .map_err(|e| CashBridgeError::Allocation(e.to_string()))?;

        let now = self.clock.now();
        let local_amount = Money::new(local_amount, currency);
        let mut created = None;

        for attempt in 1..=self.config.code_attempts {
            let Some(code) = self.codes.next_code() else {
                break;
            };
            let candidate = EscrowRecord::new(
                requester_id.clone(),
                agent_id.clone(),
                bitcoin_amount,
                local_amount.clone(),
                escrow_address.clone(),
                code,
                now,
                self.config.escrow_ttl,
            );

            match self.store.insert(&candidate).await {
                Ok(()) => {
                    created = Some(candidate);
                    break;
                }
                Err(StoreError::CodeInUse(code)) => {
                    warn!(attempt, code = %code, "Exchange code collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let record = created.ok_or_else(|| {
            CashBridgeError::Allocation("could not allocate a unique exchange code".to_string())
        })?;

        self.metrics.escrow_created();
        info!(
            escrow_id = %record.id,
            address = %record.escrow_address,
            expires_at = %record.expires_at,
            "Escrow created"
        );
        self.notify(&record.agent_id, EscrowEvent::EscrowCreated, &record)
            .await;

        Ok(record)
    }

    /// Poll the escrow address and mark the record funded once the full
    /// amount has arrived. Returns whether the record is funded afterwards.
    #[instrument(skip_all, fields(escrow_id = %escrow_id))]
    pub async fn check_funding(&self, escrow_id: EscrowId) -> Result<bool> {
        let record = self.load(escrow_id).await?;
        if record.status != EscrowStatus::Pending {
            return Ok(record.status == EscrowStatus::Funded);
        }

        let balance = self
            .ledger_call("get_balance", self.ledger.get_balance(&record.escrow_address))
            .await?;
        if balance < record.bitcoin_amount {
            debug!(balance = %balance, required = %record.bitcoin_amount, "Escrow not yet funded");
            return Ok(false);
        }

        if self.mark_funded(&record, self.clock.now()).await?.is_some() {
            return Ok(true);
        }

        // Lost the write; fine if another worker saw the same deposit.
        let current = self.load(escrow_id).await?;
        if current.status == EscrowStatus::Funded {
            Ok(true)
        } else {
            Err(CashBridgeError::Conflict {
                escrow_id,
                expected: EscrowStatus::Pending,
            })
        }
    }

    /// Release a funded escrow to the agent presenting its code.
    #[instrument(skip_all, fields(agent = %agent_id))]
    pub async fn verify_and_complete(
        &self,
        agent_id: &PartyId,
        exchange_code: &str,
    ) -> Result<EscrowRecord> {
        let code = ExchangeCode::parse(exchange_code).ok_or(CashBridgeError::InvalidCode)?;
        let record = self
            .store
            .find_by_code(&code)
            .await?
            .ok_or(CashBridgeError::InvalidCode)?;

        if &record.agent_id != agent_id {
            warn!(escrow_id = %record.id, "Code presented by unassigned agent");
            return Err(CashBridgeError::Unauthorized {
                agent_id: agent_id.clone(),
                escrow_id: record.id,
            });
        }
        if record.status != EscrowStatus::Funded {
            return Err(CashBridgeError::NotFunded {
                escrow_id: record.id,
                status: record.status,
            });
        }
        let now = self.clock.now();
        if record.is_expired_at(now) {
            return Err(CashBridgeError::Expired(record.id));
        }
        if record.is_settling() {
            self.metrics.cas_conflict();
            return Err(CashBridgeError::Conflict {
                escrow_id: record.id,
                expected: EscrowStatus::Funded,
            });
        }

        let agent = self.directory.agent(agent_id).await?.ok_or_else(|| {
            CashBridgeError::validation("agent_id", format!("unknown agent {agent_id}"))
        })?;

        let claimed = Self::advance(&record, |r| r.claim(SettlingKind::Release, now))?;
        if !self.persist(&claimed, &record).await? {
            return Err(CashBridgeError::Conflict {
                escrow_id: record.id,
                expected: EscrowStatus::Funded,
            });
        }

        // Point of no return: from here every failure escalates.
        let sent = self
            .ledger_call(
                "send",
                self.ledger.send(
                    &claimed.escrow_address,
                    &agent.settlement_address,
                    claimed.bitcoin_amount,
                ),
            )
            .await;

        match sent {
            Ok(receipt) => self.finish_release(claimed, receipt).await,
            Err(e) => Err(self
                .escalate(&claimed, format!("release transfer failed: {e}"))
                .await),
        }
    }

    /// Close out every expired escrow and every abandoned settling claim.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: Timestamp) -> Result<SweepReport> {
        let mut candidates = BTreeMap::new();
        for record in self.store.find_expired(now).await? {
            candidates.insert(record.id, record);
        }
        for record in self
            .store
            .find_stale_claims(now - self.config.stale_claim_after)
            .await?
        {
            candidates.insert(record.id, record);
        }

        let mut report = SweepReport::default();
        for (escrow_id, record) in candidates {
            let outcome = match self.sweep_one(record, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(escrow_id = %escrow_id, error = %e, "Sweep left escrow for the next run");
                    SweepOutcome::Skipped
                }
            };
            report.record(outcome);
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                refunded = report.refunded,
                disputed = report.disputed,
                conflicts = report.conflicts,
                skipped = report.skipped,
                stranded_deposits = report.stranded_deposits,
                "Expiry sweep finished"
            );
        }

        Ok(report)
    }

    pub async fn get_escrow(&self, escrow_id: EscrowId) -> Result<EscrowRecord> {
        self.load(escrow_id).await
    }

    /// Look up the escrow holding a code.
    pub async fn find_by_code(&self, exchange_code: &str) -> Result<Option<EscrowRecord>> {
        let code = ExchangeCode::parse(exchange_code).ok_or(CashBridgeError::InvalidCode)?;
        Ok(self.store.find_by_code(&code).await?)
    }

    async fn finish_release(
        &self,
        claimed: EscrowRecord,
        receipt: SendReceipt,
    ) -> Result<EscrowRecord> {
        let now = self.clock.now();
        let completed = Self::advance(&claimed, |r| {
            r.transition_to(EscrowStatus::Completed, now)?;
            r.settlement_ref = Some(receipt.tx_ref.clone());
            Ok(())
        })?;

        // Funds have moved. If the record cannot be closed the claim stays in
        // place and the sweep will escalate it once stale.
        match self.persist(&completed, &claimed).await {
            Ok(true) => {}
            Ok(false) => {
                error!(escrow_id = %claimed.id, tx_ref = %receipt.tx_ref, "Release sent but record changed underneath");
                return Err(self.release_unrecorded(&claimed, &receipt));
            }
            Err(e) => {
                error!(escrow_id = %claimed.id, tx_ref = %receipt.tx_ref, error = %e, "Release sent but record not updated");
                return Err(self.release_unrecorded(&claimed, &receipt));
            }
        }

        self.metrics.escrow_completed();
        info!(
            escrow_id = %completed.id,
            tx_ref = %receipt.tx_ref,
            network_fee = %receipt.fee,
            "Escrow released to agent"
        );
        self.notify_parties(EscrowEvent::EscrowCompleted, &completed)
            .await;

        Ok(completed)
    }

    fn release_unrecorded(&self, claimed: &EscrowRecord, receipt: &SendReceipt) -> CashBridgeError {
        CashBridgeError::Disputed {
            escrow_id: claimed.id,
            reason: format!(
                "release sent as {} but the record could not be updated",
                receipt.tx_ref
            ),
        }
    }

    async fn sweep_one(&self, record: EscrowRecord, now: Timestamp) -> Result<SweepOutcome> {
        match record.status {
            EscrowStatus::Pending if record.is_expired_at(now) => {
                self.expire_pending(record, now).await
            }
            EscrowStatus::Funded => self.sweep_funded(record, now).await,
            _ => Ok(SweepOutcome::Skipped),
        }
    }

    async fn expire_pending(&self, record: EscrowRecord, now: Timestamp) -> Result<SweepOutcome> {
        let balance = self
            .ledger_call("get_balance", self.ledger.get_balance(&record.escrow_address))
            .await?;

        if balance >= record.bitcoin_amount {
            info!(escrow_id = %record.id, "Escrow funded after expiry, refunding");
            return match self.mark_funded(&record, now).await? {
                Some(funded) => self.refund(funded, now).await,
                None => Ok(SweepOutcome::Conflict),
            };
        }

        let expired = Self::advance(&record, |r| r.transition_to(EscrowStatus::Expired, now))?;
        if !self.persist(&expired, &record).await? {
            return Ok(SweepOutcome::Conflict);
        }

        self.metrics.escrow_expired();
        let mut payload = Self::payload(&expired);
        let outcome = if balance.is_zero() {
            info!(escrow_id = %expired.id, "Escrow expired unfunded");
            SweepOutcome::Expired
        } else {
            // Nothing refunds a short deposit automatically
            error!(
                escrow_id = %expired.id,
                escrow_address = %expired.escrow_address,
                balance = %balance,
                required = %expired.bitcoin_amount,
                "Escrow expired holding a partial deposit, manual recovery required"
            );
            payload["stranded_deposit_sats"] = json!(balance.as_u64());
            SweepOutcome::ExpiredWithDeposit
        };
        self.notify_parties_with(EscrowEvent::EscrowExpired, &expired, payload)
            .await;

        Ok(outcome)
    }

    async fn sweep_funded(&self, record: EscrowRecord, now: Timestamp) -> Result<SweepOutcome> {
        if let Some(claim) = record.settling {
            if claim.claimed_at < now - self.config.stale_claim_after {
                let reason = format!(
                    "{} transfer outcome unknown: claim taken at {} was abandoned",
                    claim.kind.as_str(),
                    claim.claimed_at
                );
                return self.dispute_outcome(&record, &reason, now).await;
            }
            return Ok(SweepOutcome::Skipped);
        }

        if !record.is_expired_at(now) {
            return Ok(SweepOutcome::Skipped);
        }

        self.refund(record, now).await
    }

    async fn refund(&self, record: EscrowRecord, now: Timestamp) -> Result<SweepOutcome> {
        let Some(payout) = self.directory.payout_address(&record.requester_id).await? else {
            return self
                .dispute_outcome(&record, "no payout address on file for requester", now)
                .await;
        };

        let claimed = Self::advance(&record, |r| r.claim(SettlingKind::Refund, now))?;
        if !self.persist(&claimed, &record).await? {
            return Ok(SweepOutcome::Conflict);
        }

        let sent = self
            .ledger_call(
                "send",
                self.ledger
                    .send(&claimed.escrow_address, &payout, claimed.bitcoin_amount),
            )
            .await;

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) => {
                let reason = format!("refund transfer failed: {e}");
                return self.dispute_outcome(&claimed, &reason, now).await;
            }
        };

        let refunded = Self::advance(&claimed, |r| {
            r.transition_to(EscrowStatus::Refunded, now)?;
            r.settlement_ref = Some(receipt.tx_ref.clone());
            Ok(())
        })?;
        if !self.persist(&refunded, &claimed).await? {
            error!(escrow_id = %claimed.id, tx_ref = %receipt.tx_ref, "Refund sent but record changed underneath");
            return Ok(SweepOutcome::Conflict);
        }

        self.metrics.escrow_refunded();
        info!(escrow_id = %refunded.id, tx_ref = %receipt.tx_ref, "Escrow refunded to requester");
        self.notify_parties(EscrowEvent::EscrowRefunded, &refunded)
            .await;

        Ok(SweepOutcome::Refunded)
    }

    async fn dispute_outcome(
        &self,
        prior: &EscrowRecord,
        reason: &str,
        at: Timestamp,
    ) -> Result<SweepOutcome> {
        Ok(if self.move_to_disputed(prior, reason, at).await? {
            SweepOutcome::Disputed
        } else {
            SweepOutcome::Conflict
        })
    }

    /// Record a failed fund movement and build the caller's error.
    async fn escalate(&self, claimed: &EscrowRecord, reason: String) -> CashBridgeError {
        match self
            .move_to_disputed(claimed, &reason, self.clock.now())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(escrow_id = %claimed.id, "Dispute write lost a race"),
            Err(e) => {
                error!(escrow_id = %claimed.id, error = %e, "Could not record dispute; claim left for the sweep")
            }
        }

        CashBridgeError::Disputed {
            escrow_id: claimed.id,
            reason,
        }
    }

    async fn move_to_disputed(
        &self,
        prior: &EscrowRecord,
        reason: &str,
        at: Timestamp,
    ) -> Result<bool> {
        let disputed = Self::advance(prior, |r| r.dispute(reason, at))?;
        if !self.persist(&disputed, prior).await? {
            return Ok(false);
        }

        self.metrics.escrow_disputed();
        warn!(escrow_id = %disputed.id, reason, "Escrow moved to manual review");
        self.notify_parties(EscrowEvent::EscrowDisputed, &disputed)
            .await;

        Ok(true)
    }

    async fn mark_funded(
        &self,
        record: &EscrowRecord,
        at: Timestamp,
    ) -> Result<Option<EscrowRecord>> {
        let funded = Self::advance(record, |r| r.transition_to(EscrowStatus::Funded, at))?;
        if !self.persist(&funded, record).await? {
            return Ok(None);
        }

        self.metrics.escrow_funded();
        info!(escrow_id = %funded.id, "Escrow funded");
        self.notify(&funded.agent_id, EscrowEvent::EscrowFunded, &funded)
            .await;

        Ok(Some(funded))
    }

    async fn load(&self, escrow_id: EscrowId) -> Result<EscrowRecord> {
        self.store
            .find_by_id(escrow_id)
            .await?
            .ok_or(CashBridgeError::EscrowNotFound(escrow_id))
    }

    /// Copy `prior`, apply a change and bump the revision.
    fn advance(
        prior: &EscrowRecord,
        change: impl FnOnce(&mut EscrowRecord) -> std::result::Result<(), InvalidTransition>,
    ) -> Result<EscrowRecord> {
        let mut next = prior.clone();
        change(&mut next).map_err(|e| {
            warn!(escrow_id = %prior.id, error = %e, "Rejected state change");
            CashBridgeError::Conflict {
                escrow_id: prior.id,
                expected: prior.status,
            }
        })?;
        next.revision = prior.revision + 1;
        Ok(next)
    }

    /// Conditional write against the status and revision of `prior`.
    async fn persist(&self, next: &EscrowRecord, prior: &EscrowRecord) -> Result<bool> {
        let saved = self.store.save(next, prior.status, prior.revision).await?;
        if !saved {
            self.metrics.cas_conflict();
            debug!(escrow_id = %prior.id, expected = %prior.status, "Lost conditional write");
        }
        Ok(saved)
    }

    async fn ledger_call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = LedgerResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.ledger_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CashBridgeError::Ledger(e.to_string())),
            Err(_) => {
                self.metrics.ledger_timeout();
                warn!(operation, "Ledger call timed out");
                Err(CashBridgeError::LedgerTimeout {
                    operation: operation.to_string(),
                })
            }
        }
    }

    async fn notify_parties(&self, event: EscrowEvent, record: &EscrowRecord) {
        self.notify_parties_with(event, record, Self::payload(record))
            .await;
    }

    async fn notify_parties_with(
        &self,
        event: EscrowEvent,
        record: &EscrowRecord,
        payload: serde_json::Value,
    ) {
        self.deliver(&record.requester_id, event, payload.clone())
            .await;
        self.deliver(&record.agent_id, event, payload).await;
    }

    async fn notify(&self, party: &PartyId, event: EscrowEvent, record: &EscrowRecord) {
        self.deliver(party, event, Self::payload(record)).await;
    }

    fn payload(record: &EscrowRecord) -> serde_json::Value {
        json!({
            "escrow_id": record.id.to_string(),
            "status": record.status.as_str(),
            "bitcoin_amount_sats": record.bitcoin_amount.as_u64(),
            "local_amount": record.local_amount.value.to_string(),
            "currency": record.currency().code(),
            "expires_at": record.expires_at.to_rfc3339(),
            "dispute_reason": record.dispute_reason,
        })
    }

    async fn deliver(&self, party: &PartyId, event: EscrowEvent, payload: serde_json::Value) {
        let delivery = tokio::time::timeout(
            self.config.notification_timeout,
            self.notifier.notify(party, event, payload),
        )
        .await;

        match delivery {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.notification_failed();
                warn!(party = %party, event = event.as_str(), error = %e, "Notification failed");
            }
            Err(_) => {
                self.metrics.notification_failed();
                warn!(party = %party, event = event.as_str(), "Notification timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::SequenceCodes;
    use crate::notification::{ChannelNotifier, Notification};
    use crate::directory::InMemoryDirectory;
    use crate::store::InMemoryRecordStore;
    use cashbridge_common::{Agent, LedgerAddress, ManualClock};
    use cashbridge_ledger::{Fault, InMemoryLedger};
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;

    const AMOUNT: Satoshis = Satoshis::new(250_000);

    fn agent_id() -> PartyId {
        PartyId::new("agent_1")
    }

    fn requester_id() -> PartyId {
        PartyId::new("requester_1")
    }

    fn agent_wallet() -> LedgerAddress {
        LedgerAddress::new("agent-wallet")
    }

    fn requester_wallet() -> LedgerAddress {
        LedgerAddress::new("requester-wallet")
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        store: Arc<InMemoryRecordStore>,
        notifier: Arc<ChannelNotifier>,
        directory: Arc<InMemoryDirectory>,
        clock: Arc<ManualClock>,
        coordinator: Arc<EscrowCoordinator>,
        agent_rx: mpsc::Receiver<Notification>,
        requester_rx: mpsc::Receiver<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_codes(SequenceCodes::new(100_001..100_100))
        }

        fn with_codes(codes: SequenceCodes) -> Self {
            let config = CoordinatorConfig {
                ledger_timeout: std::time::Duration::from_millis(100),
                notification_timeout: std::time::Duration::from_millis(100),
                ..CoordinatorConfig::default()
            };

            let ledger = Arc::new(InMemoryLedger::new());
            let store = Arc::new(InMemoryRecordStore::new());
            let notifier = Arc::new(ChannelNotifier::new());
            let directory = Arc::new(InMemoryDirectory::new());
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 6, 11, 9, 0, 0).unwrap(),
            ));

            directory.add_agent(Agent::new(agent_id(), agent_wallet()));
            directory.set_payout_address(requester_id(), requester_wallet());
            let agent_rx = notifier.subscribe(agent_id());
            let requester_rx = notifier.subscribe(requester_id());

            let coordinator = EscrowCoordinator::new(
                config,
                ledger.clone(),
                store.clone(),
                notifier.clone(),
                directory.clone(),
            )
            .with_clock(clock.clone())
            .with_code_source(Arc::new(codes));

            Self {
                ledger,
                store,
                notifier,
                directory,
                clock,
                coordinator: Arc::new(coordinator),
                agent_rx,
                requester_rx,
            }
        }

        async fn open(&self) -> EscrowRecord {
            self.open_for(requester_id()).await
        }

        async fn open_for(&self, requester: PartyId) -> EscrowRecord {
            self.coordinator
                .create_escrow(requester, agent_id(), AMOUNT, dec!(95500), Currency::kes())
                .await
                .unwrap()
        }

        async fn open_funded(&self) -> EscrowRecord {
            let record = self.open().await;
            self.ledger.deposit(&record.escrow_address, AMOUNT);
            assert!(self.coordinator.check_funding(record.id).await.unwrap());
            self.coordinator.get_escrow(record.id).await.unwrap()
        }

        /// Take a settling claim directly through the store.
        async fn claim(&self, record: &EscrowRecord, kind: SettlingKind) -> EscrowRecord {
            let claimed =
                EscrowCoordinator::advance(record, |r| r.claim(kind, self.clock.now())).unwrap();
            assert!(self
                .store
                .save(&claimed, record.status, record.revision)
                .await
                .unwrap());
            claimed
        }

        fn expiry_of(&self, record: &EscrowRecord) -> Timestamp {
            record.expires_at + Duration::seconds(1)
        }
    }

    #[tokio::test]
    async fn test_create_escrow() {
        let mut h = Harness::new();
        let record = h.open().await;

        assert_eq!(record.status, EscrowStatus::Pending);
        assert_eq!(record.exchange_code.as_str(), "BTC-100001");
        assert_eq!(record.expires_at, h.clock.now() + Duration::hours(24));
        assert_eq!(record.local_amount, Money::new(dec!(95500), Currency::kes()));
        assert_eq!(record.revision, 0);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.coordinator.metrics().snapshot().escrows_created, 1);

        let note = h.agent_rx.try_recv().unwrap();
        assert_eq!(note.event, EscrowEvent::EscrowCreated);
        assert_eq!(note.payload["escrow_id"], record.id.to_string());
        assert!(note.payload.get("exchange_code").is_none());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = Harness::new();

        let zero = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), Satoshis::ZERO, dec!(10), Currency::kes())
            .await;
        assert!(matches!(zero, Err(CashBridgeError::Validation { .. })));

        let negative = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), AMOUNT, dec!(-1), Currency::kes())
            .await;
        assert!(matches!(negative, Err(CashBridgeError::Validation { .. })));

        let unknown = h
            .coordinator
            .create_escrow(
                requester_id(),
                PartyId::new("agent_9"),
                AMOUNT,
                dec!(10),
                Currency::kes(),
            )
            .await;
        assert!(matches!(unknown, Err(CashBridgeError::Validation { .. })));

        h.directory.set_active(&agent_id(), false);
        let inactive = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), AMOUNT, dec!(10), Currency::kes())
            .await;
        assert!(matches!(inactive, Err(CashBridgeError::Validation { .. })));

        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_address_allocation_failure() {
        let h = Harness::new();

        h.ledger.set_address_fault(Fault::Fail);
        let failed = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), AMOUNT, dec!(10), Currency::kes())
            .await;
        assert!(matches!(failed, Err(CashBridgeError::Allocation(_))));

        h.ledger.set_address_fault(Fault::Hang);
        let hung = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), AMOUNT, dec!(10), Currency::kes())
            .await;
        assert!(matches!(hung, Err(CashBridgeError::Allocation(_))));

        assert!(h.store.is_empty());
        assert_eq!(h.coordinator.metrics().snapshot().ledger_timeouts, 1);
    }

    #[tokio::test]
    async fn test_code_collision_regenerates() {
        let h = Harness::with_codes(SequenceCodes::new([7, 7, 8]));

        let first = h.open().await;
        let second = h.open().await;

        assert_eq!(first.exchange_code.as_str(), "BTC-000007");
        assert_eq!(second.exchange_code.as_str(), "BTC-000008");
    }

    #[tokio::test]
    async fn test_code_exhaustion_is_allocation_error() {
        let h = Harness::with_codes(SequenceCodes::new([5, 5]));
        h.open().await;

        let result = h
            .coordinator
            .create_escrow(requester_id(), agent_id(), AMOUNT, dec!(10), Currency::kes())
            .await;
        assert!(matches!(result, Err(CashBridgeError::Allocation(_))));
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block() {
        let h = Harness::new();
        h.notifier.unsubscribe(&agent_id());

        let record = h.open().await;
        assert_eq!(record.status, EscrowStatus::Pending);
        assert_eq!(h.coordinator.metrics().snapshot().notification_failures, 1);
    }

    #[tokio::test]
    async fn test_check_funding() {
        let mut h = Harness::new();
        let record = h.open().await;
        h.agent_rx.try_recv().unwrap();

        assert!(!h.coordinator.check_funding(record.id).await.unwrap());

        // Partial deposit does not fund
        h.ledger.deposit(&record.escrow_address, Satoshis::new(100_000));
        assert!(!h.coordinator.check_funding(record.id).await.unwrap());

        h.ledger.deposit(&record.escrow_address, Satoshis::new(150_000));
        assert!(h.coordinator.check_funding(record.id).await.unwrap());

        let funded = h.coordinator.get_escrow(record.id).await.unwrap();
        assert_eq!(funded.status, EscrowStatus::Funded);
        assert_eq!(funded.funded_at, Some(h.clock.now()));
        assert_eq!(funded.revision, 1);
        assert_eq!(h.agent_rx.try_recv().unwrap().event, EscrowEvent::EscrowFunded);
    }

    #[tokio::test]
    async fn test_check_funding_is_idempotent() {
        let h = Harness::new();
        let funded = h.open_funded().await;

        h.clock.advance(Duration::minutes(5));
        assert!(h.coordinator.check_funding(funded.id).await.unwrap());

        let again = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(again.revision, funded.revision);
        assert_eq!(again.funded_at, funded.funded_at);
        assert_eq!(h.coordinator.metrics().snapshot().escrows_funded, 1);
    }

    #[tokio::test]
    async fn test_check_funding_ledger_failure_is_retryable() {
        let h = Harness::new();
        let record = h.open().await;
        h.ledger.deposit(&record.escrow_address, AMOUNT);

        h.ledger.set_balance_fault(Fault::Hang);
        let err = h.coordinator.check_funding(record.id).await.unwrap_err();
        assert!(matches!(err, CashBridgeError::LedgerTimeout { .. }));
        assert!(err.is_retryable());

        h.ledger.set_balance_fault(Fault::None);
        assert!(h.coordinator.check_funding(record.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_funding_unknown_escrow() {
        let h = Harness::new();
        let result = h.coordinator.check_funding(EscrowId::new()).await;
        assert!(matches!(result, Err(CashBridgeError::EscrowNotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_and_complete() {
        let mut h = Harness::new();
        let record = h.open_funded().await;

        let code = record.exchange_code.as_str().to_lowercase();
        let completed = h
            .coordinator
            .verify_and_complete(&agent_id(), &code)
            .await
            .unwrap();

        assert_eq!(completed.status, EscrowStatus::Completed);
        assert!(completed.settlement_ref.is_some());
        assert_eq!(completed.completed_at, Some(h.clock.now()));
        assert!(completed.settling.is_none());
        assert_eq!(h.ledger.balance_of(&agent_wallet()), AMOUNT);
        assert_eq!(h.ledger.balance_of(&record.escrow_address), Satoshis::ZERO);
        assert_eq!(h.requester_rx.try_recv().unwrap().event, EscrowEvent::EscrowCompleted);

        // The code now resolves to a completed escrow
        let replay = h
            .coordinator
            .verify_and_complete(&agent_id(), record.exchange_code.as_str())
            .await;
        assert!(matches!(replay, Err(CashBridgeError::NotFunded { .. })));
        assert_eq!(h.ledger.send_count(), 1);
    }

    #[tokio::test]
    async fn test_verify_rejections() {
        let h = Harness::new();
        let pending = h.open().await;

        let malformed = h.coordinator.verify_and_complete(&agent_id(), "BTC-12").await;
        assert!(matches!(malformed, Err(CashBridgeError::InvalidCode)));

        let unknown = h
            .coordinator
            .verify_and_complete(&agent_id(), "BTC-999999")
            .await;
        assert!(matches!(unknown, Err(CashBridgeError::InvalidCode)));

        let stranger = h
            .coordinator
            .verify_and_complete(&PartyId::new("agent_2"), pending.exchange_code.as_str())
            .await;
        assert!(matches!(stranger, Err(CashBridgeError::Unauthorized { .. })));

        let unfunded = h
            .coordinator
            .verify_and_complete(&agent_id(), pending.exchange_code.as_str())
            .await;
        assert!(matches!(unfunded, Err(CashBridgeError::NotFunded { .. })));

        assert_eq!(h.ledger.send_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_after_expiry() {
        let h = Harness::new();
        let funded = h.open_funded().await;

        h.clock.advance(Duration::hours(25));
        let result = h
            .coordinator
            .verify_and_complete(&agent_id(), funded.exchange_code.as_str())
            .await;
        assert!(matches!(result, Err(CashBridgeError::Expired(_))));
        assert_eq!(h.ledger.send_count(), 0);
    }

    #[tokio::test]
    async fn test_verify_with_existing_claim_is_conflict() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.claim(&funded, SettlingKind::Refund).await;

        let result = h
            .coordinator
            .verify_and_complete(&agent_id(), funded.exchange_code.as_str())
            .await;
        assert!(matches!(result, Err(CashBridgeError::Conflict { .. })));
        assert_eq!(h.ledger.send_count(), 0);
    }

    #[tokio::test]
    async fn test_release_failure_escalates() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.ledger.set_send_fault(Fault::Fail);

        let err = h
            .coordinator
            .verify_and_complete(&agent_id(), funded.exchange_code.as_str())
            .await
            .unwrap_err();
        assert!(err.requires_manual_review());

        let record = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Disputed);
        assert!(record
            .dispute_reason
            .unwrap()
            .starts_with("release transfer failed"));
        assert_eq!(h.ledger.balance_of(&agent_wallet()), Satoshis::ZERO);
        assert_eq!(h.coordinator.metrics().snapshot().escrows_disputed, 1);
    }

    #[tokio::test]
    async fn test_release_timeout_escalates() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.ledger.set_send_fault(Fault::Hang);

        let result = h
            .coordinator
            .verify_and_complete(&agent_id(), funded.exchange_code.as_str())
            .await;
        assert!(matches!(result, Err(CashBridgeError::Disputed { .. })));

        let record = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Disputed);
        assert_eq!(h.coordinator.metrics().snapshot().ledger_timeouts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_verify_releases_once() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.ledger
            .set_send_delay(Some(std::time::Duration::from_millis(30)));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                let code = funded.exchange_code.as_str().to_string();
                tokio::spawn(async move {
                    coordinator.verify_and_complete(&agent_id(), &code).await
                })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(record) => {
                    assert_eq!(record.status, EscrowStatus::Completed);
                    completed += 1;
                }
                Err(e) => assert!(
                    matches!(
                        e,
                        CashBridgeError::Conflict { .. } | CashBridgeError::NotFunded { .. }
                    ),
                    "unexpected error: {e}"
                ),
            }
        }

        assert_eq!(completed, 1);
        assert_eq!(h.ledger.send_count(), 1);
        assert_eq!(h.ledger.balance_of(&agent_wallet()), AMOUNT);
    }

    #[tokio::test]
    async fn test_sweep_expires_unfunded() {
        let mut h = Harness::new();
        let record = h.open().await;

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.expired, 1);

        let expired = h.coordinator.get_escrow(record.id).await.unwrap();
        assert_eq!(expired.status, EscrowStatus::Expired);
        assert!(expired.resolved_at.is_some());
        assert_eq!(h.requester_rx.try_recv().unwrap().event, EscrowEvent::EscrowExpired);
    }

    #[tokio::test]
    async fn test_sweep_ignores_live_escrows() {
        let h = Harness::new();
        h.open().await;
        h.open_funded().await;

        let report = h.coordinator.sweep_expired(h.clock.now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_sweep_refunds_funded() {
        let h = Harness::new();
        let funded = h.open_funded().await;

        let report = h.coordinator.sweep_expired(h.expiry_of(&funded)).await.unwrap();
        assert_eq!(report.refunded, 1);

        let refunded = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert!(refunded.settlement_ref.is_some());
        assert_eq!(h.ledger.balance_of(&requester_wallet()), AMOUNT);
        assert_eq!(h.ledger.balance_of(&agent_wallet()), Satoshis::ZERO);
    }

    #[tokio::test]
    async fn test_sweep_refunds_late_funding() {
        let h = Harness::new();
        let record = h.open().await;
        h.ledger.deposit(&record.escrow_address, AMOUNT);

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.refunded, 1);

        let refunded = h.coordinator.get_escrow(record.id).await.unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert!(refunded.funded_at.is_some());
        assert_eq!(h.ledger.balance_of(&requester_wallet()), AMOUNT);
    }

    #[tokio::test]
    async fn test_sweep_flags_partial_deposit() {
        let mut h = Harness::new();
        let record = h.open().await;
        h.ledger.deposit(&record.escrow_address, Satoshis::new(100_000));

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.stranded_deposits, 1);
        assert_eq!(report.refunded, 0);

        let expired = h.coordinator.get_escrow(record.id).await.unwrap();
        assert_eq!(expired.status, EscrowStatus::Expired);
        assert_eq!(h.ledger.send_count(), 0);
        assert_eq!(h.ledger.balance_of(&record.escrow_address), Satoshis::new(100_000));

        let note = h.requester_rx.try_recv().unwrap();
        assert_eq!(note.event, EscrowEvent::EscrowExpired);
        assert_eq!(note.payload["stranded_deposit_sats"], 100_000);
    }

    #[tokio::test]
    async fn test_sweep_unfunded_has_no_stranded_deposit() {
        let mut h = Harness::new();
        let record = h.open().await;

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.stranded_deposits, 0);
        assert!(h.requester_rx.try_recv().unwrap().payload.get("stranded_deposit_sats").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweeps_refund_once() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        let at = h.expiry_of(&funded);
        h.ledger
            .set_send_delay(Some(std::time::Duration::from_millis(30)));

        // Independent workers over the same store and ledger
        let workers: Vec<Arc<EscrowCoordinator>> = (0..6)
            .map(|_| {
                Arc::new(
                    EscrowCoordinator::new(
                        CoordinatorConfig::default(),
                        h.ledger.clone(),
                        h.store.clone(),
                        h.notifier.clone(),
                        h.directory.clone(),
                    )
                    .with_clock(h.clock.clone()),
                )
            })
            .collect();

        let tasks: Vec<_> = workers
            .into_iter()
            .map(|worker| tokio::spawn(async move { worker.sweep_expired(at).await }))
            .collect();

        let mut refunded = 0;
        let mut disputed = 0;
        for task in tasks {
            let report = task.await.unwrap().unwrap();
            refunded += report.refunded;
            disputed += report.disputed;
        }

        assert_eq!(refunded, 1);
        assert_eq!(disputed, 0);
        assert_eq!(h.ledger.send_count(), 1);
        assert_eq!(h.ledger.balance_of(&requester_wallet()), AMOUNT);
        assert_eq!(
            h.coordinator.get_escrow(funded.id).await.unwrap().status,
            EscrowStatus::Refunded
        );
    }

    #[tokio::test]
    async fn test_sweep_refund_failure_disputes() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.ledger.set_send_fault(Fault::Fail);

        let report = h.coordinator.sweep_expired(h.expiry_of(&funded)).await.unwrap();
        assert_eq!(report.disputed, 1);

        let record = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Disputed);
        assert!(record
            .dispute_reason
            .unwrap()
            .starts_with("refund transfer failed"));
    }

    #[tokio::test]
    async fn test_sweep_without_payout_address_disputes() {
        let h = Harness::new();
        let record = h.open_for(PartyId::new("requester_2")).await;
        h.ledger.deposit(&record.escrow_address, AMOUNT);
        assert!(h.coordinator.check_funding(record.id).await.unwrap());

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.disputed, 1);
        assert_eq!(h.ledger.send_count(), 0);

        let disputed = h.coordinator.get_escrow(record.id).await.unwrap();
        assert_eq!(disputed.status, EscrowStatus::Disputed);
        assert_eq!(h.ledger.balance_of(&record.escrow_address), AMOUNT);
    }

    #[tokio::test]
    async fn test_sweep_never_reprocesses_terminal_records() {
        let h = Harness::new();
        let pending = h.open().await;
        let funded = h.open_funded().await;
        let at = h.expiry_of(&funded);

        let first = h.coordinator.sweep_expired(at).await.unwrap();
        assert_eq!(first.expired, 1);
        assert_eq!(first.refunded, 1);

        let second = h.coordinator.sweep_expired(at).await.unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(h.ledger.send_count(), 1);
        assert_eq!(
            h.coordinator.get_escrow(pending.id).await.unwrap().status,
            EscrowStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_sweep_disputes_stale_claim() {
        let h = Harness::new();
        let funded = h.open_funded().await;
        h.claim(&funded, SettlingKind::Release).await;

        // Stale claims are swept before the escrow itself expires
        let at = h.clock.now() + Duration::minutes(20);
        let report = h.coordinator.sweep_expired(at).await.unwrap();
        assert_eq!(report.disputed, 1);

        let record = h.coordinator.get_escrow(funded.id).await.unwrap();
        assert_eq!(record.status, EscrowStatus::Disputed);
        assert!(record.dispute_reason.unwrap().contains("outcome unknown"));
        assert_eq!(h.ledger.send_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_fresh_claim() {
        let h = Harness::new();
        let funded = h.open_funded().await;

        h.clock.set(funded.expires_at);
        h.claim(&funded, SettlingKind::Release).await;

        let report = h
            .coordinator
            .sweep_expired(funded.expires_at + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            h.coordinator.get_escrow(funded.id).await.unwrap().status,
            EscrowStatus::Funded
        );
    }

    #[tokio::test]
    async fn test_sweep_skips_on_balance_failure() {
        let h = Harness::new();
        let record = h.open().await;
        h.ledger.set_balance_fault(Fault::Fail);

        let report = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(
            h.coordinator.get_escrow(record.id).await.unwrap().status,
            EscrowStatus::Pending
        );

        h.ledger.set_balance_fault(Fault::None);
        let retry = h.coordinator.sweep_expired(h.expiry_of(&record)).await.unwrap();
        assert_eq!(retry.expired, 1);
    }

    #[tokio::test]
    async fn test_find_by_code() {
        let h = Harness::new();
        let record = h.open().await;

        let found = h
            .coordinator
            .find_by_code(record.exchange_code.as_str())
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(record.id));
        assert!(h.coordinator.find_by_code("nope").await.is_err());
    }
}
