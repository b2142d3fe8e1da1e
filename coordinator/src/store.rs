//! Escrow record persistence.

use async_trait::async_trait;
use cashbridge_common::{CashBridgeError, EscrowId, EscrowRecord, EscrowStatus, ExchangeCode};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Record store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another live record already holds this code.
    #[error("Exchange code {0} is in use by a live escrow")]
    CodeInUse(ExchangeCode),

    #[error("Escrow {0} already exists")]
    DuplicateId(EscrowId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for CashBridgeError {
    fn from(err: StoreError) -> Self {
        CashBridgeError::Store(err.to_string())
    }
}

/// Persistence port for escrow records.
///
/// Every mutation after insert goes through [`RecordStore::save`], a
/// conditional write keyed on the status and revision the caller read.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::CodeInUse`] when a
    /// non-terminal record already uses the same code.
    async fn insert(&self, record: &EscrowRecord) -> StoreResult<()>;

    /// Replace the stored record if it still has `expected_status` and
    /// `expected_revision`. Returns `false` when the precondition failed.
    async fn save(
        &self,
        record: &EscrowRecord,
        expected_status: EscrowStatus,
        expected_revision: u64,
    ) -> StoreResult<bool>;

    async fn find_by_id(&self, id: EscrowId) -> StoreResult<Option<EscrowRecord>>;

    /// The live record holding `code`, else the most recent terminal one.
    async fn find_by_code(&self, code: &ExchangeCode) -> StoreResult<Option<EscrowRecord>>;

    /// Pending or funded records whose expiry is before `before`.
    async fn find_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<EscrowRecord>>;

    /// Funded records whose settling claim was taken before `claimed_before`.
    async fn find_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>>;
}

/// Store backed by in-process maps.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: DashMap<EscrowId, EscrowRecord>,
    /// Codes held by non-terminal records.
    live_codes: DashMap<ExchangeCode, EscrowId>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every stored record, oldest first.
    pub fn all(&self) -> Vec<EscrowRecord> {
        let mut records: Vec<EscrowRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn collect(&self, mut keep: impl FnMut(&EscrowRecord) -> bool) -> Vec<EscrowRecord> {
        let mut records: Vec<EscrowRecord> = self
            .records
            .iter()
            .filter(|r| keep(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(&self, record: &EscrowRecord) -> StoreResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }

        if record.status.is_live() {
            match self.live_codes.entry(record.exchange_code.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::CodeInUse(record.exchange_code.clone()));
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.id);
                }
            }
        }

        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save(
        &self,
        record: &EscrowRecord,
        expected_status: EscrowStatus,
        expected_revision: u64,
    ) -> StoreResult<bool> {
        let Some(mut stored) = self.records.get_mut(&record.id) else {
            return Ok(false);
        };

        if stored.status != expected_status || stored.revision != expected_revision {
            debug!(
                escrow_id = %record.id,
                stored_status = %stored.status,
                stored_revision = stored.revision,
                "Conditional save rejected"
            );
            return Ok(false);
        }

        let released_code = stored.status.is_live() && !record.status.is_live();
        *stored = record.clone();

        if released_code {
            self.live_codes
                .remove_if(&record.exchange_code, |_, id| *id == record.id);
        }

        Ok(true)
    }

    async fn find_by_id(&self, id: EscrowId) -> StoreResult<Option<EscrowRecord>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_code(&self, code: &ExchangeCode) -> StoreResult<Option<EscrowRecord>> {
        let live = self.live_codes.get(code).map(|id| *id);
        if let Some(id) = live {
            return self.find_by_id(id).await;
        }

        Ok(self
            .collect(|r| &r.exchange_code == code)
            .into_iter()
            .max_by_key(|r| r.created_at))
    }

    async fn find_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<EscrowRecord>> {
        Ok(self.collect(|r| r.status.is_live() && r.expires_at < before))
    }

    async fn find_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>> {
        Ok(self.collect(|r| {
            r.status == EscrowStatus::Funded
                && r.settling
                    .map(|claim| claim.claimed_at < claimed_before)
                    .unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashbridge_common::{Currency, LedgerAddress, Money, PartyId, Satoshis, SettlingKind};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn record(code: u32, created_at: DateTime<Utc>) -> EscrowRecord {
        EscrowRecord::new(
            PartyId::new("requester"),
            PartyId::new("agent"),
            Satoshis::new(100_000),
            Money::new(dec!(5000), Currency::kes()),
            LedgerAddress::new(format!("addr-{code}")),
            ExchangeCode::from_number(code).unwrap(),
            created_at,
            Duration::hours(24),
        )
    }

    fn advanced(prior: &EscrowRecord, status: EscrowStatus) -> EscrowRecord {
        let mut next = prior.clone();
        next.transition_to(status, Utc::now()).unwrap();
        next.revision += 1;
        next
    }

    #[tokio::test]
    async fn test_insert_rejects_live_code_collision() {
        let store = InMemoryRecordStore::new();
        let first = record(42, Utc::now());
        store.insert(&first).await.unwrap();

        let clash = record(42, Utc::now());
        assert!(matches!(
            store.insert(&clash).await,
            Err(StoreError::CodeInUse(_))
        ));
        assert!(matches!(
            store.insert(&first).await,
            Err(StoreError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_code_reusable_after_terminal() {
        let store = InMemoryRecordStore::new();
        let first = record(42, Utc::now());
        store.insert(&first).await.unwrap();

        let expired = advanced(&first, EscrowStatus::Expired);
        assert!(store.save(&expired, EscrowStatus::Pending, 0).await.unwrap());

        let second = record(42, Utc::now() + Duration::seconds(1));
        store.insert(&second).await.unwrap();

        let code = ExchangeCode::from_number(42).unwrap();
        let found = store.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_find_by_code_falls_back_to_latest_terminal() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let older = record(7, now);
        store.insert(&older).await.unwrap();
        store
            .save(&advanced(&older, EscrowStatus::Expired), EscrowStatus::Pending, 0)
            .await
            .unwrap();

        let newer = record(7, now + Duration::minutes(5));
        store.insert(&newer).await.unwrap();
        store
            .save(&advanced(&newer, EscrowStatus::Expired), EscrowStatus::Pending, 0)
            .await
            .unwrap();

        let code = ExchangeCode::from_number(7).unwrap();
        let found = store.find_by_code(&code).await.unwrap().unwrap();
        assert_eq!(found.id, newer.id);
    }

    #[tokio::test]
    async fn test_conditional_save() {
        let store = InMemoryRecordStore::new();
        let pending = record(1, Utc::now());
        store.insert(&pending).await.unwrap();

        let funded = advanced(&pending, EscrowStatus::Funded);
        assert!(store.save(&funded, EscrowStatus::Pending, 0).await.unwrap());

        // Stale read: same expectation a second time loses
        let expired = advanced(&pending, EscrowStatus::Expired);
        assert!(!store.save(&expired, EscrowStatus::Pending, 0).await.unwrap());

        let stored = store.find_by_id(pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Funded);
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn test_find_expired_and_stale_claims() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();

        let old = record(1, now - Duration::hours(30));
        let fresh = record(2, now);
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        let expired = store.find_expired(now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);

        let mut claimed = advanced(&fresh, EscrowStatus::Funded);
        claimed.claim(SettlingKind::Release, now - Duration::hours(1)).unwrap();
        store.save(&claimed, EscrowStatus::Pending, 0).await.unwrap();

        let stale = store
            .find_stale_claims(now - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, fresh.id);
        assert!(store
            .find_stale_claims(now - Duration::hours(2))
            .await
            .unwrap()
            .is_empty());
    }
}
