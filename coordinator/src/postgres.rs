//! Postgres-backed record store.
//!
//! Code uniqueness among live escrows is a partial unique index, and the
//! conditional save is a single `UPDATE ... WHERE status = $n AND revision = $m`.

use async_trait::async_trait;
use cashbridge_common::{
    Currency, EscrowId, EscrowRecord, EscrowStatus, ExchangeCode, LedgerAddress, Money, PartyId,
    Satoshis, SettlingClaim, SettlingKind, TxRef,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{RecordStore, StoreError, StoreResult};

const LIVE_CODE_INDEX: &str = "escrows_live_code_idx";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS escrows (
    id                  UUID PRIMARY KEY,
    requester_id        TEXT NOT NULL,
    agent_id            TEXT NOT NULL,
    bitcoin_amount      BIGINT NOT NULL CHECK (bitcoin_amount > 0),
    local_amount        NUMERIC NOT NULL,
    currency            TEXT NOT NULL,
    escrow_address      TEXT NOT NULL,
    exchange_code       TEXT NOT NULL,
    status              TEXT NOT NULL,
    revision            BIGINT NOT NULL,
    settling_kind       TEXT,
    settling_claimed_at TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL,
    expires_at          TIMESTAMPTZ NOT NULL,
    funded_at           TIMESTAMPTZ,
    completed_at        TIMESTAMPTZ,
    resolved_at         TIMESTAMPTZ,
    settlement_ref      TEXT,
    dispute_reason      TEXT
)"#;

const CREATE_LIVE_CODE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS escrows_live_code_idx
    ON escrows (exchange_code)
    WHERE status IN ('pending', 'funded')"#;

const CREATE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS escrows_live_expiry_idx
    ON escrows (expires_at)
    WHERE status IN ('pending', 'funded')"#;

/// Record store on a Postgres connection pool.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(backend)?;
        info!("Connected to escrow database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if missing.
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in [CREATE_TABLE, CREATE_LIVE_CODE_INDEX, CREATE_EXPIRY_INDEX] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    async fn fetch_all(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> StoreResult<Vec<EscrowRecord>> {
        query
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .iter()
            .map(decode)
            .collect()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(&self, record: &EscrowRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"INSERT INTO escrows (
                id, requester_id, agent_id, bitcoin_amount, local_amount, currency,
                escrow_address, exchange_code, status, revision, settling_kind,
                settling_claimed_at, created_at, expires_at, funded_at, completed_at,
                resolved_at, settlement_ref, dispute_reason
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"#,
        )
        .bind(*record.id.as_uuid())
        .bind(record.requester_id.as_str())
        .bind(record.agent_id.as_str())
        .bind(sats_to_db(record.bitcoin_amount)?)
        .bind(record.local_amount.value)
        .bind(record.currency().code())
        .bind(record.escrow_address.as_str())
        .bind(record.exchange_code.as_str())
        .bind(record.status.as_str())
        .bind(revision_to_db(record.revision)?)
        .bind(record.settling.map(|c| c.kind.as_str()))
        .bind(record.settling.map(|c| c.claimed_at))
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.funded_at)
        .bind(record.completed_at)
        .bind(record.resolved_at)
        .bind(record.settlement_ref.as_ref().map(|r| r.as_str()))
        .bind(record.dispute_reason.as_deref())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(LIVE_CODE_INDEX) => {
                Err(StoreError::CodeInUse(record.exchange_code.clone()))
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId(record.id))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn save(
        &self,
        record: &EscrowRecord,
        expected_status: EscrowStatus,
        expected_revision: u64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"UPDATE escrows SET
                status = $4, revision = $5, settling_kind = $6, settling_claimed_at = $7,
                funded_at = $8, completed_at = $9, resolved_at = $10,
                settlement_ref = $11, dispute_reason = $12
            WHERE id = $1 AND status = $2 AND revision = $3"#,
        )
        .bind(*record.id.as_uuid())
        .bind(expected_status.as_str())
        .bind(revision_to_db(expected_revision)?)
        .bind(record.status.as_str())
        .bind(revision_to_db(record.revision)?)
        .bind(record.settling.map(|c| c.kind.as_str()))
        .bind(record.settling.map(|c| c.claimed_at))
        .bind(record.funded_at)
        .bind(record.completed_at)
        .bind(record.resolved_at)
        .bind(record.settlement_ref.as_ref().map(|r| r.as_str()))
        .bind(record.dispute_reason.as_deref())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let saved = result.rows_affected() == 1;
        if !saved {
            debug!(escrow_id = %record.id, expected = %expected_status, "Conditional save rejected");
        }
        Ok(saved)
    }

    async fn find_by_id(&self, id: EscrowId) -> StoreResult<Option<EscrowRecord>> {
        sqlx::query("SELECT * FROM escrows WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(decode)
            .transpose()
    }

    async fn find_by_code(&self, code: &ExchangeCode) -> StoreResult<Option<EscrowRecord>> {
        sqlx::query(
            r#"SELECT * FROM escrows WHERE exchange_code = $1
            ORDER BY (status IN ('pending', 'funded')) DESC, created_at DESC
            LIMIT 1"#,
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .as_ref()
        .map(decode)
        .transpose()
    }

    async fn find_expired(&self, before: DateTime<Utc>) -> StoreResult<Vec<EscrowRecord>> {
        self.fetch_all(
            sqlx::query(
                r#"SELECT * FROM escrows
                WHERE status IN ('pending', 'funded') AND expires_at < $1
                ORDER BY expires_at"#,
            )
            .bind(before),
        )
        .await
    }

    async fn find_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<Vec<EscrowRecord>> {
        self.fetch_all(
            sqlx::query(
                r#"SELECT * FROM escrows
                WHERE status = 'funded' AND settling_claimed_at < $1
                ORDER BY settling_claimed_at"#,
            )
            .bind(claimed_before),
        )
        .await
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn sats_to_db(amount: Satoshis) -> StoreResult<i64> {
    i64::try_from(amount.as_u64())
        .map_err(|_| StoreError::Backend(format!("amount {amount} exceeds column range")))
}

fn revision_to_db(revision: u64) -> StoreResult<i64> {
    i64::try_from(revision)
        .map_err(|_| StoreError::Backend(format!("revision {revision} exceeds column range")))
}

fn decode(row: &PgRow) -> StoreResult<EscrowRecord> {
    let corrupt = |what: &str| StoreError::Backend(format!("corrupt escrow row: {what}"));

    let status: String = row.try_get("status").map_err(backend)?;
    let code: String = row.try_get("exchange_code").map_err(backend)?;
    let sats: i64 = row.try_get("bitcoin_amount").map_err(backend)?;
    let revision: i64 = row.try_get("revision").map_err(backend)?;
    let local_amount: Decimal = row.try_get("local_amount").map_err(backend)?;
    let currency: String = row.try_get("currency").map_err(backend)?;
    let id: Uuid = row.try_get("id").map_err(backend)?;

    let settling_kind: Option<String> = row.try_get("settling_kind").map_err(backend)?;
    let settling_at: Option<DateTime<Utc>> = row.try_get("settling_claimed_at").map_err(backend)?;
    let settling = match (settling_kind, settling_at) {
        (Some(kind), Some(claimed_at)) => Some(SettlingClaim {
            kind: SettlingKind::parse(&kind).ok_or_else(|| corrupt("settling_kind"))?,
            claimed_at,
        }),
        (None, None) => None,
        _ => return Err(corrupt("half-written settling claim")),
    };

    Ok(EscrowRecord {
        id: EscrowId::from_uuid(id),
        requester_id: PartyId::new(row.try_get::<String, _>("requester_id").map_err(backend)?),
        agent_id: PartyId::new(row.try_get::<String, _>("agent_id").map_err(backend)?),
        bitcoin_amount: Satoshis::new(u64::try_from(sats).map_err(|_| corrupt("bitcoin_amount"))?),
        local_amount: Money::new(local_amount, Currency::new(currency)),
        escrow_address: LedgerAddress::new(
            row.try_get::<String, _>("escrow_address").map_err(backend)?,
        ),
        exchange_code: ExchangeCode::parse(&code).ok_or_else(|| corrupt("exchange_code"))?,
        status: EscrowStatus::parse(&status).ok_or_else(|| corrupt("status"))?,
        revision: u64::try_from(revision).map_err(|_| corrupt("revision"))?,
        settling,
        created_at: row.try_get("created_at").map_err(backend)?,
        expires_at: row.try_get("expires_at").map_err(backend)?,
        funded_at: row.try_get("funded_at").map_err(backend)?,
        completed_at: row.try_get("completed_at").map_err(backend)?,
        resolved_at: row.try_get("resolved_at").map_err(backend)?,
        settlement_ref: row
            .try_get::<Option<String>, _>("settlement_ref")
            .map_err(backend)?
            .map(TxRef::new),
        dispute_reason: row.try_get("dispute_reason").map_err(backend)?,
    })
}
