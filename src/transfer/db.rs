//! Saga Store
//!
//! Durable saga records. All state updates are atomic CAS (compare-and-swap)
//! operations; the caller checks legality against the transition table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::error::TransferError;
use super::state::SagaState;
use super::types::{SagaRecord, TransferRequest};

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert `record` unless a saga with the same id exists; return the stored one
    async fn create_or_get(&self, record: SagaRecord) -> Result<SagaRecord, TransferError>;

    async fn get(&self, saga_id: Uuid) -> Result<Option<SagaRecord>, TransferError>;

    /// Returns false if the current state did not match `expected`
    async fn update_state_if(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
    ) -> Result<bool, TransferError>;

    /// CAS to a resolved state, storing the error (if any) alongside
    async fn record_outcome(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&TransferError>,
    ) -> Result<bool, TransferError>;

    /// LOCK_RELEASED -> STARTED, bumping `attempts` and clearing the error
    async fn reopen(&self, saga_id: Uuid) -> Result<bool, TransferError>;

    /// Sagas not yet LOCK_RELEASED whose last update is older than `threshold`
    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

const SAGA_COLUMNS: &str = "saga_id, reference_id, amount, fee_amount, source_account_id, \
                            destination_account_id, metadata, state, error_code, error_message, \
                            attempts, created_at, updated_at";

pub struct PgSagaStore {
    pool: PgPool,
}

impl PgSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn create_or_get(&self, record: SagaRecord) -> Result<SagaRecord, TransferError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO transfer_sagas
                (saga_id, reference_id, amount, fee_amount, source_account_id,
                 destination_account_id, metadata, state, attempts, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), NOW())
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(record.saga_id)
        .bind(record.request.reference_id)
        .bind(record.request.amount)
        .bind(record.request.fee_amount)
        .bind(record.request.source_account_id)
        .bind(record.request.destination_account_id)
        .bind(Json(&record.request.metadata))
        .bind(record.state.id())
        .bind(record.attempts)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            tracing::info!(
                saga_id = %record.saga_id,
                reference_id = %record.request.reference_id,
                "Saga already exists - returning existing record (idempotent)"
            );
        }

        self.get(record.saga_id)
            .await?
            .ok_or_else(|| TransferError::SystemError("saga vanished after insert".to_string()))
    }

    async fn get(&self, saga_id: Uuid) -> Result<Option<SagaRecord>, TransferError> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM transfer_sagas WHERE saga_id = $1"
        ))
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn update_state_if(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_sagas
            SET state = $1, updated_at = NOW()
            WHERE saga_id = $2 AND state = $3
            "#,
        )
        .bind(new_state.id())
        .bind(saga_id)
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_outcome(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&TransferError>,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_sagas
            SET state = $1, error_code = $2, error_message = $3, updated_at = NOW()
            WHERE saga_id = $4 AND state = $5
            "#,
        )
        .bind(new_state.id())
        .bind(error.map(|e| e.code()))
        .bind(error.map(|e| e.to_string()))
        .bind(saga_id)
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reopen(&self, saga_id: Uuid) -> Result<bool, TransferError> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_sagas
            SET state = $1, error_code = NULL, error_message = NULL,
                attempts = attempts + 1, updated_at = NOW()
            WHERE saga_id = $2 AND state = $3
            "#,
        )
        .bind(SagaState::Started.id())
        .bind(saga_id)
        .bind(SagaState::LockReleased.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError> {
        let threshold_secs = interval_secs(threshold)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS}
            FROM transfer_sagas
            WHERE state <> $1
              AND updated_at < NOW() - INTERVAL '1 second' * $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(SagaState::LockReleased.id())
        .bind(threshold_secs)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

/// Seconds for a SQL interval bind
fn interval_secs(threshold: Duration) -> Result<i64, TransferError> {
    i64::try_from(threshold.as_secs()).map_err(|_| {
        TransferError::SystemError(format!("stale threshold {threshold:?} out of range"))
    })
}

fn row_to_record(row: &PgRow) -> Result<SagaRecord, TransferError> {
    let state_id: i16 = row.try_get("state")?;
    let state = SagaState::from_id(state_id)
        .ok_or_else(|| TransferError::SystemError(format!("Invalid state ID: {}", state_id)))?;

    let Json(metadata): Json<serde_json::Map<String, serde_json::Value>> =
        row.try_get("metadata")?;

    Ok(SagaRecord {
        saga_id: row.try_get("saga_id")?,
        request: TransferRequest {
            reference_id: row.try_get("reference_id")?,
            amount: row.try_get("amount")?,
            fee_amount: row.try_get("fee_amount")?,
            source_account_id: row.try_get("source_account_id")?,
            destination_account_id: row.try_get("destination_account_id")?,
            metadata,
        },
        state,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct InMemorySagaStore {
    records: DashMap<Uuid, SagaRecord>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record as-is (seeding crashed sagas in tests)
    pub fn put(&self, record: SagaRecord) {
        self.records.insert(record.saga_id, record);
    }

    fn cas<F>(&self, saga_id: Uuid, expected: SagaState, apply: F) -> bool
    where
        F: FnOnce(&mut SagaRecord),
    {
        match self.records.get_mut(&saga_id) {
            Some(mut record) if record.state == expected => {
                apply(&mut record);
                record.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create_or_get(&self, record: SagaRecord) -> Result<SagaRecord, TransferError> {
        Ok(self
            .records
            .entry(record.saga_id)
            .or_insert(record)
            .value()
            .clone())
    }

    async fn get(&self, saga_id: Uuid) -> Result<Option<SagaRecord>, TransferError> {
        Ok(self.records.get(&saga_id).map(|r| r.value().clone()))
    }

    async fn update_state_if(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
    ) -> Result<bool, TransferError> {
        Ok(self.cas(saga_id, expected, |r| r.state = new_state))
    }

    async fn record_outcome(
        &self,
        saga_id: Uuid,
        expected: SagaState,
        new_state: SagaState,
        error: Option<&TransferError>,
    ) -> Result<bool, TransferError> {
        let code = error.map(|e| e.code().to_string());
        let message = error.map(|e| e.to_string());
        Ok(self.cas(saga_id, expected, |r| {
            r.state = new_state;
            r.error_code = code;
            r.error_message = message;
        }))
    }

    async fn reopen(&self, saga_id: Uuid) -> Result<bool, TransferError> {
        Ok(self.cas(saga_id, SagaState::LockReleased, |r| {
            r.state = SagaState::Started;
            r.error_code = None;
            r.error_message = None;
            r.attempts += 1;
        }))
    }

    async fn find_stale(
        &self,
        threshold: Duration,
        limit: usize,
    ) -> Result<Vec<SagaRecord>, TransferError> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| TransferError::SystemError(e.to_string()))?;
        let cutoff = Utc::now() - threshold;

        let mut stale: Vec<SagaRecord> = self
            .records
            .iter()
            .filter(|r| r.state != SagaState::LockReleased && r.updated_at < cutoff)
            .map(|r| r.value().clone())
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }
}
