//! PostgreSQL Ledger Repository
//!
//! `accounts` and `ledger_entries` tables (see `migrations/`).
//! Balance changes always go through `SELECT ... FOR UPDATE` followed by an
//! `UPDATE` in the same transaction.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::error::LedgerError;
use super::models::{
    Account, AccountId, AccountStatus, CurrencyCode, EntryStatus, EntryType, LedgerEntry,
    NewLedgerEntry,
};
use super::repository::{LedgerRepository, LedgerTx, check_transition, next_balance};

const ACCOUNT_COLUMNS: &str = "id, user_id, balance, currency, status, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, user_id, account_id, amount, currency, reference_id, metadata, \
                             status, entry_type, created_at, updated_at";

pub struct PgLedgerRepository {
    pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an account row (account management lives elsewhere; used for seeding)
    pub async fn insert_account(&self, account: &Account) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, user_id, balance, currency, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(account.id)
        .bind(account.user_id)
        .bind(account.balance)
        .bind(account.currency.as_str())
        .bind(account.status.as_str())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for PgLedgerRepository {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    async fn get_entry_by_reference_id(
        &self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE reference_id = $1"
        ))
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn create_entry_if_absent(
        &self,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        let reference_id = entry.reference_id;
        let entry = entry.into_entry();

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO ledger_entries ({ENTRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (reference_id) DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.account_id)
        .bind(entry.amount)
        .bind(entry.currency.as_str())
        .bind(entry.reference_id)
        .bind(Json(&entry.metadata))
        .bind(entry.status.as_str())
        .bind(entry.entry_type.as_str())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return row_to_entry(&row);
        }

        // Lost the race: somebody else created it between lookup and insert
        tracing::debug!(reference_id = %reference_id, "Ledger entry already exists");
        self.get_entry_by_reference_id(reference_id)
            .await?
            .ok_or_else(|| {
                LedgerError::Corrupt(format!("entry {reference_id} conflicted but is missing"))
            })
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => row_to_account(&row),
            None => Err(LedgerError::AccountNotFound(id)),
        }
    }

    async fn get_entry_for_update(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE reference_id = $1 FOR UPDATE"
        ))
        .bind(reference_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        let current = self.get_account_for_update(account_id).await?;
        let balance = next_balance(&current, delta)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE accounts
            SET balance = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(balance)
        .bind(account_id)
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_account(&row)
    }

    async fn set_entry_status(
        &mut self,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1 FOR UPDATE"
        ))
        .bind(entry_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        let current = match row {
            Some(row) => row_to_entry(&row)?,
            None => return Err(LedgerError::EntryNotFound(entry_id)),
        };

        check_transition(current.status, status)?;
        if current.status == status {
            return Ok(current);
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE ledger_entries
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            RETURNING {ENTRY_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(entry_id)
        .fetch_one(&mut *self.tx)
        .await?;

        row_to_entry(&row)
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn row_to_account(row: &PgRow) -> Result<Account, LedgerError> {
    let currency: String = row.try_get("currency")?;
    let status: String = row.try_get("status")?;

    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        balance: row.try_get("balance")?,
        currency: CurrencyCode::new(&currency)?,
        status: status.parse::<AccountStatus>()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, LedgerError> {
    let currency: String = row.try_get("currency")?;
    let status: String = row.try_get("status")?;
    let entry_type: String = row.try_get("entry_type")?;
    let Json(metadata): Json<serde_json::Value> = row.try_get("metadata")?;

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account_id: row.try_get("account_id")?,
        amount: row.try_get("amount")?,
        currency: CurrencyCode::new(&currency)?,
        reference_id: row.try_get("reference_id")?,
        metadata,
        status: status.parse::<EntryStatus>()?,
        entry_type: entry_type.parse::<EntryType>()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
