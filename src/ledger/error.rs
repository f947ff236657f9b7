//! Ledger Error Types

use thiserror::Error;
use uuid::Uuid;

use super::models::{AccountStatus, EntryStatus};

/// Errors raised by the ledger repository and the finder-or-creator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    // === Business Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account {id} is not active (status {status})")]
    AccountNotActive { id: Uuid, status: AccountStatus },

    #[error("Account {0} is closed; only FAILURE entries may be recorded")]
    ClosedAccount(Uuid),

    #[error("Insufficient funds on account {account_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        account_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("Invalid entry status transition: {from} -> {to}")]
    InvalidStatusTransition { from: EntryStatus, to: EntryStatus },

    #[error("Ledger entry not found: {0}")]
    EntryNotFound(Uuid),

    #[error("Balance arithmetic overflow on account {0}")]
    Overflow(Uuid),

    // === Infrastructure Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt ledger row: {0}")]
    Corrupt(String),
}

impl LedgerError {
    /// Only infrastructure failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Database(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}
