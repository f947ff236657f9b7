//! Transfer Error Types
//!
//! Every variant maps to a stable string code. Retry classification and HTTP
//! status are derived from the code, so an error restored from the saga store
//! behaves exactly like the one that was recorded.

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::mutex::LockError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Fee amount must not be negative")]
    InvalidFee,

    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Amount would cause overflow")]
    Overflow,

    #[error("Reference id {0} was already used with different parameters")]
    ReferenceConflict(Uuid),

    // === Business Errors ===
    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account {account_id} is not active (status {status})")]
    AccountNotActive { account_id: Uuid, status: String },

    #[error("Currency mismatch: source {source_currency}, destination {destination_currency}")]
    CurrencyMismatch {
        source_currency: String,
        destination_currency: String,
    },

    #[error("Insufficient balance on {account_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        account_id: Uuid,
        requested: i64,
        available: i64,
    },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === Contention Errors ===
    #[error("Lock is held by another transfer: {0}")]
    LockContended(String),

    #[error("Timed out waiting for lock: {0}")]
    LockTimeout(String),

    #[error("Lock not owned: {0}")]
    LockNotOwned(String),

    // === System Errors ===
    #[error("Activity timed out: {0}")]
    ActivityTimeout(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Lock store error: {0}")]
    LockStoreError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),

    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Error restored from a persisted saga outcome
    #[error("{message}")]
    Recorded { code: &'static str, message: String },
}

/// Every code `code()` can return
pub const ERROR_CODES: &[&str] = &[
    "INVALID_AMOUNT",
    "INVALID_FEE",
    "SAME_ACCOUNT",
    "OVERFLOW",
    "REFERENCE_CONFLICT",
    "ACCOUNT_NOT_FOUND",
    "ACCOUNT_NOT_ACTIVE",
    "CURRENCY_MISMATCH",
    "INSUFFICIENT_BALANCE",
    "INVALID_STATE_TRANSITION",
    "LOCK_CONTENDED",
    "LOCK_TIMEOUT",
    "LOCK_NOT_OWNED",
    "ACTIVITY_TIMEOUT",
    "DATABASE_ERROR",
    "LOCK_STORE_ERROR",
    "SYSTEM_ERROR",
    "TRANSFER_NOT_FOUND",
];

impl TransferError {
    /// Rebuild a persisted error. Unknown codes degrade to SYSTEM_ERROR.
    pub fn recorded(code: &str, message: impl Into<String>) -> Self {
        let code = ERROR_CODES
            .iter()
            .copied()
            .find(|known| *known == code)
            .unwrap_or("SYSTEM_ERROR");
        TransferError::Recorded {
            code,
            message: message.into(),
        }
    }

    /// Get the error code for API responses and persistence
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::InvalidFee => "INVALID_FEE",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::Overflow => "OVERFLOW",
            TransferError::ReferenceConflict(_) => "REFERENCE_CONFLICT",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::AccountNotActive { .. } => "ACCOUNT_NOT_ACTIVE",
            TransferError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            TransferError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            TransferError::LockContended(_) => "LOCK_CONTENDED",
            TransferError::LockTimeout(_) => "LOCK_TIMEOUT",
            TransferError::LockNotOwned(_) => "LOCK_NOT_OWNED",
            TransferError::ActivityTimeout(_) => "ACTIVITY_TIMEOUT",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
            TransferError::LockStoreError(_) => "LOCK_STORE_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::Recorded { code, .. } => *code,
        }
    }

    /// Transient failures: retried by the activity policy, and a saga that
    /// ended on one is reopened when the same reference id is submitted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            "LOCK_CONTENDED"
                | "LOCK_TIMEOUT"
                | "ACTIVITY_TIMEOUT"
                | "DATABASE_ERROR"
                | "LOCK_STORE_ERROR"
        )
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.code() {
            "INVALID_AMOUNT" | "INVALID_FEE" | "SAME_ACCOUNT" | "OVERFLOW" => 400,
            "TRANSFER_NOT_FOUND" => 404,
            "REFERENCE_CONFLICT" => 409,
            "ACCOUNT_NOT_FOUND"
            | "ACCOUNT_NOT_ACTIVE"
            | "CURRENCY_MISMATCH"
            | "INSUFFICIENT_BALANCE" => 422,
            "LOCK_CONTENDED" | "LOCK_TIMEOUT" | "LOCK_STORE_ERROR" => 503,
            "ACTIVITY_TIMEOUT" => 504,
            _ => 500,
        }
    }
}

impl From<LedgerError> for TransferError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(id) => TransferError::AccountNotFound(id),
            LedgerError::AccountNotActive { id, status } => TransferError::AccountNotActive {
                account_id: id,
                status: status.to_string(),
            },
            LedgerError::ClosedAccount(id) => TransferError::AccountNotActive {
                account_id: id,
                status: "CLOSED".to_string(),
            },
            LedgerError::InsufficientFunds {
                account_id,
                requested,
                available,
            } => TransferError::InsufficientBalance {
                account_id,
                requested,
                available,
            },
            LedgerError::InvalidStatusTransition { from, to } => {
                TransferError::InvalidStateTransition(format!("ledger entry {from} -> {to}"))
            }
            LedgerError::Overflow(_) => TransferError::Overflow,
            LedgerError::EntryNotFound(id) => {
                TransferError::SystemError(format!("ledger entry {id} disappeared"))
            }
            LedgerError::Database(msg) => TransferError::DatabaseError(msg),
            LedgerError::Corrupt(msg) => TransferError::SystemError(msg),
        }
    }
}

impl From<LockError> for TransferError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyHeld { key } => TransferError::LockContended(key),
            LockError::NotOwner { key } => TransferError::LockNotOwned(key),
            LockError::Store(msg) => TransferError::LockStoreError(msg),
        }
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}
