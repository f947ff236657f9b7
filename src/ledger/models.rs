//! Ledger Domain Types
//!
//! Accounts and ledger entries as persisted in PostgreSQL.
//! Statuses are closed enums stored as VARCHAR; transitions are checked
//! against an explicit table rather than compared as strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::error::LedgerError;

/// Account identifier
pub type AccountId = Uuid;

/// Owning user identifier
pub type UserId = Uuid;

/// Amount in minor currency units (e.g. cents)
pub type MinorUnits = i64;

// ============================================================================
// Currency
// ============================================================================

/// ISO-4217 alphabetic currency code (three uppercase ASCII letters)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: &str) -> Result<Self, LedgerError> {
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code.to_string()))
        } else {
            Err(LedgerError::Corrupt(format!("invalid currency code: {code}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CurrencyCode::new(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

// ============================================================================
// Account
// ============================================================================

/// Account lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Inactive,
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "ACTIVE",
            AccountStatus::Inactive => "INACTIVE",
            AccountStatus::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(AccountStatus::Active),
            "INACTIVE" => Ok(AccountStatus::Inactive),
            "CLOSED" => Ok(AccountStatus::Closed),
            other => Err(LedgerError::Corrupt(format!("unknown account status: {other}"))),
        }
    }
}

/// Ledger account
///
/// `balance` only ever changes through a signed delta applied under a row lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub balance: MinorUnits,
    pub currency: CurrencyCode,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Build a fresh ACTIVE account (used by seeders and tests)
    pub fn open(user_id: UserId, currency: CurrencyCode, balance: MinorUnits) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            balance,
            currency,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ============================================================================
// Ledger Entry
// ============================================================================

/// Direction of a ledger entry relative to its account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Outbound,
    Inbound,
    OutgoingFee,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Outbound => "OUTBOUND",
            EntryType::Inbound => "INBOUND",
            EntryType::OutgoingFee => "OUTGOING_FEE",
        }
    }

    /// Sign applied to the (positive) entry amount when it settles
    #[inline]
    pub fn sign(&self) -> i64 {
        match self {
            EntryType::Inbound => 1,
            EntryType::Outbound | EntryType::OutgoingFee => -1,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUTBOUND" => Ok(EntryType::Outbound),
            "INBOUND" => Ok(EntryType::Inbound),
            "OUTGOING_FEE" => Ok(EntryType::OutgoingFee),
            other => Err(LedgerError::Corrupt(format!("unknown entry type: {other}"))),
        }
    }
}

/// Ledger entry status
///
/// ```text
/// PENDING ──► SUCCESS
///    └──────► FAILURE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Success,
    Failure,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failure => "FAILURE",
        }
    }

    /// Whether `self -> next` is a legal move. Same-state moves are no-ops and allowed.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Pending, EntryStatus::Success)
                | (EntryStatus::Pending, EntryStatus::Failure)
        ) || *self == next
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "SUCCESS" => Ok(EntryStatus::Success),
            "FAILURE" => Ok(EntryStatus::Failure),
            other => Err(LedgerError::Corrupt(format!("unknown entry status: {other}"))),
        }
    }
}

/// Persisted ledger entry (one balance movement on one account)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub account_id: AccountId,
    /// Always positive; direction comes from `entry_type`
    pub amount: MinorUnits,
    pub currency: CurrencyCode,
    /// Idempotency key, unique across the ledger
    pub reference_id: Uuid,
    pub metadata: Value,
    pub status: EntryStatus,
    pub entry_type: EntryType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed balance effect of this entry on its account
    #[inline]
    pub fn signed_amount(&self) -> i64 {
        self.entry_type.sign() * self.amount
    }
}

/// Desired ledger entry handed to the finder-or-creator
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub user_id: Option<UserId>,
    pub account_id: AccountId,
    pub amount: MinorUnits,
    pub currency: CurrencyCode,
    pub reference_id: Uuid,
    pub metadata: Map<String, Value>,
    pub status: EntryStatus,
    pub entry_type: EntryType,
}

impl NewLedgerEntry {
    /// A PENDING entry against `account`
    pub fn pending(
        account: &Account,
        entry_type: EntryType,
        amount: MinorUnits,
        reference_id: Uuid,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            user_id: Some(account.user_id),
            account_id: account.id,
            amount,
            currency: account.currency.clone(),
            reference_id,
            metadata,
            status: EntryStatus::Pending,
            entry_type,
        }
    }

    /// Materialize with a fresh id and timestamps
    pub fn into_entry(self) -> LedgerEntry {
        let now = Utc::now();
        LedgerEntry {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            account_id: self.account_id,
            amount: self.amount,
            currency: self.currency,
            reference_id: self.reference_id,
            metadata: Value::Object(self.metadata),
            status: self.status,
            entry_type: self.entry_type,
            created_at: now,
            updated_at: now,
        }
    }
}
