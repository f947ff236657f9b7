//! Ledger Repository Seams
//!
//! Two traits split the storage surface:
//! - [`LedgerRepository`]: autocommit reads and the idempotent entry insert
//! - [`LedgerTx`]: a storage transaction holding row locks until commit
//!
//! Dropping a [`LedgerTx`] without calling `commit` rolls it back.

use async_trait::async_trait;
use uuid::Uuid;

use super::error::LedgerError;
use super::models::{Account, AccountId, EntryStatus, LedgerEntry, NewLedgerEntry};

#[async_trait]
pub trait LedgerRepository: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError>;

    async fn get_entry_by_reference_id(
        &self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Insert `entry` unless an entry with the same reference id exists.
    ///
    /// Returns the persisted row either way; the unique constraint on
    /// `reference_id` decides the winner of a concurrent race.
    async fn create_entry_if_absent(&self, entry: NewLedgerEntry)
    -> Result<LedgerEntry, LedgerError>;

    /// Open a storage transaction
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Locking read of an account row
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError>;

    /// Locking read of a ledger entry by its idempotency key
    async fn get_entry_for_update(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// Apply a signed delta to an account balance under a row lock.
    ///
    /// Rejects with `InsufficientFunds` if the result would go below zero.
    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError>;

    /// Move an entry to `status`, checked against the entry transition table
    async fn set_entry_status(
        &mut self,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError>;

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}

/// Compute the new balance for `delta`, enforcing the non-negative invariant
pub(crate) fn next_balance(account: &Account, delta: i64) -> Result<i64, LedgerError> {
    let next = account
        .balance
        .checked_add(delta)
        .ok_or(LedgerError::Overflow(account.id))?;
    if next < 0 {
        return Err(LedgerError::InsufficientFunds {
            account_id: account.id,
            requested: delta.saturating_neg(),
            available: account.balance,
        });
    }
    Ok(next)
}

/// Validate an entry status move
pub(crate) fn check_transition(
    from: EntryStatus,
    to: EntryStatus,
) -> Result<(), LedgerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidStatusTransition { from, to })
    }
}
