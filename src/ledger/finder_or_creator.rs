//! Idempotent ledger-entry creation
//!
//! Given a desired entry, return the one already stored under its reference id
//! or create it, subject to the target account's status.

use std::sync::Arc;

use tracing::{debug, info};

use super::error::LedgerError;
use super::models::{AccountStatus, EntryStatus, LedgerEntry, NewLedgerEntry};
use super::repository::LedgerRepository;

#[derive(Clone)]
pub struct FinderOrCreator {
    repo: Arc<dyn LedgerRepository>,
}

impl FinderOrCreator {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        Self { repo }
    }

    pub async fn call(&self, mut desired: NewLedgerEntry) -> Result<LedgerEntry, LedgerError> {
        if let Some(existing) = self
            .repo
            .get_entry_by_reference_id(desired.reference_id)
            .await?
        {
            debug!(
                reference_id = %desired.reference_id,
                entry_id = %existing.id,
                "Ledger entry found, returning existing"
            );
            return Ok(existing);
        }

        let account = self
            .repo
            .get_account(desired.account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound(desired.account_id))?;

        if desired.user_id.is_none() {
            desired.user_id = Some(account.user_id);
        }

        match account.status {
            AccountStatus::Active => {}
            AccountStatus::Closed if desired.status == EntryStatus::Failure => {}
            AccountStatus::Closed => return Err(LedgerError::ClosedAccount(account.id)),
            status => {
                return Err(LedgerError::AccountNotActive {
                    id: account.id,
                    status,
                });
            }
        }

        let entry = self.repo.create_entry_if_absent(desired).await?;
        info!(
            reference_id = %entry.reference_id,
            entry_id = %entry.id,
            account_id = %entry.account_id,
            entry_type = %entry.entry_type,
            amount = entry.amount,
            "Ledger entry created"
        );
        Ok(entry)
    }
}
