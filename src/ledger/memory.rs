//! In-memory Ledger Repository
//!
//! A single `tokio::sync::Mutex` guards the whole ledger. A transaction holds
//! the guard for its lifetime (so transactions are fully serialized, which is
//! stronger than row locking) and works on a staged copy that replaces the
//! live state on commit.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::error::LedgerError;
use super::models::{Account, AccountId, EntryStatus, LedgerEntry, NewLedgerEntry};
use super::repository::{LedgerRepository, LedgerTx, check_transition, next_balance};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    /// Keyed by reference id (the unique idempotency key)
    entries: HashMap<Uuid, LedgerEntry>,
}

impl LedgerState {
    fn entry_by_id_mut(&mut self, entry_id: Uuid) -> Option<&mut LedgerEntry> {
        self.entries.values_mut().find(|e| e.id == entry_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    fail_begins: Arc<AtomicU32>,
    fail_creates: Arc<AtomicU32>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_account(&self, account: Account) {
        self.state.lock().await.accounts.insert(account.id, account);
    }

    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.state.lock().await.accounts.get(&id).cloned()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.entries.values().cloned().collect()
    }

    /// Make the next `n` calls to `begin` fail with a database error
    pub fn fail_next_begins(&self, n: u32) {
        self.fail_begins.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `create_entry_if_absent` fail with a database error
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32, op: &str) -> Result<(), LedgerError> {
        let hit = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(LedgerError::Database(format!("injected failure in {op}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerRepository for InMemoryLedger {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, LedgerError> {
        Ok(self.account(id).await)
    }

    async fn get_entry_by_reference_id(
        &self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.state.lock().await.entries.get(&reference_id).cloned())
    }

    async fn create_entry_if_absent(
        &self,
        entry: NewLedgerEntry,
    ) -> Result<LedgerEntry, LedgerError> {
        Self::take_failure(&self.fail_creates, "create_entry_if_absent")?;

        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&entry.account_id) {
            return Err(LedgerError::AccountNotFound(entry.account_id));
        }
        let stored = state
            .entries
            .entry(entry.reference_id)
            .or_insert_with(|| entry.into_entry());
        Ok(stored.clone())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        Self::take_failure(&self.fail_begins, "begin")?;

        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTx { guard, staged }))
    }
}

struct InMemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    staged: LedgerState,
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account, LedgerError> {
        self.staged
            .accounts
            .get(&id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(id))
    }

    async fn get_entry_for_update(
        &mut self,
        reference_id: Uuid,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.staged.entries.get(&reference_id).cloned())
    }

    async fn apply_balance_delta(
        &mut self,
        account_id: AccountId,
        delta: i64,
    ) -> Result<Account, LedgerError> {
        let account = self
            .staged
            .accounts
            .get_mut(&account_id)
            .ok_or(LedgerError::AccountNotFound(account_id))?;
        account.balance = next_balance(account, delta)?;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn set_entry_status(
        &mut self,
        entry_id: Uuid,
        status: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = self
            .staged
            .entry_by_id_mut(entry_id)
            .ok_or(LedgerError::EntryNotFound(entry_id))?;
        check_transition(entry.status, status)?;
        if entry.status != status {
            entry.status = status;
            entry.updated_at = Utc::now();
        }
        Ok(entry.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let InMemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
