//! ledger_saga - Exactly-once transfers between ledger accounts
//!
//! # Modules
//!
//! - [`ledger`] - Accounts, ledger entries, repository and finder-or-creator
//! - [`mutex`] - Per-account distributed mutex (Redis or in-memory)
//! - [`transfer`] - Saga orchestrator, activities, saga store, recovery worker, HTTP API
//! - [`context`] - Per-saga tracing context
//! - [`config`] - YAML configuration with environment overrides
//! - [`db`] - PostgreSQL pool and migrations
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod context;
pub mod db;
pub mod ledger;
pub mod logging;
pub mod mutex;
pub mod transfer;

// Convenient re-exports at crate root
pub use ledger::{Account, LedgerEntry, LedgerError, LedgerRepository};
pub use mutex::{DistributedMutex, LockError, LockStore, MutexParams};
pub use transfer::{TransferError, TransferRequest, TransferResult, TransferSaga};
