//! Ledger: accounts, ledger entries and the idempotent entry creator
//!
//! The repository exposes exactly what the transfer saga needs: lookup by
//! idempotency key, locking reads, and delta-based balance updates.

pub mod error;
pub mod finder_or_creator;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod repository;

pub use error::LedgerError;
pub use finder_or_creator::FinderOrCreator;
pub use memory::InMemoryLedger;
pub use models::{
    Account, AccountId, AccountStatus, CurrencyCode, EntryStatus, EntryType, LedgerEntry,
    MinorUnits, NewLedgerEntry, UserId,
};
pub use postgres::PgLedgerRepository;
pub use repository::{LedgerRepository, LedgerTx};
