//! Transfer Saga
//!
//! Moves money between two ledger accounts exactly once per reference id.
//!
//! # State Machine
//!
//! ```text
//! STARTED → LOCK_ACQUIRED → ACTIVITY_RUNNING → SUCCEEDED → LOCK_RELEASED
//!    ↓            ↓                ↓                            ↑
//!    └────────────┴──────────→  FAILED  ────────────────────────┘
//! ```
//!
//! A LOCK_RELEASED saga that failed on a transient error is reopened
//! (back to STARTED) when the same request is submitted again.
//!
//! # Guarantees
//!
//! 1. **Derived legs**: every ledger leg id is a UUIDv5 of the reference id,
//!    so replays find the legs an earlier attempt created
//! 2. **One settlement transaction**: a leg's balance delta is applied in the
//!    same transaction that marks it SUCCESS
//! 3. **Per-account mutex**: transfers out of one account run one at a time
//! 4. **Durable progress**: every state change is a CAS on the saga store

pub mod activities;
pub mod api;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod retry;
pub mod state;
pub mod types;
pub mod worker;

#[cfg(test)]
mod integration_tests;

// Re-exports for convenience
pub use activities::TransferActivities;
pub use api::{AppState, TransferApiRequest, router};
pub use coordinator::{SagaConfig, TransferSaga};
pub use db::{InMemorySagaStore, PgSagaStore, SagaStore};
pub use error::TransferError;
pub use retry::{ActivityOptions, RetryPolicy};
pub use state::SagaState;
pub use types::{SagaRecord, TransferRequest, TransferResult};
pub use worker::{RecoveryWorker, WorkerConfig};
