//! Integration Tests for the Transfer Saga
//!
//! Full saga runs against the in-memory ledger, lock store and saga store.
//! Nothing here needs PostgreSQL or Redis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Map;
use uuid::Uuid;

use crate::ledger::{
    Account, AccountStatus, CurrencyCode, EntryStatus, EntryType, InMemoryLedger, LedgerRepository,
    NewLedgerEntry,
};
use crate::mutex::{DistributedMutex, InMemoryLockStore, LockError, LockStore};
use crate::transfer::coordinator::{SagaConfig, TransferSaga};
use crate::transfer::db::InMemorySagaStore;
use crate::transfer::error::TransferError;
use crate::transfer::retry::{ActivityOptions, RetryPolicy};
use crate::transfer::state::SagaState;
use crate::transfer::types::{SagaRecord, TransferRequest};
use crate::transfer::worker::{RecoveryWorker, WorkerConfig};

/// Saga wired to in-memory collaborators
struct TestHarness {
    ledger: InMemoryLedger,
    locks: Arc<InMemoryLockStore>,
    store: Arc<InMemorySagaStore>,
    saga: Arc<TransferSaga>,
    config: SagaConfig,
}

fn fast_policy(maximum_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        initial_interval_ms: 2,
        backoff_coefficient: 1.0,
        maximum_interval_ms: 2,
        maximum_attempts,
    }
}

fn fast_config(lock_attempts: u32) -> SagaConfig {
    SagaConfig {
        lock_namespace: "transfers_mutex".to_string(),
        mutex_ttl: Duration::from_secs(30),
        lock_acquisition: ActivityOptions {
            start_to_close_timeout: Duration::from_millis(500),
            retry_policy: fast_policy(lock_attempts),
        },
        transfer_activity: ActivityOptions {
            start_to_close_timeout: Duration::from_secs(5),
            retry_policy: fast_policy(5),
        },
    }
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(fast_config(2_000))
    }

    fn with_config(config: SagaConfig) -> Self {
        let locks = Arc::new(InMemoryLockStore::new());
        Self::with_lock_store(config, locks.clone(), locks)
    }

    /// `locks` is what the test inspects; `mutex_store` is what the saga talks to
    fn with_lock_store(
        config: SagaConfig,
        locks: Arc<InMemoryLockStore>,
        mutex_store: Arc<dyn LockStore>,
    ) -> Self {
        let ledger = InMemoryLedger::new();
        let store = Arc::new(InMemorySagaStore::new());
        let saga = TransferSaga::new(
            store.clone(),
            Arc::new(ledger.clone()),
            DistributedMutex::new(mutex_store),
            config.clone(),
        );
        Self {
            ledger,
            locks,
            store,
            saga: Arc::new(saga),
            config,
        }
    }

    /// Another process: its own saga, sharing every store with `self.saga`
    fn second_instance(&self) -> Arc<TransferSaga> {
        Arc::new(TransferSaga::new(
            self.store.clone(),
            Arc::new(self.ledger.clone()),
            DistributedMutex::new(self.locks.clone()),
            self.config.clone(),
        ))
    }

    async fn open_account(&self, currency: &str, balance: i64) -> Account {
        let account = Account::open(Uuid::new_v4(), CurrencyCode::new(currency).unwrap(), balance);
        self.ledger.insert_account(account.clone()).await;
        account
    }

    async fn balance(&self, account: &Account) -> i64 {
        self.ledger.account(account.id).await.unwrap().balance
    }

    async fn saga_state(&self, reference_id: Uuid) -> SagaState {
        self.saga.status(reference_id).await.unwrap().state
    }

    fn lock_key(account: &Account) -> String {
        format!("transfers_mutex_{}", account.id)
    }
}

// ============================================================================
// Happy Path Tests
// ============================================================================

#[tokio::test]
async fn test_transfer_with_fee_settles_all_legs() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 500).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100).with_fee(10);

    let result = h.saga.run(req.clone()).await.unwrap();

    assert_eq!(h.balance(&source).await, 890);
    assert_eq!(h.balance(&destination).await, 600);
    assert_eq!(result.entries().len(), 3);
    assert!(result.entries().iter().all(|e| e.status == EntryStatus::Success));
    assert_eq!(result.legs, req.leg_ids());
    assert_eq!(h.saga_state(req.reference_id).await, SagaState::LockReleased);
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);

    // Same reference again: identical result, no further balance movement
    let replayed = h.saga.run(req.clone()).await.unwrap();
    assert_eq!(replayed, result);
    assert_eq!(h.balance(&source).await, 890);
    assert_eq!(h.balance(&destination).await, 600);
    assert_eq!(h.ledger.entries().await.len(), 3);
}

#[tokio::test]
async fn test_transfer_without_fee_conserves_money() {
    let h = TestHarness::new();
    let source = h.open_account("EUR", 300).await;
    let destination = h.open_account("EUR", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 300).with_fee(0);

    let result = h.saga.run(req).await.unwrap();

    assert!(result.fee_entry.is_none());
    assert_eq!(result.entries().len(), 2);
    assert_eq!(h.balance(&source).await, 0);
    assert_eq!(h.balance(&destination).await, 300);
    assert_eq!(h.balance(&source).await + h.balance(&destination).await, 300);
}

#[tokio::test]
async fn test_concurrent_identical_requests_settle_once() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 250).with_fee(5);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let saga = h.saga.clone();
            let req = req.clone();
            tokio::spawn(async move { saga.run(req).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(h.balance(&source).await, 745);
    assert_eq!(h.balance(&destination).await, 250);
    assert_eq!(h.ledger.entries().await.len(), 3);
}

#[tokio::test]
async fn test_concurrent_transfers_from_one_account_never_overdraw() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 500).await;
    let destinations = [
        h.open_account("USD", 0).await,
        h.open_account("USD", 0).await,
    ];

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let saga = h.saga.clone();
            let req = TransferRequest::new(
                Uuid::new_v4(),
                source.id,
                destinations[i % 2].id,
                100,
            );
            tokio::spawn(async move { saga.run(req).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(TransferError::InsufficientBalance { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 5);
    assert_eq!(rejected, 5);
    assert_eq!(h.balance(&source).await, 0);
    let credited = h.balance(&destinations[0]).await + h.balance(&destinations[1]).await;
    assert_eq!(credited, 500);
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);
}

// ============================================================================
// Multi-instance Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_instances_same_request_settle_once() {
    let h = TestHarness::new();
    let other = h.second_instance();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 500).await;

    for _ in 0..20 {
        let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 10).with_fee(1);
        let (first, second) = tokio::join!(h.saga.run(req.clone()), other.run(req.clone()));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.legs, second.legs);
        assert_eq!(first.source_entry.id, second.source_entry.id);
        assert_eq!(first.destination_entry.id, second.destination_entry.id);
        assert_eq!(h.saga_state(req.reference_id).await, SagaState::LockReleased);
    }

    assert_eq!(h.balance(&source).await, 780);
    assert_eq!(h.balance(&destination).await, 700);
    let entries = h.ledger.entries().await;
    assert_eq!(entries.len(), 60);
    assert!(entries.iter().all(|e| e.status == EntryStatus::Success));
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_instances_share_the_account_mutex() {
    let h = TestHarness::new();
    let other = h.second_instance();
    let source = h.open_account("USD", 500).await;
    let destination = h.open_account("USD", 0).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let saga = if i % 2 == 0 { h.saga.clone() } else { other.clone() };
            let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
            tokio::spawn(async move { saga.run(req).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(TransferError::InsufficientBalance { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 5);
    assert_eq!(h.balance(&source).await, 0);
    assert_eq!(h.balance(&destination).await, 500);
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);
}

// ============================================================================
// Account Mutex Tests
// ============================================================================

#[tokio::test]
async fn test_lock_held_through_slow_activity() {
    let mut config = fast_config(2_000);
    config.mutex_ttl = Duration::from_millis(80);
    config.transfer_activity = ActivityOptions {
        start_to_close_timeout: Duration::from_millis(25),
        retry_policy: RetryPolicy {
            initial_interval_ms: 30,
            backoff_coefficient: 1.0,
            maximum_interval_ms: 30,
            maximum_attempts: 5,
        },
    };
    assert!(config.validate().is_ok());

    let h = TestHarness::with_config(config);
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
    let key = TestHarness::lock_key(&source);

    // Attempts at ~0/30/60/90ms fail, the fifth at ~120ms settles
    h.ledger.fail_next_begins(4);
    let saga = h.saga.clone();
    let running = tokio::spawn({
        let req = req.clone();
        async move { saga.run(req).await }
    });

    // Past the TTL of the initial acquisition
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.locks.holder(&key), Some(req.reference_id.to_string()));
    let err = h
        .locks
        .try_acquire(&key, "someone-else", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::AlreadyHeld { .. }));

    running.await.unwrap().unwrap();
    assert_eq!(h.balance(&source).await, 900);
    assert_eq!(h.locks.holder(&key), None);
}

/// Acquires normally; every release fails at the store
struct FailingRelease {
    inner: Arc<InMemoryLockStore>,
}

#[async_trait]
impl LockStore for FailingRelease {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        self.inner.try_acquire(key, token, ttl).await
    }

    async fn release_if_owner(&self, _key: &str, _token: &str) -> Result<(), LockError> {
        Err(LockError::Store("connection reset by peer".to_string()))
    }
}

#[tokio::test]
async fn test_failed_release_does_not_block_result() {
    let locks = Arc::new(InMemoryLockStore::new());
    let mutex_store = Arc::new(FailingRelease {
        inner: locks.clone(),
    });
    let h = TestHarness::with_lock_store(fast_config(2_000), locks, mutex_store);
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100).with_fee(10);

    let result = h.saga.run(req.clone()).await.unwrap();

    assert_eq!(result.entries().len(), 3);
    assert_eq!(h.balance(&source).await, 890);
    assert_eq!(h.saga_state(req.reference_id).await, SagaState::LockReleased);
    // Still held until the TTL runs out
    assert_eq!(
        h.locks.holder(&TestHarness::lock_key(&source)),
        Some(req.reference_id.to_string())
    );

    // Same reference replays without touching the lock
    assert_eq!(h.saga.run(req).await.unwrap(), result);
}

// ============================================================================
// Business Failures
// ============================================================================

#[tokio::test]
async fn test_insufficient_balance_is_final() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 100).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100).with_fee(10);

    let err = h.saga.run(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    assert!(h.ledger.entries().await.is_empty());
    assert_eq!(h.balance(&source).await, 100);

    let record = h.saga.status(req.reference_id).await.unwrap();
    assert_eq!(record.state, SagaState::LockReleased);
    assert_eq!(record.error_code.as_deref(), Some("INSUFFICIENT_BALANCE"));
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);

    // Replay returns the recorded failure even after a top-up
    h.ledger
        .insert_account(Account {
            balance: 1_000,
            ..h.ledger.account(source.id).await.unwrap()
        })
        .await;
    let replayed = h.saga.run(req).await.unwrap_err();
    assert_eq!(replayed.code(), "INSUFFICIENT_BALANCE");
    assert_eq!(replayed.to_string(), err.to_string());
    assert_eq!(h.balance(&source).await, 1_000);
    assert!(h.ledger.entries().await.is_empty());
}

#[tokio::test]
async fn test_closed_destination_rejected() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let mut destination = h.open_account("USD", 0).await;
    destination.status = AccountStatus::Closed;
    h.ledger.insert_account(destination.clone()).await;

    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
    let err = h.saga.run(req).await.unwrap_err();

    assert_eq!(err.code(), "ACCOUNT_NOT_ACTIVE");
    assert!(h.ledger.entries().await.is_empty());
    assert_eq!(h.balance(&source).await, 1_000);
}

#[tokio::test]
async fn test_unknown_account_rejected() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, Uuid::new_v4(), 100);

    let err = h.saga.run(req).await.unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_NOT_FOUND");
}

#[tokio::test]
async fn test_currency_mismatch_rejected() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("EUR", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);

    let err = h.saga.run(req).await.unwrap_err();
    assert_eq!(err.code(), "CURRENCY_MISMATCH");
    assert!(h.ledger.entries().await.is_empty());
}

#[tokio::test]
async fn test_invalid_request_creates_no_saga() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, source.id, 100);

    assert_eq!(h.saga.run(req.clone()).await.unwrap_err(), TransferError::SameAccount);
    assert_eq!(
        h.saga.status(req.reference_id).await.unwrap_err().code(),
        "TRANSFER_NOT_FOUND"
    );
}

#[tokio::test]
async fn test_reference_reuse_with_different_parameters() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
    h.saga.run(req.clone()).await.unwrap();

    let mut altered = req.clone();
    altered.amount = 200;
    let err = h.saga.run(altered).await.unwrap_err();

    assert_eq!(err, TransferError::ReferenceConflict(req.reference_id));
    assert_eq!(h.balance(&source).await, 900);
}

// ============================================================================
// Retry & Resume Tests
// ============================================================================

#[tokio::test]
async fn test_resumes_with_partially_created_legs() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 500).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100).with_fee(10);

    // A previous attempt created the source leg and crashed
    let seeded = h
        .ledger
        .create_entry_if_absent(NewLedgerEntry::pending(
            &source,
            EntryType::Outbound,
            100,
            req.leg_ids().source,
            Map::new(),
        ))
        .await
        .unwrap();

    let result = h.saga.run(req).await.unwrap();

    assert_eq!(result.source_entry.id, seeded.id);
    assert_eq!(result.source_entry.status, EntryStatus::Success);
    assert_eq!(h.ledger.entries().await.len(), 3);
    assert_eq!(h.balance(&source).await, 890);
    assert_eq!(h.balance(&destination).await, 600);
}

#[tokio::test]
async fn test_transient_ledger_failures_are_retried() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 400);

    h.ledger.fail_next_creates(1);
    h.ledger.fail_next_begins(2);
    h.saga.run(req.clone()).await.unwrap();

    assert_eq!(h.balance(&source).await, 600);
    assert_eq!(h.balance(&destination).await, 400);
    assert_eq!(h.ledger.entries().await.len(), 2);
    assert_eq!(h.saga.status(req.reference_id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn test_exhausted_transient_failure_reopens_on_resubmit() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 400);

    // More failures than the activity policy's 5 attempts
    h.ledger.fail_next_begins(10);
    let err = h.saga.run(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), "DATABASE_ERROR");
    assert_eq!(h.saga_state(req.reference_id).await, SagaState::LockReleased);
    assert_eq!(h.balance(&source).await, 1_000);

    h.ledger.fail_next_begins(0);
    h.saga.run(req.clone()).await.unwrap();

    let record = h.saga.status(req.reference_id).await.unwrap();
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error_code, None);
    assert_eq!(h.balance(&source).await, 600);
    assert_eq!(h.balance(&destination).await, 400);
}

#[tokio::test]
async fn test_lock_timeout_then_reopen() {
    let h = TestHarness::with_config(fast_config(3));
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
    let key = TestHarness::lock_key(&source);

    h.locks
        .try_acquire(&key, "someone-else", Duration::from_secs(30))
        .await
        .unwrap();

    let err = h.saga.run(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), "LOCK_TIMEOUT");
    assert!(err.is_retryable());
    assert!(h.ledger.entries().await.is_empty());
    // The foreign holder keeps its lock
    assert_eq!(h.locks.holder(&key).as_deref(), Some("someone-else"));

    h.locks.release_if_owner(&key, "someone-else").await.unwrap();
    h.saga.run(req.clone()).await.unwrap();

    assert_eq!(h.balance(&source).await, 900);
    assert_eq!(h.saga.status(req.reference_id).await.unwrap().attempts, 2);
    assert_eq!(h.locks.holder(&key), None);
}

// ============================================================================
// Recovery Worker Tests
// ============================================================================

fn stale(mut record: SagaRecord, state: SagaState) -> SagaRecord {
    record.state = state;
    record.updated_at = Utc::now() - chrono::Duration::hours(1);
    record
}

fn worker(h: &TestHarness) -> RecoveryWorker {
    RecoveryWorker::new(
        h.saga.clone(),
        WorkerConfig {
            scan_interval: Duration::from_millis(10),
            stale_threshold: Duration::from_secs(60),
            batch_size: 10,
        },
    )
}

#[tokio::test]
async fn test_recovery_resumes_crashed_saga() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 500).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100).with_fee(10);

    // Crashed mid-activity while holding the lock
    h.store
        .put(stale(SagaRecord::new(req.clone()), SagaState::ActivityRunning));
    h.locks
        .try_acquire(
            &TestHarness::lock_key(&source),
            &req.reference_id.to_string(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    let recovered = worker(&h).scan_and_recover().await.unwrap();

    assert_eq!(recovered, 1);
    assert_eq!(h.saga_state(req.reference_id).await, SagaState::LockReleased);
    assert_eq!(h.balance(&source).await, 890);
    assert_eq!(h.balance(&destination).await, 600);
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);

    // Nothing left to recover
    assert_eq!(worker(&h).scan_and_recover().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recovery_only_releases_resolved_saga() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 50).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);

    let mut record = stale(SagaRecord::new(req.clone()), SagaState::Failed);
    record.error_code = Some("INSUFFICIENT_BALANCE".to_string());
    record.error_message = Some("Insufficient balance".to_string());
    h.store.put(record);
    h.locks
        .try_acquire(
            &TestHarness::lock_key(&source),
            &req.reference_id.to_string(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

    assert_eq!(worker(&h).scan_and_recover().await.unwrap(), 1);

    let record = h.saga.status(req.reference_id).await.unwrap();
    assert_eq!(record.state, SagaState::LockReleased);
    assert_eq!(record.error_code.as_deref(), Some("INSUFFICIENT_BALANCE"));
    assert_eq!(h.locks.holder(&TestHarness::lock_key(&source)), None);
    assert!(h.ledger.entries().await.is_empty());
}

#[tokio::test]
async fn test_recovery_ignores_fresh_sagas() {
    let h = TestHarness::new();
    let source = h.open_account("USD", 1_000).await;
    let destination = h.open_account("USD", 0).await;
    let req = TransferRequest::new(Uuid::new_v4(), source.id, destination.id, 100);
    h.store.put(SagaRecord::new(req.clone()));

    assert_eq!(worker(&h).scan_and_recover().await.unwrap(), 0);
    assert_eq!(h.saga_state(req.reference_id).await, SagaState::Started);
}
