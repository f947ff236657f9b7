//! Distributed Mutex
//!
//! A named, TTL-bounded, ownership-tagged lock on a shared store.
//! No local state survives between calls: release re-derives ownership from
//! the token instead of trusting an in-process handle.

pub mod memory;
pub mod redis_store;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use memory::InMemoryLockStore;
pub use redis_store::RedisLockStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Lock {key} is held by another owner")]
    AlreadyHeld { key: String },

    #[error("Lock {key} is not owned by this token")]
    NotOwner { key: String },

    #[error("Lock store error: {0}")]
    Store(String),
}

impl LockError {
    /// Contention and store hiccups go back through the caller's retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::AlreadyHeld { .. } | LockError::Store(_))
    }
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Store(e.to_string())
    }
}

/// Backing store contract
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Single non-blocking attempt. Succeeds when `key` is free, expired, or
    /// already held by `token` (in which case the TTL is refreshed).
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<(), LockError>;

    /// Atomically delete `key` if its holder is `token`
    async fn release_if_owner(&self, key: &str, token: &str) -> Result<(), LockError>;
}

/// (key, ownership token, ttl)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexParams {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

impl MutexParams {
    /// Lock on `account_id`, owned by the transfer `reference_id`
    pub fn for_account(namespace: &str, account_id: Uuid, reference_id: Uuid, ttl: Duration) -> Self {
        Self {
            key: format!("{namespace}_{account_id}"),
            token: reference_id.to_string(),
            ttl,
        }
    }
}

impl fmt::Display for MutexParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (owner {}, ttl {:?})", self.key, self.token, self.ttl)
    }
}

#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn LockStore>,
}

impl DistributedMutex {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub async fn acquire_lock(&self, params: &MutexParams) -> Result<(), LockError> {
        self.store
            .try_acquire(&params.key, &params.token, params.ttl)
            .await?;
        debug!(key = %params.key, token = %params.token, "Lock acquired");
        Ok(())
    }

    /// Re-establish ownership with the same token, then clear the lock.
    ///
    /// A different live holder surfaces as `NotOwner`.
    pub async fn release_lock(&self, params: &MutexParams) -> Result<(), LockError> {
        match self
            .store
            .try_acquire(&params.key, &params.token, params.ttl)
            .await
        {
            Ok(()) => {}
            Err(LockError::AlreadyHeld { key }) => return Err(LockError::NotOwner { key }),
            Err(e) => return Err(e),
        }
        self.store
            .release_if_owner(&params.key, &params.token)
            .await?;
        debug!(key = %params.key, token = %params.token, "Lock released");
        Ok(())
    }

    /// Single acquisition attempt returning a scoped guard
    pub async fn lock(&self, params: MutexParams) -> Result<LockGuard, LockError> {
        self.acquire_lock(&params).await?;
        Ok(LockGuard {
            mutex: self.clone(),
            params,
            released: false,
        })
    }
}

/// Held lock. Call [`LockGuard::release`] on every exit path; a guard dropped
/// without it schedules a best-effort release on the current runtime.
pub struct LockGuard {
    mutex: DistributedMutex,
    params: MutexParams,
    released: bool,
}

impl LockGuard {
    pub fn params(&self) -> &MutexParams {
        &self.params
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.mutex.release_lock(&self.params).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mutex = self.mutex.clone();
        let params = self.params.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = mutex.release_lock(&params).await {
                        warn!(key = %params.key, error = %e, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %self.params.key, "Lock guard dropped outside runtime; TTL will expire it");
            }
        }
    }
}
