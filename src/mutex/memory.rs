//! Process-local lock store (tests and single-node runs)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{LockError, LockStore};

#[derive(Default)]
pub struct InMemoryLockStore {
    /// key -> (owner token, expiry)
    locks: DashMap<String, (String, Instant)>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of `key`, if any
    pub fn holder(&self, key: &str) -> Option<String> {
        self.locks
            .get(key)
            .filter(|entry| entry.1 > Instant::now())
            .map(|entry| entry.0.clone())
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| LockError::Store(format!("ttl {ttl:?} out of range")))?;
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (holder, held_until) = occupied.get();
                if *held_until > now && holder != token {
                    return Err(LockError::AlreadyHeld {
                        key: key.to_string(),
                    });
                }
                occupied.insert((token.to_string(), expires_at));
            }
            Entry::Vacant(vacant) => {
                vacant.insert((token.to_string(), expires_at));
            }
        }
        Ok(())
    }

    async fn release_if_owner(&self, key: &str, token: &str) -> Result<(), LockError> {
        let removed = self
            .locks
            .remove_if(key, |_, (holder, expires_at)| {
                holder == token && *expires_at > Instant::now()
            });
        if removed.is_some() {
            Ok(())
        } else {
            Err(LockError::NotOwner {
                key: key.to_string(),
            })
        }
    }
}
