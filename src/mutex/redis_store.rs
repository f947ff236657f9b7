//! Redis-backed lock store
//!
//! Both operations are single Lua scripts so check-and-set and
//! check-and-delete are atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use super::{LockError, LockStore};

const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
end
if current == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockStore {
    manager: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisLockStore {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        info!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        info!("Redis connection established");

        Ok(Self {
            manager,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    pub async fn health_check(&self) -> Result<(), LockError> {
        let mut conn = self.manager.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let mut conn = self.manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let acquired: i32 = self
            .acquire
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        if acquired == 1 {
            Ok(())
        } else {
            Err(LockError::AlreadyHeld {
                key: key.to_string(),
            })
        }
    }

    async fn release_if_owner(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.manager.clone();
        let deleted: i32 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 1 {
            Ok(())
        } else {
            Err(LockError::NotOwner {
                key: key.to_string(),
            })
        }
    }
}
