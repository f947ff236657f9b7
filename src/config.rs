use serde::Deserialize;
use std::fs;
use std::time::Duration;

use anyhow::Context;

use crate::transfer::coordinator::SagaConfig;
use crate::transfer::retry::{ActivityOptions, RetryPolicy};
use crate::transfer::worker::WorkerConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub server: ServerConfig,
    pub postgres_url: String,
    pub redis_url: String,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long POST /transfers waits for the saga before answering 504
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub lock_namespace: String,
    pub mutex_ttl_secs: u64,
    pub lock_timeout_secs: u64,
    pub lock_retry: RetryPolicy,
    pub activity_timeout_secs: u64,
    pub activity_retry: RetryPolicy,
    pub recovery: RecoveryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            lock_namespace: "transfers_mutex".to_string(),
            mutex_ttl_secs: 300,
            lock_timeout_secs: 10,
            lock_retry: RetryPolicy::lock_default(),
            activity_timeout_secs: 60,
            activity_retry: RetryPolicy::activity_default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Build the saga settings, rejecting a mutex TTL the activity can outlive
    pub fn saga_config(&self) -> anyhow::Result<SagaConfig> {
        let config = SagaConfig {
            lock_namespace: self.lock_namespace.clone(),
            mutex_ttl: Duration::from_secs(self.mutex_ttl_secs),
            lock_acquisition: ActivityOptions {
                start_to_close_timeout: Duration::from_secs(self.lock_timeout_secs),
                retry_policy: self.lock_retry.clone(),
            },
            transfer_activity: ActivityOptions {
                start_to_close_timeout: Duration::from_secs(self.activity_timeout_secs),
                retry_policy: self.activity_retry.clone(),
            },
        };
        config.validate().context("invalid transfer config")?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            scan_interval_secs: worker.scan_interval.as_secs(),
            stale_threshold_secs: worker.stale_threshold.as_secs(),
            batch_size: worker.batch_size,
        }
    }
}

impl RecoveryConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            batch_size: self.batch_size,
        }
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`, then apply environment overrides
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config yaml")
    }

    /// DATABASE_URL, REDIS_URL, TRANSFER_MUTEX_TTL_SECONDS, SERVER_ADDRESS
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.postgres_url = url;
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(ttl) = lookup("TRANSFER_MUTEX_TTL_SECONDS") {
            self.transfer.mutex_ttl_secs = ttl
                .parse()
                .with_context(|| format!("TRANSFER_MUTEX_TTL_SECONDS is not a number: {ttl}"))?;
        }
        if let Some(address) = lookup("SERVER_ADDRESS") {
            let (host, port) = address
                .rsplit_once(':')
                .with_context(|| format!("SERVER_ADDRESS must be host:port, got {address}"))?;
            self.server.host = host.to_string();
            self.server.port = port
                .parse()
                .with_context(|| format!("invalid port in SERVER_ADDRESS: {port}"))?;
        }
        Ok(())
    }
}
