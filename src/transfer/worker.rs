//! Recovery Worker
//!
//! Background worker that scans for and resumes stuck sagas.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::coordinator::TransferSaga;
use super::error::TransferError;
use super::state::SagaState;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale sagas
    pub scan_interval: Duration,
    /// How long a saga must be untouched to be considered stale
    pub stale_threshold: Duration,
    /// Maximum sagas to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            // must exceed the longest lock wait + activity retry budget
            stale_threshold: Duration::from_secs(600),
            batch_size: 100,
        }
    }
}

/// Recovery Worker
///
/// Sagas stuck before an outcome are re-driven from their last state.
/// Resolved sagas whose lock was never released only get the release.
pub struct RecoveryWorker {
    saga: Arc<TransferSaga>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(saga: Arc<TransferSaga>, config: WorkerConfig) -> Self {
        Self { saga, config }
    }

    pub fn with_defaults(saga: Arc<TransferSaga>) -> Self {
        Self::new(saga, WorkerConfig::default())
    }

    /// Run the recovery loop forever
    pub async fn run(&self) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan and recovery cycle; returns how many sagas reached LOCK_RELEASED
    pub async fn scan_and_recover(&self) -> Result<usize, TransferError> {
        let stale = self
            .saga
            .store()
            .find_stale(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("No stale sagas found");
            return Ok(0);
        }

        info!(count = stale.len(), "Found stale sagas to recover");

        let mut recovered = 0;
        for record in stale {
            let reference_id = record.request.reference_id;
            debug!(
                reference_id = %reference_id,
                state = %record.state,
                attempts = record.attempts,
                "Recovering saga"
            );

            match self.saga.run(record.request).await {
                Ok(_) => {
                    info!(reference_id = %reference_id, old_state = %record.state, "Saga recovered");
                }
                Err(e) => {
                    warn!(
                        reference_id = %reference_id,
                        code = e.code(),
                        error = %e,
                        "Recovered saga ended in failure"
                    );
                }
            }

            match self.saga.status(reference_id).await {
                Ok(current) if current.state == SagaState::LockReleased => recovered += 1,
                Ok(current) => {
                    warn!(reference_id = %reference_id, state = %current.state, "Saga still not released");
                }
                Err(e) => error!(reference_id = %reference_id, error = %e, "Failed to reload saga"),
            }
        }

        if recovered > 0 {
            info!(count = recovered, "Recovered sagas this scan");
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(600));
        assert_eq!(config.batch_size, 100);
    }
}
