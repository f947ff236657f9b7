//! Transfer Saga Orchestrator
//!
//! Drives one transfer through the saga state machine:
//! persist, lock the source account, run the transfer activity, record the
//! outcome, release the lock. Each state change is a CAS on the saga store,
//! so a saga that crashed mid-way can be resumed from its last state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::context::SagaContext;
use crate::ledger::LedgerRepository;
use crate::mutex::{DistributedMutex, LockGuard, MutexParams};

use super::activities::TransferActivities;
use super::db::SagaStore;
use super::error::TransferError;
use super::retry::{ActivityOptions, RetryPolicy, execute_activity};
use super::state::SagaState;
use super::types::{SagaRecord, TransferRequest, TransferResult, saga_id_for};

type SagaFuture = Shared<BoxFuture<'static, Result<TransferResult, TransferError>>>;

#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Lock key prefix: `<namespace>_<source account id>`
    pub lock_namespace: String,
    pub mutex_ttl: Duration,
    pub lock_acquisition: ActivityOptions,
    pub transfer_activity: ActivityOptions,
}

impl SagaConfig {
    /// The lock is refreshed at the start of every transfer attempt, so it
    /// must outlive one attempt plus the longest backoff before the next.
    pub fn validate(&self) -> anyhow::Result<()> {
        let window = self.transfer_activity.refresh_window();
        anyhow::ensure!(
            self.mutex_ttl > window,
            "mutex ttl {:?} must exceed the transfer attempt window {:?}",
            self.mutex_ttl,
            window
        );
        Ok(())
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            lock_namespace: "transfers_mutex".to_string(),
            mutex_ttl: Duration::from_secs(300),
            lock_acquisition: ActivityOptions {
                start_to_close_timeout: Duration::from_secs(10),
                retry_policy: RetryPolicy::lock_default(),
            },
            transfer_activity: ActivityOptions {
                start_to_close_timeout: Duration::from_secs(60),
                retry_policy: RetryPolicy::activity_default(),
            },
        }
    }
}

pub struct TransferSaga {
    store: Arc<dyn SagaStore>,
    activities: TransferActivities,
    mutex: DistributedMutex,
    config: SagaConfig,
    /// saga id -> (request, shared execution)
    inflight: DashMap<Uuid, (TransferRequest, SagaFuture)>,
}

impl TransferSaga {
    pub fn new(
        store: Arc<dyn SagaStore>,
        ledger: Arc<dyn LedgerRepository>,
        mutex: DistributedMutex,
        config: SagaConfig,
    ) -> Self {
        Self {
            store,
            activities: TransferActivities::new(ledger),
            mutex,
            config,
            inflight: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    /// Run (or join, or replay) the saga for `request`.
    ///
    /// The saga executes on its own task: if the caller stops waiting, it
    /// still runs to completion.
    pub async fn run(
        self: &Arc<Self>,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        request.validate()?;
        let saga_id = request.saga_id();

        let execution = match self.inflight.entry(saga_id) {
            Entry::Occupied(running) => {
                let (running_request, execution) = running.get();
                if *running_request != request {
                    return Err(TransferError::ReferenceConflict(request.reference_id));
                }
                debug!(reference_id = %request.reference_id, "Joining in-flight saga");
                execution.clone()
            }
            Entry::Vacant(slot) => {
                let saga = Arc::clone(self);
                let spawned = request.clone();
                let handle = tokio::spawn(async move {
                    let result = saga.execute(spawned).await;
                    saga.inflight.remove(&saga_id);
                    result
                });
                let execution = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(TransferError::SystemError(format!("saga task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                slot.insert((request, execution.clone()));
                execution
            }
        };

        execution.await
    }

    /// Current saga record for a caller reference id
    pub async fn status(&self, reference_id: Uuid) -> Result<SagaRecord, TransferError> {
        self.store
            .get(saga_id_for(reference_id))
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(reference_id.to_string()))
    }

    async fn execute(&self, request: TransferRequest) -> Result<TransferResult, TransferError> {
        let ctx = SagaContext::new(request.reference_id, request.saga_id());
        let span = ctx.span().clone();
        self.execute_in(&ctx, request).instrument(span).await
    }

    async fn execute_in(
        &self,
        ctx: &SagaContext,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let record = self
            .store
            .create_or_get(SagaRecord::new(request.clone()))
            .await?;

        if record.request != request {
            warn!("Reference id reused with different parameters");
            return Err(TransferError::ReferenceConflict(request.reference_id));
        }

        match record.state {
            SagaState::LockReleased => self.replay(ctx, record).await,
            SagaState::Succeeded | SagaState::Failed => self.finish_unreleased(ctx, &record).await,
            state => self.drive(ctx, &record.request, state).await,
        }
    }

    /// Saga already completed: hand back the recorded outcome, or reopen it
    /// if it ended on a transient failure
    async fn replay(
        &self,
        ctx: &SagaContext,
        record: SagaRecord,
    ) -> Result<TransferResult, TransferError> {
        match record.outcome() {
            Some(Ok(())) => {
                info!("Replaying completed transfer");
                self.load_settled(ctx, &record.request).await
            }
            Some(Err(e)) if !e.is_retryable() => {
                info!(code = e.code(), "Replaying recorded failure");
                Err(e)
            }
            _ => {
                info!(
                    attempts = record.attempts,
                    "Reopening saga after transient failure"
                );
                if !self.store.reopen(ctx.saga_id()).await? {
                    warn!("Saga was reopened concurrently");
                }
                self.drive(ctx, &record.request, SagaState::Started).await
            }
        }
    }

    async fn drive(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
        state: SagaState,
    ) -> Result<TransferResult, TransferError> {
        info!(state = %state, "Driving saga");

        let guard = match self.acquire_lock(ctx, request).await {
            Ok(guard) => guard,
            Err(e) => {
                if let Some(resolved) = self.record_outcome(ctx, state, Some(&e)).await {
                    self.mark_released(ctx, resolved).await;
                }
                return Err(e);
            }
        };

        let (outcome, resolved) = match self.enter_activity(ctx, state).await {
            Ok(()) => {
                let outcome = self.run_activity(ctx, request).await;
                let resolved = self
                    .record_outcome(ctx, SagaState::ActivityRunning, outcome.as_ref().err())
                    .await;
                (outcome, resolved)
            }
            Err(e) => (Err(e), None),
        };

        // Release never blocks returning the result; the TTL bounds a failed release
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Lock release failed; TTL will expire it");
        }
        if let Some(resolved) = resolved {
            self.mark_released(ctx, resolved).await;
        }

        match &outcome {
            Ok(result) => info!(legs = result.entries().len(), "Transfer succeeded"),
            Err(e) => warn!(code = e.code(), error = %e, "Transfer failed"),
        }
        outcome
    }

    async fn acquire_lock(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
    ) -> Result<LockGuard, TransferError> {
        let params = self.lock_params(request);
        let mutex = &self.mutex;

        let acquired = execute_activity("acquire_lock", &self.config.lock_acquisition, |attempt| {
            let params = params.clone();
            async move { mutex.lock(params).await.map_err(TransferError::from) }
                .instrument(ctx.activity_span("acquire_lock", attempt))
        })
        .await;

        match acquired {
            Ok(guard) => {
                info!(key = %guard.params().key, "Account lock acquired");
                Ok(guard)
            }
            Err(TransferError::LockContended(key)) => {
                warn!(key = %key, "Gave up waiting for account lock");
                Err(TransferError::LockTimeout(key))
            }
            Err(e) => Err(e),
        }
    }

    async fn enter_activity(
        &self,
        ctx: &SagaContext,
        state: SagaState,
    ) -> Result<(), TransferError> {
        let mut state = state;
        if state == SagaState::Started {
            self.transition(ctx, SagaState::Started, SagaState::LockAcquired)
                .await?;
            state = SagaState::LockAcquired;
        }
        if state == SagaState::LockAcquired {
            self.transition(ctx, SagaState::LockAcquired, SagaState::ActivityRunning)
                .await?;
        }
        Ok(())
    }

    async fn run_activity(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let activities = &self.activities;
        let mutex = &self.mutex;
        let params = self.lock_params(request);
        execute_activity("transfer", &self.config.transfer_activity, |attempt| {
            let params = &params;
            async move {
                // Same-token reacquire pushes the expiry past this attempt
                mutex.acquire_lock(params).await?;
                activities.transfer(ctx, request).await
            }
            .instrument(ctx.activity_span("transfer", attempt))
        })
        .await
    }

    /// Resolved but the lock was never released (crash between the two)
    async fn finish_unreleased(
        &self,
        ctx: &SagaContext,
        record: &SagaRecord,
    ) -> Result<TransferResult, TransferError> {
        info!(state = %record.state, "Releasing lock of resolved saga");
        if let Err(e) = self.mutex.release_lock(&self.lock_params(&record.request)).await {
            warn!(error = %e, "Lock release failed; TTL will expire it");
        }
        self.mark_released(ctx, record.state).await;

        match record.outcome() {
            Some(Ok(())) => self.load_settled(ctx, &record.request).await,
            Some(Err(e)) => Err(e),
            None => Err(TransferError::InvalidStateTransition(format!(
                "saga in {} has no outcome",
                record.state
            ))),
        }
    }

    async fn load_settled(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        self.activities
            .load_result(ctx, request)
            .await?
            .ok_or_else(|| {
                TransferError::SystemError("succeeded saga has unsettled legs".to_string())
            })
    }

    async fn transition(
        &self,
        ctx: &SagaContext,
        from: SagaState,
        to: SagaState,
    ) -> Result<(), TransferError> {
        if !from.can_transition_to(to) {
            return Err(TransferError::InvalidStateTransition(format!("{from} -> {to}")));
        }
        if self.store.update_state_if(ctx.saga_id(), from, to).await? {
            debug!(from = %from, to = %to, "Saga state advanced");
        } else {
            warn!(from = %from, to = %to, "Saga state moved concurrently; continuing");
        }
        Ok(())
    }

    /// CAS `expected` -> SUCCEEDED / FAILED. Returns the recorded state, if any.
    async fn record_outcome(
        &self,
        ctx: &SagaContext,
        expected: SagaState,
        error: Option<&TransferError>,
    ) -> Option<SagaState> {
        let resolved = match error {
            None => SagaState::Succeeded,
            Some(_) => SagaState::Failed,
        };
        if !expected.can_transition_to(resolved) {
            warn!(from = %expected, to = %resolved, "Outcome not recordable from this state");
            return None;
        }

        match self
            .store
            .record_outcome(ctx.saga_id(), expected, resolved, error)
            .await
        {
            Ok(true) => Some(resolved),
            Ok(false) => {
                warn!(expected = %expected, "Saga state moved concurrently; outcome not recorded");
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to record saga outcome");
                None
            }
        }
    }

    async fn mark_released(&self, ctx: &SagaContext, from: SagaState) {
        match self
            .store
            .update_state_if(ctx.saga_id(), from, SagaState::LockReleased)
            .await
        {
            Ok(true) => debug!(outcome = %from, "Saga lock released"),
            Ok(false) => warn!(from = %from, "Saga state moved before release was recorded"),
            Err(e) => error!(error = %e, "Failed to record lock release"),
        }
    }

    fn lock_params(&self, request: &TransferRequest) -> MutexParams {
        MutexParams::for_account(
            &self.config.lock_namespace,
            request.source_account_id,
            request.reference_id,
            self.config.mutex_ttl,
        )
    }
}
