//! Transfer Activity Set
//!
//! One call to [`TransferActivities::transfer`] is one retryable attempt:
//! validate accounts, create the PENDING legs through the finder-or-creator,
//! then settle. Settlement applies balance deltas and finalizes legs in a
//! single storage transaction, so each leg's delta lands exactly once no
//! matter how many attempts run.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::SagaContext;
use crate::ledger::{
    Account, AccountStatus, EntryStatus, EntryType, FinderOrCreator, LedgerEntry,
    LedgerRepository, NewLedgerEntry,
};

use super::error::TransferError;
use super::types::{LegReferenceIds, TransferRequest, TransferResult};

#[derive(Clone)]
pub struct TransferActivities {
    repo: Arc<dyn LedgerRepository>,
    finder: FinderOrCreator,
}

impl TransferActivities {
    pub fn new(repo: Arc<dyn LedgerRepository>) -> Self {
        let finder = FinderOrCreator::new(repo.clone());
        Self { repo, finder }
    }

    /// One attempt of the transfer activity
    pub async fn transfer(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let legs = request.leg_ids();

        // A previous attempt already settled everything
        if let Some(result) = self.load_result(ctx, request).await? {
            info!(reference_id = %ctx.reference_id(), "Transfer already settled");
            return Ok(result);
        }

        match self.attempt(ctx, request, &legs).await {
            Err(e) if !e.is_retryable() => {
                self.abandon_pending_legs(ctx, &legs).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
        legs: &LegReferenceIds,
    ) -> Result<TransferResult, TransferError> {
        let (source, destination) = self.validate_accounts(request).await?;
        self.create_pending_legs(ctx, request, legs, &source, &destination)
            .await?;
        self.settle(ctx, request, legs).await
    }

    /// Both accounts exist, are ACTIVE, share a currency, and the source covers amount + fee
    pub async fn validate_accounts(
        &self,
        request: &TransferRequest,
    ) -> Result<(Account, Account), TransferError> {
        let source = self.load_active_account(request.source_account_id).await?;
        let destination = self
            .load_active_account(request.destination_account_id)
            .await?;

        if source.currency != destination.currency {
            return Err(TransferError::CurrencyMismatch {
                source_currency: source.currency.to_string(),
                destination_currency: destination.currency.to_string(),
            });
        }

        let total = request.total_debit()?;
        if total > source.balance {
            return Err(TransferError::InsufficientBalance {
                account_id: source.id,
                requested: total,
                available: source.balance,
            });
        }

        Ok((source, destination))
    }

    async fn load_active_account(&self, id: Uuid) -> Result<Account, TransferError> {
        let account = self
            .repo
            .get_account(id)
            .await?
            .ok_or(TransferError::AccountNotFound(id))?;
        if account.status != AccountStatus::Active {
            return Err(TransferError::AccountNotActive {
                account_id: id,
                status: account.status.to_string(),
            });
        }
        Ok(account)
    }

    /// Source debit, fee debit (if any), destination credit; each one idempotent
    pub async fn create_pending_legs(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
        legs: &LegReferenceIds,
        source: &Account,
        destination: &Account,
    ) -> Result<(), TransferError> {
        let source_entry = self
            .finder
            .call(NewLedgerEntry::pending(
                source,
                EntryType::Outbound,
                request.amount,
                legs.source,
                leg_metadata(request, EntryType::Outbound, legs.destination, destination.id),
            ))
            .await?;

        if let (Some(fee_ref), Some(fee)) = (legs.fee, request.fee()) {
            self.finder
                .call(NewLedgerEntry::pending(
                    source,
                    EntryType::OutgoingFee,
                    fee,
                    fee_ref,
                    leg_metadata(request, EntryType::OutgoingFee, legs.source, source.id),
                ))
                .await?;
        }

        self.finder
            .call(NewLedgerEntry::pending(
                destination,
                EntryType::Inbound,
                request.amount,
                legs.destination,
                leg_metadata(request, EntryType::Inbound, legs.source, source.id),
            ))
            .await?;

        debug!(
            reference_id = %ctx.reference_id(),
            source_entry = %source_entry.id,
            "Pending legs in place"
        );
        Ok(())
    }

    /// Apply the delta of every still-PENDING leg and mark it SUCCESS, atomically.
    ///
    /// Leg rows are locked first, then account rows in ascending id order so
    /// opposite-direction transfers cannot deadlock.
    pub async fn settle(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
        legs: &LegReferenceIds,
    ) -> Result<TransferResult, TransferError> {
        let mut tx = self.repo.begin().await?;

        let mut entries = Vec::with_capacity(3);
        for reference_id in legs.all() {
            let entry = tx.get_entry_for_update(reference_id).await?.ok_or_else(|| {
                TransferError::SystemError(format!("leg {reference_id} missing at settlement"))
            })?;
            if entry.status == EntryStatus::Failure {
                return Err(TransferError::InvalidStateTransition(format!(
                    "leg {reference_id} already FAILURE"
                )));
            }
            entries.push(entry);
        }

        let mut deltas: BTreeMap<Uuid, i64> = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.status == EntryStatus::Pending) {
            let delta = deltas.entry(entry.account_id).or_default();
            *delta = delta
                .checked_add(entry.signed_amount())
                .ok_or(TransferError::Overflow)?;
        }

        for (account_id, delta) in &deltas {
            let account = tx.apply_balance_delta(*account_id, *delta).await?;
            debug!(
                reference_id = %ctx.reference_id(),
                account_id = %account_id,
                delta,
                balance = account.balance,
                "Balance delta applied"
            );
        }

        let mut settled = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = if entry.status == EntryStatus::Pending {
                tx.set_entry_status(entry.id, EntryStatus::Success).await?
            } else {
                entry
            };
            settled.push(entry);
        }

        tx.commit().await?;

        info!(
            reference_id = %ctx.reference_id(),
            accounts = deltas.len(),
            "Transfer settled"
        );
        assemble(ctx, request, legs, settled)
    }

    /// The settled result, if every leg already exists and is SUCCESS
    pub async fn load_result(
        &self,
        ctx: &SagaContext,
        request: &TransferRequest,
    ) -> Result<Option<TransferResult>, TransferError> {
        let legs = request.leg_ids();
        let mut entries = Vec::with_capacity(3);
        for reference_id in legs.all() {
            match self.repo.get_entry_by_reference_id(reference_id).await? {
                Some(entry) if entry.status == EntryStatus::Success => entries.push(entry),
                _ => return Ok(None),
            }
        }
        assemble(ctx, request, &legs, entries).map(Some)
    }

    /// Move legs left PENDING by a rejected attempt to FAILURE. Best effort.
    pub async fn abandon_pending_legs(&self, ctx: &SagaContext, legs: &LegReferenceIds) {
        if let Err(e) = self.try_abandon(legs).await {
            warn!(
                reference_id = %ctx.reference_id(),
                error = %e,
                "Could not mark pending legs as FAILURE"
            );
        }
    }

    async fn try_abandon(&self, legs: &LegReferenceIds) -> Result<(), TransferError> {
        let mut tx = self.repo.begin().await?;
        let mut abandoned = 0usize;
        for reference_id in legs.all() {
            if let Some(entry) = tx.get_entry_for_update(reference_id).await?
                && entry.status == EntryStatus::Pending
            {
                tx.set_entry_status(entry.id, EntryStatus::Failure).await?;
                abandoned += 1;
            }
        }
        tx.commit().await?;
        if abandoned > 0 {
            info!(count = abandoned, "Pending legs marked FAILURE");
        }
        Ok(())
    }
}

fn leg_metadata(
    request: &TransferRequest,
    entry_type: EntryType,
    linked_reference_id: Uuid,
    linked_account_id: Uuid,
) -> Map<String, Value> {
    let mut metadata = request.metadata.clone();
    metadata.insert("operation_type".into(), json!(entry_type.as_str()));
    metadata.insert(
        "transfer_reference_id".into(),
        json!(request.reference_id.to_string()),
    );
    metadata.insert(
        "linked_transaction_id".into(),
        json!(linked_reference_id.to_string()),
    );
    metadata.insert(
        "linked_account_id".into(),
        json!(linked_account_id.to_string()),
    );
    metadata.insert(
        "destination_account_id".into(),
        json!(request.destination_account_id.to_string()),
    );
    metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    metadata
}

/// Entries arrive in `legs.all()` order: source, fee (if any), destination
fn assemble(
    ctx: &SagaContext,
    request: &TransferRequest,
    legs: &LegReferenceIds,
    entries: Vec<LedgerEntry>,
) -> Result<TransferResult, TransferError> {
    let mut iter = entries.into_iter();
    let missing = || TransferError::SystemError("incomplete leg set".to_string());

    let source_entry = iter.next().ok_or_else(missing)?;
    let fee_entry = match legs.fee {
        Some(_) => Some(iter.next().ok_or_else(missing)?),
        None => None,
    };
    let destination_entry = iter.next().ok_or_else(missing)?;

    Ok(TransferResult {
        reference_id: request.reference_id,
        saga_id: ctx.saga_id(),
        legs: *legs,
        source_entry,
        fee_entry,
        destination_entry,
    })
}
