//! Transfer Core Types
//!
//! Request, derived leg identifiers, result and the persisted saga record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::ledger::{AccountId, LedgerEntry, MinorUnits};

use super::error::TransferError;
use super::state::SagaState;

pub const SOURCE_LEG_PREFIX: &str = "transfer-source";
pub const DESTINATION_LEG_PREFIX: &str = "transfer-destination";
pub const FEE_LEG_PREFIX: &str = "transfer-fee";

/// Deterministic per-leg reference id: UUIDv5(DNS, "<prefix>-<reference_id>")
pub fn derive_leg_id(prefix: &str, reference_id: Uuid) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_DNS,
        format!("{prefix}-{reference_id}").as_bytes(),
    )
}

/// Deterministic saga identity for a caller reference id
pub fn saga_id_for(reference_id: Uuid) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, reference_id.to_string().as_bytes())
}

// ============================================================================
// Request
// ============================================================================

/// Transfer request; `reference_id` is the idempotency key of the whole transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub reference_id: Uuid,
    pub amount: MinorUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<MinorUnits>,
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TransferRequest {
    pub fn new(
        reference_id: Uuid,
        source_account_id: AccountId,
        destination_account_id: AccountId,
        amount: MinorUnits,
    ) -> Self {
        Self {
            reference_id,
            amount,
            fee_amount: None,
            source_account_id,
            destination_account_id,
            metadata: Map::new(),
        }
    }

    pub fn with_fee(mut self, fee_amount: MinorUnits) -> Self {
        self.fee_amount = Some(fee_amount);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stateless checks, run before any saga work
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.amount <= 0 {
            return Err(TransferError::InvalidAmount);
        }
        if matches!(self.fee_amount, Some(fee) if fee < 0) {
            return Err(TransferError::InvalidFee);
        }
        if self.source_account_id == self.destination_account_id {
            return Err(TransferError::SameAccount);
        }
        self.total_debit()?;
        Ok(())
    }

    /// Fee to charge; a zero fee is no fee
    pub fn fee(&self) -> Option<MinorUnits> {
        self.fee_amount.filter(|fee| *fee > 0)
    }

    /// amount + fee
    pub fn total_debit(&self) -> Result<MinorUnits, TransferError> {
        self.amount
            .checked_add(self.fee().unwrap_or(0))
            .ok_or(TransferError::Overflow)
    }

    pub fn saga_id(&self) -> Uuid {
        saga_id_for(self.reference_id)
    }

    pub fn leg_ids(&self) -> LegReferenceIds {
        LegReferenceIds::derive(self.reference_id, self.fee().is_some())
    }
}

/// Reference ids of the ledger legs of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LegReferenceIds {
    pub source: Uuid,
    pub destination: Uuid,
    pub fee: Option<Uuid>,
}

impl LegReferenceIds {
    pub fn derive(reference_id: Uuid, with_fee: bool) -> Self {
        Self {
            source: derive_leg_id(SOURCE_LEG_PREFIX, reference_id),
            destination: derive_leg_id(DESTINATION_LEG_PREFIX, reference_id),
            fee: with_fee.then(|| derive_leg_id(FEE_LEG_PREFIX, reference_id)),
        }
    }

    /// Legs in creation order: source, fee (if any), destination
    pub fn all(&self) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(3);
        ids.push(self.source);
        ids.extend(self.fee);
        ids.push(self.destination);
        ids
    }
}

// ============================================================================
// Result
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub reference_id: Uuid,
    pub saga_id: Uuid,
    pub legs: LegReferenceIds,
    pub source_entry: LedgerEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_entry: Option<LedgerEntry>,
    pub destination_entry: LedgerEntry,
}

impl TransferResult {
    pub fn entries(&self) -> Vec<&LedgerEntry> {
        let mut entries = vec![&self.source_entry];
        entries.extend(self.fee_entry.as_ref());
        entries.push(&self.destination_entry);
        entries
    }
}

// ============================================================================
// Saga Record
// ============================================================================

/// Persisted saga: request parameters, state and recorded outcome
#[derive(Debug, Clone, PartialEq)]
pub struct SagaRecord {
    pub saga_id: Uuid,
    pub request: TransferRequest,
    pub state: SagaState,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Number of times the saga was (re)started
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    pub fn new(request: TransferRequest) -> Self {
        let now = Utc::now();
        Self {
            saga_id: request.saga_id(),
            request,
            state: SagaState::Started,
            error_code: None,
            error_message: None,
            attempts: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recorded outcome, once the saga is resolved
    pub fn outcome(&self) -> Option<Result<(), TransferError>> {
        match self.state {
            SagaState::Succeeded => Some(Ok(())),
            SagaState::Failed => Some(Err(self.recorded_error())),
            SagaState::LockReleased => Some(match self.error_code {
                None => Ok(()),
                Some(_) => Err(self.recorded_error()),
            }),
            _ => None,
        }
    }

    fn recorded_error(&self) -> TransferError {
        TransferError::recorded(
            self.error_code.as_deref().unwrap_or("SYSTEM_ERROR"),
            self.error_message.clone().unwrap_or_default(),
        )
    }
}
