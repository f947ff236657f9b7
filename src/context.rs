//! Explicit per-saga context
//!
//! Carries the correlation ids and the tracing span for one saga run. It is
//! passed by reference through every activity call instead of relying on
//! task-local or global state.

use tracing::{Span, info_span};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SagaContext {
    reference_id: Uuid,
    saga_id: Uuid,
    span: Span,
}

impl SagaContext {
    pub fn new(reference_id: Uuid, saga_id: Uuid) -> Self {
        let span = info_span!(
            "transfer_saga",
            reference_id = %reference_id,
            saga_id = %saga_id
        );
        Self {
            reference_id,
            saga_id,
            span,
        }
    }

    pub fn reference_id(&self) -> Uuid {
        self.reference_id
    }

    pub fn saga_id(&self) -> Uuid {
        self.saga_id
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Child span for one activity attempt
    pub fn activity_span(&self, activity: &'static str, attempt: u32) -> Span {
        info_span!(parent: &self.span, "activity", activity, attempt)
    }
}
