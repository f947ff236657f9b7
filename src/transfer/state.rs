//! Transfer Saga State Definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.

use std::fmt;

/// Transfer saga states
///
/// ```text
/// STARTED → LOCK_ACQUIRED → ACTIVITY_RUNNING → SUCCEEDED ─┐
///    │            │                 └────────→ FAILED ────┴→ LOCK_RELEASED
///    └────────────┴─────────────────────────→ FAILED
/// ```
///
/// LOCK_RELEASED is terminal except for `reopen`, which moves a saga whose
/// failure was transient back to STARTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SagaState {
    /// Saga recorded, lock not yet held
    Started = 0,

    /// Source account mutex held
    LockAcquired = 10,

    /// Transfer activity dispatched (possibly mid-retry)
    ActivityRunning = 20,

    /// Activity returned success; lock still held
    Succeeded = 30,

    /// Terminal error recorded; lock may still be held
    Failed = -10,

    /// Terminal: outcome recorded and lock released
    LockReleased = 40,
}

impl SagaState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::LockReleased)
    }

    /// Outcome is known (success or failure), lock release may be pending
    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            SagaState::Succeeded | SagaState::Failed | SagaState::LockReleased
        )
    }

    /// Explicit transition table. Same-state moves are rejected.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Started, LockAcquired)
                | (Started, Failed)
                | (LockAcquired, ActivityRunning)
                | (LockAcquired, Failed)
                | (ActivityRunning, Succeeded)
                | (ActivityRunning, Failed)
                | (Succeeded, LockReleased)
                | (Failed, LockReleased)
                | (LockReleased, Started)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SagaState::Started),
            10 => Some(SagaState::LockAcquired),
            20 => Some(SagaState::ActivityRunning),
            30 => Some(SagaState::Succeeded),
            -10 => Some(SagaState::Failed),
            40 => Some(SagaState::LockReleased),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "STARTED",
            SagaState::LockAcquired => "LOCK_ACQUIRED",
            SagaState::ActivityRunning => "ACTIVITY_RUNNING",
            SagaState::Succeeded => "SUCCEEDED",
            SagaState::Failed => "FAILED",
            SagaState::LockReleased => "LOCK_RELEASED",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for SagaState {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        SagaState::from_id(value).ok_or(())
    }
}
