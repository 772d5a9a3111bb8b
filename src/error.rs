use thiserror::Error;

use crate::grouping::GroupingError;
use crate::phase::Phase;

/// Rejections surfaced to callers. Every variant leaves stored state untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("no verified session for this connection")]
    NoSession,

    #[error("class {0} not found")]
    ClassNotFound(u64),

    #[error("unauthorized: {action} requires {required}")]
    Unauthorized {
        action: &'static str,
        required: &'static str,
    },

    #[error("not enrolled in class {class_id}")]
    NotEnrolled { class_id: u64 },

    /// Carries the current phase so the caller can resync
    #[error("invalid transition {from} -> {to}; current phase is {from}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("grouping is not available during {phase}")]
    GroupingNotAllowed { phase: Phase },

    #[error("concurrent modification: expected revision {expected}, current revision is {actual}; retry against the current state")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{kind} already recorded for student {student_id}")]
    AlreadyRecorded {
        kind: &'static str,
        student_id: String,
    },

    #[error("cannot join group {requested}: {reason}")]
    InvalidGroupJoin { requested: u32, reason: &'static str },

    #[error(transparent)]
    Grouping(#[from] GroupingError),
}
