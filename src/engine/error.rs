use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Entity absent, or present in another tenant.
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("session {0} is closed for booking: it has already started")]
    SessionClosed(Ulid),
    #[error("student already holds booking {0} on this session")]
    AlreadyBooked(Ulid),
    #[error("student {0} has no active subscription")]
    SubscriptionRequired(Ulid),
    #[error("session is full: all {0} seats taken")]
    SessionFull(u32),
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("instructor already teaches session {0} at that time")]
    Conflict(Ulid),
    #[error("instructor is unavailable at that time (blackout {0})")]
    Unavailable(Ulid),
    #[error("booking cannot go from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl EngineError {
    /// Expected, user-correctable outcomes. These are reported to the caller
    /// and never logged as system errors.
    pub fn is_user_outcome(&self) -> bool {
        !matches!(self, EngineError::StorageUnavailable(_))
    }

    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SessionClosed(_) => "session_closed",
            EngineError::AlreadyBooked(_) => "already_booked",
            EngineError::SubscriptionRequired(_) => "subscription_required",
            EngineError::SessionFull(_) => "session_full",
            EngineError::InvalidRule(_) => "invalid_rule",
            EngineError::InvalidSession(_) => "invalid_session",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StorageUnavailable(_) => "storage_unavailable",
        }
    }
}
