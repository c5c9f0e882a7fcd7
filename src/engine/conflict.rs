use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSession(
            "start must be before end".into(),
        ));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::LimitExceeded("session longer than a day"));
    }
    Ok(())
}

pub(crate) fn validate_template(placement: &Placement, total_seats: u32) -> Result<(), EngineError> {
    if total_seats == 0 {
        return Err(EngineError::InvalidSession("seats must be at least 1".into()));
    }
    if total_seats > MAX_SEATS_PER_SESSION {
        return Err(EngineError::LimitExceeded("too many seats"));
    }
    if placement.modality.trim().is_empty() {
        return Err(EngineError::InvalidSession("modality must not be empty".into()));
    }
    if placement.modality.len() > MAX_MODALITY_LEN {
        return Err(EngineError::LimitExceeded("modality too long"));
    }
    Ok(())
}

/// First session of the instructor colliding with `span`, ignoring `exclude`.
pub(crate) fn find_conflict(
    cal: &InstructorCalendar,
    span: &Span,
    exclude: Option<Ulid>,
    policy: OverlapPolicy,
) -> Option<Ulid> {
    cal.colliding(span, policy)
        .find(|slot| slot.kind == SlotKind::Teaching && Some(slot.id) != exclude)
        .map(|slot| slot.id)
}

/// Hard gate for placing a session on a calendar: double-booking first, then
/// declared unavailability.
pub(crate) fn check_schedulable(
    cal: &InstructorCalendar,
    span: &Span,
    exclude: Option<Ulid>,
    policy: OverlapPolicy,
) -> Result<(), EngineError> {
    if let Some(existing) = find_conflict(cal, span, exclude, policy) {
        return Err(EngineError::Conflict(existing));
    }
    if let Some(blackout) = super::availability::find_blackout(cal, span, policy) {
        return Err(EngineError::Unavailable(blackout));
    }
    Ok(())
}

impl Engine {
    /// Does another session of `instructor_id` collide with `span`?
    pub async fn has_conflict(
        &self,
        instructor_id: Ulid,
        span: Span,
        exclude_session: Option<Ulid>,
    ) -> bool {
        let Some(cal) = self.calendars.get(&instructor_id).map(|e| e.value().clone()) else {
            return false;
        };
        let guard = cal.read().await;
        find_conflict(&guard, &span, exclude_session, self.policy).is_some()
    }
}
