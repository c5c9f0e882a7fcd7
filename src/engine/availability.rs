use ulid::Ulid;

use crate::directory::Actor;
use crate::limits::*;
use crate::model::*;

use super::{apply_to_calendar, Engine, EngineError};

/// First declared unavailability colliding with `span`.
pub(crate) fn find_blackout(
    cal: &InstructorCalendar,
    span: &Span,
    policy: OverlapPolicy,
) -> Option<Ulid> {
    cal.colliding(span, policy)
        .find(|slot| slot.kind == SlotKind::Blackout)
        .map(|slot| slot.id)
}

impl Engine {
    /// Is the instructor unavailable at any point of `span`?
    pub async fn is_unavailable(&self, instructor_id: Ulid, span: Span) -> bool {
        let Some(cal) = self.calendars.get(&instructor_id).map(|e| e.value().clone()) else {
            return false;
        };
        let guard = cal.read().await;
        find_blackout(&guard, &span, self.policy).is_some()
    }

    /// Ingest an unavailability record. Existing sessions are left alone; the
    /// record only gates sessions placed afterwards.
    pub async fn record_unavailability(
        &self,
        actor: &Actor,
        record: Unavailability,
    ) -> Result<(), EngineError> {
        self.require_staff(actor)?;
        if record.span.start >= record.span.end {
            return Err(EngineError::InvalidSession("start must be before end".into()));
        }
        if record.span.start < MIN_VALID_TIMESTAMP_MS || record.span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let _claim = self.claims.blackouts.claim(record.id)?;
        if self.blackout_to_instructor.contains_key(&record.id) {
            return Err(EngineError::AlreadyExists(record.id));
        }

        let _gate = self.mutation_gate.read().await;
        let cal = self.calendar(record.instructor_id);
        let mut guard = cal.write().await;
        let event = Event::UnavailabilityRecorded {
            record: record.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_calendar(&mut guard, &event);
        self.blackout_to_instructor
            .insert(record.id, record.instructor_id);
        tracing::debug!(
            "tenant {}: instructor {} unavailable {}..{}",
            self.tenant,
            record.instructor_id,
            record.span.start,
            record.span.end
        );
        Ok(())
    }

    pub async fn remove_unavailability(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        if !self.same_tenant(actor) {
            return Err(EngineError::NotFound(id));
        }
        let instructor_id = self
            .blackout_to_instructor
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        self.require_staff(actor)?;

        let _gate = self.mutation_gate.read().await;
        let cal = self.calendar(instructor_id);
        let mut guard = cal.write().await;
        if !guard.slots.iter().any(|s| s.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::UnavailabilityRemoved { id, instructor_id };
        self.wal_append(&event).await?;
        apply_to_calendar(&mut guard, &event);
        self.blackout_to_instructor.remove(&id);
        Ok(())
    }

    /// Unavailability records of an instructor colliding with `span`. Staff only.
    pub async fn list_unavailability(
        &self,
        actor: &Actor,
        instructor_id: Ulid,
        span: Span,
    ) -> Result<Vec<Unavailability>, EngineError> {
        self.require_staff(actor)?;
        if span.start >= span.end {
            return Err(EngineError::InvalidSession("range start is after its end".into()));
        }
        let Some(cal) = self.calendars.get(&instructor_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        Ok(guard
            .colliding(&span, self.policy)
            .filter(|slot| slot.kind == SlotKind::Blackout)
            .map(|slot| Unavailability {
                id: slot.id,
                instructor_id,
                span: slot.span,
            })
            .collect())
    }
}
