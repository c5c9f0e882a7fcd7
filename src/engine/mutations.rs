use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::directory::Actor;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_schedulable, validate_span, validate_template};
use super::{apply_to_calendar, apply_to_session, Engine, EngineError, SharedSession};

type CalendarGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<InstructorCalendar>>;

impl Engine {
    pub async fn create_session(
        &self,
        actor: &Actor,
        draft: SessionDraft,
    ) -> Result<SessionInfo, EngineError> {
        self.require_staff(actor)?;
        validate_template(&draft.placement, draft.total_seats)?;
        validate_span(&draft.span)?;
        if self.sessions.len() >= MAX_SESSIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }
        let _claim = self.claims.sessions.claim(draft.id)?;

        let _gate = self.mutation_gate.read().await;
        let cal = self.calendar(draft.placement.instructor_id);
        let mut guard = cal.write().await;
        if self.sessions.contains_key(&draft.id) {
            return Err(EngineError::AlreadyExists(draft.id));
        }
        check_schedulable(&guard, &draft.span, None, self.policy)?;

        let session = ClassSession {
            id: draft.id,
            placement: draft.placement,
            span: draft.span,
            total_seats: draft.total_seats,
            origin: SessionOrigin::Standalone,
        };
        let event = Event::SessionCreated {
            session: session.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_calendar(&mut guard, &event);
        let st = SessionState::new(session);
        let info = SessionInfo::from_state(&self.tenant, &st);
        self.insert_session(st);
        Ok(info)
    }

    /// Reschedule, reassign or resize a session. Conflict and availability
    /// are re-checked when the time or the instructor changes; a
    /// series-governed session becomes an exception of its series.
    pub async fn edit_session(
        &self,
        actor: &Actor,
        id: Ulid,
        edit: SessionEdit,
    ) -> Result<SessionInfo, EngineError> {
        let shared = self.visible_session(actor, id)?;
        self.require_staff(actor)?;

        let _gate = self.mutation_gate.read().await;
        let (mut cals, mut st) = self
            .lock_for_placement(&shared, id, edit.instructor_id)
            .await?;
        if edit.is_empty() {
            return Ok(SessionInfo::from_state(&self.tenant, &st));
        }
        if st.session.origin.is_withdrawn() {
            return Err(EngineError::InvalidSession(format!(
                "session {id} was withdrawn with its series"
            )));
        }

        let current = &st.session;
        let span = Span {
            start: edit.start.unwrap_or(current.span.start),
            end: edit.end.unwrap_or(current.span.end),
        };
        validate_span(&span)?;
        let placement = Placement {
            instructor_id: edit.instructor_id.unwrap_or(current.placement.instructor_id),
            unit_id: edit.unit_id.unwrap_or(current.placement.unit_id),
            location_id: edit.location_id.unwrap_or(current.placement.location_id),
            modality: edit
                .modality
                .clone()
                .unwrap_or_else(|| current.placement.modality.clone()),
        };
        let total_seats = edit.total_seats.unwrap_or(current.total_seats);
        validate_template(&placement, total_seats)?;
        let active = st.active_count();
        if total_seats < active {
            return Err(EngineError::InvalidSession(format!(
                "{total_seats} seats is below the {active} active bookings"
            )));
        }

        let moved = span != current.span || placement.instructor_id != current.instructor_id();
        if moved {
            let target = cals
                .get(&placement.instructor_id)
                .ok_or(EngineError::NotFound(placement.instructor_id))?;
            check_schedulable(target, &span, Some(id), self.policy)?;
        }

        let updated = ClassSession {
            id,
            placement,
            span,
            total_seats,
            origin: current.origin.detached(),
        };
        let event = Event::SessionUpdated { session: updated };
        self.wal_append(&event).await?;
        for cal in cals.values_mut() {
            apply_to_calendar(cal, &event);
        }
        apply_to_session(&mut st, &event, &self.booking_to_session);
        tracing::debug!("tenant {}: session {id} edited", self.tenant);
        Ok(SessionInfo::from_state(&self.tenant, &st))
    }

    /// Remove a session, cancelling its active bookings in the same record.
    /// Returns the students whose bookings were cancelled.
    pub async fn delete_session(&self, actor: &Actor, id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let shared = self.visible_session(actor, id)?;
        self.require_staff(actor)?;

        let _gate = self.mutation_gate.read().await;
        let (mut cals, mut st) = self.lock_for_placement(&shared, id, None).await?;
        let cancelled = st.active_ids();
        let students: Vec<Ulid> = st
            .bookings
            .iter()
            .filter(|b| cancelled.contains(&b.id))
            .map(|b| b.student_id)
            .collect();

        let event = Event::SessionDeleted {
            id,
            cancelled: cancelled.clone(),
        };
        self.wal_append(&event).await?;
        for cal in cals.values_mut() {
            apply_to_calendar(cal, &event);
        }
        apply_to_session(&mut st, &event, &self.booking_to_session);
        self.forget_session(&st);
        drop(st);
        drop(cals);

        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "source" => "session_deleted")
            .increment(cancelled.len() as u64);
        tracing::info!(
            "tenant {}: session {id} deleted, {} bookings cancelled",
            self.tenant,
            cancelled.len()
        );
        self.notify_cancelled(id, &students);
        Ok(students)
    }

    /// Session visible to `actor`; other tenants see nothing.
    pub(super) fn visible_session(&self, actor: &Actor, id: Ulid) -> Result<SharedSession, EngineError> {
        if !self.same_tenant(actor) {
            return Err(EngineError::NotFound(id));
        }
        self.session_handle(&id).ok_or(EngineError::NotFound(id))
    }

    /// Lock the calendars of the session's instructor (and of `new_instructor`,
    /// if given) followed by the session itself. Retries if the instructor
    /// changed between reading it and taking the calendar locks.
    async fn lock_for_placement(
        &self,
        shared: &SharedSession,
        id: Ulid,
        new_instructor: Option<Ulid>,
    ) -> Result<(CalendarGuards, OwnedRwLockWriteGuard<SessionState>), EngineError> {
        loop {
            let instructor = shared.read().await.session.instructor_id();
            let cals = self
                .lock_calendars([instructor, new_instructor.unwrap_or(instructor)])
                .await;
            let st = shared.clone().write_owned().await;
            if !self.is_live(&id, shared) {
                return Err(EngineError::NotFound(id));
            }
            if st.session.instructor_id() == instructor {
                return Ok((cals, st));
            }
        }
    }

    // ── Lifecycle sweep ──────────────────────────────────

    /// Complete every active booking on a session that ended strictly before
    /// `now`, as one record. Returns the number of bookings completed.
    pub async fn complete_elapsed(&self, now: Ms) -> Result<usize, EngineError> {
        let all: Vec<(Ulid, SharedSession)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut due = Vec::new();
        for (id, shared) in all {
            let st = shared.read().await;
            if st.session.span.has_ended(now) && st.active_count() > 0 {
                due.push(id);
            }
        }
        if due.is_empty() {
            return Ok(0);
        }

        let _gate = self.mutation_gate.read().await;
        let mut guards = self.lock_sessions(due).await;
        let bookings: Vec<(Ulid, Ulid)> = guards
            .iter()
            .filter(|(_, st)| st.session.span.has_ended(now))
            .flat_map(|(sid, st)| st.active_ids().into_iter().map(move |bid| (*sid, bid)))
            .collect();
        if bookings.is_empty() {
            return Ok(0);
        }

        let completed = bookings.len();
        let event = Event::BookingsCompleted { bookings };
        self.wal_append(&event).await?;
        for st in guards.values_mut() {
            apply_to_session(st, &event, &self.booking_to_session);
        }
        Ok(completed)
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the records needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.mutation_gate.write().await;
        let mut events = Vec::new();

        let series: Vec<Arc<RwLock<RecurringSeries>>> =
            self.series.iter().map(|e| e.value().clone()).collect();
        for shared in series {
            events.push(Event::SeriesRestored {
                series: shared.read().await.clone(),
            });
        }

        let calendars: Vec<Arc<RwLock<InstructorCalendar>>> =
            self.calendars.iter().map(|e| e.value().clone()).collect();
        for shared in calendars {
            let cal = shared.read().await;
            for slot in cal.slots.iter().filter(|s| s.kind == SlotKind::Blackout) {
                events.push(Event::UnavailabilityRecorded {
                    record: Unavailability {
                        id: slot.id,
                        instructor_id: cal.instructor_id,
                        span: slot.span,
                    },
                });
            }
        }

        let sessions: Vec<SharedSession> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for shared in sessions {
            let st = shared.read().await;
            events.push(Event::SessionRestored {
                session: st.session.clone(),
                bookings: st.bookings.clone(),
            });
        }

        let count = events.len();
        self.wal_compact(events).await?;
        tracing::info!("tenant {}: WAL compacted to {count} records", self.tenant);
        Ok(())
    }
}
