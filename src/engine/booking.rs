use ulid::Ulid;

use crate::directory::{Actor, Role};
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// Preconditions that must hold both before and after the subscription check.
fn check_bookable(st: &SessionState, student_id: Ulid, now: Ms) -> Result<(), EngineError> {
    if st.session.span.start <= now || st.session.origin.is_withdrawn() {
        return Err(EngineError::SessionClosed(st.session.id));
    }
    if let Some(existing) = st.holding(student_id) {
        return Err(EngineError::AlreadyBooked(existing.id));
    }
    Ok(())
}

impl Engine {
    pub async fn reserve(
        &self,
        actor: &Actor,
        id: Ulid,
        session_id: Ulid,
        student_id: Ulid,
    ) -> Result<BookingInfo, EngineError> {
        self.reserve_at(actor, id, session_id, student_id, now_ms())
            .await
    }

    /// Reserve one seat for `student_id`.
    ///
    /// Checks run in order and the first failure wins: the session exists in
    /// the caller's tenant, the caller is that student or staff, the session
    /// has not started, the student holds no booking on it, the student has a
    /// subscription, and a seat is free. The subscription collaborator is
    /// asked with no lock held; everything else is re-checked under the
    /// session's write lock, together with the insert.
    pub async fn reserve_at(
        &self,
        actor: &Actor,
        id: Ulid,
        session_id: Ulid,
        student_id: Ulid,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let outcome = self
            .try_reserve(actor, id, session_id, student_id, now)
            .await;
        let label = match &outcome {
            Ok(_) => "booked",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => label).increment(1);
        match &outcome {
            Ok(b) => tracing::debug!(
                "tenant {}: booking {} for student {student_id} on session {session_id}",
                self.tenant,
                b.id
            ),
            Err(e) if e.is_user_outcome() => {
                tracing::debug!("tenant {}: reservation on {session_id} refused: {e}", self.tenant)
            }
            Err(e) => tracing::error!("tenant {}: reservation on {session_id} failed: {e}", self.tenant),
        }
        outcome
    }

    async fn try_reserve(
        &self,
        actor: &Actor,
        id: Ulid,
        session_id: Ulid,
        student_id: Ulid,
        now: Ms,
    ) -> Result<BookingInfo, EngineError> {
        let shared = self.visible_session(actor, session_id)?;
        let for_self = actor.id == student_id && actor.has(Role::Student);
        if !for_self && !actor.is_staff() {
            return Err(EngineError::Forbidden("students may only book for themselves"));
        }

        // Optimistic pre-check so closed or duplicate requests never reach
        // the subscription collaborator.
        check_bookable(&*shared.read().await, student_id, now)?;

        let subscribed = self
            .collaborators
            .subscriptions
            .has_active_subscription(&self.tenant, student_id, now)
            .await
            .map_err(|e| EngineError::StorageUnavailable(format!("subscription check: {e}")))?;
        if !subscribed {
            return Err(EngineError::SubscriptionRequired(student_id));
        }
        let _claim = self.claims.bookings.claim(id)?;

        let _gate = self.mutation_gate.read().await;
        let mut st = shared.write().await;
        if !self.is_live(&session_id, &shared) {
            return Err(EngineError::NotFound(session_id));
        }
        check_bookable(&st, student_id, now)?;
        if st.active_count() >= st.session.total_seats {
            return Err(EngineError::SessionFull(st.session.total_seats));
        }
        if self.booking_to_session.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let booking = Booking {
            id,
            session_id,
            student_id,
            status: BookingStatus::Active,
            created_at: now,
        };
        let info = BookingInfo::from(&booking);
        self.persist_on_session(&mut st, &Event::BookingCreated { booking })
            .await?;
        Ok(info)
    }

    /// Cancel an active booking, freeing its seat immediately.
    pub async fn cancel(&self, actor: &Actor, booking_id: Ulid) -> Result<BookingInfo, EngineError> {
        if !self.same_tenant(actor) {
            return Err(EngineError::NotFound(booking_id));
        }
        let session_id = self
            .session_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let shared = self
            .session_handle(&session_id)
            .ok_or(EngineError::NotFound(booking_id))?;

        let _gate = self.mutation_gate.read().await;
        let mut st = shared.write().await;
        if !self.is_live(&session_id, &shared) {
            return Err(EngineError::NotFound(booking_id));
        }
        let booking = st
            .bookings
            .iter()
            .find(|b| b.id == booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if actor.id != booking.student_id && !actor.is_staff() {
            return Err(EngineError::Forbidden(
                "only the booking's student or staff may cancel it",
            ));
        }
        if !booking.status.can_become(BookingStatus::Cancelled) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Cancelled,
            });
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            session_id,
        };
        self.persist_on_session(&mut st, &event).await?;
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "source" => "booking")
            .increment(1);
        tracing::debug!(
            "tenant {}: booking {booking_id} cancelled, {} seats left on {session_id}",
            self.tenant,
            st.seats_left()
        );
        Ok(BookingInfo {
            status: BookingStatus::Cancelled,
            ..BookingInfo::from(&booking)
        })
    }
}
