use ulid::Ulid;

use crate::directory::Actor;
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError, SharedSession};

impl Engine {
    pub async fn list_bookable_sessions(
        &self,
        actor: &Actor,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionInfo>, EngineError> {
        self.list_bookable_sessions_at(actor, filter, now_ms()).await
    }

    /// Sessions that have not started yet, matching `filter`, ordered by start.
    /// Full sessions are listed too, with no seats left; withdrawn ones are not.
    pub async fn list_bookable_sessions_at(
        &self,
        actor: &Actor,
        filter: &SessionFilter,
        now: Ms,
    ) -> Result<Vec<SessionInfo>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(EngineError::InvalidSession("range start is after its end".into()));
            }
            if to - from > MAX_QUERY_WINDOW_MS {
                return Err(EngineError::LimitExceeded("query window too wide"));
            }
        }
        if !self.same_tenant(actor) {
            return Ok(Vec::new());
        }

        let all: Vec<SharedSession> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut result = Vec::new();
        for shared in all {
            let st = shared.read().await;
            if st.session.span.start > now
                && !st.session.origin.is_withdrawn()
                && filter.matches(&st.session)
            {
                result.push(SessionInfo::from_state(&self.tenant, &st));
            }
        }
        result.sort_by_key(|s| (s.start, s.id));
        Ok(result)
    }

    pub async fn get_session(&self, actor: &Actor, id: Ulid) -> Result<SessionInfo, EngineError> {
        let shared = self.visible_session(actor, id)?;
        let st = shared.read().await;
        Ok(SessionInfo::from_state(&self.tenant, &st))
    }

    /// Bookings of a session in creation order. Staff see every booking,
    /// anyone else only their own.
    pub async fn list_bookings(
        &self,
        actor: &Actor,
        session_id: Ulid,
    ) -> Result<Vec<BookingInfo>, EngineError> {
        let shared = self.visible_session(actor, session_id)?;
        let st = shared.read().await;
        let staff = actor.is_staff();
        Ok(st
            .bookings
            .iter()
            .filter(|b| staff || b.student_id == actor.id)
            .map(BookingInfo::from)
            .collect())
    }

    pub async fn get_booking(&self, actor: &Actor, id: Ulid) -> Result<BookingInfo, EngineError> {
        if !self.same_tenant(actor) {
            return Err(EngineError::NotFound(id));
        }
        let session_id = self.session_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let shared = self.session_handle(&session_id).ok_or(EngineError::NotFound(id))?;
        let st = shared.read().await;
        st.bookings
            .iter()
            .find(|b| b.id == id && (actor.is_staff() || b.student_id == actor.id))
            .map(BookingInfo::from)
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn get_series_state(
        &self,
        actor: &Actor,
        id: Ulid,
    ) -> Result<RecurringSeries, EngineError> {
        let shared = self.visible_series(actor, id)?;
        let series = shared.read().await;
        Ok(series.clone())
    }
}
