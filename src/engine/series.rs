use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::directory::Actor;
use crate::limits::*;
use crate::model::*;

use super::availability::find_blackout;
use super::conflict::{find_conflict, now_ms, validate_span, validate_template};
use super::recurrence::{date_in, expand, validate_rule};
use super::{apply_to_calendar, apply_to_series, apply_to_session, Engine, EngineError, SharedSeries};

/// Sessions to create plus the dates that were passed over.
struct Plan {
    sessions: Vec<ClassSession>,
    created: Vec<Created>,
    skipped: Vec<Skipped>,
}

/// Walk the occurrences of `series` in `[from, to]` against the instructor's
/// calendar. Each occurrence is checked against existing sessions and the ones
/// planned before it in this run, then against declared unavailability.
fn plan_occurrences(
    cal: &InstructorCalendar,
    series: &RecurringSeries,
    from: NaiveDate,
    to: NaiveDate,
    now: Ms,
    policy: OverlapPolicy,
) -> Result<Plan, EngineError> {
    let mut plan = Plan {
        sessions: Vec::new(),
        created: Vec::new(),
        skipped: Vec::new(),
    };
    for occ in expand(&series.rule, from, to) {
        let skip = |reason| Skipped {
            date: occ.date,
            reason,
        };
        if occ.span.start <= now {
            plan.skipped.push(skip(SkipReason::Elapsed));
            continue;
        }
        validate_span(&occ.span)?;
        let clash = find_conflict(cal, &occ.span, None, policy).or_else(|| {
            plan.sessions
                .iter()
                .find(|s| s.span.collides(&occ.span, policy))
                .map(|s| s.id)
        });
        if let Some(session_id) = clash {
            plan.skipped.push(skip(SkipReason::Conflict { session_id }));
            continue;
        }
        if let Some(blackout_id) = find_blackout(cal, &occ.span, policy) {
            plan.skipped.push(skip(SkipReason::Unavailable { blackout_id }));
            continue;
        }
        let session = ClassSession {
            id: Ulid::new(),
            placement: series.placement.clone(),
            span: occ.span,
            total_seats: series.total_seats,
            origin: SessionOrigin::Series {
                series_id: series.id,
            },
        };
        plan.created.push(Created {
            date: occ.date,
            session_id: session.id,
            span: session.span,
        });
        plan.sessions.push(session);
    }
    Ok(plan)
}

fn window_end(today: NaiveDate, window_days: u32) -> Result<NaiveDate, EngineError> {
    if window_days > MAX_GENERATION_WINDOW_DAYS {
        return Err(EngineError::LimitExceeded("generation window too wide"));
    }
    today
        .checked_add_days(Days::new(u64::from(window_days)))
        .ok_or(EngineError::LimitExceeded("generation window out of range"))
}

fn record_outcome(plan: &Plan, source: &'static str) {
    metrics::counter!(crate::observability::SESSIONS_MATERIALIZED_TOTAL, "source" => source)
        .increment(plan.created.len() as u64);
    for skipped in &plan.skipped {
        metrics::counter!(
            crate::observability::OCCURRENCES_SKIPPED_TOTAL,
            "reason" => skipped.reason.as_str()
        )
        .increment(1);
    }
}

impl Engine {
    pub async fn materialize_series(
        &self,
        actor: &Actor,
        draft: SeriesDraft,
        window_days: u32,
    ) -> Result<Materialization, EngineError> {
        self.materialize_series_at(actor, draft, window_days, now_ms())
            .await
    }

    /// Create a recurring series and its sessions over `[today, today + window_days]`,
    /// today being the current date in the rule's time zone. The series, every
    /// created session and the high-water mark go to the log as one record.
    pub async fn materialize_series_at(
        &self,
        actor: &Actor,
        draft: SeriesDraft,
        window_days: u32,
        now: Ms,
    ) -> Result<Materialization, EngineError> {
        self.require_staff(actor)?;
        validate_template(&draft.placement, draft.total_seats)?;
        validate_rule(&draft.rule)?;
        let today = date_in(&draft.rule.tz, now);
        let through = window_end(today, window_days)?;
        if self.series.len() >= MAX_SERIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many series"));
        }
        let _claim = self.claims.series.claim(draft.id)?;

        let _gate = self.mutation_gate.read().await;
        if self.series.contains_key(&draft.id) {
            return Err(EngineError::AlreadyExists(draft.id));
        }
        let series = RecurringSeries {
            id: draft.id,
            placement: draft.placement,
            total_seats: draft.total_seats,
            rule: draft.rule,
            active: true,
            generated_through: Some(through),
        };

        let cal = self.calendar(series.placement.instructor_id);
        let mut guard = cal.write().await;
        let plan = plan_occurrences(&guard, &series, today, through, now, self.policy)?;
        if self.sessions.len() + plan.sessions.len() > MAX_SESSIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }

        let event = Event::SeriesCreated {
            series: series.clone(),
            sessions: plan.sessions.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_calendar(&mut guard, &event);
        self.series
            .insert(series.id, Arc::new(RwLock::new(series.clone())));
        for session in plan.sessions.iter().cloned() {
            self.insert_session(SessionState::new(session));
        }

        record_outcome(&plan, "create");
        tracing::info!(
            "tenant {}: series {} materialized through {through}: {} created, {} skipped",
            self.tenant,
            series.id,
            plan.created.len(),
            plan.skipped.len()
        );
        Ok(Materialization {
            series_id: series.id,
            created: plan.created,
            skipped: plan.skipped,
            generated_through: Some(through),
        })
    }

    pub async fn extend_series(
        &self,
        actor: &Actor,
        series_id: Ulid,
        window_days: u32,
    ) -> Result<Materialization, EngineError> {
        self.extend_series_at(actor, series_id, window_days, now_ms())
            .await
    }

    /// Generate the sessions between the series' high-water mark and
    /// `today + window_days`. A no-op for inactive series or when the window
    /// is already covered.
    pub async fn extend_series_at(
        &self,
        actor: &Actor,
        series_id: Ulid,
        window_days: u32,
        now: Ms,
    ) -> Result<Materialization, EngineError> {
        let shared = self.visible_series(actor, series_id)?;
        self.require_staff(actor)?;
        self.extend_locked(&shared, window_days, now, "extend").await
    }

    /// Roll every active series forward. Returns the number of sessions created.
    /// A series refused for a user-correctable reason is logged and skipped;
    /// storage failures abort the run.
    pub async fn roll_series(&self, window_days: u32, now: Ms) -> Result<usize, EngineError> {
        let all: Vec<SharedSeries> = self.series.iter().map(|e| e.value().clone()).collect();
        let mut created = 0;
        for shared in all {
            match self.extend_locked(&shared, window_days, now, "roll").await {
                Ok(m) => created += m.created.len(),
                Err(e) if e.is_user_outcome() => {
                    tracing::warn!("tenant {}: series roll skipped: {e}", self.tenant);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    async fn extend_locked(
        &self,
        shared: &SharedSeries,
        window_days: u32,
        now: Ms,
        source: &'static str,
    ) -> Result<Materialization, EngineError> {
        let _gate = self.mutation_gate.read().await;
        let mut series = shared.write().await;
        let unchanged = Materialization {
            series_id: series.id,
            created: Vec::new(),
            skipped: Vec::new(),
            generated_through: series.generated_through,
        };
        if !series.active {
            return Ok(unchanged);
        }
        let today = date_in(&series.rule.tz, now);
        let through = window_end(today, window_days)?;
        let from = series
            .generated_through
            .and_then(|hwm| hwm.succ_opt())
            .map_or(today, |next| next.max(today));
        if from > through {
            return Ok(unchanged);
        }

        let cal = self.calendar(series.placement.instructor_id);
        let mut guard = cal.write().await;
        let plan = plan_occurrences(&guard, &series, from, through, now, self.policy)?;
        if plan.created.is_empty() && plan.skipped.is_empty() {
            return Ok(unchanged);
        }
        if self.sessions.len() + plan.sessions.len() > MAX_SESSIONS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }

        let event = Event::SeriesExtended {
            series_id: series.id,
            generated_through: through,
            sessions: plan.sessions.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_series(&mut series, &event);
        apply_to_calendar(&mut guard, &event);
        for session in plan.sessions.iter().cloned() {
            self.insert_session(SessionState::new(session));
        }

        record_outcome(&plan, source);
        tracing::info!(
            "tenant {}: series {} extended {from}..={through}: {} created, {} skipped",
            self.tenant,
            series.id,
            plan.created.len(),
            plan.skipped.len()
        );
        Ok(Materialization {
            series_id: series.id,
            created: plan.created,
            skipped: plan.skipped,
            generated_through: Some(through),
        })
    }

    pub async fn deactivate_series(
        &self,
        actor: &Actor,
        series_id: Ulid,
    ) -> Result<Vec<Ulid>, EngineError> {
        self.deactivate_series_at(actor, series_id, now_ms()).await
    }

    /// Stop a series from generating and withdraw its future, still
    /// series-governed sessions, cancelling their active bookings. Withdrawn
    /// sessions are retired, not removed, so their booking history stays
    /// readable. Past sessions and exceptions are untouched. Returns the
    /// withdrawn session ids.
    pub async fn deactivate_series_at(
        &self,
        actor: &Actor,
        series_id: Ulid,
        now: Ms,
    ) -> Result<Vec<Ulid>, EngineError> {
        let shared = self.visible_series(actor, series_id)?;
        self.require_staff(actor)?;

        let _gate = self.mutation_gate.read().await;
        let mut series = shared.write().await;
        if !series.active {
            return Ok(Vec::new());
        }

        let withdrawable = |st: &SessionState| {
            st.session.origin.is_governed_by(series_id) && st.session.span.start > now
        };
        let all: Vec<_> = self
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut candidates = Vec::new();
        let mut instructors = BTreeSet::from([series.placement.instructor_id]);
        for st in all {
            let st = st.read().await;
            if withdrawable(&*st) {
                candidates.push(st.session.id);
                instructors.insert(st.session.instructor_id());
            }
        }

        let mut cals = self.lock_calendars(instructors).await;
        let mut guards = self.lock_sessions(candidates).await;
        guards.retain(|_, st| withdrawable(&**st));
        let withdrawn: Vec<Ulid> = guards.keys().copied().collect();
        let notices: Vec<(Ulid, Vec<Ulid>)> = guards
            .values()
            .map(|st| {
                let students = st
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Active)
                    .map(|b| b.student_id)
                    .collect();
                (st.session.id, students)
            })
            .collect();

        let event = Event::SeriesDeactivated {
            id: series_id,
            withdrawn: withdrawn.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_series(&mut series, &event);
        for cal in cals.values_mut() {
            apply_to_calendar(cal, &event);
        }
        for st in guards.values_mut() {
            apply_to_session(st, &event, &self.booking_to_session);
        }
        drop(guards);
        drop(cals);

        tracing::info!(
            "tenant {}: series {series_id} deactivated, {} sessions withdrawn",
            self.tenant,
            withdrawn.len()
        );
        for (session_id, students) in notices {
            metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "source" => "series_deactivated")
                .increment(students.len() as u64);
            self.notify_cancelled(session_id, &students);
        }
        Ok(withdrawn)
    }

    pub(super) fn visible_series(&self, actor: &Actor, id: Ulid) -> Result<SharedSeries, EngineError> {
        if !self.same_tenant(actor) {
            return Err(EngineError::NotFound(id));
        }
        self.series_handle(&id).ok_or(EngineError::NotFound(id))
    }
}
