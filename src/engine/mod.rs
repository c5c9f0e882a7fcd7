mod availability;
mod booking;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod recurrence;
mod series;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub(crate) use conflict::now_ms;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockWriteGuard};
use ulid::Ulid;

use crate::directory::{Actor, CancellationNotifier, SubscriptionCheck};
use crate::model::*;
use crate::wal::Wal;

pub type SharedSession = Arc<RwLock<SessionState>>;
pub type SharedCalendar = Arc<RwLock<InstructorCalendar>>;
pub type SharedSeries = Arc<RwLock<RecurringSeries>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it (the batch window).
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the window; it runs after the batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![first];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} records failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't ride
    // along with the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── State application ────────────────────────────────────

/// Place or move a session's teaching slot. A session taught by someone else,
/// or one withdrawn with its series, is only taken off this calendar.
fn place_session(cal: &mut InstructorCalendar, session: &ClassSession) {
    cal.remove(session.id);
    if session.instructor_id() == cal.instructor_id && !session.origin.is_withdrawn() {
        cal.insert(Slot {
            id: session.id,
            span: session.span,
            kind: SlotKind::Teaching,
        });
    }
}

/// Apply an event to one instructor calendar (caller holds the lock).
pub(super) fn apply_to_calendar(cal: &mut InstructorCalendar, event: &Event) {
    match event {
        Event::SessionCreated { session }
        | Event::SessionUpdated { session }
        | Event::SessionRestored { session, .. } => place_session(cal, session),
        Event::SeriesCreated { sessions, .. } | Event::SeriesExtended { sessions, .. } => {
            for session in sessions {
                place_session(cal, session);
            }
        }
        Event::SessionDeleted { id, .. } => {
            cal.remove(*id);
        }
        Event::SeriesDeactivated { withdrawn, .. } => {
            for id in withdrawn {
                cal.remove(*id);
            }
        }
        Event::UnavailabilityRecorded { record } if record.instructor_id == cal.instructor_id => {
            cal.remove(record.id);
            cal.insert(Slot {
                id: record.id,
                span: record.span,
                kind: SlotKind::Blackout,
            });
        }
        Event::UnavailabilityRemoved { id, .. } => {
            cal.remove(*id);
        }
        _ => {}
    }
}

/// Apply an event to one session and its bookings (caller holds the lock).
pub(super) fn apply_to_session(
    st: &mut SessionState,
    event: &Event,
    booking_index: &DashMap<Ulid, Ulid>,
) {
    let sid = st.session.id;
    match event {
        Event::SessionUpdated { session } if session.id == sid => st.session = session.clone(),
        Event::BookingCreated { booking } if booking.session_id == sid => {
            booking_index.insert(booking.id, sid);
            st.bookings.push(booking.clone());
        }
        Event::BookingCancelled { id, session_id } if *session_id == sid => {
            transition(st, *id, BookingStatus::Cancelled);
        }
        Event::BookingsCompleted { bookings } => {
            for (session_id, booking_id) in bookings {
                if *session_id == sid {
                    transition(st, *booking_id, BookingStatus::Completed);
                }
            }
        }
        Event::SessionDeleted { id, cancelled } if *id == sid => {
            for booking_id in cancelled {
                transition(st, *booking_id, BookingStatus::Cancelled);
            }
        }
        Event::SeriesDeactivated { withdrawn, .. } if withdrawn.contains(&sid) => {
            for booking_id in st.active_ids() {
                transition(st, booking_id, BookingStatus::Cancelled);
            }
            st.session.origin = st.session.origin.withdrawn();
        }
        _ => {}
    }
}

fn transition(st: &mut SessionState, booking_id: Ulid, to: BookingStatus) {
    if let Some(booking) = st.booking_mut(booking_id)
        && booking.status.can_become(to)
    {
        booking.status = to;
    }
}

pub(super) fn apply_to_series(series: &mut RecurringSeries, event: &Event) {
    match event {
        Event::SeriesExtended {
            series_id,
            generated_through,
            ..
        } if *series_id == series.id => series.generated_through = Some(*generated_through),
        Event::SeriesDeactivated { id, .. } if *id == series.id => series.active = false,
        _ => {}
    }
}

/// Write lock for replay and compaction, where nothing else can hold the lock.
/// Never `blocking_write` here: replay may run inside an async context
/// (lazy tenant creation).
fn uncontended<T>(lock: &RwLock<T>) -> io::Result<RwLockWriteGuard<'_, T>> {
    lock.try_write()
        .map_err(|_| io::Error::other("replay: lock unexpectedly held"))
}

// ── Engine ───────────────────────────────────────────────

/// Collaborators an engine consults but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub subscriptions: Arc<dyn SubscriptionCheck>,
    pub notifier: Arc<dyn CancellationNotifier>,
}

/// Scheduling and booking state of one tenant.
///
/// Lock order: series → instructor calendars (by id) → sessions (by id).
/// Reservations and cancellations take a single session lock.
/// Ids reserved by in-flight inserts, one set per id space. A request claims
/// its id before the existence check and holds it until the entity is in its
/// map, so two requests carrying the same id never both pass the check.
#[derive(Default)]
pub(super) struct IdClaims {
    pub(super) sessions: ClaimSet,
    pub(super) series: ClaimSet,
    pub(super) bookings: ClaimSet,
    pub(super) blackouts: ClaimSet,
}

#[derive(Default)]
pub(super) struct ClaimSet(DashSet<Ulid>);

impl ClaimSet {
    /// Claim `id` until the guard drops. `AlreadyExists` if another request holds it.
    pub(super) fn claim(&self, id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        if self.0.insert(id) {
            Ok(IdClaim { set: self, id })
        } else {
            Err(EngineError::AlreadyExists(id))
        }
    }
}

pub(super) struct IdClaim<'a> {
    set: &'a ClaimSet,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.set.0.remove(&self.id);
    }
}

pub struct Engine {
    pub tenant: String,
    pub policy: OverlapPolicy,
    pub(super) sessions: DashMap<Ulid, SharedSession>,
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) series: DashMap<Ulid, SharedSeries>,
    /// Reverse lookup: booking id → session id
    pub(super) booking_to_session: DashMap<Ulid, Ulid>,
    /// Reverse lookup: unavailability id → instructor id
    pub(super) blackout_to_instructor: DashMap<Ulid, Ulid>,
    /// Client-supplied ids with an insert in flight
    pub(super) claims: IdClaims,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) collaborators: Collaborators,
    /// Shared by every mutation, exclusive for compaction, so a snapshot never
    /// misses a record already in the log. Taken before any entity lock.
    pub(super) mutation_gate: RwLock<()>,
}

impl Engine {
    pub fn new(
        tenant: impl Into<String>,
        wal_path: PathBuf,
        policy: OverlapPolicy,
        collaborators: Collaborators,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant: tenant.into(),
            policy,
            sessions: DashMap::new(),
            calendars: DashMap::new(),
            series: DashMap::new(),
            booking_to_session: DashMap::new(),
            blackout_to_instructor: DashMap::new(),
            claims: IdClaims::default(),
            wal_tx,
            collaborators,
            mutation_gate: RwLock::new(()),
        };
        for event in &replay.events {
            engine.replay_event(event)?;
        }
        if !replay.events.is_empty() {
            tracing::info!(
                "tenant {}: replayed {} events ({} sessions, {} series)",
                engine.tenant,
                replay.events.len(),
                engine.sessions.len(),
                engine.series.len()
            );
        }
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::SessionCreated { session } => {
                self.replay_calendar(session.instructor_id(), event)?;
                self.insert_session(SessionState::new(session.clone()));
            }
            Event::SessionRestored { session, bookings } => {
                self.replay_calendar(session.instructor_id(), event)?;
                self.insert_session(SessionState {
                    session: session.clone(),
                    bookings: bookings.clone(),
                });
            }
            Event::SessionUpdated { session } => {
                let Some(shared) = self.session_handle(&session.id) else {
                    return Ok(());
                };
                let mut st = uncontended(&shared)?;
                let previous = st.session.instructor_id();
                apply_to_session(&mut st, event, &self.booking_to_session);
                self.replay_calendar(previous, event)?;
                if previous != session.instructor_id() {
                    self.replay_calendar(session.instructor_id(), event)?;
                }
            }
            Event::SessionDeleted { id, .. } => self.replay_deletion(*id, event)?,
            Event::SeriesCreated { series, sessions } => {
                self.series
                    .insert(series.id, Arc::new(RwLock::new(series.clone())));
                self.replay_new_sessions(sessions, event)?;
            }
            Event::SeriesRestored { series } => {
                self.series
                    .insert(series.id, Arc::new(RwLock::new(series.clone())));
            }
            Event::SeriesExtended {
                series_id,
                sessions,
                ..
            } => {
                if let Some(shared) = self.series_handle(series_id) {
                    apply_to_series(&mut *uncontended(&shared)?, event);
                }
                self.replay_new_sessions(sessions, event)?;
            }
            Event::SeriesDeactivated { id, withdrawn } => {
                if let Some(shared) = self.series_handle(id) {
                    apply_to_series(&mut *uncontended(&shared)?, event);
                }
                for session_id in withdrawn {
                    self.replay_retirement(*session_id, event)?;
                }
            }
            Event::BookingCreated { booking } => {
                self.replay_on_session(booking.session_id, event)?;
            }
            Event::BookingCancelled { session_id, .. } => {
                self.replay_on_session(*session_id, event)?;
            }
            Event::BookingsCompleted { bookings } => {
                let touched: BTreeSet<Ulid> = bookings.iter().map(|(sid, _)| *sid).collect();
                for session_id in touched {
                    self.replay_on_session(session_id, event)?;
                }
            }
            Event::UnavailabilityRecorded { record } => {
                self.replay_calendar(record.instructor_id, event)?;
                self.blackout_to_instructor
                    .insert(record.id, record.instructor_id);
            }
            Event::UnavailabilityRemoved { id, instructor_id } => {
                self.replay_calendar(*instructor_id, event)?;
                self.blackout_to_instructor.remove(id);
            }
        }
        Ok(())
    }

    fn replay_calendar(&self, instructor_id: Ulid, event: &Event) -> io::Result<()> {
        let cal = self.calendar(instructor_id);
        apply_to_calendar(&mut *uncontended(&cal)?, event);
        Ok(())
    }

    fn replay_on_session(&self, session_id: Ulid, event: &Event) -> io::Result<()> {
        if let Some(shared) = self.session_handle(&session_id) {
            apply_to_session(&mut *uncontended(&shared)?, event, &self.booking_to_session);
        }
        Ok(())
    }

    fn replay_new_sessions(&self, sessions: &[ClassSession], event: &Event) -> io::Result<()> {
        let instructors: BTreeSet<Ulid> = sessions.iter().map(|s| s.instructor_id()).collect();
        for instructor_id in instructors {
            self.replay_calendar(instructor_id, event)?;
        }
        for session in sessions {
            self.insert_session(SessionState::new(session.clone()));
        }
        Ok(())
    }

    fn replay_deletion(&self, session_id: Ulid, event: &Event) -> io::Result<()> {
        let Some(shared) = self.session_handle(&session_id) else {
            return Ok(());
        };
        let mut st = uncontended(&shared)?;
        apply_to_session(&mut st, event, &self.booking_to_session);
        self.replay_calendar(st.session.instructor_id(), event)?;
        self.forget_session(&st);
        Ok(())
    }

    /// Withdrawn sessions stay in the map with their bookings; only their
    /// teaching slot goes.
    fn replay_retirement(&self, session_id: Ulid, event: &Event) -> io::Result<()> {
        let Some(shared) = self.session_handle(&session_id) else {
            return Ok(());
        };
        let mut st = uncontended(&shared)?;
        apply_to_session(&mut st, event, &self.booking_to_session);
        self.replay_calendar(st.session.instructor_id(), event)
    }

    // ── Map-level bookkeeping ────────────────────────────

    pub(super) fn insert_session(&self, st: SessionState) {
        for booking in &st.bookings {
            self.booking_to_session.insert(booking.id, st.session.id);
        }
        self.sessions
            .insert(st.session.id, Arc::new(RwLock::new(st)));
    }

    /// Drop a removed session and its booking index entries.
    pub(super) fn forget_session(&self, st: &SessionState) {
        for booking in &st.bookings {
            self.booking_to_session.remove(&booking.id);
        }
        self.sessions.remove(&st.session.id);
    }

    pub(super) fn session_handle(&self, id: &Ulid) -> Option<SharedSession> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Is `shared` still the live entry for `id`? False once the session was
    /// deleted while the caller waited for its lock.
    pub(super) fn is_live(&self, id: &Ulid, shared: &SharedSession) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), shared))
    }

    pub(super) fn series_handle(&self, id: &Ulid) -> Option<SharedSeries> {
        self.series.get(id).map(|e| e.value().clone())
    }

    /// Calendar of an instructor, created empty on first use.
    pub(super) fn calendar(&self, instructor_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(instructor_id)
            .or_insert_with(|| Arc::new(RwLock::new(InstructorCalendar::new(instructor_id))))
            .clone()
    }

    pub(super) fn session_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_session.get(booking_id).map(|e| *e.value())
    }

    /// Write-lock calendars in id order.
    pub(super) async fn lock_calendars(
        &self,
        instructors: impl IntoIterator<Item = Ulid>,
    ) -> BTreeMap<Ulid, OwnedRwLockWriteGuard<InstructorCalendar>> {
        let ids: BTreeSet<Ulid> = instructors.into_iter().collect();
        let mut guards = BTreeMap::new();
        for id in ids {
            guards.insert(id, self.calendar(id).write_owned().await);
        }
        guards
    }

    /// Write-lock sessions in id order. Sessions that no longer exist are left out.
    pub(super) async fn lock_sessions(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> BTreeMap<Ulid, OwnedRwLockWriteGuard<SessionState>> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = BTreeMap::new();
        for id in ids {
            if let Some(shared) = self.session_handle(&id) {
                guards.insert(id, shared.write_owned().await);
            }
        }
        guards
    }

    // ── Persistence ──────────────────────────────────────

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub(super) async fn wal_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// WAL-append then apply to a session the caller holds locked.
    pub(super) async fn persist_on_session(
        &self,
        st: &mut SessionState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_session(st, event, &self.booking_to_session);
        Ok(())
    }

    // ── Caller checks ────────────────────────────────────

    pub(super) fn same_tenant(&self, actor: &Actor) -> bool {
        actor.tenant == self.tenant
    }

    /// Schedule management is reserved to admins and instructors of this tenant.
    pub(super) fn require_staff(&self, actor: &Actor) -> Result<(), EngineError> {
        if self.same_tenant(actor) && actor.is_staff() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("admin or instructor role required"))
        }
    }

    pub(super) fn notify_cancelled(&self, session_id: Ulid, students: &[Ulid]) {
        if students.is_empty() {
            return;
        }
        tracing::info!(
            "tenant {}: notifying {} students of cancellation on session {session_id}",
            self.tenant,
            students.len()
        );
        self.collaborators
            .notifier
            .notify_cancelled_bookings(session_id, students);
    }
}
