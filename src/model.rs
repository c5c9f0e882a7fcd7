use chrono::{NaiveDate, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// How two spans that merely touch at a boundary are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// `a.start <= b.end && a.end >= b.start`: back-to-back classes collide.
    #[default]
    Inclusive,
    /// `[start, end)`: a class ending at 10:00 does not collide with one starting at 10:00.
    HalfOpen,
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inclusive" => Ok(OverlapPolicy::Inclusive),
            "half-open" | "half_open" | "halfopen" => Ok(OverlapPolicy::HalfOpen),
            other => Err(format!("unknown overlap policy: {other}")),
        }
    }
}

/// Interval between two instants. Whether the end is included depends on the
/// [`OverlapPolicy`] used to compare it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn collides(&self, other: &Span, policy: OverlapPolicy) -> bool {
        match policy {
            OverlapPolicy::Inclusive => self.start <= other.end && other.start <= self.end,
            OverlapPolicy::HalfOpen => self.start < other.end && other.start < self.end,
        }
    }

    pub fn has_ended(&self, now: Ms) -> bool {
        self.end < now
    }
}

// ── Sessions ─────────────────────────────────────────────────────

/// Where a session came from. A series-governed session still follows its
/// series (deactivation withdraws it); an exception was detached by an
/// individual edit and is owned on its own. A withdrawn session is a retired
/// record: it keeps its bookings for history but is off the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOrigin {
    Standalone,
    Series { series_id: Ulid },
    Exception { series_id: Ulid },
    Withdrawn { series_id: Ulid },
}

impl SessionOrigin {
    pub fn series_id(&self) -> Option<Ulid> {
        match self {
            SessionOrigin::Standalone => None,
            SessionOrigin::Series { series_id }
            | SessionOrigin::Exception { series_id }
            | SessionOrigin::Withdrawn { series_id } => Some(*series_id),
        }
    }

    pub fn is_governed_by(&self, series: Ulid) -> bool {
        matches!(self, SessionOrigin::Series { series_id } if *series_id == series)
    }

    pub fn is_withdrawn(&self) -> bool {
        matches!(self, SessionOrigin::Withdrawn { .. })
    }

    /// Origin after the governing series was deactivated.
    pub fn withdrawn(self) -> Self {
        match self {
            SessionOrigin::Series { series_id } => SessionOrigin::Withdrawn { series_id },
            other => other,
        }
    }

    /// Origin after an individual edit.
    pub fn detached(self) -> Self {
        match self {
            SessionOrigin::Series { series_id } => SessionOrigin::Exception { series_id },
            other => other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionOrigin::Standalone => "standalone",
            SessionOrigin::Series { .. } => "series",
            SessionOrigin::Exception { .. } => "exception",
            SessionOrigin::Withdrawn { .. } => "withdrawn",
        }
    }
}

/// Placement of a class: who teaches it, where, and what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub instructor_id: Ulid,
    pub unit_id: Ulid,
    pub location_id: Ulid,
    pub modality: String,
}

/// One concrete, dated class occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: Ulid,
    pub placement: Placement,
    pub span: Span,
    pub total_seats: u32,
    pub origin: SessionOrigin,
}

impl ClassSession {
    pub fn instructor_id(&self) -> Ulid {
        self.placement.instructor_id
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Active,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Only `Active` may move, and only to one of the two terminal states.
    pub fn can_become(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Active, BookingStatus::Cancelled)
                | (BookingStatus::Active, BookingStatus::Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub session_id: Ulid,
    pub student_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// A session together with every booking ever made against it.
/// This is the unit of mutual exclusion for capacity enforcement.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session: ClassSession,
    pub bookings: Vec<Booking>,
}

impl SessionState {
    pub fn new(session: ClassSession) -> Self {
        Self {
            session,
            bookings: Vec::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Active)
            .count() as u32
    }

    pub fn seats_left(&self) -> u32 {
        self.session.total_seats.saturating_sub(self.active_count())
    }

    /// Non-cancelled booking held by `student`, if any.
    pub fn holding(&self, student: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.student_id == student && b.status != BookingStatus::Cancelled)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn active_ids(&self) -> Vec<Ulid> {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Active)
            .map(|b| b.id)
            .collect()
    }
}

// ── Instructor calendar ──────────────────────────────────────────

/// What occupies an instructor's time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// A class session the instructor teaches.
    Teaching,
    /// A declared unavailability.
    Blackout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Session id or unavailability id.
    pub id: Ulid,
    pub span: Span,
    pub kind: SlotKind,
}

/// Per-instructor index of sessions and blackouts, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct InstructorCalendar {
    pub instructor_id: Ulid,
    pub slots: Vec<Slot>,
}

impl InstructorCalendar {
    pub fn new(instructor_id: Ulid) -> Self {
        Self {
            instructor_id,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    /// Slots colliding with `query` under `policy`.
    /// Binary search skips everything starting after `query.end`.
    pub fn colliding(
        &self,
        query: &Span,
        policy: OverlapPolicy,
    ) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start <= query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.collides(query, policy))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Declared blackout interval for an instructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unavailability {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub span: Span,
}

// ── Recurrence ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("unknown frequency: {other}")),
        }
    }
}

/// Set of weekdays as a bitmask (bit 0 = Monday).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const EMPTY: Weekdays = Weekdays(0);

    pub fn of(days: &[Weekday]) -> Self {
        days.iter().fold(Self::EMPTY, |set, d| set.with(*d))
    }

    pub fn with(self, day: Weekday) -> Self {
        Weekdays(self.0 | (1 << day.num_days_from_monday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Parse a comma-separated list such as `"MO,WE"` or `"mon, wed"`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let mut set = Self::EMPTY;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let day = match part.to_ascii_lowercase().as_str() {
                "mo" | "mon" | "monday" => Weekday::Mon,
                "tu" | "tue" | "tuesday" => Weekday::Tue,
                "we" | "wed" | "wednesday" => Weekday::Wed,
                "th" | "thu" | "thursday" => Weekday::Thu,
                "fr" | "fri" | "friday" => Weekday::Fri,
                "sa" | "sat" | "saturday" => Weekday::Sat,
                "su" | "sun" | "sunday" => Weekday::Sun,
                other => return Err(format!("unknown weekday: {other}")),
            };
            set = set.with(day);
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrenceBound {
    /// Last date (inclusive) that may carry an occurrence.
    Until(NaiveDate),
    /// Total number of occurrences counted from the anchor date.
    Count(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Repeat every N periods.
    pub interval: u32,
    /// Meaningful for weekly rules only.
    pub weekdays: Weekdays,
    /// Anchor date: first date that may carry an occurrence.
    pub start_date: NaiveDate,
    pub bound: RecurrenceBound,
    pub tz: Tz,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// Template for a recurring series before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesDraft {
    pub id: Ulid,
    pub placement: Placement,
    pub total_seats: u32,
    pub rule: RecurrenceRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: Ulid,
    pub placement: Placement,
    pub total_seats: u32,
    pub rule: RecurrenceRule,
    pub active: bool,
    /// High-water mark: last date already expanded.
    pub generated_through: Option<NaiveDate>,
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types, which are also the WAL record format. Every record is applied
/// all-or-nothing, so multi-row outcomes are carried by a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SessionCreated {
        session: ClassSession,
    },
    SessionUpdated {
        session: ClassSession,
    },
    /// Active bookings listed in `cancelled` are cancelled, then the session is removed.
    SessionDeleted {
        id: Ulid,
        cancelled: Vec<Ulid>,
    },
    SeriesCreated {
        series: RecurringSeries,
        sessions: Vec<ClassSession>,
    },
    SeriesExtended {
        series_id: Ulid,
        generated_through: NaiveDate,
        sessions: Vec<ClassSession>,
    },
    /// Series goes inactive; `withdrawn` sessions are removed with their bookings cancelled.
    SeriesDeactivated {
        id: Ulid,
        withdrawn: Vec<Ulid>,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        session_id: Ulid,
    },
    /// Bulk completion: `(session_id, booking_id)` pairs.
    BookingsCompleted {
        bookings: Vec<(Ulid, Ulid)>,
    },
    UnavailabilityRecorded {
        record: Unavailability,
    },
    UnavailabilityRemoved {
        id: Ulid,
        instructor_id: Ulid,
    },
    /// Compaction snapshot of a session with its booking history.
    SessionRestored {
        session: ClassSession,
        bookings: Vec<Booking>,
    },
    /// Compaction snapshot of a series.
    SeriesRestored {
        series: RecurringSeries,
    },
}

// ── Command inputs ───────────────────────────────────────────────

/// A single, standalone session to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDraft {
    pub id: Ulid,
    pub placement: Placement,
    pub span: Span,
    pub total_seats: u32,
}

/// Partial update of a session. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionEdit {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub instructor_id: Option<Ulid>,
    pub unit_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
    pub modality: Option<String>,
    pub total_seats: Option<u32>,
}

impl SessionEdit {
    pub fn is_empty(&self) -> bool {
        *self == SessionEdit::default()
    }
}

// ── Materialization outcome ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The instructor already teaches the given session at that time.
    Conflict { session_id: Ulid },
    /// The instructor declared the given unavailability.
    Unavailable { blackout_id: Ulid },
    /// The occurrence starts at or before the time of materialization.
    Elapsed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Conflict { .. } => "conflict",
            SkipReason::Unavailable { .. } => "unavailable",
            SkipReason::Elapsed => "elapsed",
        }
    }

    /// Id of the blocking session or blackout, if any.
    pub fn blocker(&self) -> Option<Ulid> {
        match self {
            SkipReason::Conflict { session_id } => Some(*session_id),
            SkipReason::Unavailable { blackout_id } => Some(*blackout_id),
            SkipReason::Elapsed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Skipped {
    pub date: NaiveDate,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub date: NaiveDate,
    pub session_id: Ulid,
    pub span: Span,
}

/// Result of one materializer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialization {
    pub series_id: Ulid,
    pub created: Vec<Created>,
    pub skipped: Vec<Skipped>,
    /// High-water mark after the run.
    pub generated_through: Option<NaiveDate>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Ulid,
    pub tenant: String,
    pub placement: Placement,
    pub start: Ms,
    pub end: Ms,
    pub total_seats: u32,
    pub booked: u32,
    pub origin: SessionOrigin,
}

impl SessionInfo {
    pub fn from_state(tenant: &str, st: &SessionState) -> Self {
        Self {
            id: st.session.id,
            tenant: tenant.to_string(),
            placement: st.session.placement.clone(),
            start: st.session.span.start,
            end: st.session.span.end,
            total_seats: st.session.total_seats,
            booked: st.active_count(),
            origin: st.session.origin,
        }
    }

    pub fn seats_left(&self) -> u32 {
        self.total_seats.saturating_sub(self.booked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub session_id: Ulid,
    pub student_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl From<&Booking> for BookingInfo {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            session_id: b.session_id,
            student_id: b.student_id,
            status: b.status,
            created_at: b.created_at,
        }
    }
}

/// Filters for the student-facing session listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub from: Option<Ms>,
    pub to: Option<Ms>,
    pub unit_id: Option<Ulid>,
    pub location_id: Option<Ulid>,
    pub modality: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, session: &ClassSession) -> bool {
        self.from.is_none_or(|from| session.span.start >= from)
            && self.to.is_none_or(|to| session.span.end <= to)
            && self.unit_id.is_none_or(|u| session.placement.unit_id == u)
            && self.location_id.is_none_or(|l| session.placement.location_id == l)
            && self
                .modality
                .as_deref()
                .is_none_or(|m| session.placement.modality.eq_ignore_ascii_case(m))
    }
}
