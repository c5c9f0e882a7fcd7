use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use super::*;
use crate::directory::{DirectoryError, Role};
use crate::notify::{Notice, NotifyHub};

const TENANT: &str = "academy";

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Unix ms of `date` at `h:m` UTC.
fn at(date: NaiveDate, h: u32, m: u32) -> Ms {
    date.and_time(t(h, m)).and_utc().timestamp_millis()
}

// ── Fakes ────────────────────────────────────────────────

#[derive(Default)]
struct FakeSubscriptions {
    lapsed: Mutex<HashSet<Ulid>>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeSubscriptions {
    fn lapse(&self, student: Ulid) {
        self.lapsed.lock().unwrap().insert(student);
    }
}

#[async_trait::async_trait]
impl SubscriptionCheck for FakeSubscriptions {
    async fn has_active_subscription(
        &self,
        _tenant: &str,
        student_id: Ulid,
        _as_of: Ms,
    ) -> Result<bool, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unreachable("billing offline".into()));
        }
        Ok(!self.lapsed.lock().unwrap().contains(&student_id))
    }
}

// ── Harness ──────────────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("classbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Harness {
    engine: Arc<Engine>,
    hub: Arc<NotifyHub>,
    subs: Arc<FakeSubscriptions>,
    admin: Actor,
    path: PathBuf,
}

fn open(path: PathBuf, policy: OverlapPolicy) -> Harness {
    let hub = Arc::new(NotifyHub::new());
    let subs = Arc::new(FakeSubscriptions::default());
    let collaborators = Collaborators {
        subscriptions: subs.clone(),
        notifier: hub.clone(),
    };
    let engine = Engine::new(TENANT, path.clone(), policy, collaborators).unwrap();
    Harness {
        engine: Arc::new(engine),
        hub,
        subs,
        admin: Actor::new(Ulid::new(), TENANT, &[Role::Admin]),
        path,
    }
}

fn harness(name: &str) -> Harness {
    open(test_wal_path(name), OverlapPolicy::Inclusive)
}

fn student() -> Actor {
    Actor::new(Ulid::new(), TENANT, &[Role::Student])
}

fn placement(instructor_id: Ulid) -> Placement {
    Placement {
        instructor_id,
        unit_id: Ulid::new(),
        location_id: Ulid::new(),
        modality: "bjj".into(),
    }
}

impl Harness {
    async fn session(&self, instructor: Ulid, start: Ms, end: Ms, seats: u32) -> Ulid {
        let id = Ulid::new();
        self.engine
            .create_session(
                &self.admin,
                SessionDraft {
                    id,
                    placement: placement(instructor),
                    span: Span::new(start, end),
                    total_seats: seats,
                },
            )
            .await
            .unwrap();
        id
    }

    async fn book(&self, who: &Actor, session_id: Ulid, now: Ms) -> Result<BookingInfo, EngineError> {
        self.engine
            .reserve_at(who, Ulid::new(), session_id, who.id, now)
            .await
    }
}

fn mon_wed_january(instructor: Ulid) -> SeriesDraft {
    SeriesDraft {
        id: Ulid::new(),
        placement: placement(instructor),
        total_seats: 10,
        rule: RecurrenceRule {
            frequency: Frequency::Weekly,
            interval: 1,
            weekdays: Weekdays::of(&[Weekday::Mon, Weekday::Wed]),
            start_date: d(2024, 1, 1),
            bound: RecurrenceBound::Until(d(2024, 1, 31)),
            tz: chrono_tz::UTC,
            start_time: t(9, 0),
            end_time: t(10, 0),
        },
    }
}

fn created_on(m: &Materialization, date: NaiveDate) -> Ulid {
    m.created
        .iter()
        .find(|c| c.date == date)
        .map(|c| c.session_id)
        .unwrap()
}

// ── Series materialization ───────────────────────────────

#[tokio::test]
async fn weekly_mon_wed_january_creates_ten_sessions() {
    let h = harness("mon_wed_january.wal");
    let now = at(d(2023, 12, 31), 0, 0);
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 31, now)
        .await
        .unwrap();

    assert_eq!(m.created.len(), 10);
    assert!(m.skipped.is_empty());
    assert_eq!(m.generated_through, Some(d(2024, 1, 31)));
    let days: Vec<u32> = m.created.iter().map(|c| c.date.day0() + 1).collect();
    assert_eq!(days, vec![1, 3, 8, 10, 15, 17, 22, 24, 29, 31]);
    assert_eq!(m.created[0].span, Span::new(at(d(2024, 1, 1), 9, 0), at(d(2024, 1, 1), 10, 0)));

    for c in &m.created {
        let info = h.engine.get_session(&h.admin, c.session_id).await.unwrap();
        assert_eq!(info.origin, SessionOrigin::Series { series_id: m.series_id });
        assert_eq!(info.total_seats, 10);
    }
}

#[tokio::test]
async fn existing_session_makes_one_occurrence_a_conflict() {
    let h = harness("mon_wed_conflict.wal");
    let instructor = Ulid::new();
    let blocker = h
        .session(instructor, at(d(2024, 1, 8), 9, 30), at(d(2024, 1, 8), 10, 30), 5)
        .await;

    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();

    assert_eq!(m.created.len(), 9);
    assert_eq!(
        m.skipped,
        vec![Skipped {
            date: d(2024, 1, 8),
            reason: SkipReason::Conflict { session_id: blocker },
        }]
    );
    // high-water mark covers the window regardless of skips
    assert_eq!(m.generated_through, Some(d(2024, 1, 31)));
}

#[tokio::test]
async fn declared_unavailability_skips_occurrence() {
    let h = harness("mon_wed_unavailable.wal");
    let instructor = Ulid::new();
    let blackout = Ulid::new();
    h.engine
        .record_unavailability(
            &h.admin,
            Unavailability {
                id: blackout,
                instructor_id: instructor,
                span: Span::new(at(d(2024, 1, 10), 0, 0), at(d(2024, 1, 10), 23, 59)),
            },
        )
        .await
        .unwrap();

    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();
    assert_eq!(m.created.len(), 9);
    assert_eq!(m.skipped[0].date, d(2024, 1, 10));
    assert_eq!(m.skipped[0].reason, SkipReason::Unavailable { blackout_id: blackout });
}

#[tokio::test]
async fn conflict_wins_over_unavailability() {
    let h = harness("conflict_before_unavailable.wal");
    let instructor = Ulid::new();
    let blocker = h
        .session(instructor, at(d(2024, 1, 3), 9, 0), at(d(2024, 1, 3), 9, 30), 5)
        .await;
    h.engine
        .record_unavailability(
            &h.admin,
            Unavailability {
                id: Ulid::new(),
                instructor_id: instructor,
                span: Span::new(at(d(2024, 1, 3), 0, 0), at(d(2024, 1, 3), 23, 0)),
            },
        )
        .await
        .unwrap();
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();
    assert_eq!(m.skipped.len(), 1);
    assert_eq!(m.skipped[0].reason, SkipReason::Conflict { session_id: blocker });
}

#[tokio::test]
async fn elapsed_occurrence_today_is_skipped() {
    let h = harness("elapsed_today.wal");
    // Jan 3 at noon: the 09:00 class that day already started
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 31, at(d(2024, 1, 3), 12, 0))
        .await
        .unwrap();
    assert_eq!(
        m.skipped,
        vec![Skipped {
            date: d(2024, 1, 3),
            reason: SkipReason::Elapsed,
        }]
    );
    assert_eq!(m.created.len(), 8);
    assert_eq!(m.created[0].date, d(2024, 1, 8));
}

#[tokio::test]
async fn rerunning_with_unchanged_high_water_mark_creates_nothing() {
    let h = harness("idempotent_materialize.wal");
    let now = at(d(2023, 12, 31), 0, 0);
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 31, now)
        .await
        .unwrap();
    let before = h.engine.sessions.len();
    let again = h
        .engine
        .extend_series_at(&h.admin, m.series_id, 31, now)
        .await
        .unwrap();
    assert!(again.created.is_empty());
    assert!(again.skipped.is_empty());
    assert_eq!(again.generated_through, m.generated_through);
    assert_eq!(h.engine.sessions.len(), before);
}

#[tokio::test]
async fn duplicate_series_id_rejected() {
    let h = harness("duplicate_series.wal");
    let draft = mon_wed_january(Ulid::new());
    let now = at(d(2023, 12, 31), 0, 0);
    h.engine
        .materialize_series_at(&h.admin, draft.clone(), 31, now)
        .await
        .unwrap();
    let again = h.engine.materialize_series_at(&h.admin, draft, 31, now).await;
    assert!(matches!(again, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn extend_generates_only_the_new_window() {
    let h = harness("extend_window.wal");
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 7, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();
    assert_eq!(m.created.len(), 2); // Jan 1, Jan 3
    assert_eq!(m.generated_through, Some(d(2024, 1, 7)));

    let next = h
        .engine
        .extend_series_at(&h.admin, m.series_id, 7, at(d(2024, 1, 7), 0, 0))
        .await
        .unwrap();
    let dates: Vec<NaiveDate> = next.created.iter().map(|c| c.date).collect();
    assert_eq!(dates, vec![d(2024, 1, 8), d(2024, 1, 10)]);
    assert_eq!(next.generated_through, Some(d(2024, 1, 14)));

    let series = h.engine.get_series_state(&h.admin, m.series_id).await.unwrap();
    assert_eq!(series.generated_through, Some(d(2024, 1, 14)));
}

#[tokio::test]
async fn roll_series_extends_active_series() {
    let h = harness("roll_series.wal");
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 7, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();
    let created = h.engine.roll_series(31, at(d(2024, 1, 1), 0, 0)).await.unwrap();
    assert_eq!(created, 8);
    // nothing left inside the rule's bound
    assert_eq!(h.engine.roll_series(60, at(d(2024, 1, 1), 0, 0)).await.unwrap(), 0);
    let series = h.engine.get_series_state(&h.admin, m.series_id).await.unwrap();
    assert_eq!(series.generated_through, Some(d(2024, 2, 1)));
}

#[tokio::test]
async fn invalid_rule_persists_nothing() {
    let h = harness("invalid_rule.wal");
    let mut draft = mon_wed_january(Ulid::new());
    draft.rule.weekdays = Weekdays::EMPTY;
    let result = h
        .engine
        .materialize_series_at(&h.admin, draft.clone(), 31, at(d(2023, 12, 31), 0, 0))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidRule(_))));
    assert!(h.engine.series.is_empty());
    assert!(h.engine.sessions.is_empty());
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn window_too_wide_rejected() {
    let h = harness("window_too_wide.wal");
    let result = h
        .engine
        .materialize_series_at(
            &h.admin,
            mon_wed_january(Ulid::new()),
            crate::limits::MAX_GENERATION_WINDOW_DAYS + 1,
            at(d(2023, 12, 31), 0, 0),
        )
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn deactivation_withdraws_future_governed_sessions_only() {
    let h = harness("deactivate_series.wal");
    let mut feed = h.hub.subscribe_all();
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(Ulid::new()), 31, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();

    let jan_10 = created_on(&m, d(2024, 1, 10));
    let jan_15 = created_on(&m, d(2024, 1, 15));
    let jan_8 = created_on(&m, d(2024, 1, 8));
    let alice = student();
    h.book(&alice, jan_10, at(d(2024, 1, 2), 0, 0)).await.unwrap();

    let exception = h
        .engine
        .edit_session(
            &h.admin,
            jan_15,
            SessionEdit {
                total_seats: Some(12),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(exception.origin, SessionOrigin::Exception { series_id: m.series_id });

    let withdrawn = h
        .engine
        .deactivate_series_at(&h.admin, m.series_id, at(d(2024, 1, 9), 0, 0))
        .await
        .unwrap();
    assert_eq!(withdrawn.len(), 6); // Jan 10, 17, 22, 24, 29, 31
    assert!(withdrawn.contains(&jan_10));
    assert!(!withdrawn.contains(&jan_15));

    let retired = h.engine.get_session(&h.admin, jan_10).await.unwrap();
    assert_eq!(retired.origin, SessionOrigin::Withdrawn { series_id: m.series_id });
    assert_eq!(retired.booked, 0);
    assert!(h.engine.get_session(&h.admin, jan_15).await.is_ok());
    assert!(h.engine.get_session(&h.admin, jan_8).await.is_ok());

    assert_eq!(
        feed.recv().await.unwrap(),
        Notice::BookingsCancelled {
            session_id: jan_10,
            student_ids: vec![alice.id],
        }
    );

    // inactive series never generate again
    let later = h
        .engine
        .extend_series_at(&h.admin, m.series_id, 60, at(d(2024, 1, 9), 0, 0))
        .await
        .unwrap();
    assert!(later.created.is_empty());
    let again = h
        .engine
        .deactivate_series_at(&h.admin, m.series_id, at(d(2024, 1, 9), 0, 0))
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn deactivation_keeps_booking_history() {
    let h = harness("deactivate_history.wal");
    let instructor = Ulid::new();
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, at(d(2023, 12, 31), 0, 0))
        .await
        .unwrap();
    let jan_10 = created_on(&m, d(2024, 1, 10));
    let alice = student();
    let booking = h.book(&alice, jan_10, at(d(2024, 1, 2), 0, 0)).await.unwrap();

    let now = at(d(2024, 1, 9), 0, 0);
    h.engine
        .deactivate_series_at(&h.admin, m.series_id, now)
        .await
        .unwrap();

    let kept = h.engine.get_booking(&alice, booking.id).await.unwrap();
    assert_eq!(kept.status, BookingStatus::Cancelled);
    let history = h.engine.list_bookings(&h.admin, jan_10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, booking.id);

    // retired sessions are off the schedule
    assert!(matches!(
        h.book(&student(), jan_10, now).await,
        Err(EngineError::SessionClosed(_))
    ));
    let listed = h
        .engine
        .list_bookable_sessions_at(&alice, &SessionFilter::default(), now)
        .await
        .unwrap();
    assert!(listed.iter().all(|s| s.id != jan_10));
    assert!(
        !h.engine
            .has_conflict(instructor, Span::new(at(d(2024, 1, 10), 9, 0), at(d(2024, 1, 10), 10, 0)), None)
            .await
    );
    assert!(matches!(
        h.engine
            .edit_session(
                &h.admin,
                jan_10,
                SessionEdit {
                    total_seats: Some(3),
                    ..Default::default()
                },
            )
            .await,
        Err(EngineError::InvalidSession(_))
    ));

    // and stay retired through compaction and restart
    h.engine.compact_wal().await.unwrap();
    let path = h.path.clone();
    drop(h);
    let h = open(path, OverlapPolicy::Inclusive);
    assert_eq!(
        h.engine.get_booking(&h.admin, booking.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert!(
        h.engine
            .get_session(&h.admin, jan_10)
            .await
            .unwrap()
            .origin
            .is_withdrawn()
    );
    assert!(
        !h.engine
            .has_conflict(instructor, Span::new(at(d(2024, 1, 10), 9, 0), at(d(2024, 1, 10), 10, 0)), None)
            .await
    );
}

// ── Single sessions ──────────────────────────────────────

#[tokio::test]
async fn create_session_rejects_double_booked_instructor() {
    let h = harness("create_conflict.wal");
    let instructor = Ulid::new();
    let existing = h
        .session(instructor, at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let result = h
        .engine
        .create_session(
            &h.admin,
            SessionDraft {
                id: Ulid::new(),
                placement: placement(instructor),
                // touches the end of the existing class: inclusive overlap
                span: Span::new(at(d(2024, 2, 1), 10, 0), at(d(2024, 2, 1), 11, 0)),
                total_seats: 5,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == existing));

    // another instructor in the same slot is fine
    h.session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
}

#[tokio::test]
async fn half_open_policy_allows_back_to_back_classes() {
    let h = open(test_wal_path("half_open.wal"), OverlapPolicy::HalfOpen);
    let instructor = Ulid::new();
    h.session(instructor, at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    h.session(instructor, at(d(2024, 2, 1), 10, 0), at(d(2024, 2, 1), 11, 0), 5)
        .await;
    assert!(
        h.engine
            .has_conflict(
                instructor,
                Span::new(at(d(2024, 2, 1), 9, 30), at(d(2024, 2, 1), 9, 45)),
                None
            )
            .await
    );
}

#[tokio::test]
async fn create_session_rejects_unavailable_instructor() {
    let h = harness("create_unavailable.wal");
    let instructor = Ulid::new();
    let blackout = Ulid::new();
    let span = Span::new(at(d(2024, 2, 1), 0, 0), at(d(2024, 2, 8), 0, 0));
    h.engine
        .record_unavailability(
            &h.admin,
            Unavailability {
                id: blackout,
                instructor_id: instructor,
                span,
            },
        )
        .await
        .unwrap();
    assert!(
        h.engine
            .is_unavailable(instructor, Span::new(at(d(2024, 2, 3), 9, 0), at(d(2024, 2, 3), 10, 0)))
            .await
    );
    let result = h
        .engine
        .create_session(
            &h.admin,
            SessionDraft {
                id: Ulid::new(),
                placement: placement(instructor),
                span: Span::new(at(d(2024, 2, 3), 9, 0), at(d(2024, 2, 3), 10, 0)),
                total_seats: 5,
            },
        )
        .await;
    assert!(matches!(result, Err(EngineError::Unavailable(id)) if id == blackout));

    let week = Span::new(at(d(2024, 2, 5), 0, 0), at(d(2024, 2, 12), 0, 0));
    let listed = h.engine.list_unavailability(&h.admin, instructor, week).await.unwrap();
    assert_eq!(listed.iter().map(|u| u.id).collect::<Vec<_>>(), vec![blackout]);
    assert!(matches!(
        h.engine.list_unavailability(&student(), instructor, week).await,
        Err(EngineError::Forbidden(_))
    ));

    h.engine.remove_unavailability(&h.admin, blackout).await.unwrap();
    assert!(!h.engine.is_unavailable(instructor, span).await);
    assert!(h
        .engine
        .list_unavailability(&h.admin, instructor, week)
        .await
        .unwrap()
        .is_empty());
    h.session(instructor, at(d(2024, 2, 3), 9, 0), at(d(2024, 2, 3), 10, 0), 5)
        .await;
}

#[tokio::test]
async fn create_session_validation() {
    let h = harness("create_validation.wal");
    let draft = |span: Span, seats: u32| SessionDraft {
        id: Ulid::new(),
        placement: placement(Ulid::new()),
        span,
        total_seats: seats,
    };
    let ok_span = Span::new(at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0));
    assert!(matches!(
        h.engine.create_session(&h.admin, draft(ok_span, 0)).await,
        Err(EngineError::InvalidSession(_))
    ));
    let inverted = Span {
        start: ok_span.end,
        end: ok_span.start,
    };
    assert!(matches!(
        h.engine.create_session(&h.admin, draft(inverted, 5)).await,
        Err(EngineError::InvalidSession(_))
    ));
    assert!(matches!(
        h.engine.create_session(&student(), draft(ok_span, 5)).await,
        Err(EngineError::Forbidden(_))
    ));
    let outsider = Actor::new(Ulid::new(), "other_academy", &[Role::Admin]);
    assert!(matches!(
        h.engine.create_session(&outsider, draft(ok_span, 5)).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn edit_rechecks_conflicts_and_excludes_itself() {
    let h = harness("edit_conflict.wal");
    let instructor = Ulid::new();
    let first = h
        .session(instructor, at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let second = h
        .session(instructor, at(d(2024, 2, 1), 11, 0), at(d(2024, 2, 1), 12, 0), 5)
        .await;

    // shifting within its own slot does not conflict with itself
    let moved = h
        .engine
        .edit_session(
            &h.admin,
            first,
            SessionEdit {
                start: Some(at(d(2024, 2, 1), 9, 15)),
                end: Some(at(d(2024, 2, 1), 10, 15)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.start, at(d(2024, 2, 1), 9, 15));
    assert_eq!(moved.origin, SessionOrigin::Standalone);

    let clash = h
        .engine
        .edit_session(
            &h.admin,
            first,
            SessionEdit {
                end: Some(at(d(2024, 2, 1), 11, 30)),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(id)) if id == second));

    // reassigning to a free instructor moves the calendar slot
    let other = Ulid::new();
    h.engine
        .edit_session(
            &h.admin,
            second,
            SessionEdit {
                instructor_id: Some(other),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let window = Span::new(at(d(2024, 2, 1), 11, 0), at(d(2024, 2, 1), 12, 0));
    assert!(!h.engine.has_conflict(instructor, window, None).await);
    assert!(h.engine.has_conflict(other, window, None).await);
}

#[tokio::test]
async fn edit_cannot_shrink_below_active_bookings() {
    let h = harness("edit_shrink.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 3)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    h.book(&student(), sid, now).await.unwrap();
    h.book(&student(), sid, now).await.unwrap();

    let shrink = |seats| SessionEdit {
        total_seats: Some(seats),
        ..Default::default()
    };
    assert!(matches!(
        h.engine.edit_session(&h.admin, sid, shrink(1)).await,
        Err(EngineError::InvalidSession(_))
    ));
    let info = h.engine.edit_session(&h.admin, sid, shrink(2)).await.unwrap();
    assert_eq!(info.seats_left(), 0);
}

#[tokio::test]
async fn delete_cascades_cancellation_and_notifies() {
    let h = harness("delete_cascade.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let mut rx = h.hub.subscribe_all();
    let now = at(d(2024, 1, 1), 0, 0);
    let (alice, bob, carol) = (student(), student(), student());
    let a = h.book(&alice, sid, now).await.unwrap();
    h.book(&bob, sid, now).await.unwrap();
    let c = h.book(&carol, sid, now).await.unwrap();
    h.engine.cancel(&carol, c.id).await.unwrap();

    let students = h.engine.delete_session(&h.admin, sid).await.unwrap();
    assert_eq!(students, vec![alice.id, bob.id]);
    assert_eq!(
        rx.recv().await.unwrap(),
        Notice::BookingsCancelled {
            session_id: sid,
            student_ids: vec![alice.id, bob.id],
        }
    );
    assert!(matches!(
        h.engine.get_session(&h.admin, sid).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.get_booking(&h.admin, a.id).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.delete_session(&h.admin, sid).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn reserve_checks_run_in_order() {
    let h = harness("reserve_order.wal");
    let start = at(d(2024, 2, 1), 9, 0);
    let sid = h.session(Ulid::new(), start, at(d(2024, 2, 1), 10, 0), 5).await;
    let before = at(d(2024, 1, 1), 0, 0);
    let alice = student();

    assert!(matches!(
        h.book(&alice, Ulid::new(), before).await,
        Err(EngineError::NotFound(_))
    ));
    let outsider = Actor::new(alice.id, "other_academy", &[Role::Student]);
    assert!(matches!(
        h.book(&outsider, sid, before).await,
        Err(EngineError::NotFound(_))
    ));
    let bob = student();
    assert!(matches!(
        h.engine.reserve_at(&bob, Ulid::new(), sid, alice.id, before).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        h.book(&alice, sid, start).await,
        Err(EngineError::SessionClosed(_))
    ));
    // closed and unknown sessions never reach the subscription collaborator
    assert_eq!(h.subs.calls.load(Ordering::SeqCst), 0);

    let booking = h.book(&alice, sid, before).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Active);
    assert!(matches!(
        h.book(&alice, sid, before).await,
        Err(EngineError::AlreadyBooked(id)) if id == booking.id
    ));

    h.subs.lapse(bob.id);
    assert!(matches!(
        h.book(&bob, sid, before).await,
        Err(EngineError::SubscriptionRequired(id)) if id == bob.id
    ));

    // staff may book on a student's behalf
    let carol = student();
    let on_behalf = h
        .engine
        .reserve_at(&h.admin, Ulid::new(), sid, carol.id, before)
        .await
        .unwrap();
    assert_eq!(on_behalf.student_id, carol.id);
}

#[tokio::test]
async fn capacity_exhaustion_then_cancellation_frees_seat() {
    let h = harness("capacity_recovery.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 1)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    let (alice, bob) = (student(), student());

    let a = h.book(&alice, sid, now).await.unwrap();
    assert!(matches!(
        h.book(&bob, sid, now).await,
        Err(EngineError::SessionFull(1))
    ));
    let cancelled = h.engine.cancel(&alice, a.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    h.book(&bob, sid, now).await.unwrap();

    // a cancelled booking does not block booking the same session again
    assert!(matches!(
        h.book(&alice, sid, now).await,
        Err(EngineError::SessionFull(1))
    ));
}

#[tokio::test]
async fn cancel_rules() {
    let h = harness("cancel_rules.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    let (alice, bob) = (student(), student());
    let a = h.book(&alice, sid, now).await.unwrap();

    assert!(matches!(
        h.engine.cancel(&bob, a.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        h.engine.cancel(&alice, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
    h.engine.cancel(&h.admin, a.id).await.unwrap();
    assert!(matches!(
        h.engine.cancel(&alice, a.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            to: BookingStatus::Cancelled
        })
    ));
}

#[tokio::test]
async fn subscription_outage_surfaces_storage_unavailable() {
    let h = harness("subscription_outage.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    h.subs.unreachable.store(true, Ordering::SeqCst);
    let result = h.book(&student(), sid, at(d(2024, 1, 1), 0, 0)).await;
    assert!(matches!(result, Err(EngineError::StorageUnavailable(_))));
    let info = h.engine.get_session(&h.admin, sid).await.unwrap();
    assert_eq!(info.booked, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_never_exceed_capacity() {
    let h = harness("concurrent_capacity.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            let s = student();
            engine.reserve_at(&s, Ulid::new(), sid, s.id, now).await
        }));
    }
    let (mut booked, mut full) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::SessionFull(5)) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 5);
    assert_eq!(full, 45);
    let info = h.engine.get_session(&h.admin, sid).await.unwrap();
    assert_eq!(info.booked, 5);
    assert_eq!(info.seats_left(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_reserves_book_once() {
    let h = harness("concurrent_duplicate.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 20)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    let alice = student();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        let alice = alice.clone();
        handles.push(tokio::spawn(async move {
            engine.reserve_at(&alice, Ulid::new(), sid, alice.id, now).await
        }));
    }
    let mut booked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::AlreadyBooked(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    let bookings = h.engine.list_bookings(&h.admin, sid).await.unwrap();
    assert_eq!(bookings.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserves_on_different_sessions_proceed_independently() {
    let h = harness("independent_sessions.wal");
    let now = at(d(2024, 1, 1), 0, 0);
    let mut sessions = Vec::new();
    for day in 1..=5 {
        sessions.push(
            h.session(Ulid::new(), at(d(2024, 2, day), 9, 0), at(d(2024, 2, day), 10, 0), 2)
                .await,
        );
    }
    let mut handles = Vec::new();
    for sid in sessions.iter().copied() {
        for _ in 0..2 {
            let engine = h.engine.clone();
            handles.push(tokio::spawn(async move {
                let s = student();
                engine.reserve_at(&s, Ulid::new(), sid, s.id, now).await
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    for sid in sessions {
        assert_eq!(h.engine.get_session(&h.admin, sid).await.unwrap().seats_left(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_with_one_id_insert_once() {
    let h = harness("concurrent_session_id.wal");
    let id = Ulid::new();
    let span = Span::new(at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0));
    // distinct instructors, so the calendar locks never serialize them
    let instructors: Vec<Ulid> = (0..8).map(|_| Ulid::new()).collect();
    let mut handles = Vec::new();
    for instructor in instructors.iter().copied() {
        let engine = h.engine.clone();
        let admin = h.admin.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_session(
                    &admin,
                    SessionDraft {
                        id,
                        placement: placement(instructor),
                        span,
                        total_seats: 5,
                    },
                )
                .await
        }));
    }
    let (mut created, mut duplicate) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(EngineError::AlreadyExists(dup)) => {
                assert_eq!(dup, id);
                duplicate += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(duplicate, 7);
    let mut scheduled = 0;
    for instructor in instructors {
        if h.engine.has_conflict(instructor, span, None).await {
            scheduled += 1;
        }
    }
    assert_eq!(scheduled, 1);
    h.engine.get_session(&h.admin, id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_with_one_booking_id_book_once() {
    let h = harness("concurrent_booking_id.wal");
    let now = at(d(2024, 1, 1), 0, 0);
    let mut sessions = Vec::new();
    for day in 1..=8 {
        sessions.push(
            h.session(Ulid::new(), at(d(2024, 2, day), 9, 0), at(d(2024, 2, day), 10, 0), 5)
                .await,
        );
    }
    let id = Ulid::new();
    let mut handles = Vec::new();
    for sid in sessions.iter().copied() {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            let s = student();
            engine.reserve_at(&s, id, sid, s.id, now).await
        }));
    }
    let mut booked = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);
    let mut holders = 0;
    for sid in sessions {
        holders += h.engine.list_bookings(&h.admin, sid).await.unwrap().len();
    }
    assert_eq!(holders, 1);
    h.engine.get_booking(&h.admin, id).await.unwrap();
}

#[tokio::test]
async fn released_claim_leaves_id_free_after_a_refusal() {
    let h = harness("claim_release.wal");
    let instructor = Ulid::new();
    h.session(instructor, at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let id = Ulid::new();
    let draft = |instructor| SessionDraft {
        id,
        placement: placement(instructor),
        span: Span::new(at(d(2024, 2, 1), 9, 30), at(d(2024, 2, 1), 10, 30)),
        total_seats: 5,
    };
    assert!(matches!(
        h.engine.create_session(&h.admin, draft(instructor)).await,
        Err(EngineError::Conflict(_))
    ));
    h.engine.create_session(&h.admin, draft(Ulid::new())).await.unwrap();
    assert!(matches!(
        h.engine.create_session(&h.admin, draft(Ulid::new())).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

// ── Lifecycle sweep ──────────────────────────────────────

#[tokio::test]
async fn sweep_completes_only_ended_sessions() {
    let h = harness("sweep_complete.wal");
    let end = at(d(2024, 2, 1), 10, 0);
    let sid = h.session(Ulid::new(), at(d(2024, 2, 1), 9, 0), end, 5).await;
    let later = h
        .session(Ulid::new(), at(d(2024, 2, 2), 9, 0), at(d(2024, 2, 2), 10, 0), 5)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    let (alice, bob) = (student(), student());
    let a = h.book(&alice, sid, now).await.unwrap();
    let b = h.book(&bob, sid, now).await.unwrap();
    h.engine.cancel(&bob, b.id).await.unwrap();
    let pending = h.book(&alice, later, now).await.unwrap();

    // the end instant itself is not "before now"
    assert_eq!(h.engine.complete_elapsed(end).await.unwrap(), 0);
    assert_eq!(h.engine.complete_elapsed(end + 1).await.unwrap(), 1);
    // idempotent
    assert_eq!(h.engine.complete_elapsed(end + 1).await.unwrap(), 0);

    assert_eq!(
        h.engine.get_booking(&h.admin, a.id).await.unwrap().status,
        BookingStatus::Completed
    );
    assert_eq!(
        h.engine.get_booking(&h.admin, b.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    assert_eq!(
        h.engine.get_booking(&h.admin, pending.id).await.unwrap().status,
        BookingStatus::Active
    );
    // completed is terminal
    assert!(matches!(
        h.engine.cancel(&alice, a.id).await,
        Err(EngineError::InvalidTransition {
            from: BookingStatus::Completed,
            ..
        })
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn bookable_listing_filters_and_orders() {
    let h = harness("bookable_listing.wal");
    let instructor = Ulid::new();
    let unit = Ulid::new();
    let mut yoga = placement(instructor);
    yoga.unit_id = unit;
    yoga.modality = "Yoga".into();
    let create = |id: Ulid, placement: Placement, day: u32| SessionDraft {
        id,
        placement,
        span: Span::new(at(d(2024, 2, day), 9, 0), at(d(2024, 2, day), 10, 0)),
        total_seats: 2,
    };
    let (past, first, second) = (Ulid::new(), Ulid::new(), Ulid::new());
    h.engine.create_session(&h.admin, create(second, yoga.clone(), 20)).await.unwrap();
    h.engine.create_session(&h.admin, create(first, yoga.clone(), 10)).await.unwrap();
    h.engine.create_session(&h.admin, create(past, yoga, 1)).await.unwrap();
    h.session(Ulid::new(), at(d(2024, 2, 15), 9, 0), at(d(2024, 2, 15), 10, 0), 2)
        .await;

    let now = at(d(2024, 2, 5), 0, 0);
    h.book(&student(), first, now).await.unwrap();

    let filter = SessionFilter {
        unit_id: Some(unit),
        modality: Some("yoga".into()),
        ..Default::default()
    };
    let listed = h
        .engine
        .list_bookable_sessions_at(&student(), &filter, now)
        .await
        .unwrap();
    let ids: Vec<Ulid> = listed.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(listed[0].seats_left(), 1);

    let ranged = SessionFilter {
        from: Some(at(d(2024, 2, 12), 0, 0)),
        to: Some(at(d(2024, 2, 28), 0, 0)),
        ..Default::default()
    };
    let listed = h
        .engine
        .list_bookable_sessions_at(&student(), &ranged, now)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);

    let outsider = Actor::new(Ulid::new(), "other_academy", &[Role::Student]);
    assert!(
        h.engine
            .list_bookable_sessions_at(&outsider, &SessionFilter::default(), now)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn students_see_only_their_own_bookings() {
    let h = harness("own_bookings.wal");
    let sid = h
        .session(Ulid::new(), at(d(2024, 2, 1), 9, 0), at(d(2024, 2, 1), 10, 0), 5)
        .await;
    let now = at(d(2024, 1, 1), 0, 0);
    let (alice, bob) = (student(), student());
    h.book(&alice, sid, now).await.unwrap();
    h.book(&bob, sid, now).await.unwrap();

    let mine = h.engine.list_bookings(&alice, sid).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].student_id, alice.id);
    assert_eq!(h.engine.list_bookings(&h.admin, sid).await.unwrap().len(), 2);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let h = harness("restart_replay.wal");
    let instructor = Ulid::new();
    let now = at(d(2023, 12, 31), 0, 0);
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, now)
        .await
        .unwrap();
    let jan_10 = created_on(&m, d(2024, 1, 10));
    let jan_17 = created_on(&m, d(2024, 1, 17));
    let alice = student();
    let kept = h.book(&alice, jan_10, now).await.unwrap();
    let dropped = h.book(&alice, jan_17, now).await.unwrap();
    h.engine.cancel(&alice, dropped.id).await.unwrap();
    h.engine
        .edit_session(
            &h.admin,
            jan_17,
            SessionEdit {
                start: Some(at(d(2024, 1, 17), 18, 0)),
                end: Some(at(d(2024, 1, 17), 19, 0)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let blackout = Unavailability {
        id: Ulid::new(),
        instructor_id: instructor,
        span: Span::new(at(d(2024, 3, 1), 0, 0), at(d(2024, 3, 2), 0, 0)),
    };
    h.engine.record_unavailability(&h.admin, blackout.clone()).await.unwrap();
    let gone = created_on(&m, d(2024, 1, 31));
    h.engine.delete_session(&h.admin, gone).await.unwrap();

    let path = h.path.clone();
    drop(h);
    let h = open(path, OverlapPolicy::Inclusive);

    assert_eq!(h.engine.sessions.len(), 9);
    assert_eq!(
        h.engine.get_booking(&h.admin, kept.id).await.unwrap().status,
        BookingStatus::Active
    );
    assert_eq!(
        h.engine.get_booking(&h.admin, dropped.id).await.unwrap().status,
        BookingStatus::Cancelled
    );
    let moved = h.engine.get_session(&h.admin, jan_17).await.unwrap();
    assert_eq!(moved.start, at(d(2024, 1, 17), 18, 0));
    assert_eq!(moved.origin, SessionOrigin::Exception { series_id: m.series_id });
    assert!(h.engine.is_unavailable(instructor, blackout.span).await);
    assert!(matches!(
        h.engine.get_session(&h.admin, gone).await,
        Err(EngineError::NotFound(_))
    ));
    // calendar index was rebuilt: the old slot is free, the new one is taken
    assert!(
        !h.engine
            .has_conflict(instructor, Span::new(at(d(2024, 1, 17), 9, 0), at(d(2024, 1, 17), 10, 0)), None)
            .await
    );
    assert!(
        h.engine
            .has_conflict(instructor, Span::new(at(d(2024, 1, 17), 18, 30), at(d(2024, 1, 17), 20, 0)), None)
            .await
    );
    let series = h.engine.get_series_state(&h.admin, m.series_id).await.unwrap();
    assert_eq!(series.generated_through, Some(d(2024, 1, 31)));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let h = harness("compaction.wal");
    let instructor = Ulid::new();
    let now = at(d(2023, 12, 31), 0, 0);
    let m = h
        .engine
        .materialize_series_at(&h.admin, mon_wed_january(instructor), 31, now)
        .await
        .unwrap();
    let alice = student();
    let jan_3 = created_on(&m, d(2024, 1, 3));
    let b = h.book(&alice, jan_3, now).await.unwrap();
    h.engine.complete_elapsed(at(d(2024, 1, 4), 0, 0)).await.unwrap();
    let blackout = Ulid::new();
    h.engine
        .record_unavailability(
            &h.admin,
            Unavailability {
                id: blackout,
                instructor_id: instructor,
                span: Span::new(at(d(2024, 3, 1), 0, 0), at(d(2024, 3, 2), 0, 0)),
            },
        )
        .await
        .unwrap();
    h.engine.remove_unavailability(&h.admin, blackout).await.unwrap();
    h.engine
        .deactivate_series_at(&h.admin, m.series_id, at(d(2024, 1, 20), 0, 0))
        .await
        .unwrap();

    assert!(h.engine.wal_appends_since_compact().await > 0);
    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    let sessions_before = h.engine.sessions.len();

    let path = h.path.clone();
    drop(h);
    let h = open(path, OverlapPolicy::Inclusive);
    assert_eq!(h.engine.sessions.len(), sessions_before);
    assert_eq!(
        h.engine.get_booking(&h.admin, b.id).await.unwrap().status,
        BookingStatus::Completed
    );
    assert!(
        !h.engine
            .is_unavailable(instructor, Span::new(at(d(2024, 3, 1), 9, 0), at(d(2024, 3, 1), 10, 0)))
            .await
    );
    let series = h.engine.get_series_state(&h.admin, m.series_id).await.unwrap();
    assert!(!series.active);
}
