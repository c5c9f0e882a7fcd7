use chrono::{Datelike, LocalResult, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Rule validation ──────────────────────────────────────────────

pub fn validate_rule(rule: &RecurrenceRule) -> Result<(), EngineError> {
    if rule.interval == 0 {
        return Err(EngineError::InvalidRule("interval must be at least 1".into()));
    }
    if rule.interval > MAX_RECURRENCE_INTERVAL {
        return Err(EngineError::InvalidRule(format!(
            "interval must be at most {MAX_RECURRENCE_INTERVAL}"
        )));
    }
    if rule.frequency == Frequency::Weekly && rule.weekdays.is_empty() {
        return Err(EngineError::InvalidRule(
            "weekly rule needs at least one weekday".into(),
        ));
    }
    if rule.start_time >= rule.end_time {
        return Err(EngineError::InvalidRule(
            "start time must be before end time".into(),
        ));
    }
    match rule.bound {
        RecurrenceBound::Until(until) if until < rule.start_date => {
            Err(EngineError::InvalidRule(format!(
                "end date {until} is before start date {}",
                rule.start_date
            )))
        }
        RecurrenceBound::Count(0) => Err(EngineError::InvalidRule(
            "occurrence count must be at least 1".into(),
        )),
        RecurrenceBound::Count(n) if n > MAX_RECURRENCE_COUNT => Err(EngineError::InvalidRule(
            format!("occurrence count must be at most {MAX_RECURRENCE_COUNT}"),
        )),
        _ => Ok(()),
    }
}

// ── Expansion ────────────────────────────────────────────────────

/// One concrete occurrence produced by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub date: NaiveDate,
    pub span: Span,
}

/// Expand `rule` over `[window_start, window_end]` (inclusive dates).
///
/// Pure: the same arguments always yield the same ascending, duplicate-free
/// sequence. Count-bounded rules are counted from the anchor date, so the
/// window only filters what is yielded, never what is counted.
pub fn expand(rule: &RecurrenceRule, window_start: NaiveDate, window_end: NaiveDate) -> Occurrences<'_> {
    let (cursor, last) = match rule.bound {
        RecurrenceBound::Until(until) => (rule.start_date.max(window_start), until.min(window_end)),
        RecurrenceBound::Count(_) => (rule.start_date, window_end),
    };
    let hard_stop = rule
        .start_date
        .checked_add_signed(TimeDelta::days(MAX_EXPANSION_DAYS))
        .unwrap_or(NaiveDate::MAX);
    Occurrences {
        rule,
        cursor: Some(cursor),
        last: last.min(hard_stop),
        window_start,
        counted: 0,
    }
}

/// Lazy iterator returned by [`expand`].
pub struct Occurrences<'a> {
    rule: &'a RecurrenceRule,
    cursor: Option<NaiveDate>,
    last: NaiveDate,
    window_start: NaiveDate,
    counted: u32,
}

impl Iterator for Occurrences<'_> {
    type Item = Occurrence;

    fn next(&mut self) -> Option<Occurrence> {
        while let Some(date) = self.cursor.filter(|d| *d <= self.last) {
            self.cursor = date.succ_opt();
            if !qualifies(self.rule, date) {
                continue;
            }
            if let RecurrenceBound::Count(limit) = self.rule.bound {
                self.counted += 1;
                if self.counted > limit {
                    self.cursor = None;
                    return None;
                }
            }
            if date < self.window_start {
                continue;
            }
            return Some(Occurrence {
                date,
                span: occurrence_span(self.rule, date),
            });
        }
        None
    }
}

/// Does `date` carry an occurrence of `rule`? Dates before the anchor never do.
pub fn qualifies(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    let anchor = rule.start_date;
    if date < anchor {
        return false;
    }
    let interval = i64::from(rule.interval.max(1));
    match rule.frequency {
        Frequency::Daily => (date - anchor).num_days() % interval == 0,
        Frequency::Weekly => {
            if !rule.weekdays.contains(date.weekday()) {
                return false;
            }
            let weeks = (week_start(date) - week_start(anchor)).num_days() / 7;
            weeks % interval == 0
        }
        Frequency::Monthly => {
            // A month without the anchor day (e.g. the 31st) is skipped, never clamped.
            if date.day() != anchor.day() {
                return false;
            }
            let months = i64::from(date.year() - anchor.year()) * 12
                + i64::from(date.month()) - i64::from(anchor.month());
            months % interval == 0
        }
    }
}

/// Monday of the week containing `date`.
fn week_start(date: NaiveDate) -> NaiveDate {
    date - TimeDelta::days(i64::from(date.weekday().num_days_from_monday()))
}

fn occurrence_span(rule: &RecurrenceRule, date: NaiveDate) -> Span {
    let start = local_to_ms(&rule.tz, date.and_time(rule.start_time));
    let end = local_to_ms(&rule.tz, date.and_time(rule.end_time));
    // A DST shift can only push the start forward; keep the span well-formed.
    Span::new(start, end.max(start + 1))
}

/// Resolve a wall-clock time in `tz` to an instant.
///
/// Ambiguous times (fall-back) take the earlier instant. Times inside a
/// spring-forward gap shift forward minute by minute to the first valid instant.
pub fn local_to_ms(tz: &Tz, naive: NaiveDateTime) -> Ms {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.timestamp_millis(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
        LocalResult::None => {
            let mut candidate = naive;
            for _ in 0..180 {
                candidate += TimeDelta::minutes(1);
                if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
                    return dt.timestamp_millis();
                }
            }
            Utc.from_utc_datetime(&naive).timestamp_millis()
        }
    }
}

/// Calendar date of instant `now` in `tz`.
pub fn date_in(tz: &Tz, now: Ms) -> NaiveDate {
    match Utc.timestamp_millis_opt(now) {
        LocalResult::Single(dt) => dt.with_timezone(tz).date_naive(),
        _ => NaiveDate::MIN,
    }
}
