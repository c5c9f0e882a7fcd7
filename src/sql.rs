use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSession {
        draft: SessionDraft,
    },
    UpdateSession {
        id: Ulid,
        edit: SessionEdit,
    },
    DeleteSession {
        id: Ulid,
    },
    InsertSeries {
        draft: SeriesDraft,
        /// Generation window override; the server default applies when absent.
        window_days: Option<u32>,
    },
    ExtendSeries {
        id: Ulid,
        window_days: Option<u32>,
    },
    DeleteSeries {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        session_id: Ulid,
        /// Defaults to the logged-in member.
        student_id: Option<Ulid>,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertUnavailability {
        record: Unavailability,
    },
    DeleteUnavailability {
        id: Ulid,
    },
    SelectSessions {
        id: Option<Ulid>,
        filter: SessionFilter,
    },
    SelectBookings {
        id: Option<Ulid>,
        session_id: Option<Ulid>,
    },
    SelectSeries {
        id: Ulid,
    },
    SelectUnavailability {
        instructor_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

const SESSION_COLUMNS: &[&str] = &[
    "id",
    "instructor_id",
    "unit_id",
    "location_id",
    "modality",
    "start",
    "end",
    "seats",
];

const SERIES_COLUMNS: &[&str] = &[
    "id",
    "instructor_id",
    "unit_id",
    "location_id",
    "modality",
    "seats",
    "frequency",
    "interval",
    "weekdays",
    "start_date",
    "until",
    "tz",
    "start_time",
    "end_time",
];

const BOOKING_COLUMNS: &[&str] = &["id", "session_id", "student_id"];

const UNAVAILABILITY_COLUMNS: &[&str] = &["id", "instructor_id", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    fields: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| expr)
            .filter(|expr| !is_null(expr))
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn ms(&self, column: &'static str) -> Result<Ms, SqlError> {
        parse_i64_expr(self.required(column)?)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(column)?)
    }

    fn placement(&self) -> Result<Placement, SqlError> {
        Ok(Placement {
            instructor_id: self.ulid("instructor_id")?,
            unit_id: self.ulid("unit_id")?,
            location_id: self.ulid("location_id")?,
            modality: self.text("modality")?,
        })
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults): (&'static str, &[&str]) = match table.as_str() {
        "sessions" => ("sessions", SESSION_COLUMNS),
        "series" => ("series", SERIES_COLUMNS),
        "bookings" => ("bookings", BOOKING_COLUMNS),
        "unavailability" => ("unavailability", UNAVAILABILITY_COLUMNS),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, table, defaults)?;

    match table {
        "sessions" => Ok(Command::InsertSession {
            draft: SessionDraft {
                id: row.ulid("id")?,
                placement: row.placement()?,
                span: Span {
                    start: row.ms("start")?,
                    end: row.ms("end")?,
                },
                total_seats: parse_u32(row.required("seats")?)?,
            },
        }),
        "series" => {
            let bound = match (row.get("until"), row.get("count")) {
                (Some(until), None) => RecurrenceBound::Until(parse_date(until)?),
                (None, Some(count)) => RecurrenceBound::Count(parse_u32(count)?),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Parse("series takes either until or count, not both".into()));
                }
                (None, None) => return Err(SqlError::MissingColumn("series", "until")),
            };
            let frequency: Frequency = row.text("frequency")?.parse().map_err(SqlError::Parse)?;
            let weekdays = match row.get("weekdays") {
                Some(expr) => Weekdays::parse(&parse_string_expr(expr)?).map_err(SqlError::Parse)?,
                None => Weekdays::EMPTY,
            };
            let tz = match row.get("tz") {
                Some(expr) => parse_tz(expr)?,
                None => chrono_tz::UTC,
            };
            let interval = match row.get("interval") {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            };
            Ok(Command::InsertSeries {
                draft: SeriesDraft {
                    id: row.ulid("id")?,
                    placement: row.placement()?,
                    total_seats: parse_u32(row.required("seats")?)?,
                    rule: RecurrenceRule {
                        frequency,
                        interval,
                        weekdays,
                        start_date: parse_date(row.required("start_date")?)?,
                        bound,
                        tz,
                        start_time: parse_time(row.required("start_time")?)?,
                        end_time: parse_time(row.required("end_time")?)?,
                    },
                },
                window_days: row.get("window_days").map(parse_u32).transpose()?,
            })
        }
        "bookings" => Ok(Command::InsertBooking {
            id: row.ulid("id")?,
            session_id: row.ulid("session_id")?,
            student_id: row.get("student_id").map(parse_ulid_expr).transpose()?,
        }),
        _ => Ok(Command::InsertUnavailability {
            record: Unavailability {
                id: row.ulid("id")?,
                instructor_id: row.ulid("instructor_id")?,
                span: Span {
                    start: row.ms("start")?,
                    end: row.ms("end")?,
                },
            },
        }),
    }
}

/// Pair the single VALUES row with its column list, or with the table's
/// canonical column order when the statement names none.
fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [single] => single,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(ident_name).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(Row {
        table,
        fields: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut set = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &assignment.value));
    }

    match table.as_str() {
        "sessions" => {
            let mut edit = SessionEdit::default();
            for (column, value) in set {
                match column.as_str() {
                    "start" => edit.start = Some(parse_i64_expr(value)?),
                    "end" => edit.end = Some(parse_i64_expr(value)?),
                    "instructor_id" => edit.instructor_id = Some(parse_ulid_expr(value)?),
                    "unit_id" => edit.unit_id = Some(parse_ulid_expr(value)?),
                    "location_id" => edit.location_id = Some(parse_ulid_expr(value)?),
                    "modality" => edit.modality = Some(parse_string_expr(value)?),
                    "seats" => edit.total_seats = Some(parse_u32(value)?),
                    _ => return Err(SqlError::UnknownColumn("sessions", column)),
                }
            }
            Ok(Command::UpdateSession { id, edit })
        }
        "series" => {
            let mut window_days = None;
            for (column, value) in set {
                match column.as_str() {
                    "window_days" => window_days = Some(parse_u32(value)?),
                    _ => return Err(SqlError::UnknownColumn("series", column)),
                }
            }
            Ok(Command::ExtendSeries { id, window_days })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "sessions" => Ok(Command::DeleteSession { id }),
        "series" => Ok(Command::DeleteSeries { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "unavailability" => Ok(Command::DeleteUnavailability { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Conjunctive WHERE clause flattened into `(column, operator, value)` terms.
#[derive(Default)]
struct Filters<'a> {
    terms: Vec<(String, &'a ast::BinaryOperator, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(expr: &'a Expr, out: &mut Self) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => Self::collect(inner, out),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                Self::collect(left, out)?;
                Self::collect(right, out)
            }
            Expr::BinaryOp { left, op, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.terms.push((column, op, right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn find(&self, column: &str, op: ast::BinaryOperator) -> Option<&'a Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && **o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, ast::BinaryOperator::Eq)
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        Filters::collect(selection, &mut filters)?;
    }
    let ulid_eq = |column: &str| filters.eq(column).map(parse_ulid_expr).transpose();

    match table.as_str() {
        "sessions" => Ok(Command::SelectSessions {
            id: ulid_eq("id")?,
            filter: SessionFilter {
                from: filters
                    .find("start", ast::BinaryOperator::GtEq)
                    .map(parse_i64_expr)
                    .transpose()?,
                to: filters
                    .find("end", ast::BinaryOperator::LtEq)
                    .map(parse_i64_expr)
                    .transpose()?,
                unit_id: ulid_eq("unit_id")?,
                location_id: ulid_eq("location_id")?,
                modality: filters.eq("modality").map(parse_string_expr).transpose()?,
            },
        }),
        "bookings" => {
            let id = ulid_eq("id")?;
            let session_id = ulid_eq("session_id")?;
            if id.is_none() && session_id.is_none() {
                return Err(SqlError::MissingFilter("session_id"));
            }
            Ok(Command::SelectBookings { id, session_id })
        }
        "series" => Ok(Command::SelectSeries {
            id: ulid_eq("id")?.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "unavailability" => Ok(Command::SelectUnavailability {
            instructor_id: ulid_eq("instructor_id")?
                .ok_or(SqlError::MissingFilter("instructor_id"))?,
            start: filters
                .find("start", ast::BinaryOperator::GtEq)
                .map(parse_i64_expr)
                .transpose()?
                .ok_or(SqlError::MissingFilter("start"))?,
            end: filters
                .find("end", ast::BinaryOperator::LtEq)
                .map(parse_i64_expr)
                .transpose()?
                .ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn ident_name(ident: &Ident) -> String {
    ident.value.to_lowercase()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident_name(ident)),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

fn parse_tz(expr: &Expr) -> Result<Tz, SqlError> {
    let s = parse_string_expr(expr)?;
    s.parse::<Tz>()
        .map_err(|_| SqlError::Parse(format!("unknown time zone: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_session() {
        let sql = format!(
            r#"INSERT INTO sessions (id, instructor_id, unit_id, location_id, modality, start, "end", seats) VALUES ('{A}', '{B}', '{B}', '{B}', 'bjj', 1000, 2000, 12)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSession { draft } => {
                assert_eq!(draft.id, ulid(A));
                assert_eq!(draft.placement.instructor_id, ulid(B));
                assert_eq!(draft.placement.modality, "bjj");
                assert_eq!(draft.span, Span { start: 1000, end: 2000 });
                assert_eq!(draft.total_seats, 12);
            }
            cmd => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_columns_follow_declared_order() {
        let sql = format!(
            r#"INSERT INTO sessions (seats, "end", start, modality, location_id, unit_id, instructor_id, id) VALUES (3, 2000, 1000, 'yoga', '{B}', '{B}', '{B}', '{A}')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSession { draft } => {
                assert_eq!(draft.id, ulid(A));
                assert_eq!(draft.total_seats, 3);
                assert_eq!(draft.span, Span { start: 1000, end: 2000 });
            }
            cmd => panic!("expected InsertSession, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_without_columns_uses_canonical_order() {
        let sql = format!("INSERT INTO bookings VALUES ('{A}', '{B}', '{B}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                id: ulid(A),
                session_id: ulid(B),
                student_id: Some(ulid(B)),
            }
        );
    }

    #[test]
    fn booking_student_defaults_to_caller() {
        let sql = format!("INSERT INTO bookings (id, session_id) VALUES ('{A}', '{B}')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking { student_id: None, .. }
        ));
    }

    #[test]
    fn parse_insert_series() {
        let sql = format!(
            r#"INSERT INTO series (id, instructor_id, unit_id, location_id, modality, seats, frequency, "interval", weekdays, start_date, until, tz, start_time, end_time)
               VALUES ('{A}', '{B}', '{B}', '{B}', 'bjj', 10, 'weekly', 1, 'MO,WE', '2024-01-01', '2024-01-31', 'Europe/Lisbon', '09:00', '10:00')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSeries { draft, window_days } => {
                assert_eq!(window_days, None);
                assert_eq!(draft.rule.frequency, Frequency::Weekly);
                assert_eq!(draft.rule.weekdays, Weekdays::of(&[Weekday::Mon, Weekday::Wed]));
                assert_eq!(
                    draft.rule.bound,
                    RecurrenceBound::Until(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
                );
                assert_eq!(draft.rule.tz, chrono_tz::Europe::Lisbon);
                assert_eq!(draft.rule.start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
            }
            cmd => panic!("expected InsertSeries, got {cmd:?}"),
        }
    }

    #[test]
    fn series_count_bound_and_window() {
        let sql = format!(
            r#"INSERT INTO series (id, instructor_id, unit_id, location_id, modality, seats, frequency, start_date, count, start_time, end_time, window_days)
               VALUES ('{A}', '{B}', '{B}', '{B}', 'bjj', 10, 'monthly', '2024-01-31', 6, '18:30', '19:30', 90)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSeries { draft, window_days } => {
                assert_eq!(draft.rule.bound, RecurrenceBound::Count(6));
                assert_eq!(draft.rule.interval, 1);
                assert_eq!(draft.rule.tz, chrono_tz::UTC);
                assert_eq!(window_days, Some(90));
            }
            cmd => panic!("expected InsertSeries, got {cmd:?}"),
        }
    }

    #[test]
    fn series_needs_exactly_one_bound() {
        let base = "INSERT INTO series (id, instructor_id, unit_id, location_id, modality, seats, frequency, start_date, start_time, end_time";
        let values = format!("'{A}', '{B}', '{B}', '{B}', 'bjj', 10, 'daily', '2024-01-01', '09:00', '10:00'");
        let neither = format!("{base}) VALUES ({values})");
        assert!(matches!(
            parse_sql(&neither),
            Err(SqlError::MissingColumn("series", "until"))
        ));
        let both = format!("{base}, until, count) VALUES ({values}, '2024-02-01', 3)");
        assert!(matches!(parse_sql(&both), Err(SqlError::Parse(_))));
    }

    #[test]
    fn bad_time_zone_rejected() {
        let sql = format!(
            "INSERT INTO series (id, instructor_id, unit_id, location_id, modality, seats, frequency, start_date, count, tz, start_time, end_time)
             VALUES ('{A}', '{B}', '{B}', '{B}', 'bjj', 10, 'daily', '2024-01-01', 3, 'Mars/Olympus', '09:00', '10:00')"
        );
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_update_session() {
        let sql = format!(
            r#"UPDATE sessions SET start = 5000, "end" = 6000, seats = 4 WHERE id = '{A}'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSession {
                id: ulid(A),
                edit: SessionEdit {
                    start: Some(5000),
                    end: Some(6000),
                    total_seats: Some(4),
                    ..Default::default()
                },
            }
        );
    }

    #[test]
    fn update_unknown_column_rejected() {
        let sql = format!("UPDATE sessions SET colour = 'red' WHERE id = '{A}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("sessions", _))));
    }

    #[test]
    fn update_series_extends() {
        let sql = format!("UPDATE series SET window_days = 28 WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ExtendSeries {
                id: ulid(A),
                window_days: Some(28),
            }
        );
    }

    #[test]
    fn parse_deletes() {
        let id = ulid(A);
        for (table, expected) in [
            ("sessions", Command::DeleteSession { id }),
            ("series", Command::DeleteSeries { id }),
            ("bookings", Command::DeleteBooking { id }),
            ("unavailability", Command::DeleteUnavailability { id }),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id = '{A}'");
            assert_eq!(parse_sql(&sql).unwrap(), expected);
        }
    }

    #[test]
    fn delete_requires_id() {
        assert!(matches!(
            parse_sql("DELETE FROM sessions"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_sessions() {
        let sql = format!(
            r#"SELECT * FROM sessions WHERE start >= 1000 AND "end" <= 2000 AND unit_id = '{B}' AND modality = 'yoga'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSessions {
                id: None,
                filter: SessionFilter {
                    from: Some(1000),
                    to: Some(2000),
                    unit_id: Some(ulid(B)),
                    location_id: None,
                    modality: Some("yoga".into()),
                },
            }
        );
    }

    #[test]
    fn select_all_sessions_has_empty_filter() {
        assert_eq!(
            parse_sql("SELECT * FROM sessions").unwrap(),
            Command::SelectSessions {
                id: None,
                filter: SessionFilter::default(),
            }
        );
    }

    #[test]
    fn select_bookings_needs_a_key() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter("session_id"))
        ));
        let sql = format!("SELECT * FROM bookings WHERE session_id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                id: None,
                session_id: Some(ulid(A)),
            }
        );
    }

    #[test]
    fn parse_select_unavailability() {
        let sql = format!(
            r#"SELECT * FROM unavailability WHERE instructor_id = '{A}' AND start >= 0 AND "end" <= 86400000"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectUnavailability {
                instructor_id: ulid(A),
                start: 0,
                end: 86_400_000,
            }
        );
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = format!("INSERT INTO bookings (id, session_id) VALUES ('{A}', '{B}'), ('{B}', '{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn wrong_arity_rejected() {
        let sql = format!("INSERT INTO bookings (id, session_id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("bookings", 2, 1))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
