use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::ClassbookAuthSource;
use crate::directory::{Actor, Directory};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct ClassbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ClassbookQueryParser>,
}

impl ClassbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ClassbookQueryParser),
        }
    }

    /// Tenant engine from the connection's database, actor from its user.
    fn resolve<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Engine>, Actor)> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata.get("user").cloned().unwrap_or_default();
        let engine = self
            .tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        let actor = self.tenant_manager.members().resolve(&db, &user).map_err(|e| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", e.to_string())
        })?;
        Ok((engine, actor))
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: &Actor,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.run(engine, actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, engine: &Engine, actor: &Actor, cmd: Command) -> PgWireResult<Response> {
        let window = |days: Option<u32>| days.unwrap_or(self.tenant_manager.settings().window_days);
        match cmd {
            Command::InsertSession { draft } => {
                engine.create_session(actor, draft).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateSession { id, edit } => {
                engine.edit_session(actor, id, edit).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSession { id } => {
                engine.delete_session(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSeries { draft, window_days } => {
                let outcome = engine
                    .materialize_series(actor, draft, window(window_days))
                    .await
                    .map_err(engine_err)?;
                Ok(materialization_response(outcome))
            }
            Command::ExtendSeries { id, window_days } => {
                let outcome = engine
                    .extend_series(actor, id, window(window_days))
                    .await
                    .map_err(engine_err)?;
                Ok(materialization_response(outcome))
            }
            Command::DeleteSeries { id } => {
                let withdrawn = engine.deactivate_series(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(withdrawn.len())))
            }
            Command::InsertBooking {
                id,
                session_id,
                student_id,
            } => {
                engine
                    .reserve(actor, id, session_id, student_id.unwrap_or(actor.id))
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel(actor, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertUnavailability { record } => {
                engine
                    .record_unavailability(actor, record)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteUnavailability { id } => {
                engine
                    .remove_unavailability(actor, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSessions { id: Some(id), .. } => {
                let session = engine.get_session(actor, id).await.map_err(engine_err)?;
                Ok(rows(session_schema(), vec![session], encode_session))
            }
            Command::SelectSessions { id: None, filter } => {
                let sessions = engine
                    .list_bookable_sessions(actor, &filter)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(session_schema(), sessions, encode_session))
            }
            Command::SelectBookings {
                id: Some(id),
                session_id,
            } => {
                let booking = engine.get_booking(actor, id).await.map_err(engine_err)?;
                let matching = session_id.is_none_or(|s| s == booking.session_id);
                let bookings = if matching { vec![booking] } else { Vec::new() };
                Ok(rows(booking_schema(), bookings, encode_booking))
            }
            Command::SelectBookings {
                id: None,
                session_id,
            } => {
                let Some(session_id) = session_id else {
                    return Err(sql_err(sql::SqlError::MissingFilter("session_id")));
                };
                let bookings = engine
                    .list_bookings(actor, session_id)
                    .await
                    .map_err(engine_err)?;
                Ok(rows(booking_schema(), bookings, encode_booking))
            }
            Command::SelectSeries { id } => {
                let series = engine.get_series_state(actor, id).await.map_err(engine_err)?;
                Ok(rows(series_schema(), vec![series], encode_series))
            }
            Command::SelectUnavailability {
                instructor_id,
                start,
                end,
            } => {
                let records = engine
                    .list_unavailability(actor, instructor_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(rows(unavailability_schema(), records, encode_unavailability))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn session_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("instructor_id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("modality", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("seats", Type::INT8),
        field("booked", Type::INT8),
        field("seats_left", Type::INT8),
        field("origin", Type::VARCHAR),
        field("series_id", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("session_id", Type::VARCHAR),
        field("student_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn series_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("instructor_id", Type::VARCHAR),
        field("modality", Type::VARCHAR),
        field("seats", Type::INT8),
        field("frequency", Type::VARCHAR),
        field("interval", Type::INT8),
        field("tz", Type::VARCHAR),
        field("active", Type::BOOL),
        field("generated_through", Type::VARCHAR),
    ]
}

fn unavailability_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("instructor_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn materialization_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("detail", Type::VARCHAR),
    ]
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_session(encoder: &mut DataRowEncoder, s: SessionInfo) -> PgWireResult<()> {
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.placement.instructor_id.to_string())?;
    encoder.encode_field(&s.placement.unit_id.to_string())?;
    encoder.encode_field(&s.placement.location_id.to_string())?;
    encoder.encode_field(&s.placement.modality)?;
    encoder.encode_field(&s.start)?;
    encoder.encode_field(&s.end)?;
    encoder.encode_field(&i64::from(s.total_seats))?;
    encoder.encode_field(&i64::from(s.booked))?;
    encoder.encode_field(&i64::from(s.seats_left()))?;
    encoder.encode_field(&s.origin.label())?;
    encoder.encode_field(&s.origin.series_id().map(|id| id.to_string()))?;
    Ok(())
}

fn encode_booking(encoder: &mut DataRowEncoder, b: BookingInfo) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.session_id.to_string())?;
    encoder.encode_field(&b.student_id.to_string())?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.created_at)?;
    Ok(())
}

fn encode_series(encoder: &mut DataRowEncoder, s: RecurringSeries) -> PgWireResult<()> {
    let frequency = match s.rule.frequency {
        Frequency::Daily => "daily",
        Frequency::Weekly => "weekly",
        Frequency::Monthly => "monthly",
    };
    encoder.encode_field(&s.id.to_string())?;
    encoder.encode_field(&s.placement.instructor_id.to_string())?;
    encoder.encode_field(&s.placement.modality)?;
    encoder.encode_field(&i64::from(s.total_seats))?;
    encoder.encode_field(&frequency)?;
    encoder.encode_field(&i64::from(s.rule.interval))?;
    encoder.encode_field(&s.rule.tz.name())?;
    encoder.encode_field(&s.active)?;
    encoder.encode_field(&s.generated_through.map(|d| d.to_string()))?;
    Ok(())
}

fn encode_unavailability(encoder: &mut DataRowEncoder, u: Unavailability) -> PgWireResult<()> {
    encoder.encode_field(&u.id.to_string())?;
    encoder.encode_field(&u.instructor_id.to_string())?;
    encoder.encode_field(&u.span.start)?;
    encoder.encode_field(&u.span.end)?;
    Ok(())
}

/// One row per occurrence date: `created` with the new session id, or the
/// skip reason with the blocking session or unavailability id.
fn materialization_response(m: Materialization) -> Response {
    let mut outcomes: Vec<(chrono::NaiveDate, &'static str, Option<String>)> = m
        .created
        .iter()
        .map(|c| (c.date, "created", Some(c.session_id.to_string())))
        .chain(
            m.skipped
                .iter()
                .map(|s| (s.date, s.reason.as_str(), s.reason.blocker().map(|id| id.to_string()))),
        )
        .collect();
    outcomes.sort_by_key(|(date, _, _)| *date);
    rows(materialization_schema(), outcomes, |encoder, (date, outcome, detail)| {
        encoder.encode_field(&date.to_string())?;
        encoder.encode_field(&outcome)?;
        encoder.encode_field(&detail)?;
        Ok(())
    })
}

/// Result columns a statement will produce, from its text alone (extended
/// protocol statements are described before their parameters are bound).
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    if normalized.starts_with("SELECT") {
        if normalized.contains("FROM SESSIONS") {
            return session_schema();
        }
        if normalized.contains("FROM BOOKINGS") {
            return booking_schema();
        }
        if normalized.contains("FROM SERIES") {
            return series_schema();
        }
        if normalized.contains("FROM UNAVAILABILITY") {
            return unavailability_schema();
        }
    }
    if normalized.starts_with("INSERT INTO SERIES") || normalized.starts_with("UPDATE SERIES") {
        return materialization_schema();
    }
    Vec::new()
}

#[async_trait]
impl SimpleQueryHandler for ClassbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, actor) = self.resolve(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(&engine, &actor, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClassbookQueryParser;

#[async_trait]
impl QueryParser for ClassbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClassbookHandler {
    type Statement = String;
    type QueryParser = ClassbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let (engine, actor) = self.resolve(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(&engine, &actor, cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // highest index first so $1 never clobbers the prefix of $10
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClassbookFactory {
    handler: Arc<ClassbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ClassbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ClassbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ClassbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ClassbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClassbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ClassbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine outcome. Booking refusals get their own codes
/// in class P0 so clients can tell them apart.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::SessionClosed(_) => "P0010",
        EngineError::AlreadyBooked(_) => "P0011",
        EngineError::SubscriptionRequired(_) => "P0012",
        EngineError::SessionFull(_) => "P0013",
        EngineError::Conflict(_) => "P0014",
        EngineError::Unavailable(_) => "P0015",
        EngineError::InvalidTransition { .. } => "P0016",
        EngineError::InvalidRule(_) | EngineError::InvalidSession(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::StorageUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_user_outcome() {
        tracing::error!("engine failure: {e}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
