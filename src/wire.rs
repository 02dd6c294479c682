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

use crate::auth::SlotguardAuthSource;
use crate::engine::{span_of, BookingError, Engine};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct SlotguardHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotguardQueryParser>,
}

impl SlotguardHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotguardQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> Result<Response, BookingError> {
    match cmd {
        Command::InsertStaff { id, name } => {
            engine.register_staff(id, name).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::InsertSubject { id, name } => {
            engine.register_subject(id, name).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::InsertBooking(req) => {
            let booking = engine.create_booking(req).await?;
            Ok(booking_rows(vec![booking]))
        }
        Command::UpdateBooking { id, changes } => {
            let booking = engine.update_booking(id, changes).await?;
            Ok(booking_rows(vec![booking]))
        }
        Command::DeleteBooking { id } => {
            engine.delete_booking(id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertReference { booking_id, ref_id } => {
            engine.attach_reference(booking_id, ref_id).await?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteReference { booking_id, ref_id } => {
            engine.detach_reference(booking_id, ref_id).await?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectResources { kind } => Ok(resource_rows(engine.list_resources(kind).await)),
        Command::SelectBooking { id } => Ok(booking_rows(vec![engine.get_booking(&id)?])),
        Command::SelectBookingsByResource {
            resource_id,
            status,
        } => Ok(booking_rows(engine.list_by_resource(&resource_id, status))),
        Command::SelectBookingsByStatus { status } => Ok(booking_rows(engine.list_by_status(status))),
        Command::SelectBookingsInRange { start, end } => {
            let window = span_of(start, end)?;
            Ok(booking_rows(engine.list_by_time_range(&window)?))
        }
        Command::SelectAvailability {
            staff_id,
            subject_id,
            start,
            end,
            duration,
        } => {
            let window = span_of(start, end)?;
            // Without a duration every gap is reported.
            let slots = engine
                .find_open_slots(staff_id, subject_id, window, duration.unwrap_or(1))
                .await?;
            Ok(slot_rows(slots))
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("staff_id"),
        varchar("subject_id"),
        int8("start"),
        int8("end"),
        varchar("status"),
        varchar("kind"),
        varchar("notes"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![int8("start"), int8("end")]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![varchar("id"), varchar("kind"), varchar("name"), int8("booked")]
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.staff_id.to_string())?;
            encoder.encode_field(&b.subject_id.to_string())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.kind.as_str())?;
            encoder.encode_field(&b.notes)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn slot_rows(slots: Vec<Span>) -> Response {
    let schema = Arc::new(availability_schema());
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resource_rows(resources: Vec<ResourceInfo>) -> Response {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.key.id.to_string())?;
            encoder.encode_field(&r.key.kind.as_str())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&(r.booked as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns of a statement, guessed from its verb and table without
/// binding parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |kw: &str| {
        words
            .iter()
            .position(|w| *w == kw)
            .and_then(|i| words.get(i + 1))
            .map(|w| w.trim_matches('"'))
    };
    let (verb, table) = match words.first() {
        Some(&"select") => ("select", after("from")),
        Some(&"insert") => ("insert", after("into")),
        Some(&"update") => ("update", words.get(1).map(|w| w.trim_matches('"'))),
        _ => return vec![],
    };
    match (verb, table) {
        (_, Some("bookings")) => booking_schema(),
        ("select", Some("availability")) => availability_schema(),
        ("select", Some("staff" | "subjects" | "cases")) => resource_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotguardHandler {
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
        let engine = self.resolve_engine(client)?;
        // Statements run in order; the first failure ends the batch.
        let mut responses = Vec::new();
        for cmd in sql::parse_batch(query).map_err(sql_err)? {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotguardQueryParser;

#[async_trait]
impl QueryParser for SlotguardQueryParser {
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
impl ExtendedQueryHandler for SlotguardHandler {
    type Statement = String;
    type QueryParser = SlotguardQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(&substitute_params(portal)).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotguardFactory {
    handler: Arc<SlotguardHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotguardAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotguardFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotguardAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotguardHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotguardFactory {
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
    let factory = SlotguardFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

pub fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Validation(_) => "22023",
        BookingError::ResourceNotFound { .. } | BookingError::NotFound(_) => "P0002",
        BookingError::AlreadyExists(_) => "23505",
        BookingError::Conflict(_) => "23P01",
        BookingError::InvalidTransition { .. } | BookingError::IntervalFrozen { .. } => "55000",
        BookingError::ReferentialIntegrity { .. } => "23503",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::Timeout(_) => "55P03",
        BookingError::Storage(_) => "58030",
    }
}

fn engine_err(e: BookingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("UPDATE bookings SET start = $2, \"end\" = $10 WHERE id = $1"),
            10
        );
        assert_eq!(count_params("SELECT '$' FROM staff"), 0);
    }

    #[test]
    fn schema_follows_table() {
        assert_eq!(names(&result_schema("select * from availability where staff_id = $1")), vec!["start", "end"]);
        assert_eq!(names(&result_schema("SELECT * FROM subjects")).len(), 4);
        assert_eq!(
            names(&result_schema("INSERT INTO bookings (staff_id) VALUES ($1)"))[0],
            "id"
        );
        assert_eq!(names(&result_schema("UPDATE \"bookings\" SET notes = $1")).len(), 8);
        assert!(result_schema("INSERT INTO booking_refs VALUES ($1, $2)").is_empty());
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO staff (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn every_error_has_its_own_state() {
        let id = Ulid::new();
        assert_eq!(
            sqlstate(&BookingError::Conflict(vec![])),
            "23P01"
        );
        assert_eq!(sqlstate(&BookingError::NotFound(id)), "P0002");
        assert_eq!(
            sqlstate(&BookingError::IntervalFrozen {
                id,
                status: BookingStatus::Completed
            }),
            "55000"
        );
        assert_eq!(
            sqlstate(&BookingError::ReferentialIntegrity {
                id,
                references: vec![Ulid::new()]
            }),
            "23503"
        );
        assert_eq!(sqlstate(&BookingError::Timeout("ledger lock")), "55P03");
    }
}
