use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
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

use crate::auth::{AuthError, BayslotAuthSource, Credentials, Principal, Role};
use crate::engine::{parse_capacity_input, parse_vehicle, Engine, EngineError, Schedule};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

pub struct BayslotHandler {
    engine: Arc<Engine>,
    schedule: Schedule,
    query_parser: Arc<BayslotQueryParser>,
}

impl BayslotHandler {
    pub fn new(engine: Arc<Engine>, schedule: Schedule) -> Self {
        Self {
            engine,
            schedule,
            query_parser: Arc::new(BayslotQueryParser),
        }
    }

    fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        user.parse()
            .map_err(|e: AuthError| user_error("28000", e.to_string()))
    }

    /// Parse, authorize and execute one statement, recording RED metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let principal = self.principal(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(principal, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, principal: Principal, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        let local = Local::now();
        let today = local.date_naive();
        match cmd {
            Command::InsertSlot {
                id,
                start_time,
                end_time,
                capacity,
                note,
            } => {
                principal.require_supervisor()?;
                let capacity = match capacity {
                    Some(raw) => parse_capacity_input(&raw)?,
                    None => DEFAULT_CAPACITY,
                };
                engine.create_slot(id, start_time, end_time, capacity, note).await?;
                Ok(inserted(1))
            }
            Command::GenerateSlots => {
                principal.require_supervisor()?;
                let created = engine.generate_default_slots(&self.schedule).await?;
                Ok(inserted(created))
            }
            Command::ToggleSlot { slot_id } => {
                principal.require_supervisor()?;
                engine.toggle_slot(slot_id).await?;
                Ok(inserted(1))
            }
            Command::UpdateCapacity {
                slot_id,
                capacity,
                view_date,
            } => {
                principal.require_supervisor()?;
                engine
                    .update_capacity(slot_id, &capacity, view_date.unwrap_or(today))
                    .await?;
                Ok(inserted(1))
            }
            Command::DeleteSlot { id, view_date } => {
                principal.require_supervisor()?;
                engine.delete_slot(id, view_date.unwrap_or(today)).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                slot_id,
                date,
                package_id,
                vehicle_type,
                custom_vehicle_type,
                address,
                contact_number,
            } => {
                let customer_id = principal.require_customer()?;
                let payload = ReservationPayload {
                    customer_id,
                    package_id,
                    vehicle: parse_vehicle(&vehicle_type, custom_vehicle_type.as_deref())?,
                    address,
                    contact_number,
                };
                engine.submit_booking(id, slot_id, date, payload, today, local.time()).await?;
                Ok(inserted(1))
            }
            Command::SetBookingStatus { booking_id, status } => {
                match principal.role {
                    Role::Supervisor => {
                        engine.set_booking_status(booking_id, &status).await?;
                    }
                    Role::Customer => {
                        if status.parse::<BookingStatus>() != Ok(BookingStatus::Cancelled) {
                            return Err(EngineError::Forbidden("customers may only cancel bookings"));
                        }
                        engine.cancel_booking(booking_id, principal.user_id).await?;
                    }
                }
                Ok(inserted(1))
            }
            Command::ArchiveBooking { booking_id } => {
                engine
                    .archive_booking(booking_id, principal.archive_side(), principal.user_id)
                    .await?;
                Ok(inserted(1))
            }
            Command::SelectSlots { date } => {
                let rows = engine.slots_for_date(date.unwrap_or(today)).await;
                Ok(query_response(slots_schema(), rows, encode_slot))
            }
            Command::SelectOpenSlots { date } => {
                let rows = engine.open_slots_for_date(date).await;
                Ok(query_response(slots_schema(), rows, encode_slot))
            }
            Command::SelectBookings { archived } => {
                let rows = match principal.role {
                    Role::Customer => engine.customer_bookings(principal.user_id, archived).await,
                    Role::Supervisor => engine.supervisor_bookings(archived).await,
                };
                Ok(query_response(bookings_schema(), rows, encode_booking))
            }
            Command::SelectBookingStats => {
                principal.require_supervisor()?;
                let stats = engine.booking_stats().await;
                Ok(query_response(stats_schema(), vec![stats], encode_stats))
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("booked_count", Type::INT8),
        field("available_for_date", Type::BOOL),
        field("is_available", Type::BOOL),
        field("note", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("package_id", Type::VARCHAR),
        field("slot_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("vehicle_type", Type::VARCHAR),
        field("custom_vehicle_type", Type::VARCHAR),
        field("address", Type::VARCHAR),
        field("contact_number", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("customer_archived", Type::BOOL),
        field("supervisor_archived", Type::BOOL),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        field("total", Type::INT8),
        field("pending", Type::INT8),
        field("in_progress", Type::INT8),
        field("completed", Type::INT8),
    ]
}

/// Pick the result schema for a statement before it runs (Describe).
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("BOOKING_STATS") {
        stats_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else {
        vec![]
    }
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_slot(encoder: &mut DataRowEncoder, slot: &SlotListing) -> PgWireResult<()> {
    encoder.encode_field(&slot.id.to_string())?;
    encoder.encode_field(&slot.start_time.format("%H:%M").to_string())?;
    encoder.encode_field(&slot.end_time.format("%H:%M").to_string())?;
    encoder.encode_field(&(slot.capacity as i64))?;
    encoder.encode_field(&(slot.booked_count as i64))?;
    encoder.encode_field(&slot.available_for_date)?;
    encoder.encode_field(&slot.is_available)?;
    encoder.encode_field(&slot.note.clone().unwrap_or_default())
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.customer_id.to_string())?;
    encoder.encode_field(&b.package_id.to_string())?;
    encoder.encode_field(&b.slot_id.map(|s| s.to_string()).unwrap_or_default())?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&b.status.as_str().to_string())?;
    encoder.encode_field(&b.vehicle.kind().to_string())?;
    encoder.encode_field(&b.vehicle.custom().unwrap_or_default().to_string())?;
    encoder.encode_field(&b.address.clone().unwrap_or_default())?;
    encoder.encode_field(&b.contact_number.clone().unwrap_or_default())?;
    encoder.encode_field(&b.created_at.to_rfc3339())?;
    encoder.encode_field(&b.is_archived_by(ArchiveSide::Customer))?;
    encoder.encode_field(&b.is_archived_by(ArchiveSide::Supervisor))
}

fn encode_stats(encoder: &mut DataRowEncoder, stats: &BookingStats) -> PgWireResult<()> {
    encoder.encode_field(&(stats.total as i64))?;
    encoder.encode_field(&(stats.pending as i64))?;
    encoder.encode_field(&(stats.in_progress as i64))?;
    encoder.encode_field(&(stats.completed as i64))
}

#[async_trait]
impl SimpleQueryHandler for BayslotHandler {
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
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BayslotQueryParser;

#[async_trait]
impl QueryParser for BayslotQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BayslotHandler {
    type Statement = String;
    type QueryParser = BayslotQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Byte ranges and 1-based indexes of the `$N` placeholders in `sql`,
/// skipping anything inside quoted literals or identifiers.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            // A doubled quote is an escaped quote and keeps us inside.
            if b == q {
                if bytes.get(i + 1) == Some(&q) {
                    i += 1;
                } else {
                    quote = None;
                }
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'$' => {
                let start = i;
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start + 1..end].parse::<usize>()
                    && n > 0
                {
                    found.push((start..end, n));
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Replace each placeholder with its bound value as a quoted text literal.
/// One pass over the statement; inserted values are never scanned again.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BayslotFactory {
    handler: Arc<BayslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BayslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BayslotFactory {
    pub fn new(engine: Arc<Engine>, credentials: Credentials, schedule: Schedule) -> Self {
        let auth_source = BayslotAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BayslotHandler::new(engine, schedule)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BayslotFactory {
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
    factory: Arc<BayslotFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. Rejections the caller can act on share
/// `P0001`; the reason code leads the message either way.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidCapacity(_)
        | EngineError::InvalidStatus(_)
        | EngineError::InvalidVehicle(_)
        | EngineError::InvalidWindow { .. }
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_user_recoverable() {
        tracing::error!("statement failed: {e}");
    }
    user_error(sqlstate(&e), format!("{}: {e}", e.reason()))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM slots"), 0);
        assert_eq!(count_params("INSERT INTO slot_toggles VALUES ($1)"), 1);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $3, $4, $5, $10)"), 10);
    }

    #[test]
    fn placeholders_inside_literals_are_ignored() {
        assert_eq!(count_params("SELECT * FROM slots WHERE date = '$3'"), 0);
        assert_eq!(count_params("INSERT INTO slot_toggles VALUES ('it''s $2', $1)"), 1);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings (id, slot_id, date, package_id, vehicle_type, custom_vehicle_type, address, contact_number) \
                   VALUES ($1, $2, $3, $4, $5, NULL, $6, $7)";
        let params: Vec<Option<Vec<u8>>> = vec![
            Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".to_vec()),
            Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAW".to_vec()),
            Some(b"2026-11-18".to_vec()),
            Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAX".to_vec()),
            Some(b"car".to_vec()),
            Some(b"Flat $1, O'Neil St".to_vec()),
            Some(b"0400111222".to_vec()),
        ];
        let bound = bind_params(sql, &params);
        assert!(bound.ends_with("'car', NULL, 'Flat $1, O''Neil St', '0400111222')"), "{bound}");

        match sql::parse_sql(&bound).unwrap() {
            Command::InsertBooking { address, vehicle_type, .. } => {
                assert_eq!(address.as_deref(), Some("Flat $1, O'Neil St"));
                assert_eq!(vehicle_type, "car");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ten_or_more_params_and_nulls() {
        let params: Vec<Option<Vec<u8>>> = (1..=10)
            .map(|i| if i == 10 { None } else { Some(format!("v{i}").into_bytes()) })
            .collect();
        assert_eq!(bind_params("($1, $10)", &params), "('v1', NULL)");
    }

    #[test]
    fn describe_picks_schema_by_table() {
        assert_eq!(schema_for_statement("SELECT * FROM booking_stats").len(), 4);
        assert_eq!(schema_for_statement("select * from bookings where archived = $1").len(), 13);
        assert_eq!(schema_for_statement("SELECT * FROM open_slots WHERE date = $1").len(), 8);
        assert!(schema_for_statement("INSERT INTO slots VALUES ($1, $2, $3)").is_empty());
    }

    #[test]
    fn errors_carry_reason_and_sqlstate() {
        let full = EngineError::SlotFull {
            slot_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 11, 18).unwrap(),
            capacity: 2,
        };
        assert_eq!(sqlstate(&full), "P0001");
        assert_eq!(sqlstate(&EngineError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&EngineError::InvalidCapacity("0".into())), "22023");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "58030");

        match engine_err(full) {
            PgWireError::UserError(info) => assert!(format!("{info:?}").contains("slot_full: ")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
