use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::auth::StationAuthSource;
use crate::engine::{Caller, Engine, EngineError, ReservationRequest};
use crate::limits::MAX_SQL_LEN;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

const CHANNEL_PREFIX: &str = "pool_";

struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Event>,
}

/// One per connection: LISTEN subscriptions belong to the session that
/// issued them.
pub struct StationHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StationQueryParser>,
    listening: Mutex<Vec<Subscription>>,
}

impl StationHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StationQueryParser),
            listening: Mutex::new(Vec::new()),
        }
    }

    /// The login user, as verified by the startup handler.
    fn caller<C: ClientInfo>(&self, client: &C) -> Caller {
        Caller::new(client.metadata().get("user").cloned().unwrap_or_default())
    }

    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        if query.len() > MAX_SQL_LEN {
            return Err(sql_err(SqlError::Unsupported(format!(
                "statement longer than {MAX_SQL_LEN} bytes"
            ))));
        }
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let caller = self.caller(client);

        let started = Instant::now();
        let result = self.execute_command(&caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SelectAvailability { slot } => {
                let check = engine.check_availability(&slot).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&check.available)?;
                encoder.encode_field(&check.duration_hours)?;
                encoder.encode_field(&check.unit_rate)?;
                encoder.encode_field(&check.estimated_cost)?;
                encoder.encode_field(&i64::from(check.capacity))?;
                let row = encoder.take_row();
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                )))
            }
            Command::SelectAvailableUnits { slot } => {
                let units = engine.list_available_units(&slot).await.map_err(engine_err)?;
                let schema = Arc::new(available_units_schema());
                let mut list = String::new();
                // Writing into a String cannot fail.
                let _ = crate::engine::write_unit_list(&mut list, &units.available_units);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&list)?;
                encoder.encode_field(&i64::from(units.capacity))?;
                encoder.encode_field(&units.first_available.map(i64::from))?;
                let row = encoder.take_row();
                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                )))
            }
            Command::InsertReservation {
                slot,
                unit_number,
                notes,
            } => {
                let request = ReservationRequest {
                    slot,
                    unit_number,
                    notes,
                };
                let reservation = engine
                    .create_reservation(caller, request)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![(reservation, None)])
            }
            Command::CancelReservation { id } => {
                let reservation = engine
                    .cancel_reservation(caller, id)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![(reservation, None)])
            }
            Command::InsertStatusChange { id, status } => {
                let reservation = engine
                    .set_reservation_status(caller, id, status)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![(reservation, None)])
            }
            Command::InsertPaymentUpdate { id, payment_status } => {
                let reservation = engine
                    .set_payment_status(caller, id, payment_status)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![(reservation, None)])
            }
            Command::SelectReservation { id } => {
                let reservation = engine
                    .get_reservation(caller, id)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(vec![(reservation, None)])
            }
            Command::SelectPoolReservations { pool_id, date } => {
                let reservations = engine
                    .list_pool_reservations(caller, pool_id, date)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(reservations.into_iter().map(|r| (r, None)).collect())
            }
            Command::SelectMyReservations => {
                let summaries = engine
                    .list_my_reservations(caller)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(
                    summaries
                        .into_iter()
                        .map(|s| (s.reservation, s.pool_name))
                        .collect(),
                )
            }
            Command::Listen { channel } => {
                let pool_id = channel
                    .strip_prefix(CHANNEL_PREFIX)
                    .and_then(|id| Ulid::from_string(id).ok())
                    .ok_or_else(|| {
                        user_error(
                            "42602",
                            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
                        )
                    })?;
                let mut listening = self.listening.lock().await;
                if !listening.iter().any(|s| s.channel == channel) {
                    let rx = engine.notify.subscribe(pool_id);
                    listening.push(Subscription { channel, rx });
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let mut listening = self.listening.lock().await;
                match channel {
                    Some(channel) => listening.retain(|s| s.channel != channel),
                    None => listening.clear(),
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Push whatever arrived on this session's channels since the last
    /// statement. Notifications ride along with statement responses rather
    /// than arriving while the session is idle.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            listening.retain_mut(|sub| loop {
                match sub.rx.try_recv() {
                    Ok(event) => pending.push((sub.channel.clone(), event)),
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(channel = %sub.channel, skipped, "listener lagged, events dropped");
                    }
                    Err(TryRecvError::Closed) => return false,
                }
            });
        }
        for (channel, event) in pending {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(%channel, "notification payload: {e}");
                    continue;
                }
            };
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("available", Type::BOOL),
        field("duration_hours", Type::FLOAT8),
        field("unit_rate", Type::FLOAT8),
        field("estimated_cost", Type::FLOAT8),
        field("capacity", Type::INT8),
    ]
}

fn available_units_schema() -> Vec<FieldInfo> {
    vec![
        field("available_units", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("first_available", Type::INT8),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("pool_id", Type::VARCHAR),
        field("pool_name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("subtype", Type::VARCHAR),
        field("unit_number", Type::INT8),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration_hours", Type::FLOAT8),
        field("unit_rate", Type::FLOAT8),
        field("total_amount", Type::FLOAT8),
        field("status", Type::VARCHAR),
        field("payment_status", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
    ]
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Result columns by statement text. Extended-protocol statements still
/// carry `$n` placeholders here, so this cannot go through the parser.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("LISTEN") || upper.starts_with("UNLISTEN") {
        vec![]
    } else if upper.contains("AVAILABLE_UNITS") {
        available_units_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else {
        reservation_schema()
    }
}

fn reservation_rows(rows: Vec<(Reservation, Option<String>)>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|(r, pool_name)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.requester_id)?;
            encoder.encode_field(&r.pool_id.to_string())?;
            encoder.encode_field(&pool_name)?;
            encoder.encode_field(&r.unit.kind_str().to_string())?;
            encoder.encode_field(&r.unit.subtype().map(|f| f.as_str().to_string()))?;
            encoder.encode_field(&i64::from(r.unit_number))?;
            encoder.encode_field(&r.date.to_string())?;
            encoder.encode_field(&r.start.to_string())?;
            encoder.encode_field(&r.end.to_string())?;
            encoder.encode_field(&r.duration_hours)?;
            encoder.encode_field(&r.unit_rate)?;
            encoder.encode_field(&r.total_amount)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&r.payment_status.as_str().to_string())?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for StationHandler {
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
pub struct StationQueryParser;

#[async_trait]
impl QueryParser for StationQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for StationHandler {
    type Statement = String;
    type QueryParser = StationQueryParser;

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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
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

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&placeholder, &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StationFactory {
    handler: Arc<StationHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StationAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StationFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = StationAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StationHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StationFactory {
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

/// Serve one client socket to completion, with a fresh session handler.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(StationFactory::new(engine, password));
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

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::Conflict { .. } => "23P01",
        EngineError::InvalidState { .. } => "55000",
        EngineError::Unavailable(_) => "40001",
        EngineError::Storage(detail) => {
            error!("storage error: {detail}");
            return user_error("58000", "internal storage error".into());
        }
    };
    debug!(code, "{e}");
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("DELETE FROM reservations WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO payment_updates VALUES ($2, $1)"), 2);
        assert_eq!(count_params("VALUES ($1, $10)"), 10);
    }

    #[test]
    fn schema_follows_statement() {
        assert_eq!(schema_for("LISTEN pool_x").len(), 0);
        assert_eq!(schema_for("select * from available_units where pool_id = $1").len(), 3);
        assert_eq!(schema_for("SELECT * FROM availability WHERE pool_id = $1").len(), 5);
        assert_eq!(schema_for("DELETE FROM reservations WHERE id = $1").len(), 18);
    }

    #[test]
    fn sqlstates_follow_error_kind() {
        let code = |e: EngineError| match engine_err(e) {
            PgWireError::UserError(info) => info.code,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(code(EngineError::validation("x")), "22023");
        assert_eq!(code(EngineError::NotFound(Ulid::nil())), "P0002");
        assert_eq!(code(EngineError::Forbidden(Ulid::nil())), "42501");
        assert_eq!(
            code(EngineError::Conflict { unit_number: 2, available_units: vec![] }),
            "23P01"
        );
        assert_eq!(code(EngineError::Unavailable("deadline".into())), "40001");
    }

    #[test]
    fn storage_detail_is_not_echoed() {
        match engine_err(EngineError::Storage("disk /var/lib full".into())) {
            PgWireError::UserError(info) => {
                assert_eq!(info.code, "58000");
                assert!(!info.message.contains("/var/lib"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
