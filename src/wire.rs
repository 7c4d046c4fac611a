use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct StayLockHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<StayLockQueryParser>,
}

impl StayLockHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(StayLockQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = run_command(engine, cmd).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        result.map_err(|e| {
            if matches!(e, EngineError::Conflict(_)) {
                metrics::counter!(observability::CONFLICTS_TOTAL, "command" => label).increment(1);
            }
            debug!("{label} failed: {e}");
            engine_err(e)
        })
    }

    async fn parse_and_execute(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            debug!("rejected statement: {e}");
            sql_err(e)
        })?;
        self.execute_command(engine, cmd).await
    }
}

async fn run_command(engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
    let response = match cmd {
        Command::InsertBooking(req) => booking_response(vec![engine.create_booking(req).await?]),
        Command::UpdateBooking { id, request } => {
            booking_response(vec![engine.update_booking(id, request).await?])
        }
        Command::CancelBooking { id } => booking_response(vec![engine.cancel_booking(id).await?]),
        Command::RebookBooking { id, request } => {
            booking_response(vec![engine.rebook_booking(id, request).await?])
        }
        Command::DeleteBooking { id } => booking_response(vec![engine.delete_booking(id).await?]),
        Command::SelectBooking { id } => booking_response(vec![engine.get_booking(id).await?]),
        Command::SelectBookingsByGuest { guest_name } => {
            booking_response(engine.find_active_bookings_by_guest_name(&guest_name).await?)
        }
        Command::SelectBookingsByProperty { property_id } => {
            booking_response(engine.list_bookings(&property_id).await)
        }
        Command::InsertBlock(req) => block_response(vec![engine.create_block(req).await?]),
        Command::UpdateBlock { id, request } => {
            block_response(vec![engine.update_block(id, request).await?])
        }
        Command::DeleteBlock { id } => {
            engine.delete_block(id).await?;
            Response::Execution(Tag::new("DELETE").with_rows(1))
        }
        Command::SelectBlock { id } => block_response(vec![engine.get_block(id).await?]),
        Command::SelectBlocks { property_id } => {
            block_response(engine.list_blocks(&property_id).await?)
        }
    };
    Ok(response)
}

// ── Result encoding ──────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    [
        "id",
        "guest_name",
        "guest_email",
        "property_id",
        "start_date",
        "end_date",
        "status",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn block_schema() -> Vec<FieldInfo> {
    ["id", "property_id", "start_date", "end_date", "reason"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn booking_response(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.guest_name)?;
            encoder.encode_field(&b.guest_email)?;
            encoder.encode_field(&b.property_id)?;
            encoder.encode_field(&b.range.start.to_string())?;
            encoder.encode_field(&b.range.end.to_string())?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn block_response(blocks: Vec<Block>) -> Response {
    let schema = Arc::new(block_schema());
    let rows: Vec<PgWireResult<_>> = blocks
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.property_id)?;
            encoder.encode_field(&b.range.start.to_string())?;
            encoder.encode_field(&b.range.end.to_string())?;
            encoder.encode_field(&b.reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row shape a statement produces, judged from its target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    match statement_table(sql).as_deref() {
        Some("bookings") => booking_schema(),
        Some("blocks") if !upper.starts_with("DELETE") => block_schema(),
        _ => vec![],
    }
}

/// Table named after the first INTO / FROM / UPDATE keyword.
fn statement_table(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    while let Some(token) = tokens.next() {
        if ["INTO", "FROM", "UPDATE"].contains(&token.to_uppercase().as_str()) {
            let name = tokens.next()?;
            let name = name
                .split(['(', ';'])
                .next()
                .unwrap_or(name)
                .trim_matches('"')
                .to_lowercase();
            return Some(name);
        }
    }
    None
}

#[async_trait]
impl SimpleQueryHandler for StayLockHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.parse_and_execute(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StayLockQueryParser;

#[async_trait]
impl QueryParser for StayLockQueryParser {
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
impl ExtendedQueryHandler for StayLockHandler {
    type Statement = String;
    type QueryParser = StayLockQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.parse_and_execute(&engine, &sql).await
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

/// Highest `$N` placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    let mut in_literal = false;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_literal = !in_literal;
        }
        if bytes[i] != b'$' || in_literal {
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

/// Inline bound parameters (text format) as quoted literals, in one pass
/// so a `$N` inside a bound value or a quoted literal is left alone.
fn substitute_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            result.push(c);
            continue;
        }
        if c != '$' || in_literal {
            result.push(c);
            continue;
        }

        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = j + 1;
            chars.next();
        }
        let param = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&sql[i..digits_end]),
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StayLockFactory {
    handler: Arc<StayLockHandler>,
    noop: Arc<NoopHandler>,
}

impl StayLockFactory {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            handler: Arc::new(StayLockHandler::new(tenant_manager)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StayLockFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    /// No authentication: every startup is accepted.
    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<StayLockFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Accept clients until `shutdown` resolves. Each connection holds a
/// semaphore permit; clients beyond the limit are dropped on accept.
pub async fn serve(
    listener: TcpListener,
    factory: Arc<StayLockFactory>,
    tls: Option<TlsAcceptor>,
    semaphore: Arc<Semaphore>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let factory = factory.clone();
                let tls = tls.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = process_connection(socket, factory, tls).await {
                        error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRange(_) | EngineError::InvalidTransition(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(..) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
