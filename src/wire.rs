use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Sink;
use futures::stream;
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
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::auth::GymdAuthSource;
use crate::engine::Engine;
use crate::model::Event;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct GymdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<GymdQueryParser>,
    subscriptions: Arc<Subscriptions>,
}

impl GymdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, subscriptions: Arc<Subscriptions>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(GymdQueryParser),
            subscriptions,
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

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertInstructor {
                id,
                name,
                age,
                available,
            } => {
                engine
                    .register_instructor(id, name, age, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateInstructor { id, changes } => {
                engine
                    .update_instructor(id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteInstructor { id } => {
                engine.remove_instructor(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ToggleInstructorAvailability { id } => {
                engine
                    .toggle_instructor_availability(id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertSlot {
                id,
                instructor_id,
                pattern,
                start,
                end,
                available,
            } => {
                engine
                    .create_slot(id, instructor_id, &pattern, start, end, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSlot { id, changes } => {
                engine.update_slot(id, changes).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSlot { id } => {
                engine.remove_slot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ToggleSlotAvailability { id } => {
                engine
                    .toggle_slot_availability(id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertSession {
                id,
                student_id,
                kind,
                name,
                instructor_id,
                slot_id,
                date,
                start,
                end,
                description,
                level,
            } => {
                engine
                    .book_session(
                        id,
                        student_id,
                        kind,
                        name,
                        instructor_id,
                        slot_id,
                        date,
                        start,
                        end,
                        description,
                        level,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateSession { id, changes } => {
                engine
                    .update_session(id, changes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteSession { id } => {
                engine.cancel_session(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::ToggleSessionCompleted { id } => {
                engine
                    .toggle_session_completed(id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectInstructors => {
                let instructors = engine.list_instructors().await;
                instructor_rows(instructors)
            }
            Command::SelectSlots { instructor_id } => {
                let slots = engine.list_slots(instructor_id).await.map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.id.to_string())?;
                        encoder.encode_field(&slot.instructor_id.to_string())?;
                        encoder.encode_field(&slot.pattern)?;
                        encoder.encode_field(&slot.window.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&slot.window.end.format("%H:%M").to_string())?;
                        encoder.encode_field(&bool_text(slot.available))?;
                        encoder.encode_field(&bool_text(slot.effective))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSessions => {
                let sessions = engine.list_sessions().await.map_err(engine_err)?;
                let schema = Arc::new(sessions_schema());
                let rows: Vec<PgWireResult<_>> = sessions
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.student_id.to_string())?;
                        encoder.encode_field(&s.kind.as_str())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.instructor_id.map(|v| v.to_string()))?;
                        encoder.encode_field(&s.slot_id.map(|v| v.to_string()))?;
                        encoder.encode_field(&s.date.map(|d| d.to_string()))?;
                        encoder
                            .encode_field(&s.window.map(|w| w.start.format("%H:%M").to_string()))?;
                        encoder
                            .encode_field(&s.window.map(|w| w.end.format("%H:%M").to_string()))?;
                        encoder.encode_field(&bool_text(s.completed))?;
                        encoder.encode_field(&bool_text(s.slot_missing))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectStats => {
                let stats = engine.stats().await.map_err(engine_err)?;
                let schema = Arc::new(stats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(stats.instructors as i64))?;
                encoder.encode_field(&(stats.slots as i64))?;
                encoder.encode_field(&(stats.available_slots as i64))?;
                encoder.encode_field(&(stats.sessions as i64))?;
                encoder.encode_field(&(stats.completed as i64))?;
                encoder.encode_field(&(stats.pending as i64))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability { slot_id, date } => {
                let windows = engine
                    .slot_free_windows(slot_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let slot_str = slot_id.to_string();
                let date_str = date.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot_str)?;
                        encoder.encode_field(&date_str)?;
                        encoder.encode_field(&w.start.format("%H:%M").to_string())?;
                        encoder.encode_field(&w.end.format("%H:%M").to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailableInstructors { date, start, end } => {
                if start >= end {
                    return Err(engine_err(crate::engine::EngineError::InvalidRange {
                        start,
                        end,
                    }));
                }
                let range = crate::model::TimeRange::new(start, end);
                let instructors = engine
                    .available_instructors(date, range)
                    .await
                    .map_err(engine_err)?;
                instructor_rows(instructors)
            }
            Command::Listen { channel } => {
                let instructor_id = parse_channel(&channel)?;
                self.subscriptions
                    .listen(channel, engine.notify.subscribe(instructor_id));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                match channel {
                    Some(name) => self.subscriptions.unlisten(&name),
                    None => self.subscriptions.unlisten_all(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

fn instructor_rows(instructors: Vec<crate::model::InstructorInfo>) -> PgWireResult<Vec<Response>> {
    let schema = Arc::new(instructors_schema());
    let rows: Vec<PgWireResult<_>> = instructors
        .into_iter()
        .map(|info| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&info.id.to_string())?;
            encoder.encode_field(&info.name)?;
            encoder.encode_field(&(info.age as i32))?;
            encoder.encode_field(&bool_text(info.available))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(vec![Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    ))])
}

fn bool_text(value: bool) -> &'static str {
    if value { "t" } else { "f" }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id_str = channel.strip_prefix("instructor_").ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected instructor_{{id}})"),
        )))
    })?;
    Ulid::from_string(id_str).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn instructors_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("name"),
        FieldInfo::new("age".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("instructor_id"),
        varchar("pattern"),
        varchar("start"),
        varchar("end"),
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("effective".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn sessions_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("student_id"),
        varchar("kind"),
        varchar("name"),
        varchar("instructor_id"),
        varchar("slot_id"),
        varchar("date"),
        varchar("start"),
        varchar("end"),
        FieldInfo::new("completed".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new(
            "slot_missing".into(),
            None,
            None,
            Type::BOOL,
            FieldFormat::Text,
        ),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    ["instructors", "slots", "available_slots", "sessions", "completed", "pending"]
        .into_iter()
        .map(|name| FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text))
        .collect()
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        varchar("slot_id"),
        varchar("date"),
        varchar("start"),
        varchar("end"),
    ]
}

/// Schema lookup for Describe, keyed off the table name in the SQL text.
/// `available_instructors` must be checked before the substrings it contains.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABLE_INSTRUCTORS") {
        instructors_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("INSTRUCTORS") {
        instructors_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("SESSIONS") {
        sessions_schema()
    } else if upper.contains("STATS") {
        stats_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for GymdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.dispatch(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GymdQueryParser;

#[async_trait]
impl QueryParser for GymdQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GymdHandler {
    type Statement = String;
    type QueryParser = GymdQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.dispatch(&engine, cmd).await?;
        Ok(responses.remove(0))
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

// ── LISTEN/NOTIFY plumbing ───────────────────────────────────────

/// Per-connection LISTEN state. Each subscribed channel runs a forwarder
/// task that turns broadcast events into `(channel, payload)` pairs for
/// the connection's relay to inject as NotificationResponse frames.
pub struct Subscriptions {
    sink: mpsc::UnboundedSender<(String, String)>,
    forwarders: DashMap<String, JoinHandle<()>>,
}

impl Subscriptions {
    fn new(sink: mpsc::UnboundedSender<(String, String)>) -> Self {
        Self {
            sink,
            forwarders: DashMap::new(),
        }
    }

    /// Repeated LISTEN on the same channel is a no-op.
    fn listen(&self, channel: String, mut events: broadcast::Receiver<Event>) {
        if self.forwarders.contains_key(&channel) {
            return;
        }
        let sink = self.sink.clone();
        let name = channel.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Ok(payload) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sink.send((name.clone(), payload)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.insert(channel, handle);
    }

    fn unlisten(&self, channel: &str) {
        if let Some((_, handle)) = self.forwarders.remove(channel) {
            handle.abort();
        }
    }

    fn unlisten_all(&self) {
        let channels: Vec<String> = self.forwarders.iter().map(|e| e.key().clone()).collect();
        for channel in channels {
            self.unlisten(&channel);
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for entry in self.forwarders.iter() {
            entry.value().abort();
        }
    }
}

// ── Connection plumbing ──────────────────────────────────────────

/// Serve one client connection.
///
/// pgwire drives the protocol on an internal loopback socket; this task
/// owns the client-facing stream and relays backend messages across. The
/// relay is what lets LISTEN push NotificationResponse frames to a
/// connection that is sitting idle between queries.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let subscriptions = Arc::new(Subscriptions::new(notif_tx));
    let factory = GymdFactory::new(tenant_manager, password, subscriptions);

    // Loopback pair: pgwire serves the accepted end, the relay owns the
    // connecting end. TLS (if any) terminates in the relay, so pgwire
    // always sees plaintext.
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (inner, accepted) = tokio::try_join!(TcpStream::connect(addr), async {
        listener.accept().await.map(|(s, _)| s)
    })?;
    tokio::spawn(async move {
        let _ = pgwire::tokio::process_socket(accepted, None, factory).await;
    });

    match negotiate_tls(socket, tls).await? {
        Negotiated::Tls(stream) => relay(stream, inner, Vec::new(), notif_rx).await,
        Negotiated::Plain(stream, consumed) => relay(stream, inner, consumed, notif_rx).await,
    }
}

enum Negotiated {
    Tls(pgwire::tokio::tokio_rustls::server::TlsStream<TcpStream>),
    /// Plaintext, plus any startup bytes already consumed off the socket.
    Plain(TcpStream, Vec<u8>),
}

const SSL_REQUEST_CODE: u32 = 80877103;
const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Handle the optional SSLRequest that precedes the startup packet.
async fn negotiate_tls(mut socket: TcpStream, tls: Option<TlsAcceptor>) -> io::Result<Negotiated> {
    let mut header = [0u8; 8];
    socket.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let code = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if len == 8 && code == SSL_REQUEST_CODE {
        return match tls {
            Some(acceptor) => {
                socket.write_all(b"S").await?;
                Ok(Negotiated::Tls(acceptor.accept(socket).await?))
            }
            None => {
                socket.write_all(b"N").await?;
                Ok(Negotiated::Plain(socket, Vec::new()))
            }
        };
    }
    if len == 8 && code == GSSENC_REQUEST_CODE {
        socket.write_all(b"N").await?;
        return Ok(Negotiated::Plain(socket, Vec::new()));
    }
    // Already inside the startup packet; the relay forwards what we read.
    Ok(Negotiated::Plain(socket, header.to_vec()))
}

/// Shuttle bytes between the client and pgwire's loopback socket.
///
/// Backend messages are framed as a tag byte plus a u32 length (the
/// length counts itself but not the tag). Notifications are only written
/// on a frame boundary so they never interleave mid-message.
async fn relay<S>(
    external: S,
    inner: TcpStream,
    consumed: Vec<u8>,
    mut notifications: mpsc::UnboundedReceiver<(String, String)>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ext_read, mut ext_write) = tokio::io::split(external);
    let (mut inner_read, mut inner_write) = inner.into_split();

    let client_to_server: JoinHandle<io::Result<()>> = tokio::spawn(async move {
        if !consumed.is_empty() {
            inner_write.write_all(&consumed).await?;
        }
        tokio::io::copy(&mut ext_read, &mut inner_write).await?;
        inner_write.shutdown().await
    });

    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];
    loop {
        tokio::select! {
            read = inner_read.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let mut wrote = false;
                while let Some(end) = frame_end(&buf) {
                    ext_write.write_all(&buf[..end]).await?;
                    buf.drain(..end);
                    wrote = true;
                }
                if wrote {
                    ext_write.flush().await?;
                }
            }
            notification = notifications.recv(), if buf.is_empty() => {
                let Some((channel, payload)) = notification else { break };
                ext_write.write_all(&notification_frame(&channel, &payload)).await?;
                ext_write.flush().await?;
            }
        }
    }

    let _ = ext_write.shutdown().await;
    client_to_server.abort();
    Ok(())
}

fn frame_end(buf: &[u8]) -> Option<usize> {
    if buf.len() < 5 {
        return None;
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let total = 1 + len;
    (buf.len() >= total).then_some(total)
}

/// Raw NotificationResponse: 'A', length, sender pid, channel, payload.
fn notification_frame(channel: &str, payload: &str) -> Vec<u8> {
    let len = 4 + 4 + channel.len() + 1 + payload.len() + 1;
    let mut frame = Vec::with_capacity(1 + len);
    frame.push(b'A');
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&0i32.to_be_bytes());
    frame.extend_from_slice(channel.as_bytes());
    frame.push(0);
    frame.extend_from_slice(payload.as_bytes());
    frame.push(0);
    frame
}

// ── Factory ──────────────────────────────────────────────────────

pub struct GymdFactory {
    handler: Arc<GymdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<GymdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl GymdFactory {
    pub fn new(
        tenant_manager: Arc<TenantManager>,
        password: String,
        subscriptions: Arc<Subscriptions>,
    ) -> Self {
        let auth_source = GymdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GymdHandler::new(tenant_manager, subscriptions)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GymdFactory {
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

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_end_requires_complete_message() {
        // 'Z' ReadyForQuery: length 5, one status byte
        let frame = [b'Z', 0, 0, 0, 5, b'I'];
        assert_eq!(frame_end(&frame[..4]), None);
        assert_eq!(frame_end(&frame[..5]), None);
        assert_eq!(frame_end(&frame), Some(6));

        // Trailing bytes of the next frame don't change the boundary.
        let mut two = frame.to_vec();
        two.push(b'Z');
        assert_eq!(frame_end(&two), Some(6));
    }

    #[test]
    fn notification_frame_layout() {
        let frame = notification_frame("instructor_x", "{}");
        assert_eq!(frame[0], b'A');
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(frame.len(), 1 + len);
        // pid, then two NUL-terminated strings
        assert_eq!(&frame[9..21], b"instructor_x");
        assert_eq!(frame[21], 0);
        assert_eq!(&frame[22..24], b"{}");
        assert_eq!(frame[24], 0);
    }

    #[test]
    fn describe_schema_disambiguates_tables() {
        let cols = |sql: &str| {
            result_schema_for(sql)
                .iter()
                .map(|f| f.name().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(cols("SELECT * FROM stats")[0], "instructors");
        assert_eq!(cols("SELECT * FROM availability WHERE slot_id = 'x'")[0], "slot_id");
        assert_eq!(
            cols("SELECT * FROM available_instructors WHERE date = 'x'"),
            vec!["id", "name", "age", "available"]
        );
        assert!(cols("INSERT INTO sessions (id) VALUES ('x')").is_empty());
    }
}
