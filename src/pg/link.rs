//! One PostgreSQL link: startup, authentication, simple and extended queries,
//! portal-based incremental fetch and out-of-band cancellation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use super::error::{PgError, PgResult};
use super::protocol::*;
use super::scram::ScramClient;
use super::statement::{PreparedStatement, SharedColumns, StatementCache};
use super::types::{Oid, PgValue};
use crate::backend::{CancelHandle, Described, Fetched, Link, QueryResult};
use crate::config::PgConfig;

const READ_BUFFER_CAPACITY: usize = 32 * 1024;

/// SQLSTATE invalid_sql_statement_name
const UNDEFINED_STATEMENT: &str = "26000";

/// An open portal being fetched in batches.
struct PortalStream {
    columns: SharedColumns,
    /// Undecoded rows of the current batch; decoded one at a time on fetch
    batch: VecDeque<Vec<Option<Bytes>>>,
    fetch_size: i32,
    /// Command tag once the portal has run to completion
    complete: Option<String>,
}

/// A PostgreSQL connection speaking protocol 3.0 over TCP.
pub struct PgLink {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: BufWriter<WriteHalf<TcpStream>>,
    config: PgConfig,
    statements: StatementCache,
    /// Statements prepared by name on request, kept until deallocated
    named: HashMap<String, Arc<PreparedStatement>>,
    /// Statements evicted from the cache, closed with the next round trip
    pending_close: Vec<String>,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    backend_secret_key: i32,
    parameters: HashMap<String, String>,
    stream: Option<PortalStream>,
    broken: bool,
    closed: bool,
    read_buffer: BytesMut,
}

impl PgLink {
    /// Open a link, giving up with [`PgError::Timeout`] once
    /// `config.connect_timeout` has passed.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, Self::establish(config))
                .await
                .map_err(|_| PgError::Timeout)?,
            None => Self::establish(config).await,
        }
    }

    async fn establish(config: PgConfig) -> PgResult<Self> {
        let stream = TcpStream::connect(config.address()).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut link = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            statements: StatementCache::new(config.statement_cache_capacity),
            named: HashMap::new(),
            config,
            pending_close: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            backend_secret_key: 0,
            parameters: HashMap::new(),
            stream: None,
            broken: false,
            closed: false,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        };

        link.startup().await?;
        tracing::debug!(
            pid = link.backend_pid,
            host = %link.config.host,
            database = %link.config.database,
            "link established"
        );
        Ok(link)
    }

    async fn startup(&mut self) -> PgResult<()> {
        let startup = StartupMessage {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options: self
                .config
                .application_name
                .iter()
                .map(|name| ("application_name".to_string(), name.clone()))
                .collect(),
        };
        self.send_message(&startup).await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password()?.to_string();
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = md5_password(&self.config.user, self.password()?, &salt);
                    self.send_message(&PasswordMessage { password }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram().await?;
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self) -> PgResult<()> {
        let mut scram = ScramClient::new(&self.config.user, self.password()?);
        self.send_message(&SaslInitialResponseMessage {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: scram.client_first_message(),
        })
        .await?;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let data = scram
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send_message(&SaslResponseMessage { data }).await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    return scram
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter reported through ParameterStatus.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    fn ensure_open(&self) -> PgResult<()> {
        if self.closed || self.broken {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    /// Record a fatal error so the link is never reused.
    fn track<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.broken {
                tracing::debug!(pid = self.backend_pid, error = %err, "link broken");
                self.broken = true;
            }
        }
        result
    }

    // ------------------------------------------------------------------
    // Simple protocol
    // ------------------------------------------------------------------

    async fn run_simple(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.ensure_open()?;
        self.close_stream().await?;
        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;

        let mut results = Vec::new();
        let mut current = QueryResult::empty();
        let mut decode_error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current = QueryResult::with_columns(Arc::new(fields));
                }
                BackendMessage::DataRow { values } => {
                    match decode_row(&values, &current.columns, Format::Text) {
                        Ok(row) => current.rows.push(row),
                        Err(e) => {
                            decode_error.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::replace(&mut current, QueryResult::empty()));
                }
                BackendMessage::EmptyQueryResponse => results.push(QueryResult::empty()),
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match decode_error {
                        Some(e) => Err(e),
                        None => Ok(results),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Extended protocol
    // ------------------------------------------------------------------

    /// Cached statement for `sql`, parsing and describing it on a miss.
    ///
    /// A cached statement whose parameter types disagree with `params` is
    /// bypassed with a one-off unnamed statement, since binary parameters
    /// must match the declared types exactly.
    async fn prepared(&mut self, sql: &str, params: &[PgValue]) -> PgResult<Arc<PreparedStatement>> {
        if let Some(stmt) = self.statements.get(sql) {
            if types_match(&stmt.param_types, params) {
                return Ok(stmt);
            }
            return self.prepare(sql, params, false).await;
        }
        let cache = self.statements.is_enabled();
        self.prepare(sql, params, cache).await
    }

    async fn prepare(
        &mut self,
        sql: &str,
        params: &[PgValue],
        cache: bool,
    ) -> PgResult<Arc<PreparedStatement>> {
        let name = if cache {
            self.statements.next_statement_name()
        } else {
            String::new()
        };
        let param_types: Vec<Oid> = params.iter().map(PgValue::type_oid).collect();
        let stmt = self.parse_describe(name, sql, param_types).await?;
        if !cache {
            return Ok(Arc::new(stmt));
        }
        tracing::trace!(pid = self.backend_pid, statement = %stmt.name, "prepared statement");
        if let Some(evicted) = self.statements.insert(stmt) {
            self.pending_close.push(evicted);
        }
        self.statements
            .get(sql)
            .ok_or_else(|| PgError::Protocol("Prepared statement missing from cache".into()))
    }

    /// Parse `sql` as statement `name` and ask the server to describe it.
    async fn parse_describe(
        &mut self,
        name: String,
        sql: &str,
        param_types: Vec<Oid>,
    ) -> PgResult<PreparedStatement> {
        self.buffer_pending_closes().await?;
        self.buffer_message(&ParseMessage {
            name: name.clone(),
            query: sql.to_string(),
            param_types: param_types.clone(),
        })
        .await?;
        self.buffer_message(&DescribeMessage {
            kind: b'S',
            name: &name,
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        let mut described_params = param_types;
        let mut columns = Vec::new();

        loop {
            match self.receive_message().await? {
                BackendMessage::ParameterDescription { type_oids } => described_params = type_oids,
                BackendMessage::RowDescription { fields } => columns = fields,
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    break;
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(PgError::from_fields(&fields));
                }
                // ParseComplete, CloseComplete, NoData
                _ => {}
            }
        }

        Ok(PreparedStatement::new(name, sql.to_string()).with_description(described_params, columns))
    }

    async fn run_extended(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.ensure_open()?;
        self.close_stream().await?;
        let stmt = self.prepared(sql, params).await?;
        self.execute_statement(&stmt, params).await
    }

    /// Bind `params` to a parsed statement and read its whole result.
    async fn execute_statement(
        &mut self,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.buffer_message(&BindMessage {
            portal: "",
            statement: &stmt.name,
            params,
            result_format: Format::Binary,
        })
        .await?;
        self.buffer_message(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        let mut result = QueryResult::with_columns(Arc::clone(&stmt.columns));
        let mut decode_error = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::DataRow { values } => {
                    match decode_row(&values, &stmt.columns, Format::Binary) {
                        Ok(row) => result.rows.push(row),
                        Err(e) => {
                            decode_error.get_or_insert(e);
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return match decode_error {
                        Some(e) => Err(e),
                        None => Ok(result),
                    };
                }
                BackendMessage::ErrorResponse { fields } => {
                    self.drain_until_ready().await?;
                    return Err(PgError::from_fields(&fields));
                }
                // BindComplete, EmptyQueryResponse
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Named statements
    // ------------------------------------------------------------------

    async fn prepare_named(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<Described> {
        self.ensure_open()?;
        self.close_stream().await?;
        let stmt = self
            .parse_describe(name.to_string(), sql, param_types.to_vec())
            .await?;
        tracing::debug!(pid = self.backend_pid, statement = name, "named statement prepared");
        let described = Described {
            param_types: stmt.param_types.clone(),
            columns: Arc::clone(&stmt.columns),
        };
        self.named.insert(name.to_string(), Arc::new(stmt));
        Ok(described)
    }

    /// Named statement for `params`. Both failures leave the protocol in sync.
    fn named_statement(&self, name: &str, params: &[PgValue]) -> PgResult<Arc<PreparedStatement>> {
        let stmt = self.named.get(name).cloned().ok_or_else(|| PgError::Server {
            severity: "ERROR".into(),
            code: UNDEFINED_STATEMENT.into(),
            message: format!("prepared statement \"{}\" does not exist", name),
            detail: None,
            hint: None,
        })?;
        if !types_match(&stmt.param_types, params) {
            return Err(PgError::Type(format!(
                "parameters for {} do not match its declared types {:?}",
                name, stmt.param_types
            )));
        }
        Ok(stmt)
    }

    async fn run_named(&mut self, name: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.ensure_open()?;
        self.close_stream().await?;
        let stmt = self.named_statement(name, params)?;
        self.execute_statement(&stmt, params).await
    }

    async fn open_named_portal(
        &mut self,
        name: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        self.ensure_open()?;
        self.close_stream().await?;
        let stmt = self.named_statement(name, params)?;
        self.bind_portal(&stmt, params, fetch_size).await
    }

    async fn deallocate_named(&mut self, name: &str) -> PgResult<()> {
        self.ensure_open()?;
        self.close_stream().await?;
        self.named.remove(name);
        self.buffer_pending_closes().await?;
        self.buffer_message(&CloseMessage { kind: b'S', name }).await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.wait_ready().await
    }

    // ------------------------------------------------------------------
    // Portal streaming
    // ------------------------------------------------------------------

    async fn open_portal(
        &mut self,
        sql: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        self.ensure_open()?;
        self.close_stream().await?;
        let stmt = self.prepared(sql, params).await?;
        self.bind_portal(&stmt, params, fetch_size).await
    }

    async fn bind_portal(
        &mut self,
        stmt: &PreparedStatement,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        let fetch_size = i32::try_from(fetch_size.max(1)).unwrap_or(i32::MAX);

        self.buffer_message(&BindMessage {
            portal: "",
            statement: &stmt.name,
            params,
            result_format: Format::Binary,
        })
        .await?;
        self.stream = Some(PortalStream {
            columns: Arc::clone(&stmt.columns),
            batch: VecDeque::new(),
            fetch_size,
            complete: None,
        });
        self.request_batch(fetch_size).await?;
        self.read_batch().await?;
        Ok(Arc::clone(&stmt.columns))
    }

    async fn request_batch(&mut self, max_rows: i32) -> PgResult<()> {
        self.buffer_message(&ExecuteMessage {
            portal: "",
            max_rows,
        })
        .await?;
        // Flush rather than Sync keeps the portal open between batches
        self.buffer_message(&FlushMessage).await?;
        self.flush().await
    }

    async fn read_batch(&mut self) -> PgResult<()> {
        loop {
            let msg = self.receive_message().await?;
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| PgError::Protocol("No open portal".into()))?;
            match msg {
                BackendMessage::DataRow { values } => stream.batch.push_back(values),
                BackendMessage::PortalSuspended => return Ok(()),
                BackendMessage::CommandComplete { tag } => {
                    stream.complete = Some(tag);
                    return Ok(());
                }
                BackendMessage::EmptyQueryResponse => {
                    stream.complete = Some(String::new());
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    // The server skips everything up to the next Sync
                    self.stream = None;
                    self.send_message(&SyncMessage).await?;
                    self.drain_until_ready().await?;
                    return Err(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    async fn next_row(&mut self) -> PgResult<Fetched> {
        self.ensure_open()?;
        loop {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| PgError::Protocol("No open portal".into()))?;
            if let Some(values) = stream.batch.pop_front() {
                return decode_row(&values, &stream.columns, Format::Binary).map(Fetched::Row);
            }
            if let Some(tag) = &stream.complete {
                return Ok(Fetched::Done(tag.clone()));
            }
            let fetch_size = stream.fetch_size;
            self.request_batch(fetch_size).await?;
            self.read_batch().await?;
        }
    }

    /// Close the open portal, if any, and wait for ReadyForQuery.
    async fn close_stream(&mut self) -> PgResult<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        if stream.complete.is_none() {
            self.buffer_message(&CloseMessage {
                kind: b'P',
                name: "",
            })
            .await?;
        }
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;
        self.wait_ready().await
    }

    // ------------------------------------------------------------------
    // I/O helpers
    // ------------------------------------------------------------------

    async fn buffer_pending_closes(&mut self) -> PgResult<()> {
        for name in std::mem::take(&mut self.pending_close) {
            tracing::trace!(pid = self.backend_pid, statement = %name, "closing evicted statement");
            self.buffer_message(&CloseMessage {
                kind: b'S',
                name: &name,
            })
            .await?;
        }
        Ok(())
    }

    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    #[inline]
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.writer.write_all(&msg.encode()).await?;
        Ok(())
    }

    #[inline]
    async fn flush(&mut self) -> PgResult<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Next message relevant to the caller. Notices, parameter changes and
    /// notifications are consumed here.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(len) = BackendMessage::frame_len(&self.read_buffer)? {
                let mut frame = self.read_buffer.split_to(len).freeze();
                match BackendMessage::decode(&mut frame)? {
                    BackendMessage::NoticeResponse { fields } => log_notice(self.backend_pid, &fields),
                    BackendMessage::ParameterStatus { name, value } => {
                        self.parameters.insert(name, value);
                    }
                    BackendMessage::NotificationResponse { channel, .. } => {
                        tracing::trace!(pid = self.backend_pid, %channel, "ignoring notification");
                    }
                    msg => return Ok(msg),
                }
                continue;
            }

            if self.reader.read_buf(&mut self.read_buffer).await? == 0 {
                return Err(PgError::ConnectionClosed);
            }
        }
    }

    /// Skip to ReadyForQuery after an ErrorResponse.
    async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive_message().await? {
                self.transaction_status = status;
                return Ok(());
            }
        }
    }

    /// Like `drain_until_ready` but reports an ErrorResponse seen on the way.
    async fn wait_ready(&mut self) -> PgResult<()> {
        let mut error = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return error.map_or(Ok(()), Err);
                }
                BackendMessage::ErrorResponse { fields } => {
                    error.get_or_insert(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    async fn terminate(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream = None;
        self.send_message(&TerminateMessage).await?;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

#[async_trait]
impl Link for PgLink {
    async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let result = self.run_extended(sql, params).await;
        self.track(result)
    }

    async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let result = self.run_simple(sql).await;
        self.track(result)
    }

    async fn start_stream(
        &mut self,
        sql: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        let result = self.open_portal(sql, params, fetch_size).await;
        self.track(result)
    }

    async fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<Described> {
        let result = self.prepare_named(name, sql, param_types).await;
        self.track(result)
    }

    async fn query_prepared(&mut self, name: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let result = self.run_named(name, params).await;
        self.track(result)
    }

    async fn start_stream_prepared(
        &mut self,
        name: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        let result = self.open_named_portal(name, params, fetch_size).await;
        self.track(result)
    }

    async fn deallocate(&mut self, name: &str) -> PgResult<()> {
        let result = self.deallocate_named(name).await;
        self.track(result)
    }

    async fn fetch(&mut self) -> PgResult<Fetched> {
        let result = self.next_row().await;
        self.track(result)
    }

    async fn finish_stream(&mut self) -> PgResult<()> {
        let result = self.close_stream().await;
        self.track(result)
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        if self.backend_pid == 0 {
            return None;
        }
        Some(Arc::new(PgCancel {
            address: self.config.address(),
            request: CancelRequestMessage {
                process_id: self.backend_pid,
                secret_key: self.backend_secret_key,
            },
        }))
    }

    fn is_broken(&self) -> bool {
        self.broken || self.closed
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    async fn close(&mut self) -> PgResult<()> {
        self.terminate().await
    }
}

/// Cancels the running statement of a backend over a fresh socket.
struct PgCancel {
    address: String,
    request: CancelRequestMessage,
}

#[async_trait]
impl CancelHandle for PgCancel {
    async fn cancel(&self) -> PgResult<()> {
        tracing::debug!(pid = self.request.process_id, "sending cancel request");
        let mut socket = TcpStream::connect(&self.address).await?;
        socket.write_all(&self.request.encode()).await?;
        socket.shutdown().await?;
        // The server closes the socket once it has read the request
        let mut sink = [0u8; 1];
        let _ = socket.read(&mut sink).await;
        Ok(())
    }
}

fn types_match(declared: &[Oid], params: &[PgValue]) -> bool {
    declared.len() == params.len()
        && declared
            .iter()
            .zip(params)
            .all(|(oid, value)| value.is_null() || value.type_oid() == *oid)
}

fn decode_row(
    values: &[Option<Bytes>],
    columns: &[FieldDescription],
    format: Format,
) -> PgResult<Vec<PgValue>> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let Some(data) = value else {
                return Ok(PgValue::Null);
            };
            let oid = columns.get(i).map_or(Oid::TEXT, |c| c.type_oid);
            match format {
                Format::Binary => PgValue::decode_binary(oid, data),
                Format::Text => PgValue::decode_text(oid, data),
            }
        })
        .collect()
}

fn log_notice(pid: i32, fields: &HashMap<u8, String>) {
    let severity = fields.get(&b'S').map_or("NOTICE", String::as_str);
    let message = fields.get(&b'M').map_or("", String::as_str);
    let code = fields.get(&b'C').map_or("", String::as_str);
    match severity {
        "WARNING" => tracing::warn!(pid, code, "{}", message),
        "DEBUG" | "LOG" => tracing::debug!(pid, code, "{}", message),
        _ => tracing::info!(pid, code, severity, "{}", message),
    }
}

/// MD5(MD5(password + user) + salt), hex encoded with an `md5` prefix.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
