//! Scripted in-memory link for exercising the orchestration layer.
//!
//! Statements are interpreted by their text:
//! - `SELECT <n>` returns one int8 row, `SELECT $1, ...` echoes the parameters
//! - `STREAM <n>` returns rows `1..=n` in an int4 column `n`
//! - `SLEEP` blocks until a cancel request arrives
//! - `FAIL ...` reports a syntax error (42601)
//! - `DROP LINK` fails with an I/O error and breaks the link
//! - `BEGIN` / `COMMIT` / `ROLLBACK` drive the transaction status
//!
//! Like the server, the extended-protocol entry points refuse text holding
//! more than one statement. Named statements are logged as `PREPARE name`,
//! `EXECUTE name` and `DEALLOCATE name`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{CancelHandle, Connector, Described, Fetched, Link, QueryResult};
use crate::data::field;
use crate::pg::error::QUERY_CANCELED;
use crate::pg::{Oid, PgError, PgResult, PgValue, SharedColumns, TransactionStatus};
use crate::sql;

#[derive(Debug, Clone, Default)]
pub struct Script {
    fail_connects: usize,
    connect_delay: Option<Duration>,
}

impl Script {
    /// The next `n` connection attempts fail.
    pub fn fail_connects(mut self, n: usize) -> Self {
        self.fail_connects = n;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<String>>,
    statement_seen: Notify,
    fail_connects: AtomicUsize,
    connects: AtomicUsize,
    rows_fetched: AtomicUsize,
    portals_closed: AtomicUsize,
    cancel_requests: AtomicUsize,
    closed: AtomicUsize,
    fail_stream_close: AtomicBool,
}

impl Shared {
    fn record(&self, sql: &str) {
        self.log.lock().push(sql.to_string());
        self.statement_seen.notify_waiters();
    }
}

#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
    connect_delay: Option<Duration>,
}

impl MockConnector {
    pub fn new(script: Script) -> Self {
        let shared = Shared::default();
        shared.fail_connects.store(script.fail_connects, Ordering::SeqCst);
        Self {
            shared: Arc::new(shared),
            connect_delay: script.connect_delay,
        }
    }

    /// Every statement text sent by any link, in order.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().clone()
    }

    pub async fn wait_for_statement(&self, sql: &str) {
        loop {
            let notified = self.shared.statement_seen.notified();
            if self.shared.log.lock().iter().any(|s| s == sql) {
                return;
            }
            notified.await;
        }
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Closing an unfinished stream loses the link from now on.
    pub fn fail_stream_close(&self) {
        self.shared.fail_stream_close.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn rows_fetched(&self) -> usize {
        self.shared.rows_fetched.load(Ordering::SeqCst)
    }

    pub fn portals_closed(&self) -> usize {
        self.shared.portals_closed.load(Ordering::SeqCst)
    }

    pub fn cancel_requests(&self) -> usize {
        self.shared.cancel_requests.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    async fn connect(&self) -> PgResult<MockLink> {
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PgError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let id = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let notify = Arc::new(Notify::new());
        Ok(MockLink {
            id,
            cancel: Arc::new(MockCancel {
                shared: Arc::clone(&self.shared),
                notify: Arc::clone(&notify),
            }),
            shared: Arc::clone(&self.shared),
            notify,
            transaction: TransactionStatus::Idle,
            broken: false,
            stream: None,
            named: HashMap::new(),
        })
    }
}

struct MockCancel {
    shared: Arc<Shared>,
    notify: Arc<Notify>,
}

#[async_trait]
impl CancelHandle for MockCancel {
    async fn cancel(&self) -> PgResult<()> {
        self.shared.cancel_requests.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

struct MockStream {
    unsent: VecDeque<Vec<PgValue>>,
    buffered: VecDeque<Vec<PgValue>>,
    fetch_size: usize,
    tag: String,
}

pub struct MockLink {
    /// Order in which the connector opened this link, from 1
    pub id: usize,
    shared: Arc<Shared>,
    cancel: Arc<MockCancel>,
    notify: Arc<Notify>,
    transaction: TransactionStatus,
    broken: bool,
    stream: Option<MockStream>,
    /// Named statement text and parameter count
    named: HashMap<String, (String, usize)>,
}

fn server_error(code: &str, message: &str) -> PgError {
    PgError::Server {
        severity: "ERROR".into(),
        code: code.into(),
        message: message.into(),
        detail: None,
        hint: None,
    }
}

fn connection_reset() -> PgError {
    PgError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
    ))
}

fn single_statement(sql: &str) -> PgResult<()> {
    if sql::scan(sql).is_ok_and(|info| info.statement_count() > 1) {
        return Err(server_error(
            "42601",
            "cannot insert multiple commands into a prepared statement",
        ));
    }
    Ok(())
}

fn result(columns: Vec<(&str, Oid)>, rows: Vec<Vec<PgValue>>, tag: impl Into<String>) -> QueryResult {
    let columns: SharedColumns = Arc::new(columns.into_iter().map(|(n, o)| field(n, o)).collect());
    QueryResult {
        columns,
        rows,
        command_tag: tag.into(),
    }
}

impl MockLink {
    async fn run(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        if self.broken {
            return Err(PgError::ConnectionClosed);
        }
        let upper = sql.trim().to_ascii_uppercase();
        let words: Vec<&str> = upper.split_whitespace().collect();
        let first = words.first().copied().unwrap_or("");

        if self.transaction == TransactionStatus::Failed && first != "ROLLBACK" {
            return Err(server_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        match first {
            "SLEEP" => {
                tokio::select! {
                    _ = self.notify.notified() => Err(server_error(QUERY_CANCELED, "canceling statement due to user request")),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(result(vec![], vec![], "SELECT 0")),
                }
            }
            "FAIL" => {
                if self.transaction == TransactionStatus::InTransaction {
                    self.transaction = TransactionStatus::Failed;
                }
                Err(server_error("42601", "syntax error"))
            }
            "DROP" if words.get(1) == Some(&"LINK") => {
                self.broken = true;
                Err(connection_reset())
            }
            "BEGIN" => {
                self.transaction = TransactionStatus::InTransaction;
                Ok(result(vec![], vec![], "BEGIN"))
            }
            "COMMIT" => {
                let tag = if self.transaction == TransactionStatus::Failed { "ROLLBACK" } else { "COMMIT" };
                self.transaction = TransactionStatus::Idle;
                Ok(result(vec![], vec![], tag))
            }
            "ROLLBACK" if words.get(1) == Some(&"TO") => {
                self.transaction = TransactionStatus::InTransaction;
                Ok(result(vec![], vec![], "ROLLBACK"))
            }
            "ROLLBACK" => {
                self.transaction = TransactionStatus::Idle;
                Ok(result(vec![], vec![], "ROLLBACK"))
            }
            "SELECT" if !params.is_empty() => {
                let columns = params.iter().map(|p| ("?column?", p.type_oid())).collect();
                Ok(result(columns, vec![params.to_vec()], "SELECT 1"))
            }
            "SELECT" => match words.get(1).and_then(|w| w.parse::<i64>().ok()) {
                Some(n) => Ok(result(vec![("?column?", Oid::INT8)], vec![vec![PgValue::Int8(n)]], "SELECT 1")),
                None => Ok(result(vec![("?column?", Oid::TEXT)], vec![], "SELECT 0")),
            },
            "STREAM" => {
                let n = words.get(1).and_then(|w| w.parse::<i32>().ok()).unwrap_or(0);
                let rows = (1..=n).map(|i| vec![PgValue::Int4(i)]).collect();
                Ok(result(vec![("n", Oid::INT4)], rows, format!("SELECT {}", n)))
            }
            "INSERT" => Ok(result(vec![], vec![], "INSERT 0 1")),
            "UPDATE" | "DELETE" => Ok(result(vec![], vec![], format!("{} 1", first))),
            "CREATE" | "DROP" | "ALTER" => {
                Ok(result(vec![], vec![], words.iter().take(2).copied().collect::<Vec<_>>().join(" ")))
            }
            _ => Ok(result(vec![], vec![], first.to_string())),
        }
    }

    fn open_stream(&mut self, result: QueryResult, fetch_size: usize) -> SharedColumns {
        self.stream = Some(MockStream {
            unsent: result.rows.into(),
            buffered: VecDeque::new(),
            fetch_size: fetch_size.max(1),
            tag: result.command_tag,
        });
        result.columns
    }

    fn named_text(&self, name: &str, params: &[PgValue]) -> PgResult<String> {
        let (text, expected) = self.named.get(name).ok_or_else(|| {
            server_error("26000", &format!("prepared statement \"{}\" does not exist", name))
        })?;
        if *expected != params.len() {
            return Err(PgError::Type(format!(
                "{} expects {} parameter(s), {} given",
                name,
                expected,
                params.len()
            )));
        }
        Ok(text.clone())
    }
}

#[async_trait]
impl Link for MockLink {
    async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.shared.record(sql);
        single_statement(sql)?;
        self.run(sql, params).await
    }

    async fn simple_query(&mut self, text: &str) -> PgResult<Vec<QueryResult>> {
        self.shared.record(text);
        let statements = sql::split_statements(text).map_err(|e| PgError::Protocol(e.to_string()))?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.run(statement, &[]).await?);
        }
        Ok(results)
    }

    async fn start_stream(&mut self, sql: &str, params: &[PgValue], fetch_size: usize) -> PgResult<SharedColumns> {
        self.shared.record(sql);
        if self.stream.is_some() {
            return Err(PgError::Protocol("stream already open".into()));
        }
        single_statement(sql)?;
        let result = self.run(sql, params).await?;
        Ok(self.open_stream(result, fetch_size))
    }

    async fn prepare(&mut self, name: &str, text: &str, param_types: &[Oid]) -> PgResult<Described> {
        self.shared.record(&format!("PREPARE {}", name));
        if self.broken {
            return Err(PgError::ConnectionClosed);
        }
        single_statement(text)?;
        if text.trim_start().to_ascii_uppercase().starts_with("FAIL") {
            return Err(server_error("42601", "syntax error"));
        }
        if self.named.contains_key(name) {
            return Err(server_error(
                "42P05",
                &format!("prepared statement \"{}\" already exists", name),
            ));
        }
        let placeholders = sql::scan(text).map_or(0, |info| info.placeholders);
        let mut types = param_types.to_vec();
        types.resize(placeholders.max(types.len()), Oid::TEXT);
        self.named.insert(name.to_string(), (text.to_string(), types.len()));
        Ok(Described {
            param_types: types,
            columns: Arc::new(Vec::new()),
        })
    }

    async fn query_prepared(&mut self, name: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.shared.record(&format!("EXECUTE {}", name));
        let text = self.named_text(name, params)?;
        self.run(&text, params).await
    }

    async fn start_stream_prepared(
        &mut self,
        name: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns> {
        self.shared.record(&format!("EXECUTE {}", name));
        let text = self.named_text(name, params)?;
        let result = self.run(&text, params).await?;
        Ok(self.open_stream(result, fetch_size))
    }

    async fn deallocate(&mut self, name: &str) -> PgResult<()> {
        self.shared.record(&format!("DEALLOCATE {}", name));
        if self.broken {
            return Err(PgError::ConnectionClosed);
        }
        self.named.remove(name);
        Ok(())
    }

    async fn fetch(&mut self) -> PgResult<Fetched> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| PgError::Protocol("no open stream".into()))?;
        if stream.buffered.is_empty() {
            let n = stream.fetch_size.min(stream.unsent.len());
            stream.buffered.extend(stream.unsent.drain(..n));
            self.shared.rows_fetched.fetch_add(n, Ordering::SeqCst);
        }
        match stream.buffered.pop_front() {
            Some(row) => Ok(Fetched::Row(row)),
            None => {
                let tag = std::mem::take(&mut stream.tag);
                self.stream = None;
                Ok(Fetched::Done(tag))
            }
        }
    }

    async fn finish_stream(&mut self) -> PgResult<()> {
        if self.stream.take().is_some() {
            if self.shared.fail_stream_close.load(Ordering::SeqCst) {
                self.broken = true;
                return Err(connection_reset());
            }
            self.shared.portals_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>> {
        Some(Arc::clone(&self.cancel) as Arc<dyn CancelHandle>)
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.transaction
    }

    async fn close(&mut self) -> PgResult<()> {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        self.broken = true;
        Ok(())
    }
}
