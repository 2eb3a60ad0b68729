//! One physical link and the strand that serializes work on it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backend::{CancelHandle, Connector, Described, Link};
use crate::data::DataTable;
use crate::error::{Error, Result};
use crate::pg::{Oid, PgError, PgResult, PgValue, TransactionStatus};
use crate::reader::{DataReader, ReaderTask, Source};
use crate::sql;
use crate::strand::{EventQueue, EventTask, Strand, Task, TaskContext, TaskHandle, TaskId, TaskKind, TaskState};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Busy,
    Broken,
}

/// Where a pooled connection goes back to once its queued work drains.
pub(crate) trait Reclaim<L: Link>: Send + Sync {
    fn reclaim(&self, conn: Connection<L>);

    /// A connection went away without being reclaimed.
    fn forget(&self, id: ConnectionId);
}

struct Status {
    state: ConnectionState,
    in_flight: Option<TaskId>,
    transaction: TransactionStatus,
    last_used: Instant,
}

/// Strand payload of a connection: the link plus its bookkeeping.
pub struct ConnectionCore<L: Link> {
    id: ConnectionId,
    pub(crate) link: tokio::sync::Mutex<L>,
    cancel: Option<Arc<dyn CancelHandle>>,
    status: Mutex<Status>,
    created_at: Instant,
}

impl<L: Link> ConnectionCore<L> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    /// Mark a task as in flight. Broken connections refuse work.
    pub(crate) fn begin(&self, task: TaskId) -> Result<()> {
        let mut status = self.status.lock();
        if status.state == ConnectionState::Broken {
            return Err(Error::Connection(format!(
                "connection {} is broken",
                self.id
            )));
        }
        status.state = ConnectionState::Busy;
        status.in_flight = Some(task);
        Ok(())
    }

    /// Record the link's condition after a task touched it.
    pub(crate) fn end(&self, link: &L, error: Option<&PgError>) {
        let broken = link.is_broken() || error.is_some_and(PgError::is_fatal);
        let mut status = self.status.lock();
        status.in_flight = None;
        status.last_used = Instant::now();
        status.transaction = link.transaction_status();
        if broken {
            if status.state != ConnectionState::Broken {
                tracing::warn!(connection = self.id, error = ?error, "connection marked broken");
            }
            status.state = ConnectionState::Broken;
        } else if status.state == ConnectionState::Busy {
            status.state = ConnectionState::Idle;
        }
    }

    pub(crate) fn cancel_handle(&self) -> Option<&dyn CancelHandle> {
        self.cancel.as_deref()
    }
}

/// Await `fut`, sending an out-of-band cancel request if a stop is requested
/// meanwhile. The future is still driven to completion so the link ends up
/// resynchronized; a statement that finished anyway keeps its result.
pub(crate) async fn cancellable<T, R, F>(ctx: &TaskContext<T>, cancel: Option<&dyn CancelHandle>, fut: F) -> PgResult<R>
where
    F: Future<Output = PgResult<R>>,
{
    tokio::pin!(fut);
    tokio::select! {
        biased;
        result = &mut fut => result,
        _ = ctx.cancelled() => {
            match cancel {
                Some(handle) => {
                    tracing::debug!(task = ctx.id(), "sending cancel request");
                    if let Err(e) = handle.cancel().await {
                        tracing::warn!(task = ctx.id(), error = %e, "cancel request failed");
                    }
                }
                None => tracing::debug!(task = ctx.id(), "link cannot cancel, waiting for statement"),
            }
            fut.await
        }
    }
}

/// A single statement-level operation on a link.
///
/// Implemented only inside this crate; it appears in the bounds of
/// [`ConnectionTask`].
#[async_trait]
pub trait Operation: Send + 'static {
    type Output: Send + 'static;

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<Self::Output>;
}

pub(crate) struct Query {
    pub sql: String,
    pub params: Vec<PgValue>,
}

#[async_trait]
impl Operation for Query {
    type Output = DataTable;

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<DataTable> {
        link.query(&self.sql, &self.params).await.map(DataTable::from)
    }
}

pub(crate) struct Batch {
    pub sql: String,
}

#[async_trait]
impl Operation for Batch {
    type Output = Vec<DataTable>;

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<Vec<DataTable>> {
        let results = link.simple_query(&self.sql).await?;
        Ok(results.into_iter().map(DataTable::from).collect())
    }
}

/// Transaction control and other statements whose rows are not wanted.
pub(crate) struct Command {
    pub sql: String,
}

#[async_trait]
impl Operation for Command {
    type Output = ();

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<()> {
        link.simple_query(&self.sql).await.map(|_| ())
    }
}

pub(crate) struct Prepare {
    pub name: String,
    pub sql: String,
    pub param_types: Vec<Oid>,
}

#[async_trait]
impl Operation for Prepare {
    type Output = Described;

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<Described> {
        link.prepare(&self.name, &self.sql, &self.param_types).await
    }
}

pub(crate) struct ExecutePrepared {
    pub name: String,
    pub params: Vec<PgValue>,
}

#[async_trait]
impl Operation for ExecutePrepared {
    type Output = DataTable;

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<DataTable> {
        link.query_prepared(&self.name, &self.params)
            .await
            .map(DataTable::from)
    }
}

pub(crate) struct Deallocate {
    pub name: String,
}

#[async_trait]
impl Operation for Deallocate {
    type Output = ();

    async fn apply<L: Link>(&mut self, link: &mut L) -> PgResult<()> {
        link.deallocate(&self.name).await
    }
}

/// Statement execution on a connection's strand.
pub struct ConnectionTask<O> {
    op: O,
}

impl<O> ConnectionTask<O> {
    pub(crate) fn new(op: O) -> Self {
        Self { op }
    }
}

#[async_trait]
impl<L: Link, O: Operation> Task<ConnectionCore<L>> for ConnectionTask<O> {
    type Output = O::Output;

    fn kind(&self) -> TaskKind {
        TaskKind::Connection
    }

    async fn run(&mut self, ctx: &TaskContext<ConnectionCore<L>>) -> Result<O::Output> {
        let core = ctx.data();
        core.begin(ctx.id())?;
        let mut link = core.link.lock().await;
        let result = cancellable(ctx, core.cancel_handle(), self.op.apply(&mut *link)).await;
        core.end(&link, result.as_ref().err());
        result.map_err(Error::from)
    }

    fn on_complete(&mut self, state: TaskState) {
        if state == TaskState::Failed {
            tracing::debug!("statement failed");
        }
    }
}

/// A connection: one link, one strand, at most one task in flight.
///
/// Everything submitted here runs in submission order. Dropping the
/// connection withdraws whatever is still queued on it.
pub struct Connection<L: Link> {
    strand: Strand<ConnectionCore<L>>,
    pool: Option<Weak<dyn Reclaim<L>>>,
}

impl<L: Link> Connection<L> {
    pub(crate) fn new(id: ConnectionId, link: L, queue: &EventQueue, pool: Option<Weak<dyn Reclaim<L>>>) -> Self {
        let now = Instant::now();
        let core = ConnectionCore {
            id,
            cancel: link.cancel_handle(),
            status: Mutex::new(Status {
                state: ConnectionState::Idle,
                in_flight: None,
                transaction: link.transaction_status(),
                last_used: now,
            }),
            link: tokio::sync::Mutex::new(link),
            created_at: now,
        };
        Self {
            strand: queue.new_strand(core),
            pool,
        }
    }

    /// Open a standalone connection, outside any pool.
    pub async fn open<C: Connector<Link = L>>(connector: &C, queue: &EventQueue) -> Result<Self> {
        let link = connector.connect().await?;
        Ok(Self::new(0, link, queue, None))
    }

    pub fn id(&self) -> ConnectionId {
        self.core().id
    }

    pub fn state(&self) -> ConnectionState {
        self.core().state()
    }

    pub fn is_broken(&self) -> bool {
        self.state() == ConnectionState::Broken
    }

    /// Task currently running on the link, if any.
    pub fn in_flight(&self) -> Option<TaskId> {
        self.core().status.lock().in_flight
    }

    /// Transaction status as of the last completed task.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.core().status.lock().transaction
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status() != TransactionStatus::Idle
    }

    pub fn created_at(&self) -> Instant {
        self.core().created_at
    }

    pub fn idle_for(&self) -> Duration {
        self.core().status.lock().last_used.elapsed()
    }

    /// Tasks queued behind the running one.
    pub fn pending(&self) -> usize {
        self.strand.len()
    }

    fn core(&self) -> &ConnectionCore<L> {
        self.strand.data()
    }

    fn submit<O: Operation>(&self, op: O) -> TaskHandle<O::Output> {
        self.strand.enqueue(ConnectionTask::new(op))
    }

    /// Queue one statement with positional parameters.
    pub fn execute(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<DataTable>> {
        sql::validate_statement(statement, params.len())?;
        Ok(self.submit(Query {
            sql: statement.to_string(),
            params,
        }))
    }

    /// Queue parameterless, possibly multi-statement text.
    pub fn execute_batch(&self, statements: &str) -> Result<TaskHandle<Vec<DataTable>>> {
        sql::validate(statements, 0)?;
        Ok(self.submit(Batch {
            sql: statements.to_string(),
        }))
    }

    /// Queue a streaming read; rows arrive one at a time, `fetch_size` per round trip.
    pub fn stream(&self, statement: &str, params: Vec<PgValue>, fetch_size: usize) -> Result<DataReader> {
        sql::validate_statement(statement, params.len())?;
        let (tx, rx) = mpsc::channel(1);
        let task = ReaderTask::new(Source::Text(statement.to_string()), params, fetch_size.max(1), tx);
        let handle = self.strand.enqueue(task);
        Ok(DataReader::new(rx, handle))
    }

    /// Parse `statement` on the server as `name`, kept until [`deallocate`](Self::deallocate).
    ///
    /// `param_types` may list fewer types than there are placeholders.
    pub fn prepare(&self, name: &str, statement: &str, param_types: Vec<Oid>) -> Result<TaskHandle<Described>> {
        sql::validate_statement_name(name)?;
        sql::validate_prepare(statement, param_types.len())?;
        Ok(self.submit(Prepare {
            name: name.to_string(),
            sql: statement.to_string(),
            param_types,
        }))
    }

    /// Run the statement prepared as `name`.
    pub fn execute_prepared(&self, name: &str, params: Vec<PgValue>) -> TaskHandle<DataTable> {
        self.submit(ExecutePrepared {
            name: name.to_string(),
            params,
        })
    }

    pub fn stream_prepared(&self, name: &str, params: Vec<PgValue>, fetch_size: usize) -> DataReader {
        let (tx, rx) = mpsc::channel(1);
        let task = ReaderTask::new(Source::Prepared(name.to_string()), params, fetch_size.max(1), tx);
        DataReader::new(rx, self.strand.enqueue(task))
    }

    pub fn deallocate(&self, name: &str) -> TaskHandle<()> {
        self.submit(Deallocate {
            name: name.to_string(),
        })
    }

    pub fn begin(&self) -> TaskHandle<()> {
        self.command("BEGIN".to_string())
    }

    pub fn commit(&self) -> TaskHandle<()> {
        self.command("COMMIT".to_string())
    }

    pub fn rollback(&self) -> TaskHandle<()> {
        self.command("ROLLBACK".to_string())
    }

    pub fn savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        Ok(self.command(format!("SAVEPOINT {}", sql::quote_identifier(name)?)))
    }

    pub fn release_savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        Ok(self.command(format!(
            "RELEASE SAVEPOINT {}",
            sql::quote_identifier(name)?
        )))
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        Ok(self.command(format!(
            "ROLLBACK TO SAVEPOINT {}",
            sql::quote_identifier(name)?
        )))
    }

    fn command(&self, sql: String) -> TaskHandle<()> {
        self.submit(Command { sql })
    }

    pub(crate) fn detach(&mut self) {
        self.pool = None;
    }

    /// Hand the connection back to its pool behind everything already queued.
    ///
    /// An open transaction is rolled back first. Without a pool the
    /// connection is shut down instead.
    pub(crate) fn release(self) {
        let strand = self.strand.downgrade();
        let id = self.id();
        let task = EventTask::new(move |ctx: TaskContext<ConnectionCore<L>>| async move {
            let conn = self;
            {
                let core = ctx.data();
                let mut link = core.link.lock().await;
                if !link.is_broken() && link.transaction_status() != TransactionStatus::Idle {
                    tracing::debug!(connection = core.id, "rolling back transaction left open");
                    let result = link.simple_query("ROLLBACK").await;
                    if let Err(e) = &result {
                        tracing::warn!(connection = core.id, error = %e, "rollback on release failed");
                    }
                    core.end(&link, result.as_ref().err());
                } else {
                    core.end(&link, None);
                }
            }
            match conn.pool.as_ref().and_then(Weak::upgrade) {
                Some(pool) => pool.reclaim(conn),
                None => {
                    let _ = conn.shutdown();
                }
            }
            Ok(())
        });
        if strand.enqueue(task).is_none() {
            tracing::debug!(connection = id, "strand closed before release");
        }
    }

    /// Close the link after queued work drains, then drop the connection.
    pub fn shutdown(self) -> Option<TaskHandle<()>> {
        let strand = self.strand.downgrade();
        strand.enqueue(EventTask::new(move |ctx: TaskContext<ConnectionCore<L>>| async move {
            let conn = self;
            let result = {
                let core = ctx.data();
                let mut link = core.link.lock().await;
                let result = link.close().await;
                tracing::debug!(connection = core.id, "connection closed");
                result
            };
            drop(conn);
            result.map_err(Error::from)
        }))
    }
}

impl<L: Link> Drop for Connection<L> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take().and_then(|w| w.upgrade()) {
            pool.forget(self.id());
        }
    }
}

impl<L: Link> fmt::Debug for Connection<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
