//! Session facade over a shared pool.
//!
//! Each `Database` value is a session with its own strand: calls made on one
//! session reach the server in call order, while separate sessions run
//! side by side on different connections. A transaction pins one pooled
//! connection to the session until it ends.

use std::fmt;

use parking_lot::Mutex;

use crate::backend::{Connector, Link, PgConnector};
use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::data::{DataRow, DataTable, FromValue};
use crate::error::{Error, Result};
use crate::pg::{Oid, PgValue};
use crate::pool::{Pool, PoolStatus, PooledConnection};
use crate::prepared::Prepared;
use crate::reader::DataReader;
use crate::sql;
use crate::strand::{EventTask, Strand, TaskContext, TaskHandle};

/// Session strand payload.
struct Session<C: Connector> {
    pool: Pool<C>,
    /// Connection held for the open transaction
    pinned: Mutex<Option<PooledConnection<C::Link>>>,
    transaction: Mutex<TxState>,
}

/// Transaction bookkeeping as of the calls made so far, ahead of the strand.
#[derive(Default)]
struct TxState {
    /// Generation of the `begin` that counts as open. A failed begin only
    /// clears its own generation, never one opened after it.
    open: Option<u64>,
    next: u64,
}

/// Which connection a dispatched call may run on.
#[derive(Clone, Copy)]
enum Route {
    /// The pinned connection if a transaction is open, else any pooled one
    Any,
    /// Only the pinned connection
    Pinned,
}

enum Lease<L: Link> {
    Pinned,
    Pooled(PooledConnection<L>),
}

impl<C: Connector> Session<C> {
    async fn lease(&self, ctx: &TaskContext<Self>, route: Route) -> Result<Lease<C::Link>> {
        if self.pinned.lock().is_some() {
            return Ok(Lease::Pinned);
        }
        if let Route::Pinned = route {
            return Err(Error::Programming("no transaction is open".into()));
        }
        self.acquire(ctx).await.map(Lease::Pooled)
    }

    /// A connection of its own, whatever the session has pinned.
    async fn acquire(&self, ctx: &TaskContext<Self>) -> Result<PooledConnection<C::Link>> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            conn = self.pool.acquire() => conn,
        }
    }

    /// Check out a connection and open a transaction on it.
    async fn open_transaction(&self, ctx: &TaskContext<Self>) -> Result<PooledConnection<C::Link>> {
        let conn = match self.lease(ctx, Route::Any).await? {
            Lease::Pooled(conn) => conn,
            Lease::Pinned => return Err(Error::Programming("a transaction is already open".into())),
        };
        forward(ctx, conn.begin()).await?;
        Ok(conn)
    }

    /// Run `f` against the leased connection.
    fn with<R>(&self, lease: &Lease<C::Link>, f: impl FnOnce(&Connection<C::Link>) -> R) -> Result<R> {
        match lease {
            Lease::Pooled(conn) => Ok(f(conn)),
            Lease::Pinned => match self.pinned.lock().as_deref() {
                Some(conn) => Ok(f(conn)),
                None => Err(Error::Programming("no transaction is open".into())),
            },
        }
    }
}

/// Await a connection task, passing a stop request on to it.
pub(crate) async fn forward<T, R>(ctx: &TaskContext<T>, mut inner: TaskHandle<R>) -> Result<R> {
    tokio::select! {
        biased;
        result = &mut inner => result,
        _ = ctx.cancelled() => {
            inner.cancel();
            inner.await
        }
    }
}

/// Asynchronous database session.
///
/// ```no_run
/// # async fn demo() -> pgstrand::Result<()> {
/// use pgstrand::{params, Database, DatabaseConfig};
///
/// let db = Database::connect(DatabaseConfig::from_url("postgres://app@localhost/app")?).await?;
/// let count = db
///     .query_value::<i64>("SELECT count(*) FROM users WHERE active = $1", params![true])?
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Database<C: Connector = PgConnector> {
    session: Strand<Session<C>>,
    fetch_size: usize,
}

impl Database<PgConnector> {
    /// Build a PostgreSQL pool and open its first session.
    pub async fn connect(config: DatabaseConfig) -> Result<Self> {
        let connector = PgConnector::new(config.pg.clone());
        Self::with_connector(connector, config).await
    }
}

impl<C: Connector> Database<C> {
    /// Build a pool over any connector. `config.pg` is not consulted.
    pub async fn with_connector(connector: C, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let pool = Pool::connect(connector, config.pool).await?;
        tracing::debug!(
            max = pool.config().max_connections,
            fetch_size = config.fetch_size,
            "database ready"
        );
        Ok(Self::from_pool(pool, config.fetch_size))
    }

    fn from_pool(pool: Pool<C>, fetch_size: usize) -> Self {
        let queue = pool.queue().clone();
        let session = queue.new_strand(Session {
            pool,
            pinned: Mutex::new(None),
            transaction: Mutex::new(TxState::default()),
        });
        Self { session, fetch_size }
    }

    /// Another session on the same pool, with its own ordering and transactions.
    pub fn session(&self) -> Self {
        Self::from_pool(self.pool().clone(), self.fetch_size)
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.session.data().pool
    }

    pub fn status(&self) -> PoolStatus {
        self.pool().status()
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    /// True between `begin` and `commit`/`rollback`.
    pub fn in_transaction(&self) -> bool {
        self.session.data().transaction.lock().open.is_some()
    }

    /// Tear down the shared pool. Other sessions fail from here on.
    pub async fn close(&self) {
        self.pool().close().await;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch<R, O, S, M>(&self, route: Route, submit: S, map: M) -> TaskHandle<O>
    where
        R: Send + 'static,
        O: Send + 'static,
        S: FnOnce(&Connection<C::Link>) -> Result<TaskHandle<R>> + Send + 'static,
        M: FnOnce(R) -> Result<O> + Send + 'static,
    {
        self.session.enqueue(EventTask::new(move |ctx: TaskContext<Session<C>>| async move {
            let session = ctx.data();
            let lease = session.lease(&ctx, route).await?;
            let inner = session.with(&lease, submit)??;
            let result = forward(&ctx, inner).await;
            // Dropping the lease queues the release behind the statement
            drop(lease);
            result.and_then(map)
        }))
    }

    /// Run one statement and collect every row.
    pub fn query(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<DataTable>> {
        sql::validate_statement(statement, params.len())?;
        let statement = statement.to_string();
        Ok(self.dispatch(Route::Any, move |conn| conn.execute(&statement, params), Ok))
    }

    /// First row of the result, if any.
    pub fn query_single(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<Option<DataRow>>> {
        sql::validate_statement(statement, params.len())?;
        let statement = statement.to_string();
        Ok(self.dispatch(
            Route::Any,
            move |conn| conn.execute(&statement, params),
            |table| Ok(table.into_rows().into_iter().next()),
        ))
    }

    /// First column of the first row, converted.
    pub fn query_value<T>(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<Option<T>>>
    where
        T: FromValue + Send + 'static,
    {
        sql::validate_statement(statement, params.len())?;
        let statement = statement.to_string();
        Ok(self.dispatch(
            Route::Any,
            move |conn| conn.execute(&statement, params),
            |table| table.scalar::<T>(),
        ))
    }

    /// Run a statement for its effect; resolves to the affected row count.
    pub fn execute(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<u64>> {
        sql::validate_statement(statement, params.len())?;
        let statement = statement.to_string();
        Ok(self.dispatch(
            Route::Any,
            move |conn| conn.execute(&statement, params),
            |table| Ok(table.affected_rows()),
        ))
    }

    /// Run parameterless, possibly multi-statement text; one table per statement.
    pub fn execute_batch(&self, statements: &str) -> Result<TaskHandle<Vec<DataTable>>> {
        sql::validate(statements, 0)?;
        let statements = statements.to_string();
        Ok(self.dispatch(Route::Any, move |conn| conn.execute_batch(&statements), Ok))
    }

    /// Stream rows as they arrive.
    ///
    /// Outside a transaction the reader keeps its pooled connection checked
    /// out until it is dropped or exhausted.
    pub fn query_reader(&self, statement: &str, params: Vec<PgValue>) -> Result<TaskHandle<DataReader>> {
        sql::validate_statement(statement, params.len())?;
        let statement = statement.to_string();
        let fetch_size = self.fetch_size;
        Ok(self.session.enqueue(EventTask::new(move |ctx: TaskContext<Session<C>>| async move {
            let session = ctx.data();
            match session.lease(&ctx, Route::Any).await? {
                Lease::Pooled(conn) => {
                    let reader = conn.stream(&statement, params, fetch_size)?;
                    Ok(reader.with_lease(conn))
                }
                lease => session.with(&lease, |conn| conn.stream(&statement, params, fetch_size))?,
            }
        })))
    }

    /// Prepare `statement` as `name` on a connection checked out for the
    /// statement's lifetime.
    ///
    /// The statement runs on that connection, outside any transaction this
    /// session has open. `param_types` may list fewer types than there are
    /// placeholders; the server infers the rest.
    pub fn prepare(
        &self,
        name: &str,
        statement: &str,
        param_types: Vec<Oid>,
    ) -> Result<TaskHandle<Prepared<C::Link>>> {
        sql::validate_statement_name(name)?;
        sql::validate_prepare(statement, param_types.len())?;
        let name = name.to_string();
        let statement = statement.to_string();
        let fetch_size = self.fetch_size;
        Ok(self.session.enqueue(EventTask::new(move |ctx: TaskContext<Session<C>>| async move {
            let session = ctx.data();
            let conn = session.acquire(&ctx).await?;
            let inner = conn.prepare(&name, &statement, param_types)?;
            let described = forward(&ctx, inner).await?;
            tracing::debug!(connection = conn.id(), statement = %name, "statement prepared");
            Ok(Prepared::new(name, described, conn, session.pool.queue(), fetch_size))
        })))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Open a transaction on a connection pinned to this session.
    pub fn begin(&self) -> Result<TaskHandle<()>> {
        let generation = {
            let mut tx = self.session.data().transaction.lock();
            if tx.open.is_some() {
                return Err(Error::Programming("a transaction is already open".into()));
            }
            let generation = tx.next;
            tx.next += 1;
            tx.open = Some(generation);
            generation
        };
        Ok(self.session.enqueue(EventTask::new(move |ctx: TaskContext<Session<C>>| async move {
            let session = ctx.data();
            match session.open_transaction(&ctx).await {
                Ok(conn) => {
                    tracing::debug!(connection = conn.id(), "transaction pinned");
                    *session.pinned.lock() = Some(conn);
                    Ok(())
                }
                Err(e) => {
                    let mut tx = session.transaction.lock();
                    if tx.open == Some(generation) {
                        tx.open = None;
                    }
                    Err(e)
                }
            }
        })))
    }

    pub fn commit(&self) -> Result<TaskHandle<()>> {
        self.finish("COMMIT")
    }

    pub fn rollback(&self) -> Result<TaskHandle<()>> {
        self.finish("ROLLBACK")
    }

    fn finish(&self, verb: &'static str) -> Result<TaskHandle<()>> {
        if self.session.data().transaction.lock().open.take().is_none() {
            return Err(Error::Programming(format!("{} without an open transaction", verb)));
        }
        Ok(self.session.enqueue(EventTask::new(move |ctx: TaskContext<Session<C>>| async move {
            let session = ctx.data();
            let conn = session.pinned.lock().take();
            let Some(conn) = conn else {
                return Err(Error::Programming("no transaction is open".into()));
            };
            let inner = if verb == "COMMIT" { conn.commit() } else { conn.rollback() };
            let result = forward(&ctx, inner).await;
            tracing::debug!(connection = conn.id(), verb, "transaction unpinned");
            // A failed end of transaction is rolled back on release
            drop(conn);
            result
        })))
    }

    fn transaction_command<S>(&self, name: &str, submit: S) -> Result<TaskHandle<()>>
    where
        S: FnOnce(&Connection<C::Link>, &str) -> Result<TaskHandle<()>> + Send + 'static,
    {
        if !self.in_transaction() {
            return Err(Error::Programming("savepoints require an open transaction".into()));
        }
        sql::quote_identifier(name)?;
        let name = name.to_string();
        Ok(self.dispatch(Route::Pinned, move |conn| submit(conn, &name), Ok))
    }

    pub fn savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        self.transaction_command(name, |conn, name| conn.savepoint(name))
    }

    pub fn release_savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        self.transaction_command(name, |conn, name| conn.release_savepoint(name))
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<TaskHandle<()>> {
        self.transaction_command(name, |conn, name| conn.rollback_to_savepoint(name))
    }
}

impl<C: Connector> fmt::Debug for Database<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("pool", &self.status())
            .field("pending", &self.session.len())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{PgConfig, PoolConfig};
    use crate::params;
    use crate::testing::{MockConnector, Script};

    async fn database(max: usize) -> (Database<MockConnector>, MockConnector) {
        let connector = MockConnector::new(Script::default());
        let config = DatabaseConfig::new(PgConfig::new("localhost", "test", "test"))
            .pool(PoolConfig::new().max_connections(max).idle_timeout(None))
            .fetch_size(2);
        let db = Database::with_connector(connector.clone(), config).await.unwrap();
        (db, connector)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_query_api() {
        let (db, _) = database(2).await;
        let table = db.query("SELECT $1, $2", params![1i32, "a"]).unwrap().await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0].get::<_, String>(1).unwrap(), "a");

        let row = db.query_single("SELECT 3", vec![]).unwrap().await.unwrap();
        assert_eq!(row.unwrap().get::<_, i64>(0).unwrap(), 3);

        let value = db.query_value::<i64>("SELECT 42", vec![]).unwrap().await.unwrap();
        assert_eq!(value, Some(42));

        let none = db.query_value::<String>("SELECT nothing", vec![]).unwrap().await.unwrap();
        assert_eq!(none, None);

        assert_eq!(db.execute("UPDATE t SET a = 1", vec![]).unwrap().await.unwrap(), 1);

        let tables = db.execute_batch("SELECT 1; INSERT INTO t VALUES (1)").unwrap().await.unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1].affected_rows(), 1);
    }

    #[tokio::test]
    async fn test_programming_errors_before_dispatch() {
        let (db, connector) = database(1).await;
        assert!(matches!(db.query("SELECT $1", vec![]), Err(Error::Programming(_))));
        assert!(matches!(
            db.execute_batch("SELECT 1; SELECT $1"),
            Err(Error::Programming(_))
        ));
        assert!(matches!(db.savepoint("sp"), Err(Error::Programming(_))));
        assert!(matches!(db.commit(), Err(Error::Programming(_))));
        assert!(matches!(db.rollback(), Err(Error::Programming(_))));
        for text in ["SELECT 1; SELECT 2", "INSERT INTO t VALUES (1); DELETE FROM t"] {
            assert!(matches!(db.query(text, vec![]), Err(Error::Programming(_))));
            assert!(matches!(db.query_single(text, vec![]), Err(Error::Programming(_))));
            assert!(matches!(db.query_value::<i64>(text, vec![]), Err(Error::Programming(_))));
            assert!(matches!(db.execute(text, vec![]), Err(Error::Programming(_))));
            assert!(matches!(db.query_reader(text, vec![]), Err(Error::Programming(_))));
        }
        assert!(matches!(db.prepare("", "SELECT 1", vec![]), Err(Error::Programming(_))));
        assert!(matches!(
            db.prepare("p", "SELECT $1", vec![Oid::INT4, Oid::INT4]),
            Err(Error::Programming(_))
        ));
        assert!(connector.log().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_reaches_handle() {
        let (db, _) = database(1).await;
        let err = db.query("FAIL here", vec![]).unwrap().await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert_eq!(err.code(), Some("42601"));
        assert!(db.query("SELECT 1", vec![]).unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn test_session_calls_are_serialized() {
        let (db, connector) = database(2).await;
        let slow = db.query("SLEEP", vec![]).unwrap();
        let next = db.query("SELECT 2", vec![]).unwrap();
        connector.wait_for_statement("SLEEP").await;
        settle().await;
        assert_eq!(connector.log(), vec!["SLEEP"]);

        // another session is not held up
        let other = db.session();
        let value = other.query_value::<i64>("SELECT 5", vec![]).unwrap().await.unwrap();
        assert_eq!(value, Some(5));

        assert!(slow.cancel());
        assert!(matches!(slow.await, Err(Error::Cancelled)));
        assert_eq!(connector.cancel_requests(), 1);
        assert_eq!(next.await.unwrap().scalar::<i64>().unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_transaction_pins_one_connection() {
        let (db, connector) = database(3).await;
        db.begin().unwrap().await.unwrap();
        assert!(db.in_transaction());
        assert!(matches!(db.begin(), Err(Error::Programming(_))));

        db.execute("INSERT INTO t VALUES (1)", vec![]).unwrap().await.unwrap();
        db.savepoint("before update").unwrap().await.unwrap();
        db.execute("UPDATE t SET a = 2", vec![]).unwrap().await.unwrap();
        db.rollback_to_savepoint("before update").unwrap().await.unwrap();
        db.release_savepoint("before update").unwrap().await.unwrap();
        db.commit().unwrap().await.unwrap();
        assert!(!db.in_transaction());
        settle().await;

        assert_eq!(db.status().size, 1);
        assert_eq!(db.status().idle, 1);
        assert_eq!(connector.log().first().map(String::as_str), Some("BEGIN"));
        assert_eq!(connector.log().last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_failed_begin_keeps_later_transaction() {
        let (db, connector) = database(1).await;
        connector.fail_next_connects(1);
        let first = db.begin().unwrap();
        let commit = db.commit().unwrap();
        let second = db.begin().unwrap();

        assert!(first.await.unwrap_err().is_connection());
        assert!(matches!(commit.await, Err(Error::Programming(_))));
        second.await.unwrap();
        assert!(db.in_transaction());

        db.commit().unwrap().await.unwrap();
        assert!(!db.in_transaction());
        settle().await;
        assert_eq!(db.status().size, 1);
        assert_eq!(db.status().idle, 1);
        assert_eq!(connector.log(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_failed_begin_closes_transaction() {
        let (db, connector) = database(1).await;
        connector.fail_next_connects(1);
        assert!(db.begin().unwrap().await.is_err());
        assert!(!db.in_transaction());
        db.begin().unwrap().await.unwrap();
        db.rollback().unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_statement_in_transaction() {
        let (db, connector) = database(1).await;
        db.begin().unwrap().await.unwrap();
        assert!(db.query("FAIL", vec![]).unwrap().await.is_err());
        let err = db.query("SELECT 1", vec![]).unwrap().await.unwrap_err();
        assert_eq!(err.code(), Some("25P02"));
        db.rollback().unwrap().await.unwrap();
        assert!(db.query("SELECT 1", vec![]).unwrap().await.is_ok());
        assert_eq!(connector.log(), vec!["BEGIN", "FAIL", "SELECT 1", "ROLLBACK", "SELECT 1"]);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back_before_reuse() {
        let (db, connector) = database(1).await;
        let session = db.session();
        session.begin().unwrap().await.unwrap();
        session.execute("INSERT INTO t VALUES (1)", vec![]).unwrap().await.unwrap();
        drop(session);

        db.query("SELECT 1", vec![]).unwrap().await.unwrap();
        assert_eq!(
            connector.log(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK", "SELECT 1"]
        );
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_reader_holds_connection_until_dropped() {
        let (db, _) = database(1).await;
        let mut reader = db.query_reader("STREAM 5", vec![]).unwrap().await.unwrap();
        let mut seen = Vec::new();
        while let Some(row) = reader.next_row().await.unwrap() {
            seen.push(row.get::<_, i32>("n").unwrap());
            assert_eq!(db.status().idle, 0);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        drop(reader);
        settle().await;
        assert_eq!(db.status().idle, 1);
    }

    #[tokio::test]
    async fn test_reader_inside_transaction() {
        let (db, connector) = database(1).await;
        db.begin().unwrap().await.unwrap();
        let reader = db.query_reader("STREAM 3", vec![]).unwrap().await.unwrap();
        let table = reader.collect().await.unwrap();
        assert_eq!(table.len(), 3);
        db.commit().unwrap().await.unwrap();
        assert_eq!(connector.log(), vec!["BEGIN", "STREAM 3", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_prepared_statement() {
        let (db, connector) = database(2).await;
        let stmt = db
            .prepare("echo", "SELECT $1", vec![Oid::INT4])
            .unwrap()
            .await
            .unwrap();
        assert_eq!(stmt.name(), "echo");
        assert_eq!(stmt.param_types(), &[Oid::INT4]);
        assert_eq!(db.status().idle, 0);

        let table = stmt.query(params![7i32]).unwrap().await.unwrap();
        assert_eq!(table.scalar::<i32>().unwrap(), Some(7));
        let row = stmt.query_single(params![8i32]).unwrap().await.unwrap();
        assert_eq!(row.unwrap().get::<_, i32>(0).unwrap(), 8);
        assert_eq!(stmt.query_value::<i32>(params![9i32]).unwrap().await.unwrap(), Some(9));
        assert_eq!(stmt.execute(params![1i32]).unwrap().await.unwrap(), 1);
        let reader = stmt.query_reader(params![3i32]).unwrap().await.unwrap();
        assert_eq!(reader.collect().await.unwrap().len(), 1);

        assert!(matches!(stmt.query(vec![]), Err(Error::Programming(_))));
        drop(stmt);
        settle().await;
        assert_eq!(db.status().idle, 1);
        let log = connector.log();
        assert_eq!(log.first().map(String::as_str), Some("PREPARE echo"));
        assert_eq!(log.last().map(String::as_str), Some("DEALLOCATE echo"));
        assert_eq!(log.iter().filter(|s| *s == "EXECUTE echo").count(), 5);

        // the name is free again on the reused connection
        let again = db.prepare("echo", "SELECT 1", vec![]).unwrap().await.unwrap();
        assert_eq!(again.query_value::<i64>(vec![]).unwrap().await.unwrap(), Some(1));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_prepared_explicit_deallocate() {
        let (db, connector) = database(1).await;
        let stmt = db.prepare("one", "SELECT 1", vec![]).unwrap().await.unwrap();
        stmt.query(vec![]).unwrap().await.unwrap();
        stmt.deallocate().unwrap().await.unwrap();
        assert!(matches!(stmt.query(vec![]), Err(Error::Programming(_))));
        assert!(matches!(stmt.deallocate(), Err(Error::Programming(_))));
        drop(stmt);
        settle().await;
        assert_eq!(connector.log(), vec!["PREPARE one", "EXECUTE one", "DEALLOCATE one"]);
    }

    #[tokio::test]
    async fn test_prepare_failure_returns_connection() {
        let (db, connector) = database(1).await;
        let err = db.prepare("bad", "FAIL now", vec![]).unwrap().await.unwrap_err();
        assert_eq!(err.code(), Some("42601"));
        settle().await;
        assert_eq!(db.status().idle, 1);

        let stmt = db.prepare("good", "SELECT 2", vec![]).unwrap().await.unwrap();
        assert_eq!(stmt.query_value::<i64>(vec![]).unwrap().await.unwrap(), Some(2));
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_reaches_caller() {
        let connector = MockConnector::new(Script::default());
        let config = DatabaseConfig::new(PgConfig::new("localhost", "test", "test")).pool(
            PoolConfig::new()
                .max_connections(1)
                .acquire_timeout(Some(Duration::from_millis(20)))
                .idle_timeout(None),
        );
        let db = Database::with_connector(connector, config).await.unwrap();
        db.begin().unwrap().await.unwrap();

        let other = db.session();
        let err = other.query("SELECT 1", vec![]).unwrap().await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { max: 1, .. }));
    }

    #[tokio::test]
    async fn test_close() {
        let (db, connector) = database(2).await;
        db.query("SELECT 1", vec![]).unwrap().await.unwrap();
        settle().await;
        db.close().await;
        assert_eq!(connector.closed(), 1);
        let err = db.query("SELECT 1", vec![]).unwrap().await.unwrap_err();
        assert!(err.is_connection());
    }
}
