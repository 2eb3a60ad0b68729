//! Boundary between the orchestration layer and a wire-protocol implementation.
//!
//! The pool, connections and tasks only ever see a [`Connector`] and the
//! [`Link`]s it opens. [`PgConnector`] is the PostgreSQL implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PgConfig;
use crate::pg::error::PgResult;
use crate::pg::protocol::TransactionStatus;
use crate::pg::statement::SharedColumns;
use crate::pg::types::{Oid, PgValue};
use crate::pg::PgLink;

/// Raw outcome of one statement, before conversion to a `DataTable`.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Vec<PgValue>>,
    /// Command tag, e.g. `SELECT 5` or `INSERT 0 1`
    pub command_tag: String,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    pub fn with_columns(columns: SharedColumns) -> Self {
        Self {
            columns,
            ..Self::empty()
        }
    }
}

/// One step of an incremental fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Row(Vec<PgValue>),
    /// The statement finished; carries its command tag.
    Done(String),
}

/// Server description of a named prepared statement.
#[derive(Debug, Clone)]
pub struct Described {
    /// Parameter types as resolved by the server
    pub param_types: Vec<Oid>,
    pub columns: SharedColumns,
}

/// Sends an out-of-band cancel request for whatever the link is running.
///
/// Usable while the link itself is mutably borrowed by the running query.
#[async_trait]
pub trait CancelHandle: Send + Sync {
    async fn cancel(&self) -> PgResult<()>;
}

/// One physical connection speaking the wire protocol.
///
/// Every method leaves the link either resynchronized with the server or
/// broken; errors for which [`PgError::is_fatal`](crate::pg::PgError::is_fatal)
/// is false keep the link usable.
#[async_trait]
pub trait Link: Send + 'static {
    /// Run one statement with positional parameters (extended protocol).
    async fn query(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult>;

    /// Run parameterless, possibly multi-statement text (simple protocol).
    async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>>;

    /// Start an incremental fetch, returning the result columns.
    async fn start_stream(
        &mut self,
        sql: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns>;

    /// Parse and describe `sql` as the named statement `name`, kept until
    /// [`deallocate`](Link::deallocate). Unlisted parameter types are inferred.
    async fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<Described>;

    /// Run a statement previously prepared under `name`.
    async fn query_prepared(&mut self, name: &str, params: &[PgValue]) -> PgResult<QueryResult>;

    /// Start an incremental fetch of a statement prepared under `name`.
    async fn start_stream_prepared(
        &mut self,
        name: &str,
        params: &[PgValue],
        fetch_size: usize,
    ) -> PgResult<SharedColumns>;

    /// Drop the named statement on the server. Unknown names are not an error.
    async fn deallocate(&mut self, name: &str) -> PgResult<()>;

    /// Next row of the open stream, pulling another batch from the server when needed.
    async fn fetch(&mut self) -> PgResult<Fetched>;

    /// Close the open stream (if any) and resynchronize.
    async fn finish_stream(&mut self) -> PgResult<()>;

    fn cancel_handle(&self) -> Option<Arc<dyn CancelHandle>>;

    fn is_broken(&self) -> bool;

    fn transaction_status(&self) -> TransactionStatus;

    async fn close(&mut self) -> PgResult<()>;
}

/// Opens new links. Shared by the pool for the lifetime of the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Link: Link;

    async fn connect(&self) -> PgResult<Self::Link>;
}

/// Connector for a PostgreSQL server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: PgConfig,
}

impl PgConnector {
    pub fn new(config: PgConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Link = PgLink;

    async fn connect(&self) -> PgResult<PgLink> {
        PgLink::connect(self.config.clone()).await
    }
}
