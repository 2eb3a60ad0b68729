//! Named prepared statements.
//!
//! A [`Prepared`] statement lives on one pooled connection, checked out for
//! as long as the handle exists. Calls on the handle run in call order on
//! its own strand. Dropping the handle deallocates the statement before the
//! connection goes back to the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{Described, Link};
use crate::connection::Connection;
use crate::data::{Columns, DataRow, DataTable, FromValue};
use crate::database::forward;
use crate::error::{Error, Result};
use crate::pg::{Oid, PgValue};
use crate::pool::PooledConnection;
use crate::reader::DataReader;
use crate::strand::{EventQueue, EventTask, Strand, TaskContext, TaskHandle};

struct Statement<L: Link> {
    name: String,
    param_types: Vec<Oid>,
    columns: Arc<Columns>,
    conn: PooledConnection<L>,
    deallocated: AtomicBool,
}

/// A statement parsed once on the server and run by name.
pub struct Prepared<L: Link> {
    strand: Strand<Statement<L>>,
    fetch_size: usize,
}

impl<L: Link> Prepared<L> {
    pub(crate) fn new(
        name: String,
        described: Described,
        conn: PooledConnection<L>,
        queue: &EventQueue,
        fetch_size: usize,
    ) -> Self {
        let statement = Statement {
            name,
            param_types: described.param_types,
            columns: Arc::new(Columns::from_fields(&described.columns)),
            conn,
            deallocated: AtomicBool::new(false),
        };
        Self {
            strand: queue.new_strand(statement),
            fetch_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.statement().name
    }

    /// Parameter types as resolved by the server.
    pub fn param_types(&self) -> &[Oid] {
        &self.statement().param_types
    }

    pub fn columns(&self) -> &Arc<Columns> {
        &self.statement().columns
    }

    fn statement(&self) -> &Statement<L> {
        self.strand.data()
    }

    fn check(&self, params: &[PgValue]) -> Result<()> {
        let statement = self.statement();
        if statement.deallocated.load(Ordering::SeqCst) {
            return Err(Error::Programming(format!(
                "prepared statement {} was deallocated",
                statement.name
            )));
        }
        if params.len() != statement.param_types.len() {
            return Err(Error::Programming(format!(
                "prepared statement {} expects {} parameter(s), {} given",
                statement.name,
                statement.param_types.len(),
                params.len()
            )));
        }
        Ok(())
    }

    fn dispatch<R, O, S, M>(&self, submit: S, map: M) -> TaskHandle<O>
    where
        R: Send + 'static,
        O: Send + 'static,
        S: FnOnce(&Connection<L>, &str) -> TaskHandle<R> + Send + 'static,
        M: FnOnce(R) -> Result<O> + Send + 'static,
    {
        self.strand.enqueue(EventTask::new(move |ctx: TaskContext<Statement<L>>| async move {
            let statement = ctx.data();
            let inner = submit(&*statement.conn, &statement.name);
            forward(&ctx, inner).await.and_then(map)
        }))
    }

    pub fn query(&self, params: Vec<PgValue>) -> Result<TaskHandle<DataTable>> {
        self.check(&params)?;
        Ok(self.dispatch(move |conn, name| conn.execute_prepared(name, params), Ok))
    }

    pub fn query_single(&self, params: Vec<PgValue>) -> Result<TaskHandle<Option<DataRow>>> {
        self.check(&params)?;
        Ok(self.dispatch(
            move |conn, name| conn.execute_prepared(name, params),
            |table| Ok(table.into_rows().into_iter().next()),
        ))
    }

    pub fn query_value<T>(&self, params: Vec<PgValue>) -> Result<TaskHandle<Option<T>>>
    where
        T: FromValue + Send + 'static,
    {
        self.check(&params)?;
        Ok(self.dispatch(
            move |conn, name| conn.execute_prepared(name, params),
            |table| table.scalar::<T>(),
        ))
    }

    /// Run for the effect; resolves to the affected row count.
    pub fn execute(&self, params: Vec<PgValue>) -> Result<TaskHandle<u64>> {
        self.check(&params)?;
        Ok(self.dispatch(
            move |conn, name| conn.execute_prepared(name, params),
            |table| Ok(table.affected_rows()),
        ))
    }

    pub fn query_reader(&self, params: Vec<PgValue>) -> Result<TaskHandle<DataReader>> {
        self.check(&params)?;
        let fetch_size = self.fetch_size;
        Ok(self.strand.enqueue(EventTask::new(move |ctx: TaskContext<Statement<L>>| async move {
            let statement = ctx.data();
            Ok(statement.conn.stream_prepared(&statement.name, params, fetch_size))
        })))
    }

    /// Drop the statement on the server now, behind calls already made.
    pub fn deallocate(&self) -> Result<TaskHandle<()>> {
        let statement = self.statement();
        if statement.deallocated.swap(true, Ordering::SeqCst) {
            return Err(Error::Programming(format!(
                "prepared statement {} was deallocated",
                statement.name
            )));
        }
        Ok(self.dispatch(|conn, name| conn.deallocate(name), Ok))
    }
}

impl<L: Link> Drop for Prepared<L> {
    fn drop(&mut self) {
        let statement = self.statement();
        if !statement.deallocated.swap(true, Ordering::SeqCst) {
            // Queued on the connection ahead of its release
            let _ = statement.conn.deallocate(&statement.name);
        }
    }
}

impl<L: Link> fmt::Debug for Prepared<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("name", &self.name())
            .field("param_types", &self.param_types())
            .field("connection", &self.statement().conn.id())
            .finish()
    }
}
