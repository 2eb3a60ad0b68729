//! pgstrand - asynchronous PostgreSQL client built on ordered task strands.
//!
//! Work flows from a [`Database`] session through its strand onto a pooled
//! [`Connection`], whose own strand runs statements one at a time in
//! submission order. Results come back as a [`DataTable`], or row by row
//! through a [`DataReader`].

mod backend;
mod config;
mod connection;
mod data;
mod database;
mod error;
pub mod pg;
mod pool;
mod prepared;
mod reader;
pub mod sql;
pub mod strand;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{CancelHandle, Connector, Described, Fetched, Link, PgConnector, QueryResult};
pub use config::{DatabaseConfig, PgConfig, PoolConfig, DEFAULT_FETCH_SIZE, DEFAULT_PORT};
pub use connection::{Connection, ConnectionCore, ConnectionId, ConnectionState, ConnectionTask};
pub use data::{parse_rows_affected, to_json, Column, ColumnIndex, Columns, DataRow, DataTable, DataValue, FromValue};
pub use database::Database;
pub use error::{Error, Result};
pub use pg::{Oid, PgValue, TransactionStatus};
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use prepared::Prepared;
pub use reader::{DataReader, ReaderTask};
pub use strand::{EventQueue, EventTask, Strand, Task, TaskContext, TaskHandle, TaskId, TaskKind, TaskState, WeakStrand};
