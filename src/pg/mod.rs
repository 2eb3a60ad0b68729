//! PostgreSQL wire protocol implementation.
//!
//! - `protocol`: message encoding/decoding
//! - `link`: one connection's startup, auth, query and fetch state machine
//! - `types`: value encoding/decoding
//! - `statement`: per-link prepared statement cache
//! - `scram`: SCRAM-SHA-256 authentication

pub mod error;
pub mod link;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod types;


pub use error::{PgError, PgResult};
pub use link::PgLink;
pub use protocol::{FieldDescription, TransactionStatus};
pub use statement::SharedColumns;
pub use types::{Oid, PgValue};
