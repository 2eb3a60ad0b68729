//! Public error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::pg::PgError;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Network or protocol failure. The connection that produced it is evicted.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Error reported by the server. The connection stays usable.
    #[error("{severity}: {message} ({code})")]
    Query {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    #[error("Pool exhausted: no connection available after {waited:?} (max {max})")]
    PoolExhausted { waited: Duration, max: usize },

    #[error("Task cancelled")]
    Cancelled,

    /// A task panicked; the strand it ran on keeps going.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// Misuse detected before anything was sent to the server.
    #[error("Programming error: {0}")]
    Programming(String),

    #[error("Type conversion error: {0}")]
    Type(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// SQLSTATE of a server-reported error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Query { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl From<PgError> for Error {
    fn from(err: PgError) -> Self {
        if err.is_query_canceled() {
            return Error::Cancelled;
        }
        let fatal = err.is_fatal();
        match err {
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } if !fatal => Error::Query {
                severity,
                code,
                message,
                detail,
                hint,
            },
            PgError::Type(msg) => Error::Type(msg),
            other => Error::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
