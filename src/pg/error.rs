//! Error types for the PostgreSQL wire layer.

use std::collections::HashMap;
use std::fmt;
use std::io;

/// SQLSTATE reported by the server when a statement was cancelled.
pub const QUERY_CANCELED: &str = "57014";

/// Result type for wire-level operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur while talking to the server.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Protocol error (unexpected message, invalid format, etc.).
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Server returned an error.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Type conversion error.
    Type(String),

    /// Link is closed or in an invalid state.
    ConnectionClosed,

    /// Timeout waiting for response.
    Timeout,
}

impl PgError {
    /// Build a server error from the fields of an ErrorResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        PgError::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// Whether the link that produced this error can no longer be trusted.
    ///
    /// Server errors leave the protocol in sync and type errors happen on our
    /// side of an already consumed message; everything else desynchronizes
    /// or loses the link.
    pub fn is_fatal(&self) -> bool {
        match self {
            PgError::Server { severity, .. } => severity == "FATAL" || severity == "PANIC",
            PgError::Type(_) => false,
            _ => true,
        }
    }

    /// Whether this is the server acknowledging a cancel request.
    pub fn is_query_canceled(&self) -> bool {
        matches!(self, PgError::Server { code, .. } if code == QUERY_CANCELED)
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "{}: {} ({})", severity, message, code)?;
                if let Some(d) = detail {
                    write!(f, "\nDetail: {}", d)?;
                }
                if let Some(h) = hint {
                    write!(f, "\nHint: {}", h)?;
                }
                Ok(())
            }
            PgError::Type(msg) => write!(f, "Type error: {}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(severity: &str, code: &str) -> PgError {
        PgError::Server {
            severity: severity.to_string(),
            code: code.to_string(),
            message: "boom".to_string(),
            detail: None,
            hint: None,
        }
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!server("ERROR", "42P01").is_fatal());
        assert!(server("FATAL", "57P01").is_fatal());
        assert!(PgError::ConnectionClosed.is_fatal());
        assert!(PgError::Protocol("desync".into()).is_fatal());
        assert!(!PgError::Type("bad int".into()).is_fatal());
    }

    #[test]
    fn test_query_canceled_detection() {
        assert!(server("ERROR", QUERY_CANCELED).is_query_canceled());
        assert!(!server("ERROR", "42601").is_query_canceled());
    }

    #[test]
    fn test_from_fields() {
        let mut fields = HashMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "23505".to_string());
        fields.insert(b'M', "duplicate key".to_string());
        fields.insert(b'D', "Key (id)=(1) already exists.".to_string());

        match PgError::from_fields(&fields) {
            PgError::Server {
                code, detail, hint, ..
            } => {
                assert_eq!(code, "23505");
                assert!(detail.is_some());
                assert!(hint.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
