//! PostgreSQL v3 wire protocol message encoding and decoding.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code sent in place of a protocol version to request cancellation.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status reported in ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    /// Whether a transaction block is open (healthy or failed).
    pub fn in_transaction(self) -> bool {
        !matches!(self, TransactionStatus::Idle)
    }
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Wrap a body into a tagged message: tag byte, length (self-inclusive), body.
fn frame(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(tag);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

/// Wrap a body into an untagged message (startup and cancel request).
fn frame_untagged(body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
    buf
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_i32(PROTOCOL_VERSION);

        put_cstring(&mut body, "user");
        put_cstring(&mut body, &self.user);

        if let Some(ref db) = self.database {
            put_cstring(&mut body, "database");
            put_cstring(&mut body, db);
        }

        for (key, value) in &self.options {
            put_cstring(&mut body, key);
            put_cstring(&mut body, value);
        }

        body.put_u8(0);
        frame_untagged(&body)
    }
}

/// Out-of-band cancel request, sent on a fresh socket.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(12);
        body.put_i32(CANCEL_REQUEST_CODE);
        body.put_i32(self.process_id);
        body.put_i32(self.secret_key);
        frame_untagged(&body)
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.password);
        frame(b'p', &body)
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::with_capacity(self.query.len() + 1);
        put_cstring(&mut body, &self.query);
        frame(b'Q', &body)
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.name);
        put_cstring(&mut body, &self.query);

        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_i32(oid.as_i32());
        }

        frame(b'P', &body)
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [PgValue],
    pub result_format: Format,
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, self.portal);
        put_cstring(&mut body, self.statement);

        // Every parameter travels in binary
        body.put_i16(1);
        body.put_i16(Format::Binary as i16);

        body.put_i16(self.params.len() as i16);
        for param in self.params {
            if param.is_null() {
                body.put_i32(-1);
            } else {
                let encoded = param.encode_binary();
                body.put_i32(encoded.len() as i32);
                body.put_slice(&encoded);
            }
        }

        body.put_i16(1);
        body.put_i16(self.result_format as i16);

        frame(b'B', &body)
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// Maximum rows to return before PortalSuspended (0 = no limit)
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, self.portal);
        body.put_i32(self.max_rows);
        frame(b'E', &body)
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.kind);
        put_cstring(&mut body, self.name);
        frame(b'D', &body)
    }
}

/// Close message ('C') - Releases a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(self.kind);
        put_cstring(&mut body, self.name);
        frame(b'C', &body)
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', &[])
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        frame(b'H', &[])
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', &[])
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut body = BytesMut::new();
        put_cstring(&mut body, &self.mechanism);
        body.put_i32(self.data.len() as i32);
        body.put_slice(&self.data);
        frame(b'p', &body)
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', &self.data)
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription { type_oids: Vec<Oid> },
}

impl BackendMessage {
    /// Total length of the first framed message in `buf`, if it is complete.
    pub fn frame_len(buf: &[u8]) -> PgResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if length < 4 {
            return Err(PgError::Protocol(format!(
                "Invalid message length {} for type {}",
                length, buf[0] as char
            )));
        }
        let total = 1 + length as usize;
        Ok((buf.len() >= total).then_some(total))
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(len as usize - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => {
                let mut body = body;
                Ok(BackendMessage::CommandComplete {
                    tag: read_cstring(&mut body)?,
                })
            }
            b'Z' => {
                let mut body = body;
                need(&body, 1)?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => {
                let mut body = body;
                let name = read_cstring(&mut body)?;
                let value = read_cstring(&mut body)?;
                Ok(BackendMessage::ParameterStatus { name, value })
            }
            b'K' => {
                let mut body = body;
                need(&body, 8)?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => {
                let mut body = body;
                need(&body, 4)?;
                let process_id = body.get_i32();
                let channel = read_cstring(&mut body)?;
                let payload = read_cstring(&mut body)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                })
            }
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(&body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(&body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        need(&body, 2)?;
        let num_params = body.get_i16().max(0) as usize;
        need(&body, num_params * 4)?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_i32(body.get_i32()))
            .collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(body: &Bytes, n: usize) -> PgResult<()> {
    if body.remaining() < n {
        return Err(PgError::Protocol(format!(
            "Truncated message: need {} bytes, have {}",
            n,
            body.remaining()
        )));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    // Try direct UTF-8 first, fall back to lossy only if invalid
    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
