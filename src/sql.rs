//! Lexical scan of statement text.
//!
//! Only what is needed to reject malformed calls before they reach the
//! server: statement boundaries, `$n` placeholders, and whether every
//! literal and comment is closed. Quoted identifiers, string literals
//! (including `E'..'` escapes), dollar-quoted bodies and comments are skipped.

use std::ops::Range;

use crate::error::{Error, Result};
use crate::pg::statement::STATEMENT_PREFIX;

/// Result of scanning one piece of SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementInfo {
    /// Highest `$n` referenced, 0 when there are none
    pub placeholders: usize,
    /// Byte ranges of the non-empty statements, trimmed
    pub statements: Vec<Range<usize>>,
}

impl StatementInfo {
    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    placeholders: usize,
    statements: Vec<Range<usize>>,
    /// First and one-past-last byte of real content in the current statement
    content: Option<Range<usize>>,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80
}

fn unterminated(what: &str, at: usize) -> Error {
    Error::Programming(format!("unterminated {} starting at byte {}", what, at))
}

impl<'a> Scanner<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            src: sql.as_bytes(),
            pos: 0,
            placeholders: 0,
            statements: Vec::new(),
            content: None,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn prev_is_ident(&self, at: usize) -> bool {
        at > 0 && (is_ident(self.src[at - 1]) || self.src[at - 1] == b'$')
    }

    fn mark(&mut self, range: Range<usize>) {
        match &mut self.content {
            Some(content) => content.end = range.end,
            None => self.content = Some(range),
        }
    }

    fn end_statement(&mut self) {
        if let Some(content) = self.content.take() {
            self.statements.push(content);
        }
    }

    fn run(mut self) -> Result<StatementInfo> {
        while let Some(b) = self.peek(0) {
            let start = self.pos;
            match b {
                b';' => {
                    self.end_statement();
                    self.pos += 1;
                }
                b'-' if self.peek(1) == Some(b'-') => {
                    while self.peek(0).is_some_and(|c| c != b'\n') {
                        self.pos += 1;
                    }
                }
                b'/' if self.peek(1) == Some(b'*') => self.block_comment()?,
                b'\'' => {
                    let escapes = start > 0
                        && matches!(self.src[start - 1], b'E' | b'e')
                        && !self.prev_is_ident(start - 1);
                    self.quoted(b'\'', escapes)?;
                    self.mark(start..self.pos);
                }
                b'"' => {
                    self.quoted(b'"', false)?;
                    self.mark(start..self.pos);
                }
                b'$' if !self.prev_is_ident(start) => self.dollar()?,
                b if b.is_ascii_whitespace() => self.pos += 1,
                _ => {
                    self.pos += 1;
                    self.mark(start..self.pos);
                }
            }
        }
        self.end_statement();
        Ok(StatementInfo {
            placeholders: self.placeholders,
            statements: self.statements,
        })
    }

    /// Block comments nest in PostgreSQL.
    fn block_comment(&mut self) -> Result<()> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            match (self.peek(0), self.peek(1)) {
                (Some(b'/'), Some(b'*')) => {
                    depth += 1;
                    self.pos += 2;
                }
                (Some(b'*'), Some(b'/')) => {
                    depth -= 1;
                    self.pos += 2;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                (Some(_), _) => self.pos += 1,
                (None, _) => return Err(unterminated("comment", start)),
            }
        }
    }

    /// A quoted literal or identifier; a doubled quote is an escaped quote.
    fn quoted(&mut self, quote: u8, backslash_escapes: bool) -> Result<()> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => {
                    let what = if quote == b'"' { "quoted identifier" } else { "string literal" };
                    return Err(unterminated(what, start));
                }
                Some(b'\\') if backslash_escapes => self.pos += 2,
                Some(c) if c == quote => {
                    self.pos += 1;
                    if self.peek(0) == Some(quote) {
                        self.pos += 1;
                    } else {
                        return Ok(());
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// `$n` placeholder, `$tag$...$tag$` body, or a lone `$`.
    fn dollar(&mut self) -> Result<()> {
        let start = self.pos;
        let digits = self.src[start + 1..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits > 0 {
            self.pos = start + 1 + digits;
            let n: usize = std::str::from_utf8(&self.src[start + 1..self.pos])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Programming(format!("invalid placeholder at byte {}", start)))?;
            if n == 0 {
                return Err(Error::Programming("placeholders are numbered from $1".into()));
            }
            self.placeholders = self.placeholders.max(n);
            self.mark(start..self.pos);
            return Ok(());
        }

        let tag_len = self.src[start + 1..]
            .iter()
            .take_while(|&&b| is_ident(b))
            .count();
        let tag_end = start + 1 + tag_len;
        if self.src.get(tag_end) != Some(&b'$') {
            self.pos += 1;
            self.mark(start..self.pos);
            return Ok(());
        }

        let delimiter = &self.src[start..=tag_end];
        let body = tag_end + 1;
        match self.src[body..]
            .windows(delimiter.len())
            .position(|w| w == delimiter)
        {
            Some(offset) => {
                self.pos = body + offset + delimiter.len();
                self.mark(start..self.pos);
                Ok(())
            }
            None => Err(unterminated("dollar-quoted string", start)),
        }
    }
}

/// Scan `sql` for statements and placeholders.
pub fn scan(sql: &str) -> Result<StatementInfo> {
    Scanner::new(sql).run()
}

/// The non-empty statements of `sql`, trimmed, in order.
pub fn split_statements(sql: &str) -> Result<Vec<&str>> {
    Ok(scan(sql)?
        .statements
        .into_iter()
        .map(|range| &sql[range])
        .collect())
}

/// Reject text that cannot be bound to `param_count` parameters.
///
/// Parameterless text may hold several statements; this is the check for
/// batches sent over the simple protocol.
pub fn validate(sql: &str, param_count: usize) -> Result<StatementInfo> {
    let info = scan(sql)?;
    if info.is_empty() {
        return Err(Error::Programming("empty statement".into()));
    }
    if info.statement_count() > 1 && param_count > 0 {
        return Err(Error::Programming(format!(
            "parameters cannot be bound to {} statements at once",
            info.statement_count()
        )));
    }
    check_params(&info, param_count)?;
    Ok(info)
}

/// Like [`validate`], but for the extended protocol: exactly one statement.
pub fn validate_statement(sql: &str, param_count: usize) -> Result<StatementInfo> {
    let info = single_statement(sql)?;
    check_params(&info, param_count)?;
    Ok(info)
}

/// Check text about to be prepared with `declared` parameter types.
///
/// Fewer types than placeholders is fine; the server infers the rest.
pub fn validate_prepare(sql: &str, declared: usize) -> Result<StatementInfo> {
    let info = single_statement(sql)?;
    if declared > info.placeholders {
        return Err(Error::Programming(format!(
            "{} parameter type(s) declared for {} placeholder(s)",
            declared, info.placeholders
        )));
    }
    Ok(info)
}

/// Check a name for a prepared statement. Names starting with
/// [`STATEMENT_PREFIX`] belong to the per-link statement cache.
pub fn validate_statement_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::Programming(format!("invalid statement name {:?}", name)));
    }
    if name.starts_with(STATEMENT_PREFIX) {
        return Err(Error::Programming(format!(
            "statement names starting with {:?} are reserved",
            STATEMENT_PREFIX
        )));
    }
    Ok(())
}

fn single_statement(sql: &str) -> Result<StatementInfo> {
    let info = scan(sql)?;
    match info.statement_count() {
        0 => Err(Error::Programming("empty statement".into())),
        1 => Ok(info),
        n => Err(Error::Programming(format!(
            "{} statements given where one is expected; use execute_batch for several",
            n
        ))),
    }
}

fn check_params(info: &StatementInfo, param_count: usize) -> Result<()> {
    if info.placeholders != param_count {
        return Err(Error::Programming(format!(
            "statement expects {} parameter(s), {} given",
            info.placeholders, param_count
        )));
    }
    Ok(())
}

/// Quote an SQL identifier (savepoint names and the like).
pub fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::Programming(format!("invalid identifier {:?}", name)));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}
