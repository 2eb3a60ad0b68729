//! PostgreSQL type encoding and decoding.
//!
//! Binary format is used for parameters and extended-protocol results; text
//! format only shows up in simple-query results.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const CIDR: Oid = Oid(650);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const MONEY: Oid = Oid(790);
    pub const MACADDR: Oid = Oid(829);
    pub const INET: Oid = Oid(869);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
///
/// Date/time values keep the server's representation: microseconds (or days
/// for `Date`) relative to 2000-01-01.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Decimal text of a NUMERIC value
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    Timestamp(i64),
    TimestampTz(i64),
    Date(i32),
    Time(i64),
    Json(String),
    /// Types without a dedicated decoder keep their raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
    data.get(..N)
        .and_then(|head| <[u8; N]>::try_from(head).ok())
        .filter(|_| data.len() == N || oid == Oid::TIMETZ)
        .ok_or_else(|| {
            PgError::Type(format!(
                "Invalid length {} for type oid {}",
                data.len(),
                oid.as_i32()
            ))
        })
}

fn utf8(data: &[u8], what: &str) -> PgResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", what, e)))
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Numeric(v) => encode_numeric(v),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) | PgValue::Time(v) => {
                v.to_be_bytes().to_vec()
            }
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // JSONB binary format: version byte then text
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            // Let the server infer the type of a bare NULL
            PgValue::Null => Oid(0),
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        Ok(match oid {
            Oid::BOOL => PgValue::Bool(fixed::<1>(oid, data)?[0] != 0),
            Oid::INT2 => PgValue::Int2(i16::from_be_bytes(fixed(oid, data)?)),
            Oid::INT4 => PgValue::Int4(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::OID_TYPE => PgValue::Int8(u32::from_be_bytes(fixed(oid, data)?) as i64),
            Oid::INT8 => PgValue::Int8(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(fixed(oid, data)?)),
            Oid::NUMERIC => PgValue::Numeric(decode_numeric(data)?),
            _ if oid.is_text_like() => PgValue::Text(utf8(data, "TEXT")?),
            Oid::BYTEA => PgValue::Bytea(data.to_vec()),
            Oid::UUID => PgValue::Uuid(fixed(oid, data)?),
            Oid::TIMESTAMP => PgValue::Timestamp(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::TIMESTAMPTZ => PgValue::TimestampTz(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::DATE => PgValue::Date(i32::from_be_bytes(fixed(oid, data)?)),
            // TIMETZ carries a trailing zone offset we do not keep
            Oid::TIME | Oid::TIMETZ => PgValue::Time(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::JSON => PgValue::Json(utf8(data, "JSON")?),
            Oid::JSONB => PgValue::Json(utf8(data.get(1..).unwrap_or_default(), "JSONB")?),
            _ => PgValue::Raw {
                oid,
                data: data.to_vec(),
            },
        })
    }

    /// Decode from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = String::from_utf8_lossy(data).into_owned();
        let invalid = |e: &dyn std::fmt::Display| {
            PgError::Type(format!("Invalid text value for oid {}: {}", oid.as_i32(), e))
        };

        Ok(match oid {
            Oid::BOOL => PgValue::Bool(matches!(text.as_str(), "t" | "true" | "1")),
            Oid::INT2 => PgValue::Int2(text.parse().map_err(|e| invalid(&e))?),
            Oid::INT4 => PgValue::Int4(text.parse().map_err(|e| invalid(&e))?),
            Oid::INT8 | Oid::OID_TYPE => PgValue::Int8(text.parse().map_err(|e| invalid(&e))?),
            Oid::FLOAT4 => PgValue::Float4(text.parse().map_err(|e| invalid(&e))?),
            Oid::FLOAT8 => PgValue::Float8(text.parse().map_err(|e| invalid(&e))?),
            Oid::NUMERIC => PgValue::Numeric(text),
            Oid::UUID => {
                let uuid = uuid::Uuid::parse_str(&text).map_err(|e| invalid(&e))?;
                PgValue::Uuid(*uuid.as_bytes())
            }
            Oid::JSON | Oid::JSONB => PgValue::Json(text),
            Oid::BYTEA => match text.strip_prefix("\\x") {
                Some(hex) => PgValue::Bytea(decode_hex(hex).map_err(|e| invalid(&e))?),
                None => PgValue::Bytea(data.to_vec()),
            },
            // Everything else stays textual; `FromValue` parses on demand
            _ => PgValue::Text(text),
        })
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    if hex.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

// ============================================================================
// NUMERIC
// ============================================================================

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

/// Decode the binary NUMERIC representation (base-10000 digits) to decimal text.
fn decode_numeric(data: &[u8]) -> PgResult<String> {
    let header = |i: usize| -> PgResult<u16> {
        data.get(i..i + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| PgError::Type("Truncated NUMERIC".to_string()))
    };

    let ndigits = header(0)? as usize;
    let weight = header(2)? as i16 as i32;
    let sign = header(4)?;
    let dscale = header(6)? as usize;

    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }

    let digits = (0..ndigits)
        .map(|i| header(8 + i * 2))
        .collect::<PgResult<Vec<u16>>>()?;

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    // Integer part: digit groups with weight >= 0
    if weight < 0 {
        out.push('0');
    } else {
        for w in 0..=weight {
            let d = digits.get(w as usize).copied().unwrap_or(0);
            if w == 0 {
                out.push_str(&d.to_string());
            } else {
                out.push_str(&format!("{:04}", d));
            }
        }
    }

    if dscale > 0 {
        out.push('.');
        let mut frac = String::new();
        let mut idx = weight + 1;
        while frac.len() < dscale {
            let d = if idx < 0 {
                0
            } else {
                digits.get(idx as usize).copied().unwrap_or(0)
            };
            frac.push_str(&format!("{:04}", d));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push_str(&frac);
    }

    Ok(out)
}

/// Encode decimal text to the binary NUMERIC representation.
///
/// Invalid input encodes as NaN; the server will reject it where it matters.
fn encode_numeric(text: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    let valid = !(int_part.is_empty() && frac_part.is_empty())
        && int_part.chars().chain(frac_part.chars()).all(|c| c.is_ascii_digit());
    if !valid {
        for v in [0u16, 0, NUMERIC_NAN, 0] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        return out;
    }

    let int_part = int_part.trim_start_matches('0');
    let dscale = frac_part.len() as u16;

    // Left-pad the integer part and right-pad the fraction to multiples of 4
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let int_digits = format!("{}{}", "0".repeat(int_pad), int_part);
    let frac_digits = format!("{}{}", frac_part, "0".repeat(frac_pad));

    let group = |s: &str| -> Vec<u16> {
        s.as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).ok().and_then(|s| s.parse().ok()).unwrap_or(0))
            .collect()
    };

    let int_groups = group(&int_digits);
    let frac_groups = group(&frac_digits);
    let mut weight = int_groups.len() as i16 - 1;

    let mut digits: Vec<u16> = int_groups.into_iter().chain(frac_groups).collect();

    // Strip leading zero groups (adjusting weight) and trailing zero groups
    while digits.first() == Some(&0) {
        digits.remove(0);
        weight -= 1;
    }
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    let sign = if negative && !digits.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    };

    out.extend_from_slice(&(digits.len() as u16).to_be_bytes());
    out.extend_from_slice(&weight.to_be_bytes());
    out.extend_from_slice(&sign.to_be_bytes());
    out.extend_from_slice(&dscale.to_be_bytes());
    for d in digits {
        out.extend_from_slice(&d.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_int4_binary() {
        let decoded = PgValue::decode_binary(Oid::INT4, &12345i32.to_be_bytes()).unwrap();
        assert_eq!(decoded, PgValue::Int4(12345));
    }

    #[test]
    fn test_wrong_length_is_type_error() {
        let err = PgValue::decode_binary(Oid::INT8, &[0, 1, 2]).unwrap_err();
        assert!(matches!(err, PgError::Type(_)));
    }

    #[test]
    fn test_timestamptz_keeps_zone_flavor() {
        let data = 1_000_000i64.to_be_bytes();
        assert_eq!(
            PgValue::decode_binary(Oid::TIMESTAMPTZ, &data).unwrap(),
            PgValue::TimestampTz(1_000_000)
        );
        assert_eq!(PgValue::TimestampTz(0).type_oid(), Oid::TIMESTAMPTZ);
    }

    #[test]
    fn test_jsonb_strips_version_byte() {
        let mut data = vec![1u8];
        data.extend_from_slice(br#"{"a":1}"#);
        assert_eq!(
            PgValue::decode_binary(Oid::JSONB, &data).unwrap(),
            PgValue::Json(r#"{"a":1}"#.to_string())
        );
    }

    #[test]
    fn test_text_decoding() {
        assert_eq!(
            PgValue::decode_text(Oid::BOOL, b"t").unwrap(),
            PgValue::Bool(true)
        );
        assert_eq!(
            PgValue::decode_text(Oid::INT8, b"-42").unwrap(),
            PgValue::Int8(-42)
        );
        assert_eq!(
            PgValue::decode_text(Oid::BYTEA, b"\\xdeadbeef").unwrap(),
            PgValue::Bytea(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert!(PgValue::decode_text(Oid::INT4, b"abc").is_err());
    }

    #[test]
    fn test_numeric_decoding() {
        // 12345.678: ndigits=3, weight=1, sign=+, dscale=3, digits [1, 2345, 6780]
        let mut data = Vec::new();
        for v in [3u16, 1, 0, 3, 1, 2345, 6780] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(decode_numeric(&data).unwrap(), "12345.678");

        // -0.05: ndigits=1, weight=-1, sign=-, dscale=2, digits [500]
        let mut data = Vec::new();
        for v in [1u16, 0xFFFF, NUMERIC_NEG, 2, 500] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        assert_eq!(decode_numeric(&data).unwrap(), "-0.05");
    }

    #[test]
    fn test_numeric_encoding_matches_decoder() {
        for text in ["0", "1", "12345.678", "-0.05", "10000", "3.14159"] {
            let encoded = encode_numeric(text);
            assert_eq!(decode_numeric(&encoded).unwrap(), text, "value {text}");
        }
        assert_eq!(decode_numeric(&encode_numeric("abc")).unwrap(), "NaN");
    }
}
