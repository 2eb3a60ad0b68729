//! Conversions between column values and Rust types.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::pg::PgValue;

/// A single column value of a result row.
pub type DataValue = PgValue;

/// Unix time of the PostgreSQL epoch, 2000-01-01 00:00:00 UTC, in microseconds.
const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
/// `num_days_from_ce` of 2000-01-01.
const PG_EPOCH_CE_DAYS: i32 = 730_120;

/// Conversion out of a [`DataValue`].
pub trait FromValue: Sized {
    fn from_value(value: &DataValue) -> Result<Self>;
}

fn kind(value: &DataValue) -> &'static str {
    match value {
        PgValue::Null => "NULL",
        PgValue::Bool(_) => "bool",
        PgValue::Int2(_) => "int2",
        PgValue::Int4(_) => "int4",
        PgValue::Int8(_) => "int8",
        PgValue::Float4(_) => "float4",
        PgValue::Float8(_) => "float8",
        PgValue::Numeric(_) => "numeric",
        PgValue::Text(_) => "text",
        PgValue::Bytea(_) => "bytea",
        PgValue::Uuid(_) => "uuid",
        PgValue::Timestamp(_) => "timestamp",
        PgValue::TimestampTz(_) => "timestamptz",
        PgValue::Date(_) => "date",
        PgValue::Time(_) => "time",
        PgValue::Json(_) => "json",
        PgValue::Raw { .. } => "raw",
    }
}

fn mismatch<T>(value: &DataValue, target: &str) -> Result<T> {
    Err(Error::Type(format!(
        "cannot convert {} to {}",
        kind(value),
        target
    )))
}

fn parse<T: std::str::FromStr>(text: &str, target: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| Error::Type(format!("cannot parse {:?} as {}", text, target)))
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for DataValue {
    fn from_value(value: &DataValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Bool(b) => Ok(*b),
            PgValue::Text(s) => match s.as_str() {
                "t" | "true" => Ok(true),
                "f" | "false" => Ok(false),
                _ => parse(s, "bool"),
            },
            other => mismatch(other, "bool"),
        }
    }
}

macro_rules! integer_from_value {
    ($($ty:ty),*) => {$(
        impl FromValue for $ty {
            fn from_value(value: &DataValue) -> Result<Self> {
                let wide: i64 = match value {
                    PgValue::Int2(v) => i64::from(*v),
                    PgValue::Int4(v) => i64::from(*v),
                    PgValue::Int8(v) => *v,
                    PgValue::Text(s) | PgValue::Numeric(s) => return parse(s, stringify!($ty)),
                    other => return mismatch(other, stringify!($ty)),
                };
                <$ty>::try_from(wide).map_err(|_| {
                    Error::Type(format!("{} out of range for {}", wide, stringify!($ty)))
                })
            }
        }
    )*};
}

integer_from_value!(i16, i32, i64, u32, u64);

impl FromValue for f64 {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(f64::from(*v)),
            PgValue::Float8(v) => Ok(*v),
            PgValue::Int2(v) => Ok(f64::from(*v)),
            PgValue::Int4(v) => Ok(f64::from(*v)),
            PgValue::Int8(v) => Ok(*v as f64),
            PgValue::Numeric(s) | PgValue::Text(s) => parse(s, "f64"),
            other => mismatch(other, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Float4(v) => Ok(*v),
            other => f64::from_value(other).map(|v| v as f32),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Text(s) | PgValue::Json(s) | PgValue::Numeric(s) => Ok(s.clone()),
            PgValue::Uuid(u) => Ok(uuid::Uuid::from_bytes(*u).to_string()),
            PgValue::Bool(b) => Ok(b.to_string()),
            PgValue::Int2(v) => Ok(v.to_string()),
            PgValue::Int4(v) => Ok(v.to_string()),
            PgValue::Int8(v) => Ok(v.to_string()),
            PgValue::Float4(v) => Ok(v.to_string()),
            PgValue::Float8(v) => Ok(v.to_string()),
            PgValue::Null | PgValue::Bytea(_) | PgValue::Raw { .. } => mismatch(value, "String"),
            PgValue::Timestamp(_) | PgValue::TimestampTz(_) | PgValue::Date(_) | PgValue::Time(_) => {
                match to_json(value) {
                    JsonValue::String(s) => Ok(s),
                    _ => mismatch(value, "String"),
                }
            }
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Bytea(b) | PgValue::Raw { data: b, .. } => Ok(b.clone()),
            other => mismatch(other, "Vec<u8>"),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Uuid(u) => Ok(uuid::Uuid::from_bytes(*u)),
            PgValue::Text(s) => uuid::Uuid::parse_str(s)
                .map_err(|e| Error::Type(format!("invalid uuid {:?}: {}", s, e))),
            other => mismatch(other, "Uuid"),
        }
    }
}

impl FromValue for JsonValue {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Json(s) => {
                serde_json::from_str(s).map_err(|e| Error::Type(format!("invalid json: {}", e)))
            }
            other => Ok(to_json(other)),
        }
    }
}

fn micros_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    let unix = micros.checked_add(PG_EPOCH_UNIX_MICROS)?;
    let secs = unix.div_euclid(1_000_000);
    let nanos = (unix.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn days_to_date(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(PG_EPOCH_CE_DAYS)?)
}

fn micros_to_time(micros: i64) -> Option<NaiveTime> {
    let secs = u32::try_from(micros.div_euclid(1_000_000)).ok()?;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
}

fn out_of_range<T>(value: &DataValue) -> Result<T> {
    Err(Error::Type(format!("{} value out of range", kind(value))))
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::TimestampTz(m) | PgValue::Timestamp(m) => {
                micros_to_utc(*m).map_or_else(|| out_of_range(value), Ok)
            }
            PgValue::Text(s) => DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
                .or_else(|_| DateTime::parse_from_rfc3339(s))
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| Error::Type(format!("cannot parse {:?} as timestamptz", s))),
            other => mismatch(other, "DateTime<Utc>"),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Timestamp(m) | PgValue::TimestampTz(m) => micros_to_utc(*m)
                .map(|dt| dt.naive_utc())
                .map_or_else(|| out_of_range(value), Ok),
            PgValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| Error::Type(format!("cannot parse {:?} as timestamp", s))),
            other => mismatch(other, "NaiveDateTime"),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Date(d) => days_to_date(*d).map_or_else(|| out_of_range(value), Ok),
            PgValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| Error::Type(format!("cannot parse {:?} as date", s))),
            other => mismatch(other, "NaiveDate"),
        }
    }
}

impl FromValue for NaiveTime {
    fn from_value(value: &DataValue) -> Result<Self> {
        match value {
            PgValue::Time(m) => micros_to_time(*m).map_or_else(|| out_of_range(value), Ok),
            PgValue::Text(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map_err(|_| Error::Type(format!("cannot parse {:?} as time", s))),
            other => mismatch(other, "NaiveTime"),
        }
    }
}

/// JSON rendering of a value.
///
/// NUMERIC stays a string to keep its precision; binary data is
/// rendered as `\x`-prefixed hex like the server's text output.
pub fn to_json(value: &DataValue) -> JsonValue {
    match value {
        PgValue::Null => JsonValue::Null,
        PgValue::Bool(b) => JsonValue::Bool(*b),
        PgValue::Int2(v) => JsonValue::from(*v),
        PgValue::Int4(v) => JsonValue::from(*v),
        PgValue::Int8(v) => JsonValue::from(*v),
        PgValue::Float4(v) => float_json(f64::from(*v)),
        PgValue::Float8(v) => float_json(*v),
        PgValue::Numeric(s) | PgValue::Text(s) => JsonValue::String(s.clone()),
        PgValue::Uuid(u) => JsonValue::String(uuid::Uuid::from_bytes(*u).to_string()),
        PgValue::Json(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone()))
        }
        PgValue::Bytea(b) | PgValue::Raw { data: b, .. } => JsonValue::String(hex(b)),
        PgValue::Timestamp(m) => micros_to_utc(*m).map_or(JsonValue::Null, |dt| {
            JsonValue::String(dt.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }),
        PgValue::TimestampTz(m) => micros_to_utc(*m).map_or(JsonValue::Null, |dt| {
            JsonValue::String(dt.to_rfc3339())
        }),
        PgValue::Date(d) => days_to_date(*d).map_or(JsonValue::Null, |d| {
            JsonValue::String(d.format("%Y-%m-%d").to_string())
        }),
        PgValue::Time(m) => micros_to_time(*m).map_or(JsonValue::Null, |t| {
            JsonValue::String(t.format("%H:%M:%S%.f").to_string())
        }),
    }
}

fn float_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

// Parameters

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<$ty> for PgValue {
            fn from(v: $ty) -> Self {
                PgValue::$variant(v.into())
            }
        }
    )*};
}

value_from!(
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
);

impl From<uuid::Uuid> for PgValue {
    fn from(u: uuid::Uuid) -> Self {
        PgValue::Uuid(*u.as_bytes())
    }
}

impl From<JsonValue> for PgValue {
    fn from(v: JsonValue) -> Self {
        PgValue::Json(v.to_string())
    }
}

impl From<DateTime<Utc>> for PgValue {
    fn from(dt: DateTime<Utc>) -> Self {
        PgValue::TimestampTz(dt.timestamp_micros() - PG_EPOCH_UNIX_MICROS)
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(dt: NaiveDateTime) -> Self {
        PgValue::Timestamp(dt.and_utc().timestamp_micros() - PG_EPOCH_UNIX_MICROS)
    }
}

impl From<NaiveDate> for PgValue {
    fn from(d: NaiveDate) -> Self {
        PgValue::Date(d.num_days_from_ce() - PG_EPOCH_CE_DAYS)
    }
}

impl From<NaiveTime> for PgValue {
    fn from(t: NaiveTime) -> Self {
        let micros = i64::from(t.num_seconds_from_midnight()) * 1_000_000
            + i64::from(t.nanosecond() / 1_000);
        PgValue::Time(micros)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}

/// Build a parameter list from heterogeneous values.
///
/// ```
/// let params = pgstrand::params![1i32, "two", None::<i64>];
/// assert_eq!(params.len(), 3);
/// ```
#[macro_export]
macro_rules! params {
    () => { ::std::vec::Vec::<$crate::pg::PgValue>::new() };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::pg::PgValue::from($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widening_and_range() {
        assert_eq!(i64::from_value(&PgValue::Int2(7)).unwrap(), 7);
        assert_eq!(i32::from_value(&PgValue::Int8(42)).unwrap(), 42);
        assert!(matches!(
            i16::from_value(&PgValue::Int8(1 << 40)),
            Err(Error::Type(_))
        ));
        assert_eq!(i64::from_value(&PgValue::Text("12".into())).unwrap(), 12);
        assert!(i32::from_value(&PgValue::Bool(true)).is_err());
    }

    #[test]
    fn test_option_maps_null() {
        assert_eq!(Option::<i32>::from_value(&PgValue::Null).unwrap(), None);
        assert_eq!(
            Option::<i32>::from_value(&PgValue::Int4(3)).unwrap(),
            Some(3)
        );
        assert!(i32::from_value(&PgValue::Null).is_err());
    }

    #[test]
    fn test_epoch_conversions() {
        let date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert_eq!(PgValue::from(date), PgValue::Date(0));
        assert_eq!(NaiveDate::from_value(&PgValue::Date(0)).unwrap(), date);
        assert_eq!(
            NaiveDate::from_value(&PgValue::Date(-1)).unwrap(),
            NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()
        );

        let ts = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(12, 30, 0, 250)
            .unwrap();
        let value = PgValue::from(ts);
        assert_eq!(NaiveDateTime::from_value(&value).unwrap(), ts);

        let utc = ts.and_utc();
        let value = PgValue::from(utc);
        assert!(matches!(value, PgValue::TimestampTz(_)));
        assert_eq!(DateTime::<Utc>::from_value(&value).unwrap(), utc);
        assert_eq!(DateTime::<Utc>::from_value(&value).unwrap().year(), 2024);

        let t = NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap();
        assert_eq!(NaiveTime::from_value(&PgValue::from(t)).unwrap(), t);
    }

    #[test]
    fn test_text_forms_from_simple_protocol() {
        assert_eq!(
            NaiveDate::from_value(&PgValue::Text("2023-05-06".into())).unwrap(),
            NaiveDate::from_ymd_opt(2023, 5, 6).unwrap()
        );
        let dt = DateTime::<Utc>::from_value(&PgValue::Text("2023-05-06 07:08:09.5+00".into()))
            .unwrap();
        assert_eq!(dt.timestamp_subsec_millis(), 500);
        assert!(bool::from_value(&PgValue::Text("t".into())).unwrap());
    }

    #[test]
    fn test_uuid_and_json() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(uuid::Uuid::from_value(&PgValue::from(id)).unwrap(), id);
        assert_eq!(
            String::from_value(&PgValue::from(id)).unwrap(),
            id.to_string()
        );

        let doc = serde_json::json!({"a": [1, 2]});
        let value = PgValue::from(doc.clone());
        assert_eq!(JsonValue::from_value(&value).unwrap(), doc);
    }

    #[test]
    fn test_to_json_rendering() {
        assert_eq!(to_json(&PgValue::Null), JsonValue::Null);
        assert_eq!(to_json(&PgValue::Int8(5)), serde_json::json!(5));
        assert_eq!(to_json(&PgValue::Float8(f64::NAN)), JsonValue::Null);
        assert_eq!(
            to_json(&PgValue::Numeric("12.340".into())),
            serde_json::json!("12.340")
        );
        assert_eq!(
            to_json(&PgValue::Bytea(vec![0xde, 0xad])),
            serde_json::json!("\\xdead")
        );
        assert_eq!(to_json(&PgValue::Date(0)), serde_json::json!("2000-01-01"));
    }

    #[test]
    fn test_params_macro() {
        let params = crate::params![1i32, "two", None::<i64>, 2.5f64];
        assert_eq!(
            params,
            vec![
                PgValue::Int4(1),
                PgValue::Text("two".into()),
                PgValue::Null,
                PgValue::Float8(2.5),
            ]
        );
        assert!(crate::params![].is_empty());
    }
}
