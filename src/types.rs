//! Core type aliases and value types.
//!
//! This module defines the foundational types used throughout the engine:
//! page and row identifiers, the declared column kinds, and the dynamic
//! [`Value`] that flows between the SQL surface and the row codec.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page index within the database file (0-based; page 0 is the header page).
pub type PageId = u32;

/// Implicit clustered row identifier (unsigned 64-bit).
pub type RowId = u64;

/// Transaction identifier.
pub type TxnId = u64;

/// Fixed size of every page in the database file.
pub const PAGE_SIZE: usize = 4096;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the zero point
/// of the TIMESTAMP column kind.
pub const TIMESTAMP_EPOCH_UNIX_SECS: i64 = 946_684_800;

// ============================================================================
// Column Kinds
// ============================================================================

/// Declared column kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 1 byte, 0x00 or 0x01.
    Boolean,
    /// 4 bytes, two's complement little-endian.
    Int4,
    /// 8 bytes, two's complement little-endian.
    Int8,
    /// 4 bytes, IEEE-754 single precision.
    Real,
    /// 8 bytes, IEEE-754 double precision.
    Double,
    /// 8 bytes, signed microseconds from 2000-01-01T00:00:00Z.
    Timestamp,
    /// Variable length text with a declared maximum of `n` bytes (n <= 255).
    Varchar(u16),
    /// Variable length text, spilled to overflow pages past the inline cap.
    Text,
}

impl DataType {
    /// Fixed encoded width for scalar kinds; `None` for text kinds.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            DataType::Boolean => Some(1),
            DataType::Int4 | DataType::Real => Some(4),
            DataType::Int8 | DataType::Double | DataType::Timestamp => Some(8),
            DataType::Varchar(_) | DataType::Text => None,
        }
    }

    /// True for VARCHAR and TEXT.
    pub fn is_text(&self) -> bool {
        matches!(self, DataType::Varchar(_) | DataType::Text)
    }

    /// True for kinds usable as a PRIMARY KEY column.
    pub fn is_primary_key_capable(&self) -> bool {
        match self {
            DataType::Text => false,
            DataType::Varchar(n) => *n <= 255,
            _ => true,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Int4 => write!(f, "INT4"),
            DataType::Int8 => write!(f, "INT8"),
            DataType::Real => write!(f, "REAL"),
            DataType::Double => write!(f, "DOUBLE"),
            DataType::Timestamp => write!(f, "TIMESTAMP"),
            DataType::Varchar(n) => write!(f, "VARCHAR({})", n),
            DataType::Text => write!(f, "TEXT"),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// Handle to a text value whose tail lives in an overflow chain.
///
/// The row codec stores long text as a pointer cell: total byte length, the
/// first overflow page, and an inline prefix. The chain is resolved lazily
/// when the value is read for output.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRef {
    /// Total byte length of the full text value.
    pub len: u64,
    /// First page of the overflow chain.
    pub first_page: PageId,
    /// Inline prefix bytes (raw, may end mid code point).
    pub prefix: Vec<u8>,
}

/// Dynamic value for one column slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Int4(i32),
    Int8(i64),
    Real(f32),
    Double(f64),
    /// Signed microseconds from 2000-01-01T00:00:00Z.
    Timestamp(i64),
    Text(String),
    /// Long text stored out of line; see [`TextRef`].
    TextRef(TextRef),
}

impl Value {
    /// Check if value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column kind this value naturally carries, if any.
    pub fn natural_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int4(_) => Some(DataType::Int4),
            Value::Int8(_) => Some(DataType::Int8),
            Value::Real(_) => Some(DataType::Real),
            Value::Double(_) => Some(DataType::Double),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Text(_) | Value::TextRef(_) => Some(DataType::Text),
        }
    }

    /// Coerce this value to the declared kind of a column.
    ///
    /// Coercion is strict: integers narrow only when they fit, text never
    /// converts to numbers, and VARCHAR enforces its declared maximum.
    /// Timestamps additionally accept RFC 3339 / `YYYY-MM-DD HH:MM:SS` text.
    pub fn coerce_to(&self, kind: DataType) -> Result<Value> {
        match (self, kind) {
            (Value::Null, _) => Ok(Value::Null),
            (Value::Boolean(b), DataType::Boolean) => Ok(Value::Boolean(*b)),
            (Value::Int4(v), DataType::Int4) => Ok(Value::Int4(*v)),
            (Value::Int4(v), DataType::Int8) => Ok(Value::Int8(*v as i64)),
            (Value::Int8(v), DataType::Int8) => Ok(Value::Int8(*v)),
            (Value::Int8(v), DataType::Int4) => {
                i32::try_from(*v).map(Value::Int4).map_err(|_| {
                    Error::TypeMismatch(format!("integer {} does not fit in INT4", v))
                })
            }
            (Value::Int4(v), DataType::Real) => Ok(Value::Real(*v as f32)),
            (Value::Int4(v), DataType::Double) => Ok(Value::Double(*v as f64)),
            (Value::Int8(v), DataType::Real) => Ok(Value::Real(*v as f32)),
            (Value::Int8(v), DataType::Double) => Ok(Value::Double(*v as f64)),
            (Value::Real(v), DataType::Real) => Ok(Value::Real(*v)),
            (Value::Real(v), DataType::Double) => Ok(Value::Double(*v as f64)),
            (Value::Double(v), DataType::Double) => Ok(Value::Double(*v)),
            (Value::Double(v), DataType::Real) => Ok(Value::Real(*v as f32)),
            (Value::Timestamp(v), DataType::Timestamp) => Ok(Value::Timestamp(*v)),
            (Value::Int8(v), DataType::Timestamp) => Ok(Value::Timestamp(*v)),
            (Value::Text(s), DataType::Timestamp) => parse_timestamp(s),
            (Value::Text(s), DataType::Varchar(n)) => {
                if s.len() > n as usize {
                    Err(Error::TypeMismatch(format!(
                        "text of {} bytes exceeds VARCHAR({})",
                        s.len(),
                        n
                    )))
                } else {
                    Ok(Value::Text(s.clone()))
                }
            }
            (Value::Text(s), DataType::Text) => Ok(Value::Text(s.clone())),
            (Value::TextRef(r), DataType::Text) => Ok(Value::TextRef(r.clone())),
            (v, kind) => Err(Error::TypeMismatch(format!(
                "cannot store {} into {} column",
                v.kind_name(),
                kind
            ))),
        }
    }

    /// Short human-readable name of the value's kind, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Int4(_) => "INT4",
            Value::Int8(_) => "INT8",
            Value::Real(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Text(_) | Value::TextRef(_) => "TEXT",
        }
    }

    /// Interpret the value as an unsigned row id.
    pub fn as_row_id(&self) -> Option<RowId> {
        match self {
            Value::Int4(v) if *v >= 0 => Some(*v as RowId),
            Value::Int8(v) if *v >= 0 => Some(*v as RowId),
            _ => None,
        }
    }

    /// The value rendered for display in query output.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".into(),
            Value::Boolean(b) => if *b { "true" } else { "false" }.into(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Timestamp(v) => format_timestamp(*v),
            Value::Text(s) => s.clone(),
            Value::TextRef(r) => format!("<text:{} bytes>", r.len),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int4(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int8(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Current wall-clock time as engine-epoch microseconds.
pub fn now_timestamp() -> i64 {
    let now: DateTime<Utc> = Utc::now();
    now.timestamp_micros() - TIMESTAMP_EPOCH_UNIX_SECS * 1_000_000
}

/// Render engine-epoch microseconds as an RFC 3339 string.
pub fn format_timestamp(micros: i64) -> String {
    let unix_micros = micros + TIMESTAMP_EPOCH_UNIX_SECS * 1_000_000;
    match Utc.timestamp_micros(unix_micros) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339(),
        _ => format!("<timestamp:{}us>", micros),
    }
}

/// Parse a text literal into a TIMESTAMP value.
fn parse_timestamp(s: &str) -> Result<Value> {
    let parsed = DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .map_err(|_| Error::TypeMismatch(format!("cannot parse '{}' as TIMESTAMP", s)))?;
    Ok(Value::Timestamp(
        parsed.timestamp_micros() - TIMESTAMP_EPOCH_UNIX_SECS * 1_000_000,
    ))
}

// ============================================================================
// Cancellation
// ============================================================================

/// Caller-supplied cancellation token.
///
/// Long-running operations check the token between B+ tree steps and between
/// produced rows; a set token surfaces as [`Error::Cancelled`] and leaves the
/// surrounding transaction un-committed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of operations observing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return `Err(Cancelled)` when the token is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_integer_widening_and_narrowing() {
        assert_eq!(
            Value::Int4(7).coerce_to(DataType::Int8).unwrap(),
            Value::Int8(7)
        );
        assert_eq!(
            Value::Int8(7).coerce_to(DataType::Int4).unwrap(),
            Value::Int4(7)
        );
        assert!(Value::Int8(i64::MAX).coerce_to(DataType::Int4).is_err());
    }

    #[test]
    fn test_coerce_text_rules() {
        assert_eq!(
            Value::from("abc").coerce_to(DataType::Varchar(3)).unwrap(),
            Value::Text("abc".into())
        );
        assert!(Value::from("abcd").coerce_to(DataType::Varchar(3)).is_err());
        assert!(Value::from("12").coerce_to(DataType::Int4).is_err());
    }

    #[test]
    fn test_null_coerces_to_anything() {
        assert_eq!(
            Value::Null.coerce_to(DataType::Boolean).unwrap(),
            Value::Null
        );
        assert_eq!(Value::Null.coerce_to(DataType::Text).unwrap(), Value::Null);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let v = parse_timestamp("2000-01-01 00:00:00").unwrap();
        assert_eq!(v, Value::Timestamp(0));
        let v = parse_timestamp("2000-01-01 00:00:01").unwrap();
        assert_eq!(v, Value::Timestamp(1_000_000));
    }

    #[test]
    fn test_as_row_id() {
        assert_eq!(Value::Int8(5).as_row_id(), Some(5));
        assert_eq!(Value::Int8(-1).as_row_id(), None);
        assert_eq!(Value::from("5").as_row_id(), None);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
