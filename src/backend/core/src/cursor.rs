//! Cursor codec: durable encoding of a resume position.
//!
//! A cursor is either a single scalar or an ordered tuple of cursors. It encodes to a JSON
//! value so it can ride along in a job payload:
//! - A 1-tuple encodes as the bare scalar, any other arity as an array
//! - Timestamps encode as fixed-precision UTC strings (`2024-01-02T03:04:05.123456Z`) so
//!   sub-second ordering survives the round-trip
//! - `null` means "start from the beginning"
//!
//! Cursors can also travel as opaque URL-safe tokens via [`Cursor::to_token`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{IterationError, Result};

/// Canonical timestamp encoding, microsecond precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

const TIMESTAMP_LEN: usize = "2000-01-01T00:00:00.000000Z".len();

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor Value
// ═══════════════════════════════════════════════════════════════════════════════

/// A scalar stored in a cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorValue {
    /// Null value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Integer value (i64).
    Integer(i64),
    /// Floating point value. NaN and the infinities have no JSON form and encode as null.
    Float(f64),
    /// String value. UUIDs are carried as strings.
    ///
    /// A string spelled exactly like [`TIMESTAMP_FORMAT`] reads back as a
    /// [`CursorValue::Timestamp`]. [`CursorValue::from_column`] makes the same call for row
    /// values, so keyset comparisons see one type on both sides.
    String(String),
    /// Timestamp, always truncated to microseconds.
    Timestamp(DateTime<Utc>),
}

impl CursorValue {
    /// Create a timestamp value, truncating to microsecond precision.
    pub fn timestamp(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts.trunc_subsecs(6))
    }

    /// Encode this scalar to its JSON transport form.
    ///
    /// Non-finite floats encode as `null`, which decodes as [`CursorValue::Null`].
    pub fn encode(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::Timestamp(ts) => Value::String(format_timestamp(ts)),
        }
    }

    /// Decode a scalar from its JSON transport form.
    ///
    /// Strings in the canonical timestamp format decode as timestamps, whichever variant
    /// produced them.
    pub fn decode(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Boolean(*b)),
            Value::Number(n) => Ok(number_value(n)),
            Value::String(s) => Ok(parse_canonical_timestamp(s)
                .map(Self::Timestamp)
                .unwrap_or_else(|| Self::String(s.clone()))),
            Value::Array(_) | Value::Object(_) => Err(IterationError::invalid_cursor(format!(
                "expected a scalar cursor value, got {}",
                value
            ))),
        }
    }

    /// Extract a scalar from a row column.
    ///
    /// Besides the canonical form, RFC 3339 timestamps and offset-less ISO 8601 timestamps
    /// (read as UTC) are recognised. Returns `None` for nested JSON structures.
    pub fn from_column(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(
                parse_canonical_timestamp(s)
                    .or_else(|| {
                        DateTime::parse_from_rfc3339(s)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc).trunc_subsecs(6))
                    })
                    .or_else(|| {
                        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                            .ok()
                            .map(|naive| naive.and_utc().trunc_subsecs(6))
                    })
                    .map(Self::Timestamp)
                    .unwrap_or_else(|| Self::String(s.clone())),
            ),
            Value::Array(_) | Value::Object(_) => None,
            other => Self::decode(other).ok(),
        }
    }

    /// Compare two scalars of compatible types.
    ///
    /// Integers and floats compare numerically. Mismatched types yield `None`.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => (*a as f64).partial_cmp(b),
            (Self::Float(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Check whether this is the null scalar.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

fn number_value(n: &serde_json::Number) -> CursorValue {
    match n.as_i64() {
        Some(i) => CursorValue::Integer(i),
        None => CursorValue::Float(n.as_f64().unwrap_or(f64::NAN)),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_canonical_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.len() != TIMESTAMP_LEN || !s.ends_with('Z') {
        return None;
    }
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

macro_rules! cursor_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for CursorValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }

            impl From<$ty> for Cursor {
                fn from(v: $ty) -> Self {
                    Self::Value(CursorValue::from(v))
                }
            }
        )*
    };
}

cursor_value_from! {
    bool => Boolean,
    i32 => Integer,
    i64 => Integer,
    u32 => Integer,
    f64 => Float,
    String => String,
    &str => String,
}

impl From<DateTime<Utc>> for CursorValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::timestamp(ts)
    }
}

impl From<DateTime<Utc>> for Cursor {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Value(CursorValue::timestamp(ts))
    }
}

impl From<uuid::Uuid> for CursorValue {
    fn from(id: uuid::Uuid) -> Self {
        Self::String(id.to_string())
    }
}

impl From<uuid::Uuid> for Cursor {
    fn from(id: uuid::Uuid) -> Self {
        Self::Value(CursorValue::from(id))
    }
}

impl From<CursorValue> for Cursor {
    fn from(value: CursorValue) -> Self {
        Self::Value(value)
    }
}

impl From<Vec<CursorValue>> for Cursor {
    fn from(values: Vec<CursorValue>) -> Self {
        Self::from_tuple(values)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor
// ═══════════════════════════════════════════════════════════════════════════════

/// A position in an enumerator source.
///
/// `Value` is a scalar (the degenerate 1-tuple). `List` is an ordered tuple whose slots may
/// themselves be tuples, which is how nested enumerators carry one slot per level.
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    Value(CursorValue),
    List(Vec<Cursor>),
}

impl Cursor {
    /// The null cursor.
    pub fn null() -> Self {
        Self::Value(CursorValue::Null)
    }

    /// Cursor for a 0-based offset.
    pub fn index(offset: u64) -> Self {
        Self::Value(CursorValue::Integer(offset as i64))
    }

    /// Build a cursor from tuple values; a 1-tuple collapses to the bare scalar.
    pub fn from_tuple(mut values: Vec<CursorValue>) -> Self {
        if values.len() == 1 {
            Self::Value(values.remove(0))
        } else {
            Self::List(values.into_iter().map(Self::Value).collect())
        }
    }

    /// Build a composite cursor from per-level slots. `None` slots encode as null.
    ///
    /// A single slot collapses to the slot itself, matching the 1-tuple rule.
    pub fn from_slots(slots: Vec<Option<Cursor>>) -> Self {
        let mut cursors: Vec<Cursor> = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(Self::null))
            .collect();
        if cursors.len() == 1 {
            cursors.remove(0)
        } else {
            Self::List(cursors)
        }
    }

    /// Check whether this is the null cursor.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Value(CursorValue::Null))
    }

    /// Split this cursor into a tuple of exactly `arity` scalars.
    pub fn into_tuple(self, arity: usize) -> Result<Vec<CursorValue>> {
        match self {
            Self::Value(value) if arity == 1 => Ok(vec![value]),
            Self::Value(_) => Err(IterationError::cursor_arity_mismatch(arity, 1)),
            Self::List(items) => {
                if items.len() != arity {
                    return Err(IterationError::cursor_arity_mismatch(arity, items.len()));
                }
                items
                    .into_iter()
                    .map(|item| match item {
                        Self::Value(value) => Ok(value),
                        Self::List(_) => Err(IterationError::invalid_cursor(
                            "tuple cursor slots must be scalars",
                        )),
                    })
                    .collect()
            }
        }
    }

    /// Split a composite cursor into `levels` slots; null slots become `None`.
    pub fn into_slots(self, levels: usize) -> Result<Vec<Option<Cursor>>> {
        let to_slot = |cursor: Cursor| if cursor.is_null() { None } else { Some(cursor) };

        if levels == 1 {
            return Ok(vec![to_slot(self)]);
        }
        match self {
            Self::List(items) if items.len() == levels => Ok(items.into_iter().map(to_slot).collect()),
            Self::List(items) => Err(IterationError::cursor_arity_mismatch(levels, items.len())),
            Self::Value(_) => Err(IterationError::cursor_arity_mismatch(levels, 1)),
        }
    }

    /// Interpret this cursor as a non-negative offset.
    pub fn as_index(&self) -> Result<u64> {
        match self {
            Self::Value(CursorValue::Integer(i)) if *i >= 0 => Ok(*i as u64),
            other => Err(IterationError::invalid_cursor(format!(
                "expected a non-negative integer offset, got {}",
                other
            ))),
        }
    }

    /// Encode to the JSON transport form.
    pub fn encode(&self) -> Value {
        match self {
            Self::Value(value) => value.encode(),
            Self::List(items) => Value::Array(items.iter().map(Self::encode).collect()),
        }
    }

    /// Decode from the JSON transport form.
    pub fn decode(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(Self::decode)
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            scalar => CursorValue::decode(scalar).map(Self::Value),
        }
    }

    /// Decode an optional cursor; JSON null means "no cursor".
    pub fn decode_optional(value: &Value) -> Result<Option<Self>> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::decode(value).map(Some)
        }
    }

    /// Encode a tuple of scalars directly.
    pub fn encode_tuple(values: &[CursorValue]) -> Value {
        match values {
            [single] => single.encode(),
            many => Value::Array(many.iter().map(CursorValue::encode).collect()),
        }
    }

    /// Decode a serialized tuple of the given arity.
    pub fn decode_tuple(value: &Value, arity: usize) -> Result<Vec<CursorValue>> {
        Self::decode(value)?.into_tuple(arity)
    }

    /// Encode as an opaque, URL-safe token.
    pub fn to_token(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.encode().to_string())
    }

    /// Decode an opaque token produced by [`Cursor::to_token`].
    pub fn from_token(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| IterationError::invalid_cursor(format!("invalid cursor token: {}", e)))?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Self::decode(&value)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.encode().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::decode(&value).map_err(|e| serde::de::Error::custom(e.user_message().to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
