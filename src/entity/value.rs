// ABOUTME: Attribute values and entity identifiers shared by every store adapter
// ABOUTME: Coerces raw store values into the declared attribute type

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use super::schema::AttributeType;

/// Prefix of placeholder identifiers handed out for entities still in flight.
pub const PLACEHOLDER_PREFIX: &str = "temp_";

/// Primary key of an entity in one store.
///
/// Source and target stores have independent key spaces, so an `EntityId`
/// only means something together with the store it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Integer key (auto-increment columns).
    Int(i64),
    /// Textual key (UUIDs, natural keys, placeholders).
    Text(String),
}

impl EntityId {
    /// Parses a command-line identifier: integers stay integers, everything else is text.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => EntityId::Int(id),
            Err(_) => EntityId::Text(raw.trim().to_string()),
        }
    }

    /// Whether this is a placeholder issued by the identifier mapper.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, EntityId::Text(s) if s.starts_with(PLACEHOLDER_PREFIX))
    }

    /// Converts the identifier into an attribute value (for foreign keys).
    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(id) => Value::Integer(*id),
            EntityId::Text(id) => Value::Text(id.clone()),
        }
    }

    /// Reads an identifier out of a foreign key value. Returns `None` for NULL.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(id) => Some(EntityId::Int(*id)),
            Value::Text(id) => Some(EntityId::parse(id)),
            Value::Float(f) if f.fract() == 0.0 => Some(EntityId::Int(*f as i64)),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "{}", id),
            EntityId::Text(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        EntityId::Int(i64::from(id))
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Text(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::Text(id)
    }
}

impl From<uuid::Uuid> for EntityId {
    fn from(id: uuid::Uuid) -> Self {
        EntityId::Text(id.to_string())
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Nested structured value (JSON columns).
    Json(JsonValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Json(_) => "json",
        }
    }

    /// Coerces the value into the declared attribute type.
    ///
    /// Stores hand back loosely typed values (SQLite has no boolean or
    /// timestamp type, JSON arrives as text); this is where they become the
    /// type the schema declares. NULL passes through for every type.
    pub fn coerce(self, ty: AttributeType) -> Result<Value, String> {
        let mismatch = |v: &Value| format!("expected {}, got {}", ty, v.kind());

        match (ty, self) {
            (_, Value::Null) => Ok(Value::Null),

            (AttributeType::String, Value::Text(s)) => Ok(Value::Text(s)),
            (AttributeType::String, Value::Integer(i)) => Ok(Value::Text(i.to_string())),
            (AttributeType::String, Value::Float(f)) => Ok(Value::Text(f.to_string())),

            (AttributeType::Uuid, Value::Text(s)) => uuid::Uuid::parse_str(&s)
                .map(|u| Value::Text(u.to_string()))
                .map_err(|e| format!("invalid uuid '{}': {}", s, e)),

            (AttributeType::Integer, Value::Integer(i)) => Ok(Value::Integer(i)),
            (AttributeType::Integer, Value::Boolean(b)) => Ok(Value::Integer(i64::from(b))),
            (AttributeType::Integer, Value::Float(f)) if f.fract() == 0.0 => {
                Ok(Value::Integer(f as i64))
            }
            (AttributeType::Integer, Value::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("expected integer, got '{}'", s)),

            (AttributeType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (AttributeType::Float, Value::Integer(i)) => Ok(Value::Float(i as f64)),
            (AttributeType::Float, Value::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("expected float, got '{}'", s)),

            (AttributeType::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
            (AttributeType::Boolean, Value::Integer(i)) => Ok(Value::Boolean(i != 0)),
            (AttributeType::Boolean, Value::Text(s)) => match s.trim() {
                "1" | "true" | "t" => Ok(Value::Boolean(true)),
                "0" | "false" | "f" => Ok(Value::Boolean(false)),
                other => Err(format!("expected boolean, got '{}'", other)),
            },

            (AttributeType::Timestamp, Value::Timestamp(ts)) => Ok(Value::Timestamp(ts)),
            (AttributeType::Timestamp, Value::Text(s)) => parse_timestamp(&s)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("invalid timestamp '{}'", s)),
            (AttributeType::Timestamp, Value::Integer(secs)) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(Value::Timestamp)
                .ok_or_else(|| format!("timestamp {} out of range", secs)),

            (AttributeType::Json, Value::Json(j)) => Ok(Value::Json(j)),
            (AttributeType::Json, Value::Text(s)) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|e| format!("invalid json: {}", e)),
            (AttributeType::Json, Value::Integer(i)) => Ok(Value::Json(JsonValue::from(i))),
            (AttributeType::Json, Value::Boolean(b)) => Ok(Value::Json(JsonValue::Bool(b))),

            (_, other) => Err(mismatch(&other)),
        }
    }
}

/// Parses RFC 3339 timestamps and SQLite's `CURRENT_TIMESTAMP` format (UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<&EntityId> for Value {
    fn from(id: &EntityId) -> Self {
        id.to_value()
    }
}
