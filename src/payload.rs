use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::path::json_type_name;
use crate::property::number_value;

static COUNTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(INCREMENT|DECREMENT)(?:\s+(.*?))?\s*$").expect("counter pattern compiles")
});

/// Key the backend uses to mark server-side values.
pub const SERVER_VALUE_KEY: &str = ".sv";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PayloadError {
    #[error("invalid {kind} delta `{delta}`: expected a number")]
    InvalidDelta { kind: &'static str, delta: String },

    #[error("invalid type for {what}: {found}")]
    Type { what: &'static str, found: String },
}

/// The server-timestamp sentinel.
pub fn server_timestamp() -> Value {
    json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// The atomic-increment sentinel.
pub fn server_increment(delta: f64) -> Value {
    json!({ SERVER_VALUE_KEY: { "increment": number_value(delta).unwrap_or(Value::Null) } })
}

/// Rewrites `TIMESTAMP`, `INCREMENT n` and `DECREMENT n` strings anywhere in
/// a write payload into server-value sentinels. Everything else is copied.
pub fn normalize_payload(payload: &Value) -> Result<Value, PayloadError> {
    match payload {
        Value::String(s) => normalize_string(s),
        Value::Array(items) => items.iter().map(normalize_payload).collect::<Result<Vec<_>, _>>().map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), normalize_payload(v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn normalize_string(s: &str) -> Result<Value, PayloadError> {
    if s.trim() == "TIMESTAMP" {
        return Ok(server_timestamp());
    }
    let Some(caps) = COUNTER.captures(s) else {
        return Ok(Value::String(s.to_string()));
    };
    let kind = if &caps[1] == "INCREMENT" { "INCREMENT" } else { "DECREMENT" };
    let raw = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
    let delta: f64 = raw
        .parse()
        .ok()
        .filter(|d: &f64| d.is_finite())
        .ok_or_else(|| PayloadError::InvalidDelta { kind, delta: raw.to_string() })?;
    Ok(server_increment(if kind == "INCREMENT" { delta } else { -delta }))
}

/// Node priority as accepted by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Priority {
    Number(f64),
    String(String),
}

impl Priority {
    pub fn to_value(&self) -> Value {
        match self {
            Priority::Number(n) => number_value(*n).unwrap_or(Value::Null),
            Priority::String(s) => Value::String(s.clone()),
        }
    }
}

/// Parses a priority. Numeric strings become numbers, blank and `null`
/// clear the priority.
pub fn parse_priority(value: &Value) -> Result<Option<Priority>, PayloadError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64().map(Priority::Number)),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            match trimmed.parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Some(Priority::Number(n))),
                _ => Ok(Some(Priority::String(s.clone()))),
            }
        }
        other => Err(PayloadError::Type { what: "priority", found: json_type_name(other).to_string() }),
    }
}
