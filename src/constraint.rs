//! Query constraints: ordering, range and limit modifiers applied to a read
//! or a subscription.
//!
//! Constraints are persisted as a JSON object keyed by constraint kind. Each
//! payload carries typed fields that may be deferred references, so a set of
//! constraints is evaluated per request into an ordered list of [`QueryOp`]s.
//!
//! Payloads come in two persisted shapes. The current one nests the type
//! tags:
//!
//! ```json
//! { "startAt": { "value": "10", "child": "age", "types": { "value": "num", "child": "str" } } }
//! ```
//!
//! The legacy one is flat, with the child key stored under `key`:
//!
//! ```json
//! { "startAt": { "value": "10", "type": "num", "key": "age" } }
//! ```
//!
//! [`upcast_payload`] turns either shape (or a bare scalar) into the current
//! one and is idempotent.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::path::json_type_name;
use crate::property::{EvalError, PropertyScope, TypeTag, TypedValue};

/// The eleven query constraints. Declaration order is application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ConstraintKind {
    OrderByChild,
    OrderByKey,
    OrderByPriority,
    OrderByValue,
    StartAt,
    StartAfter,
    EndAt,
    EndBefore,
    EqualTo,
    LimitToFirst,
    LimitToLast,
}

impl ConstraintKind {
    pub fn is_order_by(self) -> bool {
        matches!(
            self,
            ConstraintKind::OrderByChild
                | ConstraintKind::OrderByKey
                | ConstraintKind::OrderByPriority
                | ConstraintKind::OrderByValue
        )
    }

    fn has_payload(self) -> bool {
        !matches!(
            self,
            ConstraintKind::OrderByKey | ConstraintKind::OrderByPriority | ConstraintKind::OrderByValue
        )
    }

    fn is_range(self) -> bool {
        matches!(
            self,
            ConstraintKind::StartAt
                | ConstraintKind::StartAfter
                | ConstraintKind::EndAt
                | ConstraintKind::EndBefore
                | ConstraintKind::EqualTo
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("constraints must be an object, got {0}")]
    NotAnObject(String),

    #[error("unknown constraint `{0}`")]
    UnknownKind(String),

    #[error("constraint `{0}` is given more than once")]
    Duplicate(ConstraintKind),

    #[error("invalid `{kind}` payload: {reason}")]
    Payload { kind: ConstraintKind, reason: String },

    #[error("`{kind}`: {source}")]
    Eval {
        kind: ConstraintKind,
        #[source]
        source: EvalError,
    },

    #[error("`{kind}` {field} must be {expected}, got {found}")]
    Type {
        kind: ConstraintKind,
        field: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("`{kind}` limit must be a positive integer, got {value}")]
    InvalidLimit { kind: ConstraintKind, value: String },
}

/// A bound for the range and equality constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    pub value: TypedValue,
    pub child: Option<TypedValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    OrderByChild(TypedValue),
    OrderByKey,
    OrderByPriority,
    OrderByValue,
    StartAt(RangeBound),
    StartAfter(RangeBound),
    EndAt(RangeBound),
    EndBefore(RangeBound),
    EqualTo(RangeBound),
    LimitToFirst(TypedValue),
    LimitToLast(TypedValue),
}

/// A resolved constraint, ready to be applied to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueryOp {
    OrderByChild { path: String },
    OrderByKey,
    OrderByPriority,
    OrderByValue,
    StartAt { value: Value, #[serde(skip_serializing_if = "Option::is_none")] key: Option<String> },
    StartAfter { value: Value, #[serde(skip_serializing_if = "Option::is_none")] key: Option<String> },
    EndAt { value: Value, #[serde(skip_serializing_if = "Option::is_none")] key: Option<String> },
    EndBefore { value: Value, #[serde(skip_serializing_if = "Option::is_none")] key: Option<String> },
    EqualTo { value: Value, #[serde(skip_serializing_if = "Option::is_none")] key: Option<String> },
    LimitToFirst { limit: u32 },
    LimitToLast { limit: u32 },
}

impl Constraint {
    pub fn kind(&self) -> ConstraintKind {
        match self {
            Constraint::OrderByChild(_) => ConstraintKind::OrderByChild,
            Constraint::OrderByKey => ConstraintKind::OrderByKey,
            Constraint::OrderByPriority => ConstraintKind::OrderByPriority,
            Constraint::OrderByValue => ConstraintKind::OrderByValue,
            Constraint::StartAt(_) => ConstraintKind::StartAt,
            Constraint::StartAfter(_) => ConstraintKind::StartAfter,
            Constraint::EndAt(_) => ConstraintKind::EndAt,
            Constraint::EndBefore(_) => ConstraintKind::EndBefore,
            Constraint::EqualTo(_) => ConstraintKind::EqualTo,
            Constraint::LimitToFirst(_) => ConstraintKind::LimitToFirst,
            Constraint::LimitToLast(_) => ConstraintKind::LimitToLast,
        }
    }

    /// Builds a constraint from a payload in any accepted shape.
    pub fn from_payload(kind: ConstraintKind, raw: &Value) -> Result<Self, ConstraintError> {
        let payload = upcast_payload(kind, raw)?;
        let value = || typed_field(kind, &payload, "value", "value");
        let child = || -> Option<TypedValue> {
            let raw = payload.get("child")?;
            let tag = payload
                .get("types")
                .and_then(|t| t.get("child"))
                .and_then(|t| serde_json::from_value(t.clone()).ok())
                .unwrap_or(TypeTag::Str);
            Some(TypedValue::new(raw.clone(), tag))
        };
        let range = || -> Result<RangeBound, ConstraintError> { Ok(RangeBound { value: value()?, child: child() }) };

        Ok(match kind {
            ConstraintKind::OrderByChild => Constraint::OrderByChild(value()?),
            ConstraintKind::OrderByKey => Constraint::OrderByKey,
            ConstraintKind::OrderByPriority => Constraint::OrderByPriority,
            ConstraintKind::OrderByValue => Constraint::OrderByValue,
            ConstraintKind::StartAt => Constraint::StartAt(range()?),
            ConstraintKind::StartAfter => Constraint::StartAfter(range()?),
            ConstraintKind::EndAt => Constraint::EndAt(range()?),
            ConstraintKind::EndBefore => Constraint::EndBefore(range()?),
            ConstraintKind::EqualTo => Constraint::EqualTo(range()?),
            ConstraintKind::LimitToFirst => Constraint::LimitToFirst(value()?),
            ConstraintKind::LimitToLast => Constraint::LimitToLast(value()?),
        })
    }

    /// True when any field of the constraint reads the in-flight message.
    pub fn needs_message(&self) -> bool {
        match self {
            Constraint::OrderByChild(v) | Constraint::LimitToFirst(v) | Constraint::LimitToLast(v) => v.needs_message(),
            Constraint::StartAt(b)
            | Constraint::StartAfter(b)
            | Constraint::EndAt(b)
            | Constraint::EndBefore(b)
            | Constraint::EqualTo(b) => b.value.needs_message() || b.child.as_ref().is_some_and(|c| c.needs_message()),
            Constraint::OrderByKey | Constraint::OrderByPriority | Constraint::OrderByValue => false,
        }
    }

    pub async fn evaluate(&self, scope: &PropertyScope<'_>) -> Result<QueryOp, ConstraintError> {
        let kind = self.kind();
        Ok(match self {
            Constraint::OrderByChild(child) => QueryOp::OrderByChild { path: eval_child(kind, child, scope).await? },
            Constraint::OrderByKey => QueryOp::OrderByKey,
            Constraint::OrderByPriority => QueryOp::OrderByPriority,
            Constraint::OrderByValue => QueryOp::OrderByValue,
            Constraint::StartAt(b) => {
                let (value, key) = eval_bound(kind, b, scope).await?;
                QueryOp::StartAt { value, key }
            }
            Constraint::StartAfter(b) => {
                let (value, key) = eval_bound(kind, b, scope).await?;
                QueryOp::StartAfter { value, key }
            }
            Constraint::EndAt(b) => {
                let (value, key) = eval_bound(kind, b, scope).await?;
                QueryOp::EndAt { value, key }
            }
            Constraint::EndBefore(b) => {
                let (value, key) = eval_bound(kind, b, scope).await?;
                QueryOp::EndBefore { value, key }
            }
            Constraint::EqualTo(b) => {
                let (value, key) = eval_bound(kind, b, scope).await?;
                QueryOp::EqualTo { value, key }
            }
            Constraint::LimitToFirst(v) => QueryOp::LimitToFirst { limit: eval_limit(kind, v, scope).await? },
            Constraint::LimitToLast(v) => QueryOp::LimitToLast { limit: eval_limit(kind, v, scope).await? },
        })
    }
}

fn typed_field(kind: ConstraintKind, payload: &Value, field: &str, tag_field: &str) -> Result<TypedValue, ConstraintError> {
    let value = payload.get(field).cloned().unwrap_or(Value::Null);
    let tag = payload
        .get("types")
        .and_then(|t| t.get(tag_field))
        .cloned()
        .ok_or_else(|| ConstraintError::Payload { kind, reason: format!("missing type for `{field}`") })?;
    let tag: TypeTag = serde_json::from_value(tag)
        .map_err(|e| ConstraintError::Payload { kind, reason: e.to_string() })?;
    Ok(TypedValue::new(value, tag))
}

async fn eval_child(kind: ConstraintKind, child: &TypedValue, scope: &PropertyScope<'_>) -> Result<String, ConstraintError> {
    match scope.evaluate(child).await.map_err(|source| ConstraintError::Eval { kind, source })? {
        Some(Value::String(s)) => Ok(s),
        other => Err(type_error(kind, "child", "a string", other.as_ref())),
    }
}

async fn eval_bound(
    kind: ConstraintKind,
    bound: &RangeBound,
    scope: &PropertyScope<'_>,
) -> Result<(Value, Option<String>), ConstraintError> {
    let value = match scope.evaluate(&bound.value).await.map_err(|source| ConstraintError::Eval { kind, source })? {
        Some(v @ (Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Null)) => v,
        other => return Err(type_error(kind, "value", "a boolean, number, string or null", other.as_ref())),
    };
    let key = match &bound.child {
        Some(child) => Some(eval_child(kind, child, scope).await?),
        None => None,
    };
    Ok((value, key))
}

async fn eval_limit(kind: ConstraintKind, value: &TypedValue, scope: &PropertyScope<'_>) -> Result<u32, ConstraintError> {
    let resolved = scope.evaluate(value).await.map_err(|source| ConstraintError::Eval { kind, source })?;
    let n = match &resolved {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        other => return Err(type_error(kind, "value", "a string or number", other.as_ref())),
    };
    match n {
        Some(n) if n.is_finite() && n >= 1.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) => Ok(n as u32),
        _ => Err(ConstraintError::InvalidLimit {
            kind,
            value: resolved.map(|v| v.to_string()).unwrap_or_default(),
        }),
    }
}

fn type_error(kind: ConstraintKind, field: &'static str, expected: &'static str, found: Option<&Value>) -> ConstraintError {
    ConstraintError::Type {
        kind,
        field,
        expected,
        found: found.map(json_type_name).unwrap_or("undefined").to_string(),
    }
}

fn infer_tag(value: &Value) -> TypeTag {
    match value {
        Value::Bool(_) => TypeTag::Bool,
        Value::Number(_) => TypeTag::Num,
        Value::Null => TypeTag::Null,
        _ => TypeTag::Str,
    }
}

/// Rewrites one constraint payload into the current shape.
///
/// Accepts the current shape, the legacy flat shape and bare scalars.
/// Payload-less kinds always upcast to `null`.
pub fn upcast_payload(kind: ConstraintKind, raw: &Value) -> Result<Value, ConstraintError> {
    if !kind.has_payload() {
        return Ok(Value::Null);
    }
    let obj = match raw {
        Value::Object(obj) => obj,
        Value::Array(_) => {
            return Err(ConstraintError::Payload { kind, reason: "expected an object or a scalar".into() });
        }
        scalar => {
            let mut types = Map::new();
            types.insert("value".into(), Value::String(infer_tag(scalar).to_string()));
            let mut out = Map::new();
            out.insert("value".into(), scalar.clone());
            out.insert("types".into(), Value::Object(types));
            return Ok(Value::Object(out));
        }
    };

    let value = obj.get("value").cloned().unwrap_or(Value::Null);
    let mut types = Map::new();
    let mut out = Map::new();

    let nested = obj.get("types").and_then(Value::as_object);
    let value_tag = nested
        .and_then(|t| t.get("value").cloned())
        .or_else(|| obj.get("type").cloned())
        .unwrap_or_else(|| Value::String(infer_tag(&value).to_string()));
    types.insert("value".into(), value_tag);

    if kind.is_range() {
        let child = obj.get("child").or_else(|| obj.get("key")).filter(|c| !c.is_null());
        if let Some(child) = child {
            let child_tag = nested
                .and_then(|t| t.get("child").cloned())
                .unwrap_or_else(|| Value::String(TypeTag::Str.to_string()));
            out.insert("child".into(), child.clone());
            types.insert("child".into(), child_tag);
        }
    }

    out.insert("value".into(), value);
    out.insert("types".into(), Value::Object(types));
    Ok(Value::Object(out))
}

/// Upcasts every payload of a persisted constraints object.
pub fn migrate_constraints(raw: &Value) -> Result<Value, ConstraintError> {
    let Value::Object(map) = raw else {
        return Err(ConstraintError::NotAnObject(json_type_name(raw).to_string()));
    };
    let mut out = Map::with_capacity(map.len());
    for (name, payload) in map {
        let kind = ConstraintKind::from_str(name).map_err(|_| ConstraintError::UnknownKind(name.clone()))?;
        out.insert(name.clone(), upcast_payload(kind, payload)?);
    }
    Ok(Value::Object(out))
}

/// At most one constraint per kind, iterated in application order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstraintSet {
    constraints: BTreeMap<ConstraintKind, Constraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses raw constraints. Objects map kinds to payloads; arrays hold
    /// single-entry objects and may not repeat a kind.
    pub fn parse(raw: &Value) -> Result<Self, ConstraintError> {
        let mut set = Self::new();
        match raw {
            Value::Object(map) => {
                for (name, payload) in map {
                    set.insert_raw(name, payload)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    let Value::Object(map) = item else {
                        return Err(ConstraintError::NotAnObject(json_type_name(item).to_string()));
                    };
                    for (name, payload) in map {
                        set.insert_raw(name, payload)?;
                    }
                }
            }
            other => return Err(ConstraintError::NotAnObject(json_type_name(other).to_string())),
        }
        Ok(set)
    }

    fn insert_raw(&mut self, name: &str, payload: &Value) -> Result<(), ConstraintError> {
        let kind = ConstraintKind::from_str(name).map_err(|_| ConstraintError::UnknownKind(name.to_string()))?;
        self.insert(Constraint::from_payload(kind, payload)?)
    }

    pub fn insert(&mut self, constraint: Constraint) -> Result<(), ConstraintError> {
        let kind = constraint.kind();
        if self.constraints.contains_key(&kind) {
            return Err(ConstraintError::Duplicate(kind));
        }
        self.constraints.insert(kind, constraint);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn kinds(&self) -> Vec<ConstraintKind> {
        self.constraints.keys().copied().collect()
    }

    pub fn needs_message(&self) -> bool {
        self.constraints.values().any(Constraint::needs_message)
    }

    /// Resolves every constraint, in kind order.
    pub async fn evaluate(&self, scope: &PropertyScope<'_>) -> Result<Vec<QueryOp>, ConstraintError> {
        let mut ops = Vec::with_capacity(self.constraints.len());
        for constraint in self.constraints.values() {
            ops.push(constraint.evaluate(scope).await?);
        }
        Ok(ops)
    }
}
