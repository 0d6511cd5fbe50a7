//! Typed properties: configuration fields whose value is either a literal or
//! a deferred reference resolved against the in-flight message, the flow and
//! global context stores, the environment, or an expression.

use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Engine, Scope};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::config::ConfigManager;
use crate::message::Message;
use crate::state::ContextStore;

static MSG_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^A-Za-z0-9_.])msg\b").expect("msg pattern compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TypeTag {
    Bool,
    Num,
    Str,
    Date,
    Null,
    Msg,
    Flow,
    Global,
    Env,
    Jsonata,
}

impl TypeTag {
    /// Deferred tags are resolved at request time instead of being literals.
    pub fn is_deferred(self) -> bool {
        matches!(
            self,
            TypeTag::Msg | TypeTag::Flow | TypeTag::Global | TypeTag::Env | TypeTag::Jsonata
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("message missing to evaluate property")]
    MissingMessage,

    #[error("invalid {tag} literal: {value}")]
    InvalidLiteral { tag: TypeTag, value: String },

    #[error("expression error: {0}")]
    Expression(String),
}

/// A value paired with the tag that says how to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TypedValue {
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type")]
    pub tag: TypeTag,
}

impl TypedValue {
    pub fn new(value: Value, tag: TypeTag) -> Self {
        Self { value, tag }
    }

    pub fn str(value: &str) -> Self {
        Self::new(Value::String(value.to_string()), TypeTag::Str)
    }

    /// True when resolving this value reads the in-flight message.
    pub fn needs_message(&self) -> bool {
        if !self.tag.is_deferred() {
            return false;
        }
        match self.tag {
            TypeTag::Msg => true,
            TypeTag::Jsonata => self.value.as_str().is_some_and(expression_uses_msg),
            _ => false,
        }
    }
}

/// Everything a typed property may be resolved against.
#[derive(Clone, Copy)]
pub struct PropertyScope<'a> {
    pub msg: Option<&'a Message>,
    pub flow: &'a ContextStore,
    pub global: &'a ContextStore,
    pub env: &'a ConfigManager,
}

impl<'a> PropertyScope<'a> {
    /// Resolves a typed value. `Ok(None)` means the reference pointed at
    /// nothing, which callers treat differently from an explicit `null`.
    pub async fn evaluate(&self, typed: &TypedValue) -> Result<Option<Value>, EvalError> {
        if typed.needs_message() && self.msg.is_none() {
            return Err(EvalError::MissingMessage);
        }
        match typed.tag {
            TypeTag::Str => Ok(Some(Value::String(literal_text(&typed.value)))),
            TypeTag::Num => parse_number(&typed.value).map(Some),
            TypeTag::Bool => Ok(Some(Value::Bool(match &typed.value {
                Value::Bool(b) => *b,
                Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
                _ => false,
            }))),
            TypeTag::Date => Ok(Some(Value::from(chrono::Utc::now().timestamp_millis()))),
            TypeTag::Null => Ok(Some(Value::Null)),
            TypeTag::Msg => Ok(self
                .msg
                .and_then(|msg| msg.property(&literal_text(&typed.value)))
                .cloned()),
            TypeTag::Flow => Ok(self.flow.get(&literal_text(&typed.value))),
            TypeTag::Global => Ok(self.global.get(&literal_text(&typed.value))),
            TypeTag::Env => Ok(self.env.get(literal_text(&typed.value).trim()).await.map(Value::String)),
            TypeTag::Jsonata => eval_expression(&literal_text(&typed.value), self.msg).map(Some),
        }
    }
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_number(value: &Value) -> Result<Value, EvalError> {
    let invalid = || EvalError::InvalidLiteral { tag: TypeTag::Num, value: literal_text(value) };
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let parsed: f64 = s.trim().parse().map_err(|_| invalid())?;
            number_value(parsed).ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

/// Converts a float to a JSON number, keeping integral values integral.
pub fn number_value(n: f64) -> Option<Value> {
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Some(Value::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number)
}

pub fn expression_uses_msg(expr: &str) -> bool {
    MSG_IDENT.is_match(expr)
}

fn eval_expression(expr: &str, msg: Option<&Message>) -> Result<Value, EvalError> {
    let engine = Engine::new();
    let mut scope = Scope::new();
    if let Some(msg) = msg {
        let json = serde_json::to_value(msg).map_err(|e| EvalError::Expression(e.to_string()))?;
        let dynamic = rhai::serde::to_dynamic(&json).map_err(|e| EvalError::Expression(e.to_string()))?;
        scope.push_dynamic("msg", dynamic);
    }
    let result = engine
        .eval_with_scope::<rhai::Dynamic>(&mut scope, expr)
        .map_err(|e| EvalError::Expression(e.to_string()))?;
    rhai::serde::from_dynamic::<Value>(&result).map_err(|e| EvalError::Expression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigManager;
    use serde_json::json;

    struct Fixture {
        flow: std::sync::Arc<ContextStore>,
        global: std::sync::Arc<ContextStore>,
        env: ConfigManager,
    }

    impl Fixture {
        fn new() -> Self {
            let flow = ContextStore::new();
            flow.set("room", json!({"id": "r1"}));
            let global = ContextStore::new();
            global.set("limit", json!(25));
            let env = ConfigManager(MapConfigManager::new().with("DB_ROOT", "prod"));
            Self { flow, global, env }
        }

        fn scope<'a>(&'a self, msg: Option<&'a Message>) -> PropertyScope<'a> {
            PropertyScope { msg, flow: &self.flow, global: &self.global, env: &self.env }
        }
    }

    #[tokio::test]
    async fn test_literals() {
        let fx = Fixture::new();
        let scope = fx.scope(None);

        let num = TypedValue::new(json!("10"), TypeTag::Num);
        assert_eq!(scope.evaluate(&num).await.unwrap(), Some(json!(10)));
        let dec = TypedValue::new(json!(" 2.5 "), TypeTag::Num);
        assert_eq!(scope.evaluate(&dec).await.unwrap(), Some(json!(2.5)));
        let bad = TypedValue::new(json!("ten"), TypeTag::Num);
        assert!(matches!(scope.evaluate(&bad).await, Err(EvalError::InvalidLiteral { .. })));

        let yes = TypedValue::new(json!("TRUE"), TypeTag::Bool);
        assert_eq!(scope.evaluate(&yes).await.unwrap(), Some(json!(true)));
        let null = TypedValue::new(json!("ignored"), TypeTag::Null);
        assert_eq!(scope.evaluate(&null).await.unwrap(), Some(Value::Null));
        let s = TypedValue::new(json!(42), TypeTag::Str);
        assert_eq!(scope.evaluate(&s).await.unwrap(), Some(json!("42")));

        let date = TypedValue::new(Value::Null, TypeTag::Date);
        assert!(scope.evaluate(&date).await.unwrap().unwrap().as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_references() {
        let fx = Fixture::new();
        let msg = Message::new(json!({"age": 30}));
        let scope = fx.scope(Some(&msg));

        let m = TypedValue::new(json!("payload.age"), TypeTag::Msg);
        assert_eq!(scope.evaluate(&m).await.unwrap(), Some(json!(30)));
        let missing = TypedValue::new(json!("payload.nope"), TypeTag::Msg);
        assert_eq!(scope.evaluate(&missing).await.unwrap(), None);

        let f = TypedValue::new(json!("room.id"), TypeTag::Flow);
        assert_eq!(scope.evaluate(&f).await.unwrap(), Some(json!("r1")));
        let g = TypedValue::new(json!("limit"), TypeTag::Global);
        assert_eq!(scope.evaluate(&g).await.unwrap(), Some(json!(25)));
        let e = TypedValue::new(json!("DB_ROOT"), TypeTag::Env);
        assert_eq!(scope.evaluate(&e).await.unwrap(), Some(json!("prod")));
    }

    #[tokio::test]
    async fn test_expression() {
        let fx = Fixture::new();
        let msg = Message::new(json!({"age": 30}));
        let scope = fx.scope(Some(&msg));

        let expr = TypedValue::new(json!("msg.payload.age + 1"), TypeTag::Jsonata);
        assert_eq!(scope.evaluate(&expr).await.unwrap(), Some(json!(31)));

        let constant = TypedValue::new(json!("\"users/\" + 7"), TypeTag::Jsonata);
        assert_eq!(fx.scope(None).evaluate(&constant).await.unwrap(), Some(json!("users/7")));

        let broken = TypedValue::new(json!("1 +"), TypeTag::Jsonata);
        assert!(matches!(scope.evaluate(&broken).await, Err(EvalError::Expression(_))));
    }

    #[tokio::test]
    async fn test_missing_message() {
        let fx = Fixture::new();
        let scope = fx.scope(None);

        let m = TypedValue::new(json!("payload"), TypeTag::Msg);
        assert_eq!(scope.evaluate(&m).await, Err(EvalError::MissingMessage));
        let expr = TypedValue::new(json!("msg.topic"), TypeTag::Jsonata);
        assert_eq!(scope.evaluate(&expr).await, Err(EvalError::MissingMessage));
        let flow = TypedValue::new(json!("room"), TypeTag::Flow);
        assert!(scope.evaluate(&flow).await.is_ok());
    }

    #[test]
    fn test_expression_uses_msg() {
        assert!(expression_uses_msg("msg.payload"));
        assert!(expression_uses_msg("1 + msg"));
        assert!(!expression_uses_msg("message + 1"));
        assert!(!expression_uses_msg("a.msg"));

        assert!(TypedValue::new(json!("msg.payload"), TypeTag::Jsonata).needs_message());
        assert!(TypedValue::new(json!("topic"), TypeTag::Msg).needs_message());
        assert!(!TypedValue::str("msg.payload").needs_message());
        assert!(!TypedValue::new(json!("ROOM"), TypeTag::Env).needs_message());
    }

    #[test]
    fn test_tag_parsing() {
        use std::str::FromStr;
        assert_eq!(TypeTag::from_str("jsonata").unwrap(), TypeTag::Jsonata);
        assert!(TypeTag::Env.is_deferred());
        assert!(!TypeTag::Num.is_deferred());
        let typed: TypedValue = serde_json::from_value(json!({"value": "x", "type": "msg"})).unwrap();
        assert_eq!(typed.tag, TypeTag::Msg);
    }
}
