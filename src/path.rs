use serde_json::Value;
use thiserror::Error;

use crate::property::{EvalError, PropertyScope, TypedValue};

const FORBIDDEN: [char; 5] = ['.', '#', '$', '[', ']'];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PathError {
    #[error("PATH must not be empty")]
    Empty,

    #[error("PATH must be a string, got {0}")]
    Type(String),

    #[error("PATH `{0}` must not contain \".\", \"#\", \"$\", \"[\", \"]\" or \"//\"")]
    Invalid(String),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Validates a database path and hands it back unchanged.
pub fn check_path(path: &str) -> Result<&str, PathError> {
    if path.contains("//") || path.contains(FORBIDDEN) {
        return Err(PathError::Invalid(path.to_string()));
    }
    Ok(path)
}

/// Resolves and validates the target path of a request.
///
/// With `allow_blank`, an absent or empty path yields `None`, which targets
/// the database root.
pub async fn resolve_path(
    source: &TypedValue,
    scope: &PropertyScope<'_>,
    allow_blank: bool,
) -> Result<Option<String>, PathError> {
    match scope.evaluate(source).await? {
        None => blank(allow_blank),
        Some(Value::String(path)) if path.is_empty() => blank(allow_blank),
        Some(Value::String(path)) => {
            check_path(&path)?;
            Ok(Some(path))
        }
        Some(other) => Err(PathError::Type(json_type_name(&other).to_string())),
    }
}

fn blank(allow_blank: bool) -> Result<Option<String>, PathError> {
    if allow_blank { Ok(None) } else { Err(PathError::Empty) }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigManager, MapConfigManager};
    use crate::message::Message;
    use crate::property::TypeTag;
    use crate::state::ContextStore;
    use serde_json::json;

    #[test]
    fn test_check_path() {
        for bad in ["a//b", "a.b", "a#b", "$a", "a[0]", "a]", "///", "a/b//"] {
            assert_eq!(check_path(bad), Err(PathError::Invalid(bad.to_string())), "{bad}");
        }
        for good in ["a/b", "users", "/users/42", "a/b/", "émoji/ok", "a-b_c"] {
            assert_eq!(check_path(good), Ok(good));
        }
    }

    #[tokio::test]
    async fn test_resolve_path() {
        let flow = ContextStore::new();
        let global = ContextStore::new();
        let env = ConfigManager(MapConfigManager::new());
        let mut msg = Message::new(json!(null));
        msg.set("topic", json!("rooms/1"));
        msg.set("count", json!(5));
        let scope = PropertyScope { msg: Some(&msg), flow: &flow, global: &global, env: &env };

        let from_msg = TypedValue::new(json!("topic"), TypeTag::Msg);
        assert_eq!(resolve_path(&from_msg, &scope, false).await, Ok(Some("rooms/1".to_string())));

        let static_path = TypedValue::str("users");
        assert_eq!(resolve_path(&static_path, &scope, false).await, Ok(Some("users".to_string())));

        let number = TypedValue::new(json!("count"), TypeTag::Msg);
        assert_eq!(resolve_path(&number, &scope, false).await, Err(PathError::Type("number".into())));

        let absent = TypedValue::new(json!("nothing"), TypeTag::Msg);
        assert_eq!(resolve_path(&absent, &scope, false).await, Err(PathError::Empty));
        assert_eq!(resolve_path(&absent, &scope, true).await, Ok(None));

        let empty = TypedValue::str("");
        assert_eq!(resolve_path(&empty, &scope, false).await, Err(PathError::Empty));
        assert_eq!(resolve_path(&empty, &scope, true).await, Ok(None));

        let invalid = TypedValue::str("a.b");
        assert_eq!(resolve_path(&invalid, &scope, true).await, Err(PathError::Invalid("a.b".into())));
    }

    #[tokio::test]
    async fn test_resolve_path_without_message() {
        let flow = ContextStore::new();
        let global = ContextStore::new();
        let env = ConfigManager(MapConfigManager::new());
        let scope = PropertyScope { msg: None, flow: &flow, global: &global, env: &env };

        let from_msg = TypedValue::new(json!("topic"), TypeTag::Msg);
        assert_eq!(
            resolve_path(&from_msg, &scope, false).await,
            Err(PathError::Eval(EvalError::MissingMessage))
        );
    }
}
