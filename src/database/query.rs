//! Applies resolved [`QueryOp`]s to the children of a location, following
//! the backend's ordering rules.

use std::cmp::Ordering;

use serde_json::{Map, Value};

use crate::constraint::QueryOp;
use crate::payload::Priority;

#[derive(Debug, Clone, PartialEq)]
enum OrderBy {
    Key,
    Value,
    Priority,
    Child(Vec<String>),
}

/// Orders values the way the backend does: null, false, true, numbers,
/// strings, then objects.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) | Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or_default(), y.as_f64().unwrap_or_default());
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Keys that parse as 32-bit integers sort first, numerically.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<i32>(), b.parse::<i32>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn priority_value(p: Option<Priority>) -> Value {
    p.map(|p| p.to_value()).unwrap_or(Value::Null)
}

fn child_entries(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items.iter().enumerate().map(|(i, v)| (i.to_string(), v.clone())).collect(),
        _ => vec![],
    }
}

fn at_path<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, seg| v.get(seg.as_str()))
}

/// Children of `value`, ordered and filtered by `ops`. `priority` looks up
/// the priority of a child by key.
pub fn ordered_children(
    value: &Value,
    ops: &[QueryOp],
    priority: &dyn Fn(&str) -> Option<Priority>,
) -> Vec<(String, Value)> {
    let order = ops
        .iter()
        .find_map(|op| match op {
            QueryOp::OrderByChild { path } => Some(OrderBy::Child(
                path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect(),
            )),
            QueryOp::OrderByKey => Some(OrderBy::Key),
            QueryOp::OrderByValue => Some(OrderBy::Value),
            QueryOp::OrderByPriority => Some(OrderBy::Priority),
            _ => None,
        })
        .unwrap_or(OrderBy::Key);

    let sort_value = |key: &str, child: &Value| -> Value {
        match &order {
            OrderBy::Key => Value::String(key.to_string()),
            OrderBy::Value => child.clone(),
            OrderBy::Priority => priority_value(priority(key)),
            OrderBy::Child(path) => at_path(child, path).cloned().unwrap_or(Value::Null),
        }
    };
    let compare = |(ka, va): (&str, &Value), (kb, vb): (&str, &Value)| -> Ordering {
        let by_value = if order == OrderBy::Key { compare_keys(ka, kb) } else { compare_values(va, vb) };
        by_value.then_with(|| compare_keys(ka, kb))
    };

    let mut children: Vec<(String, Value, Value)> = child_entries(value)
        .into_iter()
        .map(|(k, v)| {
            let s = sort_value(&k, &v);
            (k, v, s)
        })
        .collect();
    children.sort_by(|a, b| compare((&a.0, &a.2), (&b.0, &b.2)));

    for op in ops {
        let (bound, key, keep): (&Value, &Option<String>, fn(Ordering) -> bool) = match op {
            QueryOp::StartAt { value, key } => (value, key, |o| o != Ordering::Less),
            QueryOp::StartAfter { value, key } => (value, key, |o| o == Ordering::Greater),
            QueryOp::EndAt { value, key } => (value, key, |o| o != Ordering::Greater),
            QueryOp::EndBefore { value, key } => (value, key, |o| o == Ordering::Less),
            QueryOp::EqualTo { value, key } => (value, key, |o| o == Ordering::Equal),
            _ => continue,
        };
        children.retain(|(k, _, s)| {
            let ord = match &order {
                OrderBy::Key => compare_keys(k, bound.as_str().unwrap_or_default()),
                _ => {
                    let by_value = compare_values(s, bound);
                    match key {
                        Some(bound_key) if by_value == Ordering::Equal => compare_keys(k, bound_key),
                        _ => by_value,
                    }
                }
            };
            keep(ord)
        });
    }

    for op in ops {
        match op {
            QueryOp::LimitToFirst { limit } => children.truncate(*limit as usize),
            QueryOp::LimitToLast { limit } => {
                let skip = children.len().saturating_sub(*limit as usize);
                children.drain(..skip);
            }
            _ => {}
        }
    }

    children.into_iter().map(|(k, v, _)| (k, v)).collect()
}

/// The value a query yields at a location. Without ops the value is
/// returned as is.
pub fn query_value(value: &Value, ops: &[QueryOp], priority: &dyn Fn(&str) -> Option<Priority>) -> Value {
    if ops.is_empty() || !(value.is_object() || value.is_array()) {
        return value.clone();
    }
    let children = ordered_children(value, ops, priority);
    if children.is_empty() {
        return Value::Null;
    }
    Value::Object(children.into_iter().collect::<Map<String, Value>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_priority(_: &str) -> Option<Priority> {
        None
    }

    fn keys(children: &[(String, Value)]) -> Vec<&str> {
        children.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn people() -> Value {
        json!({
            "ann": {"age": 31},
            "bob": {"age": 12},
            "cid": {"age": 45},
            "dee": {"name": "no age"}
        })
    }

    #[test]
    fn test_order_by_child_and_range() {
        let ops = vec![
            QueryOp::OrderByChild { path: "age".into() },
            QueryOp::StartAt { value: json!(10), key: None },
        ];
        let out = ordered_children(&people(), &ops, &no_priority);
        assert_eq!(keys(&out), vec!["bob", "ann", "cid"]);

        let ops = vec![
            QueryOp::OrderByChild { path: "age".into() },
            QueryOp::EndBefore { value: json!(45), key: None },
            QueryOp::LimitToLast { limit: 2 },
        ];
        let out = ordered_children(&people(), &ops, &no_priority);
        assert_eq!(keys(&out), vec!["bob", "ann"]);
    }

    #[test]
    fn test_order_by_key_with_limits() {
        let data = json!({"b": 1, "a": 2, "10": 3, "9": 4});
        let out = ordered_children(&data, &[QueryOp::OrderByKey], &no_priority);
        assert_eq!(keys(&out), vec!["9", "10", "a", "b"]);

        let out = ordered_children(&data, &[QueryOp::LimitToFirst { limit: 1 }], &no_priority);
        assert_eq!(keys(&out), vec!["9"]);

        let out = ordered_children(
            &data,
            &[QueryOp::OrderByKey, QueryOp::StartAfter { value: json!("a"), key: None }],
            &no_priority,
        );
        assert_eq!(keys(&out), vec!["b"]);
    }

    #[test]
    fn test_order_by_value_mixed_types() {
        let data = json!({"s": "x", "n": 5, "t": true, "f": false, "o": {"a": 1}});
        let out = ordered_children(&data, &[QueryOp::OrderByValue], &no_priority);
        assert_eq!(keys(&out), vec!["f", "t", "n", "s", "o"]);

        let out = ordered_children(
            &data,
            &[QueryOp::OrderByValue, QueryOp::EqualTo { value: json!(5), key: None }],
            &no_priority,
        );
        assert_eq!(keys(&out), vec!["n"]);
    }

    #[test]
    fn test_order_by_priority() {
        let data = json!({"a": 1, "b": 2, "c": 3});
        let priority = |k: &str| match k {
            "a" => Some(Priority::Number(3.0)),
            "c" => Some(Priority::Number(1.0)),
            _ => None,
        };
        let out = ordered_children(&data, &[QueryOp::OrderByPriority], &priority);
        assert_eq!(keys(&out), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_range_with_key_tiebreak() {
        let data = json!({"a": {"g": 1}, "b": {"g": 1}, "c": {"g": 1}});
        let ops = vec![
            QueryOp::OrderByChild { path: "g".into() },
            QueryOp::StartAt { value: json!(1), key: Some("b".into()) },
        ];
        let out = ordered_children(&data, &ops, &no_priority);
        assert_eq!(keys(&out), vec!["b", "c"]);
    }

    #[test]
    fn test_query_value() {
        let data = people();
        assert_eq!(query_value(&data, &[], &no_priority), data);
        assert_eq!(query_value(&json!(3), &[QueryOp::OrderByKey], &no_priority), json!(3));
        let out = query_value(&data, &[QueryOp::LimitToLast { limit: 1 }], &no_priority);
        assert_eq!(out, json!({"dee": {"name": "no age"}}));
        let none = query_value(
            &data,
            &[QueryOp::OrderByKey, QueryOp::EqualTo { value: json!("zzz"), key: None }],
            &no_priority,
        );
        assert_eq!(none, Value::Null);
    }
}
