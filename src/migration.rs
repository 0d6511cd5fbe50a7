//! One-shot upgrade of persisted leaf-node configuration.
//!
//! Older editors stored a single `constraint` object next to a
//! `useConstraint` flag, with flat constraint payloads. Everything is
//! rewritten here, once, at load time. Running it again changes nothing.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::constraint::{migrate_constraints, ConstraintError};
use crate::path::json_type_name;

/// Node types whose configuration goes through [`migrate_node_config`].
pub const LEAF_NODE_TYPES: [&str; 4] = ["firebase-get", "firebase-in", "firebase-out", "on-disconnect"];

const LEGACY_CONSTRAINTS: &str = "constraint";
const CONSTRAINTS: &str = "constraints";
const LEGACY_USE_CONSTRAINTS: &str = "useConstraint";
const USE_CONSTRAINTS: &str = "useConstraints";

#[derive(Debug, Error, PartialEq)]
pub enum MigrationError {
    #[error("a flow export must be an array of nodes, got {0}")]
    NotAFlowExport(String),

    #[error("node `{id}`: {source}")]
    Node {
        id: String,
        #[source]
        source: ConstraintError,
    },
}

/// Upgrades one leaf-node config in place. Returns whether anything changed.
pub fn migrate_node_config(config: &mut Value) -> Result<bool, ConstraintError> {
    let Value::Object(obj) = config else {
        return Ok(false);
    };
    let mut changed = false;

    if let Some(legacy) = obj.remove(LEGACY_CONSTRAINTS) {
        if !obj.contains_key(CONSTRAINTS) {
            obj.insert(CONSTRAINTS.into(), legacy);
        }
        changed = true;
    }
    if let Some(legacy) = obj.remove(LEGACY_USE_CONSTRAINTS) {
        if !obj.contains_key(USE_CONSTRAINTS) {
            obj.insert(USE_CONSTRAINTS.into(), Value::Bool(truthy(&legacy)));
        }
        changed = true;
    }

    match obj.get(CONSTRAINTS).cloned() {
        Some(Value::Null) => {
            obj.insert(CONSTRAINTS.into(), Value::Object(Map::new()));
            changed = true;
        }
        Some(current) => {
            let migrated = migrate_constraints(&current)?;
            if migrated != current {
                obj.insert(CONSTRAINTS.into(), migrated);
                changed = true;
            }
        }
        None => {}
    }
    Ok(changed)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// Upgrades every leaf node of a flow export. Returns how many changed.
pub fn migrate_flows(flows: &mut Value) -> Result<usize, MigrationError> {
    let Value::Array(nodes) = flows else {
        return Err(MigrationError::NotAFlowExport(json_type_name(flows).to_string()));
    };
    let mut changed = 0;
    for node in nodes.iter_mut() {
        let is_leaf = node
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| LEAF_NODE_TYPES.contains(&t));
        if !is_leaf {
            continue;
        }
        let id = node.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        if migrate_node_config(node).map_err(|source| MigrationError::Node { id, source })? {
            changed += 1;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_fields_are_moved() {
        let mut config = json!({
            "path": "users",
            "constraint": {"limitToLast": {"value": "5", "type": "num"}},
            "useConstraint": "true"
        });
        assert!(migrate_node_config(&mut config).unwrap());
        assert_eq!(
            config,
            json!({
                "path": "users",
                "constraints": {"limitToLast": {"value": "5", "types": {"value": "num"}}},
                "useConstraints": true
            })
        );
        let snapshot = config.clone();
        assert!(!migrate_node_config(&mut config).unwrap());
        assert_eq!(config, snapshot);
    }

    #[test]
    fn test_current_fields_win() {
        let mut config = json!({
            "constraint": {"limitToFirst": 1},
            "constraints": {},
            "useConstraint": false,
            "useConstraints": true
        });
        assert!(migrate_node_config(&mut config).unwrap());
        assert_eq!(config, json!({"constraints": {}, "useConstraints": true}));
    }

    #[test]
    fn test_null_constraints_become_empty() {
        let mut config = json!({"constraints": null});
        assert!(migrate_node_config(&mut config).unwrap());
        assert_eq!(config["constraints"], json!({}));
        assert!(!migrate_node_config(&mut json!("not an object")).unwrap());
    }

    #[test]
    fn test_migrate_flows() {
        let mut flows = json!([
            {"id": "t1", "type": "tab"},
            {"id": "g1", "type": "firebase-get", "constraint": {"orderByKey": true}},
            {"id": "i1", "type": "firebase-in", "constraints": {"startAt": {"value": 1, "types": {"value": "num"}}}},
            {"id": "o1", "type": "firebase-out", "useConstraint": false}
        ]);
        assert_eq!(migrate_flows(&mut flows).unwrap(), 2);
        assert_eq!(flows[1]["constraints"], json!({"orderByKey": null}));
        assert_eq!(migrate_flows(&mut flows).unwrap(), 0);

        let mut broken = json!([{"id": "bad", "type": "firebase-get", "constraints": {"sortBy": 1}}]);
        match migrate_flows(&mut broken) {
            Err(MigrationError::Node { id, source }) => {
                assert_eq!(id, "bad");
                assert_eq!(source, ConstraintError::UnknownKind("sortBy".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(migrate_flows(&mut json!({})), Err(MigrationError::NotAFlowExport(_))));
    }
}
