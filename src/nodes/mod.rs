//! The four leaf node types.

pub mod get;
pub mod listen;
pub mod on_disconnect;
pub mod write;

use std::str::FromStr;
use std::sync::Arc;

use node_plugin::{Message, NodeHost};
use serde_json::Value;

use crate::database::DataSnapshot;
use crate::node::{LeafConfig, LeafNode, NodeContext, NodeError, OutputType};
use crate::path::json_type_name;
use crate::payload::{parse_priority, Priority};
use crate::property::PropertyScope;

pub use get::GetNode;
pub use listen::InNode;
pub use on_disconnect::OnDisconnectNode;
pub use write::OutNode;

pub const GET_NODE: &str = "firebase-get";
pub const IN_NODE: &str = "firebase-in";
pub const OUT_NODE: &str = "firebase-out";
pub const ON_DISCONNECT_NODE: &str = "on-disconnect";

/// Builds a leaf node from its type name and persisted config.
pub fn build_node(
    node_type: &str,
    host: Arc<dyn NodeHost>,
    raw: &Value,
    context: NodeContext,
) -> Result<Box<dyn LeafNode>, NodeError> {
    let config = LeafConfig::load(raw)?;
    Ok(match node_type {
        GET_NODE => Box::new(GetNode::new(host, config, context)?),
        IN_NODE => Box::new(InNode::new(host, config, context)?),
        OUT_NODE => Box::new(OutNode::new(host, config, context)?),
        ON_DISCONNECT_NODE => Box::new(OnDisconnectNode::new(host, config, context)?),
        other => return Err(NodeError::Configuration(format!("unknown node type `{other}`"))),
    })
}

/// Puts a snapshot on a message: value, key, priority and the previous
/// sibling for child events.
pub(crate) fn apply_snapshot(msg: &mut Message, snapshot: DataSnapshot, output: OutputType) {
    msg.set_payload(output.encode(snapshot.value));
    msg.set("key", snapshot.key.map(Value::String).unwrap_or(Value::Null));
    msg.set("priority", snapshot.priority.map(|p| p.to_value()).unwrap_or(Value::Null));
    if let Some(previous) = snapshot.previous_child_name {
        msg.set("previousChildName", Value::String(previous));
    }
}

/// Parses a configured operation name. `none` (or nothing) means the
/// operation comes from `msg.method`.
pub(crate) fn configured_operation<K: FromStr>(query_type: Option<&str>) -> Result<Option<K>, NodeError> {
    match query_type.map(str::trim) {
        None | Some("") | Some("none") => Ok(None),
        Some(name) => K::from_str(name)
            .map(Some)
            .map_err(|_| NodeError::Configuration(format!("unknown query type `{name}`"))),
    }
}

pub(crate) fn operation_from_msg<K: FromStr>(msg: &Message) -> Result<K, NodeError> {
    match msg.get("method") {
        Some(Value::String(name)) => {
            K::from_str(name.trim()).map_err(|_| NodeError::Validation(format!("invalid msg.method `{name}`")))
        }
        Some(other) => Err(NodeError::Validation(format!(
            "msg.method must be a string, got {}",
            json_type_name(other)
        ))),
        None => Err(NodeError::Validation("msg.method is required when the query type is `none`".into())),
    }
}

/// The configured priority, falling back to `msg.priority`.
pub(crate) async fn resolve_priority(
    config: &LeafConfig,
    scope: &PropertyScope<'_>,
    msg: &Message,
) -> Result<Option<Priority>, NodeError> {
    let raw = match config.priority_property() {
        Some(property) => scope.evaluate(&property).await?,
        None => msg.get("priority").cloned(),
    };
    match raw {
        Some(value) => Ok(parse_priority(&value)?),
        None => Ok(None),
    }
}
