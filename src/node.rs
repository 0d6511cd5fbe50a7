//! What every leaf node shares: the error taxonomy at the node boundary,
//! the persisted configuration, the lookup of its config node and the
//! status badge it renders.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use node_plugin::{LogLevel, Message, NodeHost, NodeStatus, PluginError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{error, warn};

use crate::config::ConfigManager;
use crate::config_node::{ConfigNode, ConfigNodeRegistry, ConnectionState, StatusListener, MIN_CONFIG_VERSION};
use crate::constraint::{ConstraintError, ConstraintSet};
use crate::database::{Database, DatabaseError, ListenerKind};
use crate::migration::migrate_node_config;
use crate::path::PathError;
use crate::payload::PayloadError;
use crate::property::{EvalError, PropertyScope, TypeTag, TypedValue};
use crate::state::ContextStore;

/// How long a network or backend error stays on the badge.
pub const ERROR_BADGE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// The node cannot work at all. Reported once, then every request fails.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("database error: {0}")]
    Backend(String),
}

impl From<PathError> for NodeError {
    fn from(err: PathError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

impl From<ConstraintError> for NodeError {
    fn from(err: ConstraintError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

impl From<PayloadError> for NodeError {
    fn from(err: PayloadError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

impl From<EvalError> for NodeError {
    fn from(err: EvalError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

impl From<DatabaseError> for NodeError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::PermissionDenied(path) => NodeError::PermissionDenied(path),
            DatabaseError::Network(reason) => NodeError::TransientNetwork(reason),
            other => NodeError::Backend(other.to_string()),
        }
    }
}

/// Services shared by all nodes of a deployment.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub flow: Arc<ContextStore>,
    pub global: Arc<ContextStore>,
    pub env: ConfigManager,
    pub registry: Arc<ConfigNodeRegistry>,
    pub error_ttl: Duration,
}

impl NodeContext {
    pub fn new(env: ConfigManager, registry: Arc<ConfigNodeRegistry>) -> Self {
        Self {
            flow: ContextStore::new(),
            global: ContextStore::new(),
            env,
            registry,
            error_ttl: ERROR_BADGE_TTL,
        }
    }

    pub fn scope<'a>(&'a self, msg: Option<&'a Message>) -> PropertyScope<'a> {
        PropertyScope { msg, flow: &self.flow, global: &self.global, env: &self.env }
    }
}

/// Encoding of snapshot values put on `msg.payload`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputType {
    #[default]
    Auto,
    Json,
    String,
}

impl OutputType {
    pub fn encode(self, value: Value) -> Value {
        match (self, value) {
            (OutputType::Json, Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            (OutputType::String, Value::String(s)) => Value::String(s),
            (OutputType::String, other) => Value::String(other.to_string()),
            (_, other) => other,
        }
    }
}

fn default_str_tag() -> TypeTag {
    TypeTag::Str
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Persisted configuration of a leaf node, after migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LeafConfig {
    /// Id of the config node.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub path: Value,
    #[serde(default = "default_str_tag")]
    pub path_type: TypeTag,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default = "empty_object")]
    pub constraints: Value,
    #[serde(default)]
    pub use_constraints: bool,
    #[serde(default)]
    pub listener_type: Option<ListenerKind>,
    /// Write or on-disconnect operation; `none` takes it from `msg.method`.
    #[serde(default)]
    pub query_type: Option<String>,
    #[serde(default)]
    pub priority: Option<Value>,
    #[serde(default = "default_str_tag")]
    pub priority_type: TypeTag,
}

impl LeafConfig {
    /// Migrates and parses a persisted config. Constraints that cannot be
    /// migrated only fail the load when they are in use.
    pub fn load(raw: &Value) -> Result<Self, NodeError> {
        let mut raw = raw.clone();
        if let Err(err) = migrate_node_config(&mut raw) {
            let in_use = raw.get("useConstraints").and_then(Value::as_bool).unwrap_or(false);
            if in_use {
                return Err(NodeError::Configuration(err.to_string()));
            }
            warn!(%err, "dropping stale constraints, constraints are disabled");
            raw["constraints"] = empty_object();
        }
        serde_json::from_value(raw).map_err(|e| NodeError::Configuration(e.to_string()))
    }

    pub fn path_property(&self) -> TypedValue {
        TypedValue::new(self.path.clone(), self.path_type)
    }

    /// The configured priority, unless left blank.
    pub fn priority_property(&self) -> Option<TypedValue> {
        match &self.priority {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() && self.priority_type == TypeTag::Str => None,
            Some(value) => Some(TypedValue::new(value.clone(), self.priority_type)),
        }
    }

    /// Static constraints, when enabled and not empty.
    pub fn constraint_set(&self) -> Result<Option<ConstraintSet>, NodeError> {
        if !self.use_constraints {
            return Ok(None);
        }
        let set = ConstraintSet::parse(&self.constraints).map_err(|e| NodeError::Configuration(e.to_string()))?;
        Ok(if set.is_empty() { None } else { Some(set) })
    }
}

#[derive(Debug)]
struct BadgeState {
    connection: ConnectionState,
    subscribed: bool,
    permission_denied: bool,
    error: Option<String>,
    error_generation: u64,
    closed: bool,
}

/// The badge of one leaf node. Attached to the config node as a dependent.
pub struct LeafStatus {
    host: Arc<dyn NodeHost>,
    state: Mutex<BadgeState>,
    error_ttl: Duration,
}

impl LeafStatus {
    fn new(host: Arc<dyn NodeHost>, error_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            host,
            state: Mutex::new(BadgeState {
                connection: ConnectionState::Disconnected,
                subscribed: false,
                permission_denied: false,
                error: None,
                error_generation: 0,
                closed: false,
            }),
            error_ttl,
        })
    }

    fn update(&self, change: impl FnOnce(&mut BadgeState)) {
        let status = match self.state.lock() {
            Ok(mut state) => {
                change(&mut *state);
                if state.closed {
                    return;
                }
                if state.permission_denied {
                    NodeStatus::PermissionDenied
                } else if let Some(text) = &state.error {
                    NodeStatus::Error(text.clone())
                } else if state.subscribed && state.connection == ConnectionState::Connected {
                    NodeStatus::Subscribed
                } else {
                    state.connection.status()
                }
            }
            Err(_) => return,
        };
        self.host.status(&status);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub fn set_subscribed(&self, subscribed: bool) {
        self.update(|s| s.subscribed = subscribed);
    }

    /// A request went through: clears any error and the permission badge.
    pub fn succeeded(&self) {
        let dirty = self.state.lock().map(|s| s.permission_denied || s.error.is_some()).unwrap_or(false);
        if dirty {
            self.update(|s| {
                s.permission_denied = false;
                s.error = None;
            });
        }
    }

    /// Sticky until the next successful request.
    pub fn permission_denied(&self) {
        self.update(|s| s.permission_denied = true);
    }

    /// Shows `text` until it expires or something replaces it.
    pub fn show_error(self: &Arc<Self>, text: &str) {
        let mut generation = 0;
        self.update(|s| {
            s.error_generation += 1;
            generation = s.error_generation;
            s.error = Some(text.to_string());
        });
        let Ok(runtime) = tokio::runtime::Handle::try_current() else { return };
        let status = Arc::downgrade(self);
        let ttl = self.error_ttl;
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(status) = status.upgrade() {
                status.update(|s| {
                    if s.error_generation == generation {
                        s.error = None;
                    }
                });
            }
        });
    }

    fn close(&self) {
        let was_open = match self.state.lock() {
            Ok(mut s) => !std::mem::replace(&mut s.closed, true),
            Err(_) => false,
        };
        if was_open {
            self.host.status(&NodeStatus::Idle);
        }
    }
}

impl StatusListener for LeafStatus {
    fn listener_id(&self) -> &str {
        self.host.node_id()
    }

    fn on_status(&self, state: ConnectionState) -> Result<(), PluginError> {
        if self.is_closed() {
            return Err(PluginError::Closed(self.host.node_id().to_string()));
        }
        self.update(|s| s.connection = state);
        Ok(())
    }
}

/// Config-node binding and status handling shared by the leaf nodes.
pub struct LeafBase {
    host: Arc<dyn NodeHost>,
    context: NodeContext,
    config_node: Option<Arc<ConfigNode>>,
    status: Arc<LeafStatus>,
    disabled: Option<String>,
}

impl LeafBase {
    /// Looks up the config node and registers as its dependent. Without a
    /// usable config node the leaf is disabled for good.
    pub fn new(host: Arc<dyn NodeHost>, context: NodeContext, database: Option<&str>) -> Self {
        let status = LeafStatus::new(host.clone(), context.error_ttl);
        let lookup = match database {
            None | Some("") => Err("no database configured".to_string()),
            Some(id) => context
                .registry
                .get(id)
                .ok_or_else(|| format!("database config `{id}` not found")),
        }
        .and_then(|node| {
            if node.settings().is_supported() {
                Ok(node)
            } else {
                Err(format!(
                    "database config `{}` is version {}, at least {} is required; redeploy it",
                    node.id(),
                    node.settings().version,
                    MIN_CONFIG_VERSION
                ))
            }
        });

        let (config_node, disabled) = match lookup {
            Ok(node) => {
                node.attach(status.clone());
                (Some(node), None)
            }
            Err(reason) => {
                error!(node = host.node_id(), %reason, "leaf node disabled");
                host.log(LogLevel::Error, &reason);
                host.status(&NodeStatus::Error(reason.clone()));
                (None, Some(reason))
            }
        };
        Self { host, context, config_node, status, disabled }
    }

    pub fn id(&self) -> &str {
        self.host.node_id()
    }

    pub fn host(&self) -> &Arc<dyn NodeHost> {
        &self.host
    }

    pub fn context(&self) -> &NodeContext {
        &self.context
    }

    pub fn config_node(&self) -> Option<&Arc<ConfigNode>> {
        self.config_node.as_ref()
    }

    pub fn status(&self) -> &Arc<LeafStatus> {
        &self.status
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// The client a request goes to. `Ok(None)` once the node or its
    /// config node is closed: the request then does nothing.
    pub fn client(&self) -> Result<Option<Arc<dyn Database>>, NodeError> {
        if let Some(reason) = &self.disabled {
            return Err(NodeError::Configuration(reason.clone()));
        }
        if self.status.is_closed() {
            return Ok(None);
        }
        Ok(self.config_node.as_ref().and_then(|node| node.client()))
    }

    /// Renders the outcome of a request and hands it back.
    pub fn finish<T>(&self, result: Result<T, NodeError>) -> Result<T, NodeError> {
        match &result {
            Ok(_) => self.status.succeeded(),
            Err(err) => {
                warn!(node = self.id(), %err, "request failed");
                match err {
                    NodeError::PermissionDenied(_) => self.status.permission_denied(),
                    NodeError::TransientNetwork(_) | NodeError::Backend(_) => self.status.show_error(&err.to_string()),
                    NodeError::Validation(_) | NodeError::Configuration(_) => {}
                }
            }
        }
        result
    }

    pub fn close(&self) {
        self.status.close();
        if let Some(node) = &self.config_node {
            node.detach(self.id());
        }
    }
}

/// A deployed leaf node as the host drives it.
#[async_trait]
pub trait LeafNode: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn base(&self) -> &LeafBase;

    /// Called once after deploy.
    async fn start(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Handles one inbound message. The error is the message's outcome.
    async fn on_input(&self, _msg: Message) -> Result<(), NodeError> {
        Ok(())
    }

    async fn close(&self) {
        self.base().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigManager;
    use crate::config_node::ConfigNodeSettings;
    use crate::database::{AuthMethod, ClientKind, MemoryDatabase};
    use node_plugin::plugin_test_util::RecordingHost;
    use serde_json::json;

    fn context() -> NodeContext {
        NodeContext::new(ConfigManager(MapConfigManager::new()), ConfigNodeRegistry::new())
    }

    fn register(ctx: &NodeContext, version: u32) -> Arc<ConfigNode> {
        let settings = ConfigNodeSettings { auth: AuthMethod::Anonymous, version };
        let node = ConfigNode::new(RecordingHost::new("db"), settings, MemoryDatabase::new(ClientKind::User)).unwrap();
        ctx.registry.register(node.clone());
        node
    }

    #[test]
    fn test_leaf_config_load() {
        let config = LeafConfig::load(&json!({
            "id": "n1",
            "type": "firebase-get",
            "database": "db",
            "path": "users",
            "outputType": "json",
            "constraint": {"limitToFirst": {"value": "2", "type": "num"}},
            "useConstraint": true
        }))
        .unwrap();
        assert_eq!(config.path_type, TypeTag::Str);
        assert_eq!(config.output_type, OutputType::Json);
        assert_eq!(config.constraint_set().unwrap().unwrap().len(), 1);
        assert!(config.priority_property().is_none());

        let off = LeafConfig::load(&json!({"constraints": {"limitToFirst": 1}})).unwrap();
        assert!(off.constraint_set().unwrap().is_none());

        assert!(matches!(
            LeafConfig::load(&json!({"pathType": "nope"})),
            Err(NodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_stale_constraints_only_matter_when_enabled() {
        let disabled = LeafConfig::load(&json!({"constraint": {"sortBy": 1}, "useConstraint": false})).unwrap();
        assert_eq!(disabled.constraints, json!({}));
        assert!(disabled.constraint_set().unwrap().is_none());

        let unset = LeafConfig::load(&json!({"constraints": {"sortBy": 1}})).unwrap();
        assert!(!unset.use_constraints);

        assert!(matches!(
            LeafConfig::load(&json!({"constraints": {"sortBy": 1}, "useConstraints": true})),
            Err(NodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_output_encoding() {
        assert_eq!(OutputType::Auto.encode(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(OutputType::Json.encode(json!("{\"a\":1}")), json!({"a": 1}));
        assert_eq!(OutputType::Json.encode(json!("plain")), json!("plain"));
        assert_eq!(OutputType::String.encode(json!({"a": 1})), json!("{\"a\":1}"));
        assert_eq!(OutputType::String.encode(json!("x")), json!("x"));
    }

    #[test]
    fn test_database_errors_map_to_taxonomy() {
        assert_eq!(
            NodeError::from(DatabaseError::PermissionDenied("a".into())),
            NodeError::PermissionDenied("a".into())
        );
        assert_eq!(
            NodeError::from(DatabaseError::Network("down".into())),
            NodeError::TransientNetwork("down".into())
        );
        assert!(matches!(NodeError::from(DatabaseError::Closed), NodeError::Backend(_)));
        assert!(matches!(NodeError::from(PathError::Empty), NodeError::Validation(_)));
    }

    #[test]
    fn test_missing_config_node_disables_leaf() {
        let ctx = context();
        let host = RecordingHost::new("leaf");
        let base = LeafBase::new(host.clone(), ctx, Some("missing"));
        assert!(base.is_disabled());
        assert!(matches!(base.client(), Err(NodeError::Configuration(_))));
        assert!(matches!(base.client(), Err(NodeError::Configuration(_))));
        assert_eq!(host.logs().len(), 1);
    }

    #[test]
    fn test_old_config_node_version_disables_leaf() {
        let ctx = context();
        register(&ctx, MIN_CONFIG_VERSION - 1);
        let host = RecordingHost::new("leaf");
        let base = LeafBase::new(host.clone(), ctx, Some("db"));
        assert!(base.is_disabled());
        assert!(host.logs()[0].1.contains("redeploy"));
    }

    #[tokio::test]
    async fn test_badges() {
        let mut ctx = context();
        ctx.error_ttl = Duration::from_millis(20);
        let node = register(&ctx, MIN_CONFIG_VERSION);
        let host = RecordingHost::new("leaf");
        let base = LeafBase::new(host.clone(), ctx, Some("db"));
        assert_eq!(node.dependent_ids(), vec!["leaf"]);
        assert_eq!(host.last_status(), Some(NodeStatus::Disconnected));

        let denied: Result<(), NodeError> = Err(NodeError::PermissionDenied("x".into()));
        assert!(base.finish(denied).is_err());
        assert_eq!(host.last_status(), Some(NodeStatus::PermissionDenied));
        base.status().on_status(ConnectionState::Connected).unwrap();
        assert_eq!(host.last_status(), Some(NodeStatus::PermissionDenied));
        base.finish(Ok(())).unwrap();
        assert_eq!(host.last_status(), Some(NodeStatus::Connected));

        let flaky: Result<(), NodeError> = Err(NodeError::TransientNetwork("timeout".into()));
        assert!(base.finish(flaky).is_err());
        assert_eq!(host.last_status(), Some(NodeStatus::Error("network error: timeout".into())));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(host.last_status(), Some(NodeStatus::Connected));

        base.close();
        assert_eq!(host.last_status(), Some(NodeStatus::Idle));
        assert!(node.dependent_ids().is_empty());
        assert!(base.client().unwrap().is_none());
        assert!(base.status().on_status(ConnectionState::Connecting).is_err());
    }
}
