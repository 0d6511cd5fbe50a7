use std::sync::Arc;

use async_trait::async_trait;
use node_plugin::{Message, NodeHost};
use serde_json::Value;
use tracing::debug;

use super::{configured_operation, operation_from_msg, resolve_priority, ON_DISCONNECT_NODE};
use crate::database::{Database, OnDisconnectKind, OnDisconnectOp};
use crate::node::{LeafBase, LeafConfig, LeafNode, NodeContext, NodeError};
use crate::path::{json_type_name, resolve_path};
use crate::payload::normalize_payload;

/// Queues a write the server runs when this client disconnects, or cancels
/// the queued writes at a location.
pub struct OnDisconnectNode {
    base: LeafBase,
    config: LeafConfig,
    operation: Option<OnDisconnectKind>,
}

impl OnDisconnectNode {
    pub fn new(host: Arc<dyn NodeHost>, config: LeafConfig, context: NodeContext) -> Result<Self, NodeError> {
        let operation = configured_operation(config.query_type.as_deref())?;
        let base = LeafBase::new(host, context, config.database.as_deref());
        Ok(Self { base, config, operation })
    }

    async fn register(&self, db: &dyn Database, msg: &Message) -> Result<(), NodeError> {
        let scope = self.base.context().scope(Some(msg));
        let operation = match self.operation {
            Some(op) => op,
            None => operation_from_msg(msg)?,
        };
        let path = resolve_path(&self.config.path_property(), &scope, false).await?;
        let payload = || normalize_payload(msg.payload().unwrap_or(&Value::Null));

        let op = match operation {
            OnDisconnectKind::Cancel => OnDisconnectOp::Cancel,
            OnDisconnectKind::Remove => OnDisconnectOp::Remove,
            OnDisconnectKind::Set => OnDisconnectOp::Set(payload()?),
            OnDisconnectKind::SetWithPriority => {
                OnDisconnectOp::SetWithPriority(payload()?, resolve_priority(&self.config, &scope, msg).await?)
            }
            OnDisconnectKind::Update => match payload()? {
                Value::Object(map) => OnDisconnectOp::Update(map),
                other => {
                    return Err(NodeError::Validation(format!(
                        "update needs an object payload, got {}",
                        json_type_name(&other)
                    )));
                }
            },
        };
        debug!(path = ?path, op = %operation, "registering on-disconnect");
        Ok(db.on_disconnect(path.as_deref(), op).await?)
    }
}

#[async_trait]
impl LeafNode for OnDisconnectNode {
    fn type_name(&self) -> &'static str {
        ON_DISCONNECT_NODE
    }

    fn base(&self) -> &LeafBase {
        &self.base
    }

    #[tracing::instrument(name = "on_disconnect_input", skip(self, msg), fields(node = %self.base.id()))]
    async fn on_input(&self, msg: Message) -> Result<(), NodeError> {
        let Some(db) = self.base.client()? else {
            debug!("client released, dropping message");
            return Ok(());
        };
        let result = self.register(db.as_ref(), &msg).await;
        self.base.finish(result)
    }
}
