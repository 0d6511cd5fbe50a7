use std::sync::Arc;

use async_trait::async_trait;
use node_plugin::{Message, NodeHost};
use serde_json::Value;
use tracing::debug;

use super::{configured_operation, operation_from_msg, resolve_priority, OUT_NODE};
use crate::database::{Database, WriteKind, WriteOp};
use crate::node::{LeafBase, LeafConfig, LeafNode, NodeContext, NodeError};
use crate::path::{json_type_name, resolve_path};
use crate::payload::normalize_payload;

/// Writes `msg.payload` to a location. Pushes put the new key on `msg.key`
/// before the message is passed on.
pub struct OutNode {
    base: LeafBase,
    config: LeafConfig,
    operation: Option<WriteKind>,
}

impl OutNode {
    pub fn new(host: Arc<dyn NodeHost>, config: LeafConfig, context: NodeContext) -> Result<Self, NodeError> {
        let operation = configured_operation(config.query_type.as_deref())?;
        let base = LeafBase::new(host, context, config.database.as_deref());
        Ok(Self { base, config, operation })
    }

    async fn write(&self, db: &dyn Database, msg: &Message) -> Result<Option<String>, NodeError> {
        let scope = self.base.context().scope(Some(msg));
        let operation = match self.operation {
            Some(op) => op,
            None => operation_from_msg(msg)?,
        };
        let path = resolve_path(&self.config.path_property(), &scope, false).await?;
        let payload = || normalize_payload(msg.payload().unwrap_or(&Value::Null));

        let op = match operation {
            WriteKind::Set => WriteOp::Set(payload()?),
            WriteKind::Push => WriteOp::Push(payload()?),
            WriteKind::Update => match payload()? {
                Value::Object(map) => WriteOp::Update(map),
                other => {
                    return Err(NodeError::Validation(format!(
                        "update needs an object payload, got {}",
                        json_type_name(&other)
                    )));
                }
            },
            WriteKind::Remove => WriteOp::Remove,
            WriteKind::SetPriority => WriteOp::SetPriority(resolve_priority(&self.config, &scope, msg).await?),
            WriteKind::SetWithPriority => {
                WriteOp::SetWithPriority(payload()?, resolve_priority(&self.config, &scope, msg).await?)
            }
        };
        debug!(path = ?path, op = %op.kind(), "writing");
        Ok(db.write(path.as_deref(), op).await?)
    }
}

#[async_trait]
impl LeafNode for OutNode {
    fn type_name(&self) -> &'static str {
        OUT_NODE
    }

    fn base(&self) -> &LeafBase {
        &self.base
    }

    #[tracing::instrument(name = "firebase_out_input", skip(self, msg), fields(node = %self.base.id()))]
    async fn on_input(&self, mut msg: Message) -> Result<(), NodeError> {
        let Some(db) = self.base.client()? else {
            debug!("client released, dropping message");
            return Ok(());
        };
        let result = self.write(db.as_ref(), &msg).await;
        if let Some(key) = self.base.finish(result)? {
            msg.set("key", Value::String(key));
        }
        self.base.host().send(msg);
        Ok(())
    }
}
