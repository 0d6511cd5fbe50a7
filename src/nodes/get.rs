use std::sync::Arc;

use async_trait::async_trait;
use node_plugin::{Message, NodeHost};
use tracing::debug;

use super::{apply_snapshot, GET_NODE};
use crate::constraint::ConstraintSet;
use crate::database::{DataSnapshot, Database};
use crate::node::{LeafBase, LeafConfig, LeafNode, NodeContext, NodeError};
use crate::path::resolve_path;

/// Reads a location once per inbound message.
///
/// `msg.constraints`, when present, replaces the configured constraints for
/// that message.
pub struct GetNode {
    base: LeafBase,
    config: LeafConfig,
    constraints: Option<ConstraintSet>,
}

impl GetNode {
    pub fn new(host: Arc<dyn NodeHost>, config: LeafConfig, context: NodeContext) -> Result<Self, NodeError> {
        let constraints = config.constraint_set()?;
        let base = LeafBase::new(host, context, config.database.as_deref());
        Ok(Self { base, config, constraints })
    }

    async fn read(&self, db: &dyn Database, msg: &Message) -> Result<DataSnapshot, NodeError> {
        let scope = self.base.context().scope(Some(msg));
        let path = resolve_path(&self.config.path_property(), &scope, true).await?;
        let ops = match (msg.get("constraints"), &self.constraints) {
            (Some(raw), _) => ConstraintSet::parse(raw)?.evaluate(&scope).await?,
            (None, Some(set)) => set.evaluate(&scope).await?,
            (None, None) => vec![],
        };
        Ok(db.get(path.as_deref(), &ops).await?)
    }
}

#[async_trait]
impl LeafNode for GetNode {
    fn type_name(&self) -> &'static str {
        GET_NODE
    }

    fn base(&self) -> &LeafBase {
        &self.base
    }

    #[tracing::instrument(name = "firebase_get_input", skip(self, msg), fields(node = %self.base.id()))]
    async fn on_input(&self, mut msg: Message) -> Result<(), NodeError> {
        let Some(db) = self.base.client()? else {
            debug!("client released, dropping message");
            return Ok(());
        };
        let result = self.read(db.as_ref(), &msg).await;
        let snapshot = self.base.finish(result)?;
        apply_snapshot(&mut msg, snapshot, self.config.output_type);
        self.base.host().send(msg);
        Ok(())
    }
}
