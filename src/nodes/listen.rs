use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use node_plugin::{Message, NodeHost};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{apply_snapshot, IN_NODE};
use crate::config_node::{ConfigNode, SubscriptionKey, SubscriptionStream};
use crate::constraint::ConstraintSet;
use crate::database::{DataSnapshot, ListenerKind};
use crate::node::{LeafBase, LeafConfig, LeafNode, NodeContext, NodeError, OutputType};
use crate::path::resolve_path;

struct Active {
    key: SubscriptionKey,
    forward: JoinHandle<()>,
}

/// Subscribes to a location on start and emits one message per event.
///
/// Path and constraints are resolved without a message, so they may not
/// reference `msg`.
pub struct InNode {
    base: LeafBase,
    config: LeafConfig,
    constraints: Option<ConstraintSet>,
    listener: ListenerKind,
    active: Mutex<Option<Active>>,
}

impl InNode {
    pub fn new(host: Arc<dyn NodeHost>, config: LeafConfig, context: NodeContext) -> Result<Self, NodeError> {
        let constraints = config.constraint_set()?;
        let listener = config.listener_type.unwrap_or(ListenerKind::Value);
        let base = LeafBase::new(host, context, config.database.as_deref());
        Ok(Self { base, config, constraints, listener, active: Mutex::new(None) })
    }

    async fn subscribe(&self, node: &ConfigNode) -> Result<SubscriptionStream, NodeError> {
        let scope = self.base.context().scope(None);
        let path = resolve_path(&self.config.path_property(), &scope, true).await?;
        let ops = match &self.constraints {
            Some(set) => set.evaluate(&scope).await?,
            None => vec![],
        };
        Ok(node.subscribe(self.listener, path.as_deref(), &ops)?)
    }

    fn is_active(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(false)
    }
}

async fn forward(
    host: Arc<dyn NodeHost>,
    replay: Option<DataSnapshot>,
    mut events: broadcast::Receiver<DataSnapshot>,
    output: OutputType,
) {
    let emit = |snapshot: DataSnapshot| {
        let mut msg = Message::new(Value::Null);
        apply_snapshot(&mut msg, snapshot, output);
        host.send(msg);
    };
    if let Some(snapshot) = replay {
        emit(snapshot);
    }
    loop {
        match events.recv().await {
            Ok(snapshot) => emit(snapshot),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(node = host.node_id(), skipped, "subscriber fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl LeafNode for InNode {
    fn type_name(&self) -> &'static str {
        IN_NODE
    }

    fn base(&self) -> &LeafBase {
        &self.base
    }

    #[tracing::instrument(name = "firebase_in_start", skip(self), fields(node = %self.base.id(), listener = %self.listener))]
    async fn start(&self) -> Result<(), NodeError> {
        if self.base.client()?.is_none() || self.is_active() {
            return Ok(());
        }
        let Some(node) = self.base.config_node().cloned() else {
            return Ok(());
        };
        let result = self.subscribe(&node).await;
        let stream = self.base.finish(result)?;
        info!(key = ?stream.key, "listening");

        let key = stream.key.clone();
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(_) => {
                node.unsubscribe(&key);
                return Err(NodeError::Backend("subscription state poisoned".into()));
            }
        };
        // close() ran while the path or constraints were resolving
        if self.base.status().is_closed() {
            drop(active);
            node.unsubscribe(&key);
            info!(key = ?key, "closed while starting, released");
            return Ok(());
        }
        let task = tokio::spawn(forward(
            self.base.host().clone(),
            stream.replay,
            stream.events,
            self.config.output_type,
        ));
        *active = Some(Active { key, forward: task });
        drop(active);
        self.base.status().set_subscribed(true);
        Ok(())
    }

    async fn close(&self) {
        // Marked closed before `active` is taken; start() re-checks under the same lock.
        self.base.close();
        let active = self.active.lock().ok().and_then(|mut a| a.take());
        if let Some(active) = active {
            active.forward.abort();
            if let Some(node) = self.base.config_node() {
                node.unsubscribe(&active.key);
            }
        }
    }
}
