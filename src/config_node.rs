//! The shared database connection that leaf nodes point at.
//!
//! A [`ConfigNode`] owns exactly one client, tracks the connection state,
//! pushes every state change to its dependents and ref-counts listeners so
//! that leaf nodes observing the same location share one subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use node_plugin::{LogLevel, NodeHost, NodeStatus, PluginError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::constraint::QueryOp;
use crate::database::{AuthMethod, DataSnapshot, Database, DatabaseError, ListenHandle, ListenerKind, SnapshotSink};

/// Settings written by the current editor.
pub const CONFIG_VERSION: u32 = 2;

/// Oldest settings version leaf nodes accept.
pub const MIN_CONFIG_VERSION: u32 = 2;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Sign-in failed. Behaves as `Disconnected` until the next `connect`.
    Errored,
}

impl ConnectionState {
    /// The state dependents get to see.
    pub fn public(self) -> Self {
        match self {
            ConnectionState::Errored => ConnectionState::Disconnected,
            other => other,
        }
    }

    pub fn status(self) -> NodeStatus {
        match self.public() {
            ConnectionState::Connected => NodeStatus::Connected,
            ConnectionState::Connecting => NodeStatus::Connecting,
            _ => NodeStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigNodeSettings {
    pub auth: AuthMethod,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl ConfigNodeSettings {
    pub fn new(auth: AuthMethod) -> Self {
        Self { auth, version: CONFIG_VERSION }
    }

    pub fn is_supported(&self) -> bool {
        self.version >= MIN_CONFIG_VERSION
    }
}

/// A dependent of a config node.
pub trait StatusListener: Send + Sync {
    fn listener_id(&self) -> &str;

    fn on_status(&self, state: ConnectionState) -> Result<(), PluginError>;
}

/// Identity of a shared subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub listener: ListenerKind,
    pub path: Option<String>,
    pub query: String,
}

impl SubscriptionKey {
    pub fn new(listener: ListenerKind, path: Option<&str>, query: &[QueryOp]) -> Self {
        Self {
            listener,
            path: path.map(str::to_string),
            query: serde_json::to_string(query).unwrap_or_default(),
        }
    }
}

struct Subscription {
    refs: usize,
    handle: ListenHandle,
    events: broadcast::Sender<DataSnapshot>,
    latest: Arc<Mutex<Option<DataSnapshot>>>,
}

/// What a subscriber receives from [`ConfigNode::subscribe`].
#[derive(Debug)]
pub struct SubscriptionStream {
    pub key: SubscriptionKey,
    /// Last value seen by an already running `value` subscription.
    pub replay: Option<DataSnapshot>,
    pub events: broadcast::Receiver<DataSnapshot>,
}

pub struct ConfigNode {
    host: Arc<dyn NodeHost>,
    settings: ConfigNodeSettings,
    client: Mutex<Option<Arc<dyn Database>>>,
    state: Mutex<ConnectionState>,
    dependents: Mutex<Vec<Arc<dyn StatusListener>>>,
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    error_reported: AtomicBool,
    liveness: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConfigNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigNode")
            .field("id", &self.host.node_id())
            .field("auth", &self.settings.auth)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConfigNode {
    /// Wraps a client. The client kind must match what the auth method needs.
    pub fn new(
        host: Arc<dyn NodeHost>,
        settings: ConfigNodeSettings,
        client: Arc<dyn Database>,
    ) -> Result<Arc<Self>, DatabaseError> {
        if client.kind() != settings.auth.client_kind() {
            return Err(DatabaseError::Other(format!(
                "{} sign-in needs a {} client, got {}",
                settings.auth.name(),
                settings.auth.client_kind(),
                client.kind()
            )));
        }
        Ok(Arc::new(Self {
            host,
            settings,
            client: Mutex::new(Some(client)),
            state: Mutex::new(ConnectionState::Disconnected),
            dependents: Mutex::new(vec![]),
            subscriptions: Mutex::new(HashMap::new()),
            error_reported: AtomicBool::new(false),
            liveness: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        self.host.node_id()
    }

    pub fn settings(&self) -> &ConfigNodeSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().map(|s| *s).unwrap_or(ConnectionState::Disconnected)
    }

    /// The client, unless the node was closed.
    pub fn client(&self) -> Option<Arc<dyn Database>> {
        self.client.lock().ok().and_then(|c| c.clone())
    }

    pub fn attach(&self, dependent: Arc<dyn StatusListener>) {
        let state = self.state().public();
        if let Ok(mut dependents) = self.dependents.lock() {
            dependents.retain(|d| d.listener_id() != dependent.listener_id());
            dependents.push(dependent.clone());
        }
        if let Err(err) = dependent.on_status(state) {
            warn!(dependent = dependent.listener_id(), %err, "dependent rejected initial status");
        }
    }

    pub fn detach(&self, id: &str) {
        if let Ok(mut dependents) = self.dependents.lock() {
            dependents.retain(|d| d.listener_id() != id);
        }
    }

    pub fn dependent_ids(&self) -> Vec<String> {
        self.dependents
            .lock()
            .map(|d| d.iter().map(|l| l.listener_id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Pushes the state to every dependent in attach order. A failing
    /// dependent does not stop the others.
    fn broadcast(&self, state: ConnectionState) {
        let dependents = self.dependents.lock().map(|d| d.clone()).unwrap_or_default();
        for dependent in dependents {
            if let Err(err) = dependent.on_status(state.public()) {
                warn!(config = self.id(), dependent = dependent.listener_id(), %err, "status broadcast failed");
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        let previous = match self.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, next),
            Err(_) => return,
        };
        debug!(config = self.id(), from = %previous, to = %next, "connection state");
        self.host.status(&next.status());
        self.broadcast(next);
    }

    /// Signs in and starts following the liveness signal.
    pub async fn connect(self: &Arc<Self>) -> Result<(), DatabaseError> {
        let client = self.client().ok_or(DatabaseError::Closed)?;
        if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Connected) {
            return Ok(());
        }
        self.error_reported.store(false, Ordering::SeqCst);
        self.transition(ConnectionState::Connecting);

        let mut liveness = client.connection();
        if let Err(err) = client.sign_in(&self.settings.auth).await {
            self.fail(&err);
            return Err(err);
        }
        info!(config = self.id(), method = self.settings.auth.name(), "signed in");

        while let Ok(up) = liveness.try_recv() {
            self.on_connection_signal(up);
        }
        let node: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                match liveness.recv().await {
                    Ok(up) => match node.upgrade() {
                        Some(node) => node.on_connection_signal(up),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Ok(mut slot) = self.liveness.lock() {
            if let Some(old) = slot.replace(task) {
                old.abort();
            }
        }
        Ok(())
    }

    fn fail(&self, err: &DatabaseError) {
        self.transition(ConnectionState::Errored);
        if !self.error_reported.swap(true, Ordering::SeqCst) {
            error!(config = self.id(), %err, "sign-in failed");
            self.host.log(LogLevel::Error, &err.to_string());
            self.host.status(&NodeStatus::Error(err.to_string()));
        }
    }

    /// Applies a liveness signal from the backend. `Errored` counts as
    /// `Disconnected` here.
    pub fn on_connection_signal(&self, up: bool) {
        let next = match (self.state().public(), up) {
            (ConnectionState::Connecting | ConnectionState::Disconnected, true) => ConnectionState::Connected,
            (ConnectionState::Connected, false) => ConnectionState::Connecting,
            _ => return,
        };
        self.transition(next);
    }

    /// Ref-counted listener registration.
    pub fn subscribe(
        &self,
        listener: ListenerKind,
        path: Option<&str>,
        query: &[QueryOp],
    ) -> Result<SubscriptionStream, DatabaseError> {
        let key = SubscriptionKey::new(listener, path, query);
        let mut subscriptions = self
            .subscriptions
            .lock()
            .map_err(|_| DatabaseError::Other("subscription table poisoned".into()))?;

        if let Some(existing) = subscriptions.get_mut(&key) {
            existing.refs += 1;
            debug!(config = self.id(), ?key, refs = existing.refs, "joined subscription");
            // Receiver before replay: an event landing in between is seen twice, never lost.
            let events = existing.events.subscribe();
            let replay = match listener {
                ListenerKind::Value => existing.latest.lock().ok().and_then(|l| l.clone()),
                _ => None,
            };
            return Ok(SubscriptionStream { key, replay, events });
        }

        let client = self.client().ok_or(DatabaseError::Closed)?;
        let (events, receiver) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let latest = Arc::new(Mutex::new(None));
        let sink: SnapshotSink = {
            let events = events.clone();
            let latest = latest.clone();
            Arc::new(move |snapshot: DataSnapshot| {
                if listener == ListenerKind::Value {
                    if let Ok(mut slot) = latest.lock() {
                        *slot = Some(snapshot.clone());
                    }
                }
                let _ = events.send(snapshot);
            })
        };
        let handle = client.listen(listener, path, query, sink)?;
        info!(config = self.id(), ?key, "subscribed");
        subscriptions.insert(key.clone(), Subscription { refs: 1, handle, events, latest });
        Ok(SubscriptionStream { key, replay: None, events: receiver })
    }

    /// Drops one reference. Unknown keys are ignored.
    pub fn unsubscribe(&self, key: &SubscriptionKey) {
        let Ok(mut subscriptions) = self.subscriptions.lock() else { return };
        let Some(existing) = subscriptions.get_mut(key) else {
            debug!(config = self.id(), ?key, "unsubscribe for untracked subscription");
            return;
        };
        existing.refs -= 1;
        if existing.refs == 0 {
            if let Some(sub) = subscriptions.remove(key) {
                sub.handle.cancel();
                info!(config = self.id(), ?key, "subscription cancelled");
            }
        }
    }

    pub fn subscription_refs(&self, key: &SubscriptionKey) -> usize {
        self.subscriptions.lock().ok().and_then(|s| s.get(key).map(|s| s.refs)).unwrap_or(0)
    }

    /// Signs out, disposes the client and releases it.
    pub async fn close(&self) {
        if let Ok(mut slot) = self.liveness.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .map(|mut s| s.drain().map(|(_, sub)| sub).collect())
            .unwrap_or_default();
        for sub in subscriptions {
            sub.handle.cancel();
        }

        let client = self.client.lock().ok().and_then(|mut c| c.take());
        if let Some(client) = client {
            if let Err(err) = client.sign_out().await {
                warn!(config = self.id(), %err, "sign-out failed");
            }
            client.dispose().await;
        }
        self.transition(ConnectionState::Disconnected);
        info!(config = self.id(), "closed");
    }
}

/// Deployed config nodes by id.
#[derive(Debug, Default)]
pub struct ConfigNodeRegistry {
    nodes: DashMap<String, Arc<ConfigNode>>,
}

impl ConfigNodeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: Arc<ConfigNode>) {
        self.nodes.insert(node.id().to_string(), node);
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConfigNode>> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<ConfigNode>> {
        self.nodes.remove(id).map(|(_, n)| n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ClientKind, MemoryDatabase, WriteOp};
    use node_plugin::plugin_test_util::RecordingHost;
    use serde_json::json;

    struct Recorder {
        id: String,
        seen: Mutex<Vec<ConnectionState>>,
        fail: bool,
    }

    impl Recorder {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self { id: id.into(), seen: Mutex::new(vec![]), fail })
        }

        fn seen(&self) -> Vec<ConnectionState> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl StatusListener for Recorder {
        fn listener_id(&self) -> &str {
            &self.id
        }

        fn on_status(&self, state: ConnectionState) -> Result<(), PluginError> {
            self.seen.lock().unwrap().push(state);
            if self.fail { Err(PluginError::Closed(self.id.clone())) } else { Ok(()) }
        }
    }

    fn node(db: &Arc<MemoryDatabase>) -> (Arc<ConfigNode>, Arc<RecordingHost>) {
        let host = RecordingHost::new("db-config");
        let node = ConfigNode::new(host.clone(), ConfigNodeSettings::new(AuthMethod::Anonymous), db.clone()).unwrap();
        (node, host)
    }

    #[tokio::test]
    async fn test_connect_and_broadcast_in_order() {
        let db = MemoryDatabase::new(ClientKind::User);
        let (node, host) = node(&db);
        let first = Recorder::new("a", true);
        let second = Recorder::new("b", false);
        node.attach(first.clone());
        node.attach(second.clone());
        assert_eq!(node.dependent_ids(), vec!["a", "b"]);

        node.connect().await.unwrap();
        assert_eq!(node.state(), ConnectionState::Connected);
        let expected = vec![ConnectionState::Disconnected, ConnectionState::Connecting, ConnectionState::Connected];
        assert_eq!(first.seen(), expected);
        assert_eq!(second.seen(), expected);
        assert_eq!(host.last_status(), Some(NodeStatus::Connected));

        node.on_connection_signal(false);
        assert_eq!(node.state(), ConnectionState::Connecting);
        node.on_connection_signal(true);
        assert_eq!(second.seen().last(), Some(&ConnectionState::Connected));

        node.detach("a");
        node.close().await;
        assert_eq!(node.state(), ConnectionState::Disconnected);
        assert_eq!(first.seen().len(), 5);
        assert_eq!(second.seen().last(), Some(&ConnectionState::Disconnected));
        assert!(node.client().is_none());
        assert!(db.is_closed());
        assert_eq!(node.connect().await, Err(DatabaseError::Closed));
    }

    #[tokio::test]
    async fn test_liveness_signal_is_followed() {
        let db = MemoryDatabase::new(ClientKind::User);
        let (node, _host) = node(&db);
        node.connect().await.unwrap();
        db.set_online(false);
        for _ in 0..50 {
            if node.state() == ConnectionState::Connecting {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(node.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported_once() {
        let db = MemoryDatabase::new(ClientKind::User);
        db.reject_auth("bad credentials");
        let (node, host) = node(&db);
        let dependent = Recorder::new("leaf", false);
        node.attach(dependent.clone());

        assert!(node.connect().await.is_err());
        assert_eq!(node.state(), ConnectionState::Errored);
        assert_eq!(dependent.seen().last(), Some(&ConnectionState::Disconnected));
        assert!(matches!(host.last_status(), Some(NodeStatus::Error(_))));

        assert_eq!(host.logs().len(), 1);

        node.on_connection_signal(false);
        assert_eq!(node.state(), ConnectionState::Errored);
        node.on_connection_signal(true);
        assert_eq!(node.state(), ConnectionState::Connected);
        assert_eq!(dependent.seen().last(), Some(&ConnectionState::Connected));
        assert_eq!(host.last_status(), Some(NodeStatus::Connected));
        assert_eq!(host.logs().len(), 1);
    }

    #[test]
    fn test_client_kind_must_match_auth() {
        let db = MemoryDatabase::new(ClientKind::User);
        let host = RecordingHost::new("admin");
        let settings = ConfigNodeSettings::new(AuthMethod::PrivateKey {
            client_email: "svc@example.iam".into(),
            private_key: "key".into(),
            project_id: None,
        });
        assert!(ConfigNode::new(host, settings, db).is_err());
    }

    #[tokio::test]
    async fn test_subscriptions_are_shared() {
        let db = MemoryDatabase::new(ClientKind::User);
        let (node, _host) = node(&db);
        let query = [QueryOp::OrderByKey];

        let mut streams = vec![];
        for _ in 0..3 {
            streams.push(node.subscribe(ListenerKind::Value, Some("room"), &query).unwrap());
        }
        let key = streams[0].key.clone();
        assert_eq!(node.subscription_refs(&key), 3);
        assert_eq!(db.listen_calls(), 1);

        let other = node.subscribe(ListenerKind::Value, Some("room"), &[]).unwrap();
        assert_ne!(other.key, key);
        assert_eq!(db.listen_calls(), 2);
        node.unsubscribe(&other.key);

        db.write(Some("room/a"), WriteOp::Set(json!(1))).await.unwrap();
        assert_eq!(streams[2].events.try_recv().unwrap().value, json!({"a": 1}));
        let late = node.subscribe(ListenerKind::Value, Some("room"), &query).unwrap();
        assert_eq!(late.replay.unwrap().value, json!({"a": 1}));

        for _ in 0..4 {
            node.unsubscribe(&key);
        }
        assert_eq!(db.listen_calls(), 2);
        assert_eq!(db.cancel_calls(), 2);
        assert_eq!(node.subscription_refs(&key), 0);

        node.unsubscribe(&key);
        assert_eq!(db.cancel_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_joiners_see_the_latest_value() {
        let db = MemoryDatabase::new(ClientKind::User);
        let (node, _host) = node(&db);
        let _first = node.subscribe(ListenerKind::Value, Some("counter"), &[]).unwrap();

        let writer = {
            let db = db.clone();
            tokio::spawn(async move {
                for i in 1..=200 {
                    db.write(Some("counter"), WriteOp::Set(json!(i))).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut joiners = vec![];
        while !writer.is_finished() {
            joiners.push(node.subscribe(ListenerKind::Value, Some("counter"), &[]).unwrap());
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();

        for mut joiner in joiners {
            let mut last = joiner.replay.take().map(|s| s.value);
            while let Ok(snapshot) = joiner.events.try_recv() {
                last = Some(snapshot.value);
            }
            assert_eq!(last, Some(json!(200)));
        }
    }

    #[test]
    fn test_registry_and_settings() {
        let db = MemoryDatabase::new(ClientKind::User);
        let (node, _host) = node(&db);
        let registry = ConfigNodeRegistry::new();
        registry.register(node);
        assert!(registry.get("db-config").is_some());
        assert!(registry.remove("db-config").is_some());
        assert!(registry.get("db-config").is_none());

        let settings: ConfigNodeSettings = serde_json::from_value(json!({"auth": {"method": "anonymous"}})).unwrap();
        assert_eq!(settings.version, CONFIG_VERSION);
        let old: ConfigNodeSettings =
            serde_json::from_value(json!({"auth": {"method": "anonymous"}, "version": 1})).unwrap();
        assert!(!old.is_supported());
    }
}
