//! The seam to the realtime database SDK.
//!
//! A [`Database`] is one client: either a user-mode client (API key, with
//! anonymous or email/password sign-in) or an admin-mode client (service
//! account). The config node owns exactly one and hands it to its leaf nodes.

pub mod memory;
pub mod query;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::constraint::QueryOp;
use crate::payload::Priority;

pub use memory::MemoryDatabase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ListenerKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildMoved,
    ChildRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ClientKind {
    User,
    Admin,
}

/// How a config node authenticates.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum AuthMethod {
    Anonymous,
    Email {
        email: String,
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    PrivateKey {
        client_email: String,
        private_key: String,
        #[serde(default)]
        project_id: Option<String>,
    },
}

impl AuthMethod {
    pub fn client_kind(&self) -> ClientKind {
        match self {
            AuthMethod::PrivateKey { .. } => ClientKind::Admin,
            _ => ClientKind::User,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Anonymous => "anonymous",
            AuthMethod::Email { .. } => "email",
            AuthMethod::PrivateKey { .. } => "privateKey",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Anonymous => f.write_str("Anonymous"),
            AuthMethod::Email { email, .. } => f.debug_struct("Email").field("email", email).finish_non_exhaustive(),
            AuthMethod::PrivateKey { client_email, project_id, .. } => f
                .debug_struct("PrivateKey")
                .field("client_email", client_email)
                .field("project_id", project_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatabaseError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("database client is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// The data at a location, as delivered by a read or a listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSnapshot {
    pub key: Option<String>,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_child_name: Option<String>,
}

impl DataSnapshot {
    pub fn exists(&self) -> bool {
        !self.value.is_null()
    }
}

pub type SnapshotSink = Arc<dyn Fn(DataSnapshot) + Send + Sync>;

/// Cancels a listener registered with [`Database::listen`].
pub struct ListenHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ListenHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenHandle").field("armed", &self.cancel.is_some()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum WriteKind {
    Set,
    Push,
    Update,
    Remove,
    SetPriority,
    SetWithPriority,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set(Value),
    Push(Value),
    Update(Map<String, Value>),
    Remove,
    SetPriority(Option<Priority>),
    SetWithPriority(Value, Option<Priority>),
}

impl WriteOp {
    pub fn kind(&self) -> WriteKind {
        match self {
            WriteOp::Set(_) => WriteKind::Set,
            WriteOp::Push(_) => WriteKind::Push,
            WriteOp::Update(_) => WriteKind::Update,
            WriteOp::Remove => WriteKind::Remove,
            WriteOp::SetPriority(_) => WriteKind::SetPriority,
            WriteOp::SetWithPriority(..) => WriteKind::SetWithPriority,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, EnumString, AsRefStr, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OnDisconnectKind {
    Cancel,
    Remove,
    Set,
    SetWithPriority,
    Update,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnDisconnectOp {
    Cancel,
    Remove,
    Set(Value),
    SetWithPriority(Value, Option<Priority>),
    Update(Map<String, Value>),
}

/// One database client.
///
/// Reads and writes are async. Listener registration is synchronous: the
/// sink is called for every event until the returned handle is cancelled.
#[async_trait]
pub trait Database: Send + Sync {
    fn kind(&self) -> ClientKind;

    async fn sign_in(&self, auth: &AuthMethod) -> Result<(), DatabaseError>;

    async fn sign_out(&self) -> Result<(), DatabaseError>;

    /// Liveness of the backend connection (`true` when connected).
    fn connection(&self) -> broadcast::Receiver<bool>;

    async fn get(&self, path: Option<&str>, query: &[QueryOp]) -> Result<DataSnapshot, DatabaseError>;

    fn listen(
        &self,
        listener: ListenerKind,
        path: Option<&str>,
        query: &[QueryOp],
        sink: SnapshotSink,
    ) -> Result<ListenHandle, DatabaseError>;

    /// Applies a write. Returns the generated key for pushes.
    async fn write(&self, path: Option<&str>, op: WriteOp) -> Result<Option<String>, DatabaseError>;

    async fn on_disconnect(&self, path: Option<&str>, op: OnDisconnectOp) -> Result<(), DatabaseError>;

    async fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_auth_method_serde() {
        let auth: AuthMethod = serde_json::from_value(json!({
            "method": "privateKey",
            "clientEmail": "svc@example.iam",
            "privateKey": "-----BEGIN-----"
        }))
        .unwrap();
        assert_eq!(auth.client_kind(), ClientKind::Admin);
        assert_eq!(auth.name(), "privateKey");
        assert!(!format!("{auth:?}").contains("BEGIN"));

        let anon: AuthMethod = serde_json::from_value(json!({"method": "anonymous"})).unwrap();
        assert_eq!(anon.client_kind(), ClientKind::User);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ListenerKind::from_str("child_added").unwrap(), ListenerKind::ChildAdded);
        assert_eq!(ListenerKind::ChildMoved.to_string(), "child_moved");
        assert_eq!(WriteKind::from_str("setWithPriority").unwrap(), WriteKind::SetWithPriority);
        assert_eq!(OnDisconnectKind::from_str("cancel").unwrap(), OnDisconnectKind::Cancel);
        assert_eq!(WriteOp::Remove.kind(), WriteKind::Remove);
    }

    #[test]
    fn test_listen_handle_cancels_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = flag.clone();
        let handle = ListenHandle::new(move || seen.store(true, Ordering::SeqCst));
        assert!(format!("{handle:?}").contains("true"));
        handle.cancel();
        assert!(flag.load(Ordering::SeqCst));
    }
}
