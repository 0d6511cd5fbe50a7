use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::message::Message;

/// What log levels are supported?
/// Higher-value variants are more severe.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Red,
    Green,
    Yellow,
    Blue,
    Grey,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Ring,
    Dot,
}

/// The badge the editor renders under a node.
/// An empty badge (no fill, no shape, no text) clears the status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct StatusBadge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<Fill>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    #[serde(default)]
    pub text: String,
}

impl StatusBadge {
    pub fn new(fill: Fill, shape: Shape, text: impl Into<String>) -> Self {
        Self { fill: Some(fill), shape: Some(shape), text: text.into() }
    }

    pub fn is_clear(&self) -> bool {
        self.fill.is_none() && self.shape.is_none() && self.text.is_empty()
    }
}

/// Status a node reports to its host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Subscribed,
    PermissionDenied,
    Error(String),
}

impl NodeStatus {
    pub fn badge(&self) -> StatusBadge {
        match self {
            NodeStatus::Idle => StatusBadge::default(),
            NodeStatus::Connecting => StatusBadge::new(Fill::Yellow, Shape::Ring, "connecting"),
            NodeStatus::Connected => StatusBadge::new(Fill::Green, Shape::Dot, "connected"),
            NodeStatus::Disconnected => StatusBadge::new(Fill::Red, Shape::Ring, "disconnected"),
            NodeStatus::Subscribed => StatusBadge::new(Fill::Blue, Shape::Dot, "subscribed"),
            NodeStatus::PermissionDenied => StatusBadge::new(Fill::Red, Shape::Dot, "permission denied"),
            NodeStatus::Error(text) => StatusBadge::new(Fill::Red, Shape::Dot, text.clone()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NodeStatus::Error(_) | NodeStatus::PermissionDenied)
    }
}

/// The services the flow host runtime offers to a node instance.
///
/// One `NodeHost` is bound to exactly one deployed node. The host decides how
/// badges are rendered and where sent messages are wired to.
pub trait NodeHost: Send + Sync {
    /// Id of the node this host handle belongs to.
    fn node_id(&self) -> &str;

    /// Render a status badge for the node.
    fn status(&self, status: &NodeStatus);

    /// Emit a message on the node's output.
    fn send(&self, msg: Message);

    /// Structured log line attributed to the node.
    fn log(&self, level: LogLevel, text: &str);
}

/// Errors a dependent can return while the host pushes something into it.
#[derive(Error, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum PluginError {
    /// The node was closed and no longer accepts calls.
    #[error("node `{0}` is closed")]
    Closed(String),
}
