pub mod message;
pub mod plugin;

#[cfg(any(test, feature = "test-utils"))]
pub mod plugin_test_util;

pub use message::Message;
pub use plugin::{Fill, LogLevel, NodeHost, NodeStatus, PluginError, Shape, StatusBadge};
