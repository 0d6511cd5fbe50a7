use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::message::Message;
use crate::plugin::{LogLevel, NodeHost, NodeStatus};

/// A `NodeHost` that records everything a node does to it.
pub struct RecordingHost {
    id: String,
    statuses: Mutex<Vec<NodeStatus>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
    sent: Mutex<Vec<Message>>,
    sent_tx: UnboundedSender<Message>,
    sent_rx: tokio::sync::Mutex<UnboundedReceiver<Message>>,
}

impl RecordingHost {
    pub fn new(id: &str) -> Arc<Self> {
        let (sent_tx, sent_rx) = unbounded_channel();
        Arc::new(Self {
            id: id.to_string(),
            statuses: Mutex::new(vec![]),
            logs: Mutex::new(vec![]),
            sent: Mutex::new(vec![]),
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
        })
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.statuses.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_status(&self) -> Option<NodeStatus> {
        self.statuses().last().cloned()
    }

    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Waits for the next message the node sends.
    pub async fn next_sent(&self, timeout: Duration) -> Option<Message> {
        let mut rx = self.sent_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

impl NodeHost for RecordingHost {
    fn node_id(&self) -> &str {
        &self.id
    }

    fn status(&self, status: &NodeStatus) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.push(status.clone());
        }
    }

    fn send(&self, msg: Message) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(msg.clone());
        }
        let _ = self.sent_tx.send(msg);
    }

    fn log(&self, level: LogLevel, text: &str) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push((level, text.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_host() {
        let host = RecordingHost::new("n1");
        host.status(&NodeStatus::Connected);
        host.log(LogLevel::Warn, "careful");
        host.send(Message::new(json!(1)));

        assert_eq!(host.node_id(), "n1");
        assert_eq!(host.last_status(), Some(NodeStatus::Connected));
        assert_eq!(host.logs(), vec![(LogLevel::Warn, "careful".to_string())]);
        let next = host.next_sent(Duration::from_millis(50)).await.unwrap();
        assert_eq!(next.payload(), Some(&json!(1)));
        assert!(host.next_sent(Duration::from_millis(10)).await.is_none());
    }
}
