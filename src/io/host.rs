//! Host output - node messages and status updates
//!
//! The node hands everything it emits to a bounded channel. `HostWriter`
//! drains it into a JSONL file, one object per line:
//!
//! ```text
//! {"ts":1700000000000,"kind":"output","node":"n1","port":0,"msg":{...}}
//! {"ts":1700000000000,"kind":"status","node":"n1","status":{...}}
//! ```

use crate::domain::events::{NodeMessage, NodeStatus};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Something the node reports to its host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HostMessage {
    Output { node: String, port: usize, msg: NodeMessage },
    Status { node: String, status: NodeStatus },
}

/// Current time in epoch milliseconds
pub fn epoch_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

/// Non-blocking handle used by the node to reach the host
#[derive(Debug, Clone)]
pub struct HostSender {
    tx: mpsc::Sender<HostMessage>,
    node_id: String,
    dropped: Arc<AtomicU64>,
}

impl HostSender {
    pub fn new(tx: mpsc::Sender<HostMessage>, node_id: &str) -> Self {
        Self { tx, node_id: node_id.to_string(), dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Messages lost because the host channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn send(&self, port: usize, msg: NodeMessage) {
        self.push(HostMessage::Output { node: self.node_id.clone(), port, msg });
    }

    pub fn status(&self, status: NodeStatus) {
        self.push(HostMessage::Status { node: self.node_id.clone(), status });
    }

    fn push(&self, message: HostMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(node = %self.node_id, dropped_total = %total, "host_message_dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(node = %self.node_id, "host channel closed");
            }
        }
    }
}

/// Create a host channel with the given buffer size
pub fn create_host_channel(
    buffer_size: usize,
    node_id: &str,
) -> (HostSender, mpsc::Receiver<HostMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (HostSender::new(tx, node_id), rx)
}

#[derive(Serialize)]
struct HostLine<'a> {
    ts: u64,
    #[serde(flatten)]
    message: &'a HostMessage,
}

/// Appends host messages to a JSONL file
pub struct HostWriter {
    path: PathBuf,
}

impl HostWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        info!(file = %path.display(), "host_writer_initialized");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one message; returns false when the line could not be written
    pub fn write(&self, message: &HostMessage) -> bool {
        let line = match serde_json::to_string(&HostLine { ts: epoch_ms(), message }) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "host_message_encode_failed");
                return false;
            }
        };

        match self.append_line(&line) {
            Ok(()) => true,
            Err(e) => {
                error!(file = %self.path.display(), error = %e, "host_write_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        debug!(file = %self.path.display(), bytes = %line.len(), "host_line_written");
        Ok(())
    }

    /// Drain the channel until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<HostMessage>) {
        let mut written = 0u64;
        while let Some(message) = rx.recv().await {
            if self.write(&message) {
                written += 1;
            }
        }
        info!(file = %self.path.display(), written = %written, "host_writer_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_write_output_and_status() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/events.jsonl");
        let writer = HostWriter::new(&path);

        let msg = NodeMessage { topic: "clientReady".to_string(), payload: json!({"client": {"id": "c1"}}) };
        assert!(writer.write(&HostMessage::Output { node: "n1".to_string(), port: 0, msg }));
        assert!(writer.write(&HostMessage::Status {
            node: "n1".to_string(),
            status: NodeStatus::clients(1)
        }));

        let parsed = lines(&path);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["kind"], "output");
        assert_eq!(parsed[0]["port"], 0);
        assert_eq!(parsed[0]["msg"]["topic"], "clientReady");
        assert!(parsed[0]["ts"].as_u64().unwrap() > 0);
        assert_eq!(parsed[1]["kind"], "status");
        assert_eq!(parsed[1]["status"]["fill"], "green");
        assert_eq!(parsed[1]["status"]["shape"], "dot");
        assert_eq!(parsed[1]["status"]["text"], "1 connected");
    }

    #[tokio::test]
    async fn test_sender_drops_when_full() {
        let (sender, mut rx) = create_host_channel(1, "n1");
        sender.status(NodeStatus::connected());
        sender.status(NodeStatus::disconnected());
        assert_eq!(sender.dropped(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            HostMessage::Status { node: "n1".to_string(), status: NodeStatus::connected() }
        );
    }

    #[tokio::test]
    async fn test_run_drains_until_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let (sender, rx) = create_host_channel(8, "n1");
        let task = tokio::spawn(HostWriter::new(&path).run(rx));

        sender.send(1, NodeMessage { topic: "publish".to_string(), payload: json!({}) });
        sender.status(NodeStatus::connected());
        drop(sender);
        task.await.unwrap();

        let parsed = lines(&path);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["port"], 1);
        assert_eq!(parsed[0]["node"], "n1");
    }
}
