#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Progress events emitted by unlearning jobs and consumed by pollers, UIs, and audit logs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Progress event encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique identifier.
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Event type (e.g., `unlearning.status`).
    pub event_type: String,
    /// Job the event belongs to, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ProgressEvent {
    /// Creates an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            event_type: event_type.into(),
            job_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Associates the event with a job.
    #[must_use]
    pub fn for_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Event publisher interface.
#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    /// Publishes an event.
    async fn publish(&self, event: ProgressEvent) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait ProgressSubscriber: Send + Sync {
    /// Returns a receiver that yields every event published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<ProgressEvent>>;
}

/// In-memory broadcast bus with a bounded backlog for late readers.
#[derive(Debug, Clone)]
pub struct MemoryProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
    backlog: Arc<Mutex<VecDeque<ProgressEvent>>>,
    limit: usize,
}

impl MemoryProgressBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let limit = capacity.max(1);
        let (sender, _) = broadcast::channel(limit);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(limit))),
            limit,
        }
    }

    /// Snapshot of recent events retained in memory, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Recent events of a given type.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<ProgressEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

/// Publisher that appends events as JSON lines.
#[derive(Debug, Clone)]
pub struct FileProgressPublisher {
    path: PathBuf,
}

impl FileProgressPublisher {
    /// Creates a publisher that appends to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ProgressPublisher for MemoryProgressBus {
    async fn publish(&self, event: ProgressEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(event.clone());
            while backlog.len() > self.limit {
                backlog.pop_front();
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl ProgressSubscriber for MemoryProgressBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<ProgressEvent>> {
        Ok(self.sender.subscribe())
    }
}

#[async_trait]
impl ProgressPublisher for FileProgressPublisher {
    async fn publish(&self, event: ProgressEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&event)?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    fn status_event(epoch: u32) -> ProgressEvent {
        ProgressEvent::new(
            "worker",
            "unlearning.status",
            serde_json::json!({ "current_epoch": epoch }),
        )
        .for_job("9f3c")
    }

    #[test]
    fn publishes_and_receives() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryProgressBus::new(16);
            let mut rx = bus.subscribe().await.unwrap();
            bus.publish(status_event(1)).await.unwrap();
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, "unlearning.status");
            assert_eq!(event.job_id.as_deref(), Some("9f3c"));
        });
    }

    #[test]
    fn backlog_is_bounded() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryProgressBus::new(2);
            for epoch in 0..5 {
                bus.publish(status_event(epoch)).await.unwrap();
            }
            let backlog = bus.snapshot();
            assert_eq!(backlog.len(), 2);
            assert_eq!(backlog[1].payload["current_epoch"], 4);
        });
    }

    #[test]
    fn file_publisher_writes_events() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let publisher = FileProgressPublisher::new(dir.path().join("events.log")).unwrap();
            publisher.publish(status_event(2)).await.unwrap();
            let content = std::fs::read_to_string(publisher.path()).unwrap();
            assert!(content.contains("unlearning.status"));
        });
    }
}
