//! Channel identity and the runtime counters hanging off it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::task::{PackageFormat, Task};

/// A channel declaration after id assignment and wildcard resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: String,
    pub name: String,
    pub tasks: Vec<Task>,
}

impl ChannelSpec {
    /// Concrete spec produced by resolving a wildcard against a live stream name
    pub fn resolved_from(wildcard: &ChannelSpec, name: &str) -> Self {
        Self {
            id: format!("{}_{}", wildcard.id, name),
            name: name.to_string(),
            tasks: wildcard.tasks.clone(),
        }
    }
}

/// An online channel.
///
/// Identity fields never change after creation. `connect_attempts` and
/// `running_tasks` are updated by the channel's own supervisor only.
#[derive(Debug)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub app: String,
    pub service: String,
    pub source_url: String,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    connect_attempts: AtomicU32,
    running_tasks: RwLock<Vec<RunningTask>>,
}

/// Byte counter of one packaging process in the current generation
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub protocol: PackageFormat,
    pub bytes: Arc<AtomicU64>,
    pub path: PathBuf,
}

impl RunningTask {
    pub fn new(protocol: PackageFormat, path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            protocol,
            bytes: Arc::new(AtomicU64::new(0)),
            path,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RunningTaskSnapshot {
        RunningTaskSnapshot {
            id: self.id,
            created_at: self.created_at,
            protocol: self.protocol,
            bytes: self.bytes(),
            path: self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTaskSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub protocol: PackageFormat,
    pub bytes: u64,
    pub path: PathBuf,
}

/// Point-in-time, read-only view of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub app: String,
    pub service: String,
    pub source_url: String,
    pub tasks: Vec<Task>,
    pub created_at: DateTime<Utc>,
    pub connect_attempts: u32,
    pub running_tasks: Vec<RunningTaskSnapshot>,
}

impl Channel {
    pub fn new(
        spec: &ChannelSpec,
        app: impl Into<String>,
        service: impl Into<String>,
        source_url: impl Into<String>,
        tasks: Vec<Task>,
    ) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            app: app.into(),
            service: service.into(),
            source_url: source_url.into(),
            tasks,
            created_at: Utc::now(),
            connect_attempts: AtomicU32::new(0),
            running_tasks: RwLock::new(Vec::new()),
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Records a finished ingest attempt and returns the new total.
    pub(crate) fn record_attempt(&self) -> u32 {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) async fn set_running_tasks(&self, tasks: Vec<RunningTask>) {
        *self.running_tasks.write().await = tasks;
    }

    pub(crate) async fn clear_running_tasks(&self) {
        self.running_tasks.write().await.clear();
    }

    pub async fn running_tasks(&self) -> Vec<RunningTask> {
        self.running_tasks.read().await.clone()
    }

    pub async fn snapshot(&self) -> ChannelSnapshot {
        let running_tasks = self
            .running_tasks
            .read()
            .await
            .iter()
            .map(RunningTask::snapshot)
            .collect();
        ChannelSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            app: self.app.clone(),
            service: self.service.clone(),
            source_url: self.source_url.clone(),
            tasks: self.tasks.clone(),
            created_at: self.created_at,
            connect_attempts: self.connect_attempts(),
            running_tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChannelSpec {
        ChannelSpec {
            id: "wc".into(),
            name: "*".into(),
            tasks: vec![Task::Package { format: PackageFormat::Hls }],
        }
    }

    #[test]
    fn resolved_ids_are_derived_from_wildcard() {
        let resolved = ChannelSpec::resolved_from(&spec(), "s1");
        assert_eq!(resolved.id, "wc_s1");
        assert_eq!(resolved.name, "s1");
        assert_eq!(resolved.tasks, spec().tasks);
        assert_eq!(ChannelSpec::resolved_from(&spec(), "s1"), resolved);
    }

    #[tokio::test]
    async fn attempts_accumulate_and_running_tasks_reset() {
        let channel = Channel::new(&spec(), "live", "klpq", "rtmp://o/live/s1", spec().tasks);
        assert_eq!(channel.record_attempt(), 1);
        assert_eq!(channel.record_attempt(), 2);

        let task = RunningTask::new(PackageFormat::Hls, PathBuf::from("hls/wc"));
        task.bytes.fetch_add(4096, Ordering::Relaxed);
        channel.set_running_tasks(vec![task]).await;

        let snap = channel.snapshot().await;
        assert_eq!(snap.connect_attempts, 2);
        assert_eq!(snap.running_tasks.len(), 1);
        assert_eq!(snap.running_tasks[0].bytes, 4096);

        channel.clear_running_tasks().await;
        assert!(channel.running_tasks().await.is_empty());
        assert_eq!(channel.connect_attempts(), 2);
    }
}
