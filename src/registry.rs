//! Active-task registry — concurrency-safe tracker of in-flight
//! long-running background operations.
//!
//! One registry per task category (asset generation, submission). Each
//! holds at most one live entry per job. Entries are updated in place by
//! the owning background task, read by pollers, and evicted lazily once a
//! retention window past completion has elapsed. Updates fan out over a
//! broadcast channel so live observers don't need to poll.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::RegistryError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Category of background work. Each category gets its own registry, so a
/// submission and an asset-generation task may coexist for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    AssetGeneration,
    Submission,
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AssetGeneration => write!(f, "asset_generation"),
            Self::Submission => write!(f, "submission"),
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset_generation" => Ok(Self::AssetGeneration),
            "submission" => Ok(Self::Submission),
            other => Err(format!("unknown task category '{other}'")),
        }
    }
}

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One registry entry, readable by pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub job_id: String,
    pub category: TaskCategory,
    pub state: TaskState,
    /// Free-text name of the current step.
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ordered progress lines, append-only.
    pub log: Vec<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl TaskStatus {
    fn new(job_id: &str, category: TaskCategory) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            category,
            state: TaskState::Pending,
            stage: "queued".to_string(),
            started_at: now,
            updated_at: now,
            log: Vec::new(),
            error: None,
            result: None,
        }
    }

    fn is_evictable(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        if self.state.is_live() {
            return false;
        }
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map(|a| a > retention).unwrap_or(false)
    }
}

/// Event pushed to observers on every registry mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        job_id: String,
        category: TaskCategory,
    },
    Progress {
        job_id: String,
        category: TaskCategory,
        stage: String,
        line: String,
    },
    Completed {
        job_id: String,
        category: TaskCategory,
    },
    Failed {
        job_id: String,
        category: TaskCategory,
        error: String,
    },
}

/// Write handle owned by the background task driving one operation.
///
/// Holds the entry's own lock, so progress updates never contend with
/// unrelated jobs.
#[derive(Debug)]
pub struct TaskHandle {
    job_id: String,
    category: TaskCategory,
    entry: Arc<RwLock<TaskStatus>>,
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Mark the current step and move to in-progress.
    pub async fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        {
            let mut entry = self.entry.write().await;
            entry.state = TaskState::InProgress;
            entry.stage = stage.clone();
            entry.updated_at = Utc::now();
        }
        let _ = self.tx.send(TaskEvent::Progress {
            job_id: self.job_id.clone(),
            category: self.category,
            stage,
            line: String::new(),
        });
    }

    /// Append a progress line.
    pub async fn append_log(&self, line: impl Into<String>) {
        let line = line.into();
        let stage = {
            let mut entry = self.entry.write().await;
            entry.log.push(line.clone());
            entry.updated_at = Utc::now();
            entry.stage.clone()
        };
        let _ = self.tx.send(TaskEvent::Progress {
            job_id: self.job_id.clone(),
            category: self.category,
            stage,
            line,
        });
    }

    /// Mark the task completed with a result payload.
    pub async fn complete(&self, result: serde_json::Value) {
        {
            let mut entry = self.entry.write().await;
            entry.state = TaskState::Completed;
            entry.stage = "done".to_string();
            entry.result = Some(result);
            entry.updated_at = Utc::now();
        }
        info!(job_id = %self.job_id, category = %self.category, "Task completed");
        let _ = self.tx.send(TaskEvent::Completed {
            job_id: self.job_id.clone(),
            category: self.category,
        });
    }

    /// Mark the task failed.
    pub async fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        {
            let mut entry = self.entry.write().await;
            entry.state = TaskState::Failed;
            entry.error = Some(error.clone());
            entry.updated_at = Utc::now();
        }
        warn!(job_id = %self.job_id, category = %self.category, error = %error, "Task failed");
        let _ = self.tx.send(TaskEvent::Failed {
            job_id: self.job_id.clone(),
            category: self.category,
            error,
        });
    }
}

/// Registry of in-flight tasks for one category.
///
/// The outer map lock is held only for insert/lookup; entry updates go
/// through each entry's own lock.
pub struct ActiveTaskRegistry {
    category: TaskCategory,
    retention: Duration,
    entries: RwLock<HashMap<String, Arc<RwLock<TaskStatus>>>>,
    tx: broadcast::Sender<TaskEvent>,
}

impl ActiveTaskRegistry {
    pub fn new(category: TaskCategory, retention: Duration) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            category,
            retention,
            entries: RwLock::new(HashMap::new()),
            tx,
        })
    }

    pub fn category(&self) -> TaskCategory {
        self.category
    }

    /// Subscribe to live task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Begin tracking a task for a job.
    ///
    /// Fails if a live entry already exists for this job — this is what
    /// makes a second concurrent submission impossible. A terminal entry
    /// from an earlier attempt is replaced.
    pub async fn begin(&self, job_id: &str) -> Result<TaskHandle, RegistryError> {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get(job_id) {
            let state = existing.read().await.state;
            if state.is_live() {
                return Err(RegistryError::AlreadyActive {
                    category: self.category.to_string(),
                    job_id: job_id.to_string(),
                });
            }
        }

        let entry = Arc::new(RwLock::new(TaskStatus::new(job_id, self.category)));
        entries.insert(job_id.to_string(), Arc::clone(&entry));
        drop(entries);

        debug!(job_id = job_id, category = %self.category, "Task registered");
        let _ = self.tx.send(TaskEvent::Started {
            job_id: job_id.to_string(),
            category: self.category,
        });

        Ok(TaskHandle {
            job_id: job_id.to_string(),
            category: self.category,
            entry,
            tx: self.tx.clone(),
        })
    }

    /// Read one entry. Entries past retention are evicted on access.
    pub async fn get(&self, job_id: &str) -> Option<TaskStatus> {
        let snapshot = {
            let entries = self.entries.read().await;
            match entries.get(job_id) {
                Some(entry) => entry.read().await.clone(),
                None => return None,
            }
        };

        if snapshot.is_evictable(self.retention, Utc::now()) {
            self.evict_if_stale(job_id).await;
            return None;
        }
        Some(snapshot)
    }

    /// Snapshot all current entries, oldest first. Evicts stale ones.
    pub async fn snapshot(&self) -> Vec<TaskStatus> {
        let now = Utc::now();
        let mut result = Vec::new();
        let mut stale = Vec::new();

        {
            let entries = self.entries.read().await;
            for (job_id, entry) in entries.iter() {
                let status = entry.read().await.clone();
                if status.is_evictable(self.retention, now) {
                    stale.push(job_id.clone());
                } else {
                    result.push(status);
                }
            }
        }

        if !stale.is_empty() {
            for job_id in &stale {
                self.evict_if_stale(job_id).await;
            }
            debug!(count = stale.len(), category = %self.category, "Evicted stale tasks");
        }

        result.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        result
    }

    /// Remove an entry unless a fresh task replaced it in the meantime.
    async fn evict_if_stale(&self, job_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(job_id) {
            if entry.read().await.is_evictable(self.retention, Utc::now()) {
                entries.remove(job_id);
            }
        }
    }

    /// Number of live (pending or in-progress) entries.
    pub async fn live_count(&self) -> usize {
        let entries = self.entries.read().await;
        let mut count = 0;
        for entry in entries.values() {
            if entry.read().await.state.is_live() {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ActiveTaskRegistry> {
        ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn begin_and_progress() {
        let reg = registry();
        let handle = reg.begin("job-1").await.unwrap();

        handle.set_stage("navigating").await;
        handle.append_log("opened apply page").await;
        handle.append_log("filled cover letter").await;

        let status = reg.get("job-1").await.unwrap();
        assert_eq!(status.state, TaskState::InProgress);
        assert_eq!(status.stage, "navigating");
        assert_eq!(
            status.log,
            vec!["opened apply page", "filled cover letter"]
        );
    }

    #[tokio::test]
    async fn second_begin_while_live_is_rejected() {
        let reg = registry();
        let _handle = reg.begin("job-1").await.unwrap();

        let err = reg.begin("job-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn begin_after_failure_replaces_entry() {
        let reg = registry();
        let handle = reg.begin("job-1").await.unwrap();
        handle.fail("browser crashed").await;

        // Retry produces exactly one fresh entry, not two.
        let _retry = reg.begin("job-1").await.unwrap();
        let status = reg.get("job-1").await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert!(status.error.is_none());
        assert_eq!(reg.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn complete_records_result() {
        let reg = registry();
        let handle = reg.begin("job-1").await.unwrap();
        handle
            .complete(serde_json::json!({"confirmation": "abc123"}))
            .await;

        let status = reg.get("job-1").await.unwrap();
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(
            status.result.unwrap()["confirmation"],
            serde_json::json!("abc123")
        );
    }

    #[tokio::test]
    async fn terminal_entries_evicted_after_retention() {
        let reg = ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_millis(10));
        let handle = reg.begin("job-1").await.unwrap();
        handle.complete(serde_json::json!({})).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.get("job-1").await.is_none());
        assert!(reg.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn live_entries_survive_retention() {
        let reg = ActiveTaskRegistry::new(TaskCategory::Submission, Duration::from_millis(10));
        let handle = reg.begin("job-1").await.unwrap();
        handle.set_stage("working").await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(reg.get("job-1").await.is_some());
    }

    #[tokio::test]
    async fn snapshot_ordered_by_start() {
        let reg = registry();
        let _a = reg.begin("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _b = reg.begin("b").await.unwrap();

        let snapshot = reg.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].job_id, "a");
        assert_eq!(snapshot[1].job_id, "b");
    }

    #[tokio::test]
    async fn broadcast_emits_lifecycle_events() {
        let reg = registry();
        let mut rx = reg.subscribe();

        let handle = reg.begin("job-1").await.unwrap();
        handle.append_log("step one").await;
        handle.complete(serde_json::json!({})).await;

        assert!(matches!(rx.recv().await.unwrap(), TaskEvent::Started { .. }));
        match rx.recv().await.unwrap() {
            TaskEvent::Progress { line, .. } => assert_eq!(line, "step one"),
            other => panic!("expected Progress, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            TaskEvent::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn live_count_tracks_states() {
        let reg = registry();
        let a = reg.begin("a").await.unwrap();
        let _b = reg.begin("b").await.unwrap();
        assert_eq!(reg.live_count().await, 2);

        a.complete(serde_json::json!({})).await;
        assert_eq!(reg.live_count().await, 1);
    }
}
