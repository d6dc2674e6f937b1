//! Persistent FIFO task queue
//!
//! A single JSON file holds the pending evaluations so a restart resumes
//! exactly where the process died. Every mutation is a whole-file
//! read-modify-write under a process-wide lock, written via temp file +
//! atomic rename: a crash mid-mutation leaves either the pre- or the
//! post-state on disk, never a torn file. There is no in-memory queue
//! that could drift from disk.
//!
//! Ordering is strict FIFO by enqueue order. No priorities, no
//! deduplication: enqueuing the same submission twice produces two
//! tasks (callers prevent this upstream).

use crate::store::write_atomic;
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Serializes every read-modify-write cycle on the queue file.
static QUEUE_LOCK: Mutex<()> = Mutex::const_new(());

/// Everything the worker needs to evaluate one submission, with no
/// lookups in any other index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub submission_id: String,
    pub contest_id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    pub image_tar_path: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub contest_dir: PathBuf,
    pub submission_dir: PathBuf,
    /// UTC ISO-8601, stamped by [`TaskQueue::enqueue`].
    #[serde(default)]
    pub enqueued_at: Option<String>,
}

/// Handle on the persistent queue file.
///
/// # Examples
///
/// ```rust,ignore
/// use verdict::{TaskQueue, TaskDescriptor};
///
/// let queue = TaskQueue::new("./task_queue.json");
/// let queue_ahead = queue.enqueue(task).await?;
/// println!("{queue_ahead} tasks ahead of you");
///
/// while let Some(task) = queue.dequeue().await? {
///     // evaluate...
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TaskQueue {
    path: PathBuf,
}

impl TaskQueue {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append a task at the tail, stamping `enqueued_at`.
    ///
    /// Returns the resulting queue length, which callers report to
    /// clients as the number of tasks ahead of (and including) this one.
    pub async fn enqueue(&self, mut task: TaskDescriptor) -> Result<usize> {
        let _guard = QUEUE_LOCK.lock().await;
        let mut tasks = self.load().await;
        task.enqueued_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true));
        tasks.push(task);
        self.save(&tasks).await?;
        Ok(tasks.len())
    }

    /// Pop the head task; `None` when the queue is empty.
    pub async fn dequeue(&self) -> Result<Option<TaskDescriptor>> {
        let _guard = QUEUE_LOCK.lock().await;
        let mut tasks = self.load().await;
        if tasks.is_empty() {
            return Ok(None);
        }
        let task = tasks.remove(0);
        self.save(&tasks).await?;
        Ok(Some(task))
    }

    /// Snapshot of the pending tasks, head first. Does not mutate.
    pub async fn peek(&self) -> Vec<TaskDescriptor> {
        let _guard = QUEUE_LOCK.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> usize {
        let _guard = QUEUE_LOCK.lock().await;
        self.load().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Missing or malformed file reads as an empty queue.
    async fn load(&self) -> Vec<TaskDescriptor> {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    async fn save(&self, tasks: &[TaskDescriptor]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(tasks).context("failed to serialize task queue")?;
        write_atomic(&self.path, json.as_bytes()).await
    }
}
