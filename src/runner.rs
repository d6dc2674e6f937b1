//! Queue Runner: the single long-lived consumer
//!
//! Pops tasks in FIFO order and drives each one through the evaluation
//! worker: mark `RUNNING`, evaluate, persist artifacts beside the
//! submission, record the terminal verdict. One failing task never
//! poisons the loop; errors back off briefly and the loop continues.
//!
//! Exactly one runner is intended per deployment. The queue itself is
//! safe against concurrent runners, but a single consumer is what
//! bounds concurrent use of the container runtime: at most one
//! participant and one organizer container ever exist at a time.

use crate::queue::{TaskDescriptor, TaskQueue};
use crate::store::{ContestStore, StatusCode, SubmissionState};
use crate::worker::{EvalResult, EvaluationWorker};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::time::Duration;
use tokio::fs;

/// Sleep between polls of an empty queue.
const IDLE_SLEEP: Duration = Duration::from_secs(1);
/// Backoff after an error in the loop body.
const ERROR_SLEEP: Duration = Duration::from_secs(2);

pub struct QueueRunner {
    queue: TaskQueue,
    store: ContestStore,
    worker: EvaluationWorker,
}

impl QueueRunner {
    pub fn new(queue: TaskQueue, store: ContestStore, worker: EvaluationWorker) -> Self {
        Self {
            queue,
            store,
            worker,
        }
    }

    /// Consume the queue forever.
    pub async fn run(&self) {
        tracing::info!("queue runner started");
        loop {
            match self.iteration().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(IDLE_SLEEP).await,
                Err(e) => {
                    tracing::error!("queue runner iteration failed: {e:#}");
                    tokio::time::sleep(ERROR_SLEEP).await;
                }
            }
        }
    }

    /// Process at most one task; `Ok(false)` when the queue was empty.
    pub async fn iteration(&self) -> Result<bool> {
        let Some(task) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        self.process_task(task).await?;
        Ok(true)
    }

    async fn process_task(&self, task: TaskDescriptor) -> Result<()> {
        tracing::info!(
            submission = %task.submission_id,
            contest = %task.contest_id,
            "processing task"
        );

        self.store
            .update_submission_status(
                &task.contest_id,
                &task.submission_id,
                SubmissionState::Running,
                SubmissionState::Running.default_desc(),
            )
            .await?;

        let result = match self.worker.evaluate(&task).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(submission = %task.submission_id, "worker escaped: {e:#}");
                EvalResult::execution_exception(&e, &task)
            }
        };

        // Artifact persistence is best-effort; the verdict must land
        // regardless.
        if let Err(e) = self.save_artifacts(&task, &result).await {
            tracing::error!(submission = %task.submission_id, "failed to save artifacts: {e:#}");
        }

        let status = StatusCode::from_code(result.code).unwrap_or(StatusCode::Error);
        self.store
            .update_submission_status(
                &task.contest_id,
                &task.submission_id,
                SubmissionState::Done(status),
                &result.desc,
            )
            .await?;

        tracing::info!(
            submission = %task.submission_id,
            code = result.code,
            desc = %result.desc,
            "task finished"
        );
        Ok(())
    }

    /// Write logs and organizer results beside the submission.
    async fn save_artifacts(&self, task: &TaskDescriptor, result: &EvalResult) -> Result<()> {
        fs::create_dir_all(&task.submission_dir)
            .await
            .with_context(|| format!("failed to create {}", task.submission_dir.display()))?;

        fs::write(
            task.submission_dir.join("participant_logs.txt"),
            &result.participant_logs,
        )
        .await
        .context("failed to write participant_logs.txt")?;

        if let Some(organizer_logs) = &result.organizer_logs {
            fs::write(task.submission_dir.join("organizer_logs.txt"), organizer_logs)
                .await
                .context("failed to write organizer_logs.txt")?;
        }

        if let Some(organizer_results) = &result.organizer_results {
            let pretty = serde_json::to_string_pretty(organizer_results)
                .context("failed to serialize organizer results")?;
            fs::write(task.submission_dir.join("organizer_results.json"), pretty)
                .await
                .context("failed to write organizer_results.json")?;
        }
        Ok(())
    }

    /// Downgrade crash orphans on startup.
    ///
    /// A submission is stuck in `RUNNING` only when a previous process
    /// died mid-evaluation: its task is no longer queued, so nothing
    /// will ever finish it. Such records become terminal code 3.
    /// Returns the number of downgraded records.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let queued: HashSet<String> = self
            .queue
            .peek()
            .await
            .into_iter()
            .map(|t| t.submission_id)
            .collect();

        let mut downgraded = 0;
        let mut contests = match fs::read_dir(self.store.base_dir()).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = contests.next_entry().await {
            if !entry.path().is_dir() {
                continue;
            }
            let contest_id = entry.file_name().to_string_lossy().to_string();
            for record in self.store.load_submission_records(&contest_id).await {
                if record.status_code != SubmissionState::Running
                    || queued.contains(&record.submission_id)
                {
                    continue;
                }
                tracing::warn!(
                    contest = %contest_id,
                    submission = %record.submission_id,
                    "downgrading crash-orphaned RUNNING submission"
                );
                self.store
                    .update_submission_status(
                        &contest_id,
                        &record.submission_id,
                        SubmissionState::Done(StatusCode::Error),
                        "orchestration error (interrupted by restart)",
                    )
                    .await?;
                downgraded += 1;
            }
        }
        if downgraded > 0 {
            tracing::info!(downgraded, "orphan reconciliation complete");
        }
        Ok(downgraded)
    }
}
