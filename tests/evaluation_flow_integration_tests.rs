//! End-to-end pipeline tests that run without a container runtime.
//!
//! Submissions whose image tarball cannot be loaded still travel the
//! whole path (intake, queue, RUNNING transition, verdict, artifacts,
//! terminal state), which is exactly what these tests exercise. The
//! scenarios that need a live Docker daemon live in
//! `docker_e2e_scenarios.rs`.

use tempfile::TempDir;
use verdict::store::SubmissionRecord;
use verdict::{
    Config, ContestStore, EvaluationWorker, QueueRunner, StatusCode, SubmissionState, TaskQueue,
    ingress,
};

struct Platform {
    _tmp: TempDir,
    config: Config,
    store: ContestStore,
    queue: TaskQueue,
}

impl Platform {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("projects");

        let source = base.join("AE20240101-000/info/dataset/source");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("input.csv"), "1,2,3").unwrap();

        let config = Config {
            base_dir: base.clone(),
            queue_file: tmp.path().join("task_queue.json"),
            ..Config::default()
        };
        Self {
            store: ContestStore::new(&base),
            queue: TaskQueue::new(&config.queue_file),
            config,
            _tmp: tmp,
        }
    }

    /// Fresh runner over the same on-disk state, as after a restart.
    fn runner(&self) -> QueueRunner {
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        QueueRunner::new(
            TaskQueue::new(&self.config.queue_file),
            ContestStore::new(&self.config.base_dir),
            EvaluationWorker::new(docker, self.config.clone()),
        )
    }

    fn upload(&self, name: &str) -> std::path::PathBuf {
        let path = self._tmp.path().join("uploads").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not a real image tarball").unwrap();
        path
    }

    async fn submit(&self, participant: &str) -> String {
        let upload = self.upload("app.tar");
        ingress::submit_image(
            &self.store,
            &self.queue,
            &self.config,
            "AE20240101-000",
            Some(participant),
            &upload,
        )
        .await
        .unwrap()
        .submission_id
    }

    async fn record(&self, submission_id: &str) -> SubmissionRecord {
        self.store
            .load_submission_records("AE20240101-000")
            .await
            .into_iter()
            .find(|r| r.submission_id == submission_id)
            .unwrap()
    }
}

#[tokio::test]
async fn test_fifo_each_task_terminal_before_next_starts() {
    let platform = Platform::new();
    let first = platform.submit("alice").await;
    let second = platform.submit("bob").await;
    let third = platform.submit("carol").await;

    let runner = platform.runner();

    // After one iteration only the first submission is terminal; the
    // later ones have not begun.
    assert!(runner.iteration().await.unwrap());
    assert!(platform.record(&first).await.status_code.is_terminal());
    assert_eq!(platform.record(&second).await.status_code, SubmissionState::Queued);
    assert_eq!(platform.record(&third).await.status_code, SubmissionState::Queued);

    assert!(runner.iteration().await.unwrap());
    assert!(platform.record(&second).await.status_code.is_terminal());
    assert_eq!(platform.record(&third).await.status_code, SubmissionState::Queued);

    assert!(runner.iteration().await.unwrap());
    assert!(platform.record(&third).await.status_code.is_terminal());

    // Queue fully drained.
    assert!(!runner.iteration().await.unwrap());
}

#[tokio::test]
async fn test_restart_mid_queue_resumes_remaining_tasks_in_order() {
    let platform = Platform::new();
    let first = platform.submit("alice").await;
    let second = platform.submit("alice").await;
    let third = platform.submit("alice").await;

    // First process: finish one task, then "die".
    {
        let runner = platform.runner();
        assert!(runner.iteration().await.unwrap());
        assert!(platform.record(&first).await.status_code.is_terminal());
    }

    // Restarted process: fresh handles over the same files.
    let runner = platform.runner();
    assert_eq!(runner.reconcile_orphans().await.unwrap(), 0);

    let pending: Vec<String> = platform
        .queue
        .peek()
        .await
        .into_iter()
        .map(|t| t.submission_id)
        .collect();
    assert_eq!(pending, vec![second.clone(), third.clone()]);

    assert!(runner.iteration().await.unwrap());
    assert!(platform.record(&second).await.status_code.is_terminal());
    assert_eq!(platform.record(&third).await.status_code, SubmissionState::Queued);

    assert!(runner.iteration().await.unwrap());
    assert!(platform.record(&third).await.status_code.is_terminal());
    assert!(platform.queue.is_empty().await);
}

#[tokio::test]
async fn test_unloadable_image_yields_error_verdict_with_artifacts() {
    let platform = Platform::new();
    let id = platform.submit("alice").await;

    let runner = platform.runner();
    assert!(runner.iteration().await.unwrap());

    let record = platform.record(&id).await;
    assert_eq!(record.status_code, SubmissionState::Done(StatusCode::Error));
    assert_eq!(record.status_desc, StatusCode::Error.desc());

    let submission_dir = platform
        .store
        .resolve_submission_dir("AE20240101-000", Some(&id), Some("alice"), None)
        .unwrap();
    let logs = std::fs::read_to_string(submission_dir.join("participant_logs.txt")).unwrap();
    assert!(!logs.is_empty());
    assert!(logs.contains("execution error"), "logs: {logs}");
}

#[tokio::test]
async fn test_crash_orphan_is_downgraded_on_restart() {
    let platform = Platform::new();
    let id = platform.submit("alice").await;

    // Simulate a crash mid-run: the task was dequeued and the record
    // marked RUNNING, then the process died.
    let task = platform.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(task.submission_id, id);
    platform
        .store
        .update_submission_status(
            "AE20240101-000",
            &id,
            SubmissionState::Running,
            SubmissionState::Running.default_desc(),
        )
        .await
        .unwrap();

    let runner = platform.runner();
    assert_eq!(runner.reconcile_orphans().await.unwrap(), 1);

    let record = platform.record(&id).await;
    assert_eq!(record.status_code, SubmissionState::Done(StatusCode::Error));
    assert!(record.status_desc.contains("interrupted by restart"));

    // Reconciliation is idempotent and the terminal state sticks.
    assert_eq!(runner.reconcile_orphans().await.unwrap(), 0);
}

#[tokio::test]
async fn test_listing_surfaces_verdict_and_artifacts() {
    let platform = Platform::new();
    let id = platform.submit("alice").await;
    platform.runner().iteration().await.unwrap();

    let views = platform.store.list_submissions("AE20240101-000").await;
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].record.submission_id, id);
    assert!(views[0].record.status_code.is_terminal());
    assert!(views[0].participant_logs.is_some());
}
