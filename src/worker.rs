//! Evaluation Worker: the two-stage pipeline for one submission
//!
//! Stage 1 runs the participant image against the contest input with a
//! metrics sampler attached. Stage 2 runs the organizer's scoring image
//! over the participant output; it still runs after a participant
//! `TIMEOUT` or `CONTAINER_ERROR` (the scorer may award partial credit
//! or report the absent output) but is skipped after an orchestration
//! `ERROR`, where there is nothing trustworthy to score. Stage 3
//! validates the organizer's results.json, enriches it with the
//! participant's runtime info and writes it back.
//!
//! The returned code/desc pair is a stable wire contract (see
//! [`StatusCode`]).

use crate::config::Config;
use crate::metrics::MetricsSummary;
use crate::queue::TaskDescriptor;
use crate::rules::{self, ValidationError};
use crate::sandbox::{self, Mount, RunSpec};
use crate::store::{ContestInfo, StatusCode};
use anyhow::{Context, Result};
use bollard::Docker;
use serde_json::Value;
use std::path::Path;

/// Log line appended when a container exits 0 without producing output.
pub const MISSING_RESULTS_SENTINEL: &str =
    "error: container exited cleanly but results.json was not found in /output";

/// Outcome of one evaluation, ready for persistence.
#[derive(Debug, Clone)]
pub struct EvalResult {
    /// Stable wire code, `0..=3`.
    pub code: u8,
    pub desc: String,
    pub participant_logs: String,
    pub organizer_logs: Option<String>,
    /// Validated (and enriched) organizer results, or the raw file text
    /// when it exists but cannot be parsed.
    pub organizer_results: Option<Value>,
    /// Participant image tar path relative to the contest dir, POSIX-style.
    pub participant_image: String,
    pub participant_id: Option<String>,
}

impl EvalResult {
    /// Synthetic result for errors that escaped the worker entirely.
    pub fn execution_exception(error: &anyhow::Error, task: &TaskDescriptor) -> Self {
        Self {
            code: StatusCode::Error.code(),
            desc: format!("execution exception: {error:#}"),
            participant_logs: format!("execution error: {error:#}"),
            organizer_logs: None,
            organizer_results: None,
            participant_image: participant_image_rel(&task.image_tar_path, &task.contest_dir),
            participant_id: task.participant_id.clone(),
        }
    }
}

/// Drives the participant → organizer → validate pipeline.
#[derive(Debug, Clone)]
pub struct EvaluationWorker {
    docker: Docker,
    config: Config,
}

impl EvaluationWorker {
    pub fn new(docker: Docker, config: Config) -> Self {
        Self { docker, config }
    }

    /// Evaluate one task to a terminal verdict.
    ///
    /// Sandbox misbehavior is folded into the verdict; only failures
    /// before the pipeline can even start (e.g. the submission
    /// directories cannot be created) surface as `Err`, which the queue
    /// runner turns into a synthetic code-3 result.
    pub async fn evaluate(&self, task: &TaskDescriptor) -> Result<EvalResult> {
        tokio::fs::create_dir_all(&task.output_dir)
            .await
            .with_context(|| format!("failed to create {}", task.output_dir.display()))?;

        let mut metrics = MetricsSummary {
            cpu_peak: 0.0,
            memory_peak: 0.0,
        };
        let mut runtime_seconds = 0.0;

        // Stage 1: participant run.
        let mut status;
        let mut participant_logs;
        match sandbox::run(&self.docker, &self.participant_spec(task)).await {
            Ok(outcome) => {
                participant_logs = outcome.logs;
                if let Some(sampled) = outcome.metrics {
                    metrics = sampled;
                }
                runtime_seconds = outcome.wall_time_seconds;
                status = classify_participant(outcome.exit_code, outcome.timed_out, &task.output_dir);
                if status == StatusCode::ContainerError && outcome.exit_code == 0 {
                    append_line(&mut participant_logs, MISSING_RESULTS_SENTINEL);
                }
                tracing::info!(
                    submission = %task.submission_id,
                    exit_code = outcome.exit_code,
                    wall = runtime_seconds,
                    ?status,
                    "participant run finished"
                );
            }
            Err(e) => {
                status = StatusCode::Error;
                participant_logs = format!("execution error: {e:#}");
                tracing::error!(submission = %task.submission_id, "participant run failed: {e:#}");
            }
        }

        // Stage 2: organizer run, skipped when orchestration itself broke.
        let mut organizer_logs = None;
        if status != StatusCode::Error {
            organizer_logs = self.run_organizer(task).await;
        }

        // Stage 3: validate + enrich the organizer's results.
        let mut organizer_results = None;
        let results_path = task.submission_dir.join("organizer_output").join("results.json");
        if results_path.exists() {
            match rules::validate_organizer_results(&results_path) {
                Ok(mut object) => {
                    rules::add_runtime_info(&mut object, &metrics, runtime_seconds);
                    let pretty = serde_json::to_string_pretty(&object)
                        .context("failed to serialize organizer results")?;
                    tokio::fs::write(&results_path, pretty)
                        .await
                        .with_context(|| format!("failed to write {}", results_path.display()))?;
                    organizer_results = Some(Value::Object(object));
                }
                Err(ValidationError::Unreadable(e)) => {
                    // Present but unreadable as JSON rules require;
                    // carry whatever is there verbatim.
                    tracing::warn!(submission = %task.submission_id, "organizer results unreadable: {e}");
                    if let Ok(raw) = tokio::fs::read(&results_path).await {
                        organizer_results =
                            Some(Value::String(String::from_utf8_lossy(&raw).into_owned()));
                    }
                }
                Err(e) => {
                    status = StatusCode::ContainerError;
                    let line = format!("organizer results validation failed: {e}");
                    tracing::warn!(submission = %task.submission_id, "{line}");
                    append_line(organizer_logs.get_or_insert_with(String::new), &line);
                }
            }
        }

        Ok(EvalResult {
            code: status.code(),
            desc: status.desc().to_string(),
            participant_logs,
            organizer_logs,
            organizer_results,
            participant_image: participant_image_rel(&task.image_tar_path, &task.contest_dir),
            participant_id: task.participant_id.clone(),
        })
    }

    fn participant_spec(&self, task: &TaskDescriptor) -> RunSpec {
        let mut mounts = vec![Mount::read_write(task.output_dir.clone(), "/output")];
        let source_dir = task.contest_dir.join("info").join("dataset").join("source");
        if source_dir.exists() {
            mounts.push(Mount::read_only(source_dir, "/input"));
        }
        RunSpec {
            image_tar: task.image_tar_path.clone(),
            mounts,
            mem_limit_bytes: self.config.participant.mem_limit_bytes,
            nano_cpus: self.config.participant.nano_cpus(),
            timeout: self.config.participant.timeout,
            sample_metrics: true,
        }
    }

    /// Run the organizer image when the contest declares one. Returns
    /// the organizer log text; `None` when no organizer image is
    /// configured.
    async fn run_organizer(&self, task: &TaskDescriptor) -> Option<String> {
        let info_path = task.contest_dir.join("info").join("info.json");
        let info: ContestInfo = match tokio::fs::read_to_string(&info_path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(info) => info,
                Err(e) => return Some(format!("info.json is malformed, organizer not run: {e}")),
            },
            Err(_) => return Some("info.json not found, organizer not run".to_string()),
        };
        let image = info.image?;

        let image_tar = task.contest_dir.join("info").join(&image);
        if !image_tar.exists() {
            return Some(format!(
                "organizer image tar not found: {}",
                image_tar.display()
            ));
        }

        let organizer_output = task.submission_dir.join("organizer_output");
        if let Err(e) = tokio::fs::create_dir_all(&organizer_output).await {
            return Some(format!("failed to create organizer output dir: {e}"));
        }

        let mut mounts = vec![
            Mount::read_only(task.output_dir.clone(), "/input"),
            Mount::read_write(organizer_output, "/output"),
        ];
        let result_dir = task.contest_dir.join("info").join("dataset").join("result");
        if result_dir.exists() {
            mounts.push(Mount::read_only(result_dir, "/result"));
        }

        let spec = RunSpec {
            image_tar,
            mounts,
            mem_limit_bytes: self.config.organizer.mem_limit_bytes,
            nano_cpus: self.config.organizer.nano_cpus(),
            timeout: self.config.organizer.timeout,
            sample_metrics: false,
        };

        match sandbox::run(&self.docker, &spec).await {
            Ok(outcome) => {
                tracing::info!(
                    submission = %task.submission_id,
                    exit_code = outcome.exit_code,
                    timed_out = outcome.timed_out,
                    "organizer run finished"
                );
                Some(outcome.logs)
            }
            Err(e) => {
                tracing::error!(submission = %task.submission_id, "organizer run failed: {e:#}");
                Some(format!("organizer run failed: {e:#}"))
            }
        }
    }
}

/// Participant verdict from the sandbox outcome: exit 0 alone is not
/// success, the image must also have produced `/output/results.json`.
fn classify_participant(exit_code: i64, timed_out: bool, output_dir: &Path) -> StatusCode {
    if timed_out {
        StatusCode::Timeout
    } else if exit_code == 0 {
        if output_dir.join("results.json").exists() {
            StatusCode::Success
        } else {
            StatusCode::ContainerError
        }
    } else {
        StatusCode::ContainerError
    }
}

fn append_line(text: &mut String, line: &str) {
    if !text.is_empty() {
        text.push('\n');
    }
    text.push_str(line);
}

/// Image tar path relative to the contest dir, forward slashes, falling
/// back to the bare file name.
fn participant_image_rel(image_tar: &Path, contest_dir: &Path) -> String {
    let rel = image_tar.strip_prefix(contest_dir).unwrap_or_else(|_| {
        image_tar
            .file_name()
            .map(Path::new)
            .unwrap_or(image_tar)
    });
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_classify_timeout_wins_over_exit_code() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            classify_participant(-1, true, tmp.path()),
            StatusCode::Timeout
        );
        // Even a clean exit recorded after the deadline is a timeout.
        assert_eq!(
            classify_participant(0, true, tmp.path()),
            StatusCode::Timeout
        );
    }

    #[test]
    fn test_classify_requires_results_json_for_success() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            classify_participant(0, false, tmp.path()),
            StatusCode::ContainerError
        );

        std::fs::write(tmp.path().join("results.json"), "{}").unwrap();
        assert_eq!(classify_participant(0, false, tmp.path()), StatusCode::Success);
    }

    #[test]
    fn test_classify_nonzero_exit_is_container_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("results.json"), "{}").unwrap();
        assert_eq!(
            classify_participant(2, false, tmp.path()),
            StatusCode::ContainerError
        );
    }

    #[test]
    fn test_participant_image_rel_is_posix_relative() {
        let contest = PathBuf::from("/base/AE20240101-000");
        let image = contest.join("evaluation/submissions/submission_1/app.tar");
        assert_eq!(
            participant_image_rel(&image, &contest),
            "evaluation/submissions/submission_1/app.tar"
        );

        // Outside the contest dir only the file name survives.
        assert_eq!(
            participant_image_rel(Path::new("/elsewhere/app.tar"), &contest),
            "app.tar"
        );
    }

    #[test]
    fn test_append_line() {
        let mut text = String::new();
        append_line(&mut text, MISSING_RESULTS_SENTINEL);
        assert_eq!(text, MISSING_RESULTS_SENTINEL);

        let mut text = "container said hi".to_string();
        append_line(&mut text, MISSING_RESULTS_SENTINEL);
        assert_eq!(text, format!("container said hi\n{MISSING_RESULTS_SENTINEL}"));
    }

    #[test]
    fn test_execution_exception_result_carries_code_3() {
        let task = TaskDescriptor {
            submission_id: "1".into(),
            contest_id: "c".into(),
            participant_id: Some("alice".into()),
            image_tar_path: PathBuf::from("/base/c/evaluation/submissions/submission_1/app.tar"),
            input_dir: PathBuf::from("/base/c/in"),
            output_dir: PathBuf::from("/base/c/out"),
            contest_dir: PathBuf::from("/base/c"),
            submission_dir: PathBuf::from("/base/c/evaluation/submissions/submission_1"),
            enqueued_at: None,
        };
        let error = anyhow::anyhow!("daemon unreachable");
        let result = EvalResult::execution_exception(&error, &task);
        assert_eq!(result.code, 3);
        assert!(result.desc.contains("daemon unreachable"));
        assert_eq!(result.participant_id.as_deref(), Some("alice"));
        assert_eq!(
            result.participant_image,
            "evaluation/submissions/submission_1/app.tar"
        );
    }
}
