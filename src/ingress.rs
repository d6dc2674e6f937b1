//! Submission intake
//!
//! The producer half of the pipeline: given an uploaded image tarball,
//! materialize the submission on disk (tarball, a private snapshot of
//! the contest input dataset, empty output directories), append the
//! `QUEUED` index record and enqueue the task descriptor. The HTTP
//! surface in front of this validates transport concerns; everything
//! here is what must hold regardless of how the bytes arrived.

use crate::config::Config;
use crate::queue::{TaskDescriptor, TaskQueue};
use crate::store::{ContestStore, SubmissionRecord, SubmissionState};
use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Receipt handed back to the submitter.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub submission_id: String,
    /// Queue length after insertion, i.e. this task's position.
    pub queue_ahead: usize,
    pub submission_dir: PathBuf,
}

/// Accept one participant image for evaluation.
pub async fn submit_image(
    store: &ContestStore,
    queue: &TaskQueue,
    config: &Config,
    contest_id: &str,
    participant_id: Option<&str>,
    image_tar_src: &Path,
) -> Result<SubmitReceipt> {
    let paths = store.contest_paths(contest_id);
    if !paths.contest_dir.is_dir() {
        bail!("contest {contest_id} does not exist");
    }

    let participant = participant_id.unwrap_or("default");
    if !is_valid_participant_id(participant) {
        bail!("invalid participant id: {participant:?}");
    }

    let file_name = image_tar_src
        .file_name()
        .and_then(|n| n.to_str())
        .context("image path has no usable file name")?
        .to_string();
    if !allowed_tar_file(&file_name, &config.allowed_tar_extensions) {
        bail!("image file extension not allowed: {file_name}");
    }

    let tar_size = fs::metadata(image_tar_src)
        .await
        .with_context(|| format!("cannot stat upload {}", image_tar_src.display()))?
        .len();
    if tar_size > config.tar_max_size {
        bail!("image tar exceeds the {} byte limit", config.tar_max_size);
    }

    // Millisecond timestamp, bumped forward on the (rare) collision.
    let mut id = Utc::now().timestamp_millis();
    while paths.submissions_root.join(format!("submission_{id}")).exists() {
        id += 1;
    }
    let submission_id = id.to_string();

    let submission_dir = paths.submissions_root.join(format!("submission_{submission_id}"));
    let input_dir = submission_dir.join("input");
    let output_dir = submission_dir.join("output");
    fs::create_dir_all(&output_dir).await?;
    fs::create_dir_all(submission_dir.join("organizer_output")).await?;

    let image_tar_path = submission_dir.join(&file_name);
    fs::copy(image_tar_src, &image_tar_path)
        .await
        .with_context(|| format!("failed to place image tar in {}", submission_dir.display()))?;

    // Snapshot the contest input so later dataset edits cannot touch a
    // submission that is already queued.
    let source_dir = paths.info_dir.join("dataset").join("source");
    if source_dir.is_dir() {
        copy_dir_all(&source_dir, &input_dir)
            .with_context(|| format!("failed to snapshot {}", source_dir.display()))?;
    } else {
        fs::create_dir_all(&input_dir).await?;
    }

    let storage_path = format!("evaluation/submissions/submission_{submission_id}");
    let record = SubmissionRecord {
        submission_id: submission_id.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        status_code: SubmissionState::Queued,
        status_desc: SubmissionState::Queued.default_desc().to_string(),
        participant_id: participant.to_string(),
        storage_path: storage_path.clone(),
        output_path: Some(format!("{storage_path}/output")),
    };
    store.append_submission_record(contest_id, record).await?;

    let queue_ahead = queue
        .enqueue(TaskDescriptor {
            submission_id: submission_id.clone(),
            contest_id: contest_id.to_string(),
            participant_id: Some(participant.to_string()),
            image_tar_path,
            input_dir,
            output_dir,
            contest_dir: paths.contest_dir.clone(),
            submission_dir: submission_dir.clone(),
            enqueued_at: None,
        })
        .await?;

    tracing::info!(
        contest = contest_id,
        submission = %submission_id,
        participant,
        queue_ahead,
        "submission accepted"
    );

    Ok(SubmitReceipt {
        submission_id,
        queue_ahead,
        submission_dir,
    })
}

/// Alphanumeric, dash or underscore, at most 64 chars.
pub fn is_valid_participant_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Check a file name against the allowed tar extensions, matching
/// multi-part extensions like `tar.gz` from the right.
pub fn allowed_tar_file(file_name: &str, allowed: &HashSet<String>) -> bool {
    let lower = file_name.to_lowercase();
    let parts: Vec<&str> = lower.split('.').collect();
    (1..parts.len()).any(|i| allowed.contains(&parts[i..].join(".")))
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
