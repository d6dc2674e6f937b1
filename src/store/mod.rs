//! Submission Store: durable on-disk layout for contests and submissions
//!
//! Filesystem layout, rooted at `<BASE>/<contest_id>/`:
//!
//! ```text
//! info/
//!   info.json                 # contest metadata + organizer image filename
//!   <organizer_image>.tar
//!   dataset/source/…          # participant input dataset
//!   dataset/result/…          # reference result set
//! evaluation/
//!   submissions.json          # append-only submission index
//!   submissions/
//!     submission_<id>/
//!       <participant_image>.tar
//!       input/ output/ organizer_output/
//!       participant_logs.txt organizer_logs.txt organizer_results.json
//! ```
//!
//! The index file is the source of truth for submission state. Every
//! index mutation is load → mutate → write-to-temp → atomic rename,
//! serialized by a process-wide lock. Readers tolerate absent or
//! malformed files.

mod state;

pub use state::{StatusCode, SubmissionState};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Serializes read-modify-write cycles on every `submissions.json`.
static INDEX_LOCK: Mutex<()> = Mutex::const_new(());

/// Resolved paths of one contest.
#[derive(Debug, Clone)]
pub struct ContestPaths {
    pub contest_dir: PathBuf,
    pub info_dir: PathBuf,
    pub evaluation_dir: PathBuf,
    pub submissions_root: PathBuf,
    pub submissions_json: PathBuf,
}

/// Contest metadata parsed from `info/info.json`.
///
/// Only the fields the pipeline consumes are typed; unknown keys are
/// ignored so the ingress can evolve the file independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContestInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Organizer scoring image tar filename, relative to `info/`.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
}

/// One entry of the append-only submission index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub submission_id: String,
    pub timestamp: String,
    pub status_code: SubmissionState,
    pub status_desc: String,
    #[serde(default)]
    pub participant_id: String,
    /// POSIX-style path relative to the contest directory.
    pub storage_path: String,
    #[serde(default)]
    pub output_path: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubmissionIndex {
    #[serde(default)]
    submissions: Vec<SubmissionRecord>,
}

/// Handle on the contest tree under one base directory.
#[derive(Debug, Clone)]
pub struct ContestStore {
    base_dir: PathBuf,
}

impl ContestStore {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn contest_paths(&self, contest_id: &str) -> ContestPaths {
        let contest_dir = self.base_dir.join(contest_id);
        let evaluation_dir = contest_dir.join("evaluation");
        ContestPaths {
            info_dir: contest_dir.join("info"),
            submissions_root: evaluation_dir.join("submissions"),
            submissions_json: evaluation_dir.join("submissions.json"),
            contest_dir,
            evaluation_dir,
        }
    }

    /// Allocate the next unused contest id of the form `AE<YYYYMMDD>-NNN`.
    pub fn generate_contest_id(&self) -> Result<String> {
        let prefix = Local::now().format("AE%Y%m%d").to_string();
        for seq in 0..1000 {
            let contest_id = format!("{prefix}-{seq:03}");
            if !self.base_dir.join(&contest_id).exists() {
                return Ok(contest_id);
            }
        }
        anyhow::bail!("no free contest id left under prefix {prefix}")
    }

    /// Parse `info/info.json`; `Ok(None)` when the file is absent.
    pub async fn read_contest_info(&self, contest_id: &str) -> Result<Option<ContestInfo>> {
        let path = self.contest_paths(contest_id).info_dir.join("info.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let info = serde_json::from_str(&raw)
            .with_context(|| format!("malformed contest info {}", path.display()))?;
        Ok(Some(info))
    }

    /// Append a record to the contest's submission index.
    pub async fn append_submission_record(
        &self,
        contest_id: &str,
        record: SubmissionRecord,
    ) -> Result<()> {
        let _guard = INDEX_LOCK.lock().await;
        let paths = self.contest_paths(contest_id);
        let mut index = load_index(&paths.submissions_json).await;
        index.submissions.push(record);
        write_index(&paths.submissions_json, &index).await
    }

    /// Patch `status_code`/`status_desc` of one record in place.
    ///
    /// Silent no-op when the index or the submission id is missing
    /// (callers have already logged the enqueue). A record in a terminal
    /// state never moves back to `QUEUED`/`RUNNING`, and re-applying an
    /// identical state leaves the file untouched, so repeated terminal
    /// writes are byte-identical.
    pub async fn update_submission_status(
        &self,
        contest_id: &str,
        submission_id: &str,
        state: SubmissionState,
        desc: &str,
    ) -> Result<()> {
        let _guard = INDEX_LOCK.lock().await;
        let paths = self.contest_paths(contest_id);
        if !paths.submissions_json.exists() {
            return Ok(());
        }
        let mut index = load_index(&paths.submissions_json).await;

        let mut changed = false;
        for record in &mut index.submissions {
            if record.submission_id != submission_id {
                continue;
            }
            if record.status_code.is_terminal() && !state.is_terminal() {
                tracing::warn!(
                    submission_id,
                    "refusing to move terminal submission back to {:?}",
                    state
                );
                break;
            }
            if record.status_code != state || record.status_desc != desc {
                record.status_code = state;
                record.status_desc = desc.to_string();
                changed = true;
            }
            break;
        }

        if changed {
            write_index(&paths.submissions_json, &index).await?;
        }
        Ok(())
    }

    /// Load the full index; empty when absent or malformed.
    pub async fn load_submission_records(&self, contest_id: &str) -> Vec<SubmissionRecord> {
        let paths = self.contest_paths(contest_id);
        load_index(&paths.submissions_json).await.submissions
    }

    /// Locate a submission directory, trying the stored path, the
    /// current layout, then the legacy per-participant layout.
    pub fn resolve_submission_dir(
        &self,
        contest_id: &str,
        submission_id: Option<&str>,
        participant_id: Option<&str>,
        storage_path: Option<&str>,
    ) -> Option<PathBuf> {
        let paths = self.contest_paths(contest_id);
        let mut candidates = Vec::new();

        if let Some(stored) = storage_path {
            candidates.push(paths.contest_dir.join(stored));
        }
        if let Some(id) = submission_id {
            candidates.push(paths.submissions_root.join(format!("submission_{id}")));
            if let Some(participant) = participant_id {
                candidates.push(
                    paths
                        .evaluation_dir
                        .join(participant)
                        .join(format!("submission_{id}")),
                );
            }
        }

        candidates.into_iter().find(|c| c.exists())
    }

    /// List a contest's submissions with their on-disk artifacts joined in.
    ///
    /// The index is authoritative; when it is absent the legacy
    /// per-participant layout (`evaluation/<participant>/submissions.json`,
    /// latest entry only) is scanned instead. Newest first.
    pub async fn list_submissions(&self, contest_id: &str) -> Vec<SubmissionView> {
        let paths = self.contest_paths(contest_id);
        if !paths.evaluation_dir.exists() {
            return Vec::new();
        }

        let records = if paths.submissions_json.exists() {
            load_index(&paths.submissions_json).await.submissions
        } else {
            self.legacy_records(&paths).await
        };

        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.load_view(contest_id, record).await);
        }
        views.sort_by(|a, b| b.record.timestamp.cmp(&a.record.timestamp));
        views
    }

    async fn legacy_records(&self, paths: &ContestPaths) -> Vec<SubmissionRecord> {
        let mut records = Vec::new();
        let Ok(mut entries) = fs::read_dir(&paths.evaluation_dir).await else {
            return records;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let participant_dir = entry.path();
            if !participant_dir.is_dir() {
                continue;
            }
            let participant_id = entry.file_name().to_string_lossy().to_string();
            let index = load_index(&participant_dir.join("submissions.json")).await;
            // Older writers kept one index per participant; only its
            // latest entry was ever surfaced.
            if let Some(mut latest) = index.submissions.into_iter().next_back() {
                if latest.participant_id.is_empty() {
                    latest.participant_id = participant_id;
                }
                records.push(latest);
            }
        }
        records
    }

    async fn load_view(&self, contest_id: &str, record: SubmissionRecord) -> SubmissionView {
        let submission_dir = self.resolve_submission_dir(
            contest_id,
            Some(&record.submission_id),
            Some(effective_participant(&record.participant_id)),
            Some(&record.storage_path),
        );

        let mut view = SubmissionView {
            record,
            participant_logs: None,
            organizer_logs: None,
            organizer_results: None,
            participant_output_results: None,
        };

        let Some(dir) = submission_dir else {
            return view;
        };

        view.participant_logs = fs::read_to_string(dir.join("participant_logs.txt")).await.ok();
        view.organizer_logs = fs::read_to_string(dir.join("organizer_logs.txt")).await.ok();
        view.organizer_results = read_json_or_text(&dir.join("organizer_results.json")).await;
        view.participant_output_results =
            read_json_or_text(&dir.join("output").join("results.json")).await;
        view
    }
}

/// A submission record joined with the artifacts read back from disk.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    #[serde(flatten)]
    pub record: SubmissionRecord,
    pub participant_logs: Option<String>,
    pub organizer_logs: Option<String>,
    pub organizer_results: Option<serde_json::Value>,
    pub participant_output_results: Option<serde_json::Value>,
}

fn effective_participant(participant_id: &str) -> &str {
    if participant_id.is_empty() {
        "default"
    } else {
        participant_id
    }
}

async fn load_index(path: &Path) -> SubmissionIndex {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => SubmissionIndex::default(),
    }
}

async fn write_index(path: &Path, index: &SubmissionIndex) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(index).context("failed to serialize submission index")?;
    write_atomic(path, json.as_bytes()).await
}

/// Write via a sibling temp file and atomic rename, so a crash leaves
/// either the old or the new content, never a torn file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
    Ok(())
}

/// Read a results file, preferring JSON, falling back to raw text.
async fn read_json_or_text(path: &Path) -> Option<serde_json::Value> {
    let raw = fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(
            String::from_utf8_lossy(&raw).into_owned(),
        )),
    }
}
