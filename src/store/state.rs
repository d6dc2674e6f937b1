//! Submission states and the stable wire code mapping
//!
//! Internally a submission moves through a tagged enum
//! (`Queued → Running → Done(code)`); persistence and API boundaries
//! only ever see the stable pair of a numeric code and its canonical
//! description. Terminal states are never left.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Terminal outcome of an evaluation.
///
/// The numeric codes and descriptions form a wire contract shared with
/// the frontend; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Timeout,
    ContainerError,
    Error,
}

impl StatusCode {
    /// Stable numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            StatusCode::Success => 0,
            StatusCode::Timeout => 1,
            StatusCode::ContainerError => 2,
            StatusCode::Error => 3,
        }
    }

    /// Canonical human-readable description for the wire code.
    pub fn desc(self) -> &'static str {
        match self {
            StatusCode::Success => "participant image succeeded",
            StatusCode::Timeout => "participant image timed out",
            StatusCode::ContainerError => "participant image container failure",
            StatusCode::Error => "orchestration error",
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::Timeout),
            2 => Some(StatusCode::ContainerError),
            3 => Some(StatusCode::Error),
            _ => None,
        }
    }
}

/// Lifecycle state of a submission as recorded in the index.
///
/// Wire form: `"QUEUED"`, `"RUNNING"`, or the bare terminal number
/// `0..=3`. The reader additionally tolerates `"0".."3"` string
/// spellings left behind by older writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Queued,
    Running,
    Done(StatusCode),
}

impl SubmissionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SubmissionState::Done(_))
    }

    /// Description shown beside the state in the index.
    pub fn default_desc(self) -> &'static str {
        match self {
            SubmissionState::Queued => "queued",
            SubmissionState::Running => "evaluating...",
            SubmissionState::Done(code) => code.desc(),
        }
    }
}

impl Serialize for SubmissionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SubmissionState::Queued => serializer.serialize_str("QUEUED"),
            SubmissionState::Running => serializer.serialize_str("RUNNING"),
            SubmissionState::Done(code) => serializer.serialize_u8(code.code()),
        }
    }
}

impl<'de> Deserialize<'de> for SubmissionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match &value {
            serde_json::Value::String(s) => match s.as_str() {
                "QUEUED" => Ok(SubmissionState::Queued),
                "RUNNING" => Ok(SubmissionState::Running),
                other => other
                    .parse::<u8>()
                    .ok()
                    .and_then(StatusCode::from_code)
                    .map(SubmissionState::Done)
                    .ok_or_else(|| de::Error::custom(format!("unknown submission state: {other}"))),
            },
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .and_then(StatusCode::from_code)
                .map(SubmissionState::Done)
                .ok_or_else(|| de::Error::custom(format!("unknown status code: {n}"))),
            _ => Err(de::Error::custom("submission state must be a string or number")),
        }
    }
}
