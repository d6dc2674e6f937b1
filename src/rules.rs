//! Validation rules for organizer results.json files
//!
//! The organizer's scoring container must write a JSON object carrying
//! an `indicator` array; validation failures downgrade the submission
//! and surface the reason in the organizer log. The participant side
//! has no shape rule: its results.json only needs to exist (see the
//! worker's classification).

use crate::metrics::MetricsSummary;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("results file not found: {0}")]
    Missing(String),
    #[error("failed to read results file: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("results.json is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("results must be a JSON object")]
    NotAnObject,
    #[error("results missing required 'indicator' field")]
    MissingIndicator,
    #[error("'indicator' must be an array, got {0}")]
    IndicatorNotArray(&'static str),
}

/// Peak resource usage and wall time of the participant run, injected
/// into the organizer results as `runtimeInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuntimeInfo {
    /// Peak CPU usage in percent (may exceed 100 on multi-core quotas).
    pub cpu: f64,
    /// Peak memory usage in MiB.
    pub memory: f64,
    /// Participant wall time in seconds.
    pub runtime: f64,
}

/// Validate an organizer `results.json` and return the parsed object.
pub fn validate_organizer_results(path: &Path) -> Result<Map<String, Value>, ValidationError> {
    let object = read_object(path)?;
    match object.get("indicator") {
        None => Err(ValidationError::MissingIndicator),
        Some(Value::Array(_)) => Ok(object),
        Some(other) => Err(ValidationError::IndicatorNotArray(json_type_name(other))),
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>, ValidationError> {
    if !path.exists() {
        return Err(ValidationError::Missing(path.display().to_string()));
    }
    let raw = std::fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&raw)? {
        Value::Object(object) => Ok(object),
        _ => Err(ValidationError::NotAnObject),
    }
}

/// Attach `runtimeInfo` to a validated results object, in place.
pub fn add_runtime_info(
    results: &mut Map<String, Value>,
    metrics: &MetricsSummary,
    runtime_seconds: f64,
) {
    let info = RuntimeInfo {
        cpu: metrics.cpu_peak,
        memory: metrics.memory_peak,
        runtime: (runtime_seconds * 100.0).round() / 100.0,
    };
    results.insert(
        "runtimeInfo".to_string(),
        serde_json::to_value(info).expect("RuntimeInfo serializes"),
    );
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join("results.json");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_valid_organizer_results_pass() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, r#"{"indicator": [0.9, 0.8], "note": "好"}"#);
        let object = validate_organizer_results(&path).unwrap();
        assert_eq!(object["indicator"], serde_json::json!([0.9, 0.8]));
    }

    #[test]
    fn test_missing_indicator_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, r#"{"score": 1}"#);
        let err = validate_organizer_results(&path).unwrap_err();
        assert!(matches!(err, ValidationError::MissingIndicator));
        assert!(err.to_string().contains("indicator"));
    }

    #[test]
    fn test_non_array_indicator_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write(&tmp, r#"{"indicator": 0.9}"#);
        let err = validate_organizer_results(&path).unwrap_err();
        assert!(matches!(err, ValidationError::IndicatorNotArray("number")));
    }

    #[test]
    fn test_non_object_and_malformed_results_are_rejected() {
        let tmp = TempDir::new().unwrap();

        let path = write(&tmp, r#"[1, 2, 3]"#);
        assert!(matches!(
            validate_organizer_results(&path),
            Err(ValidationError::NotAnObject)
        ));

        let path = write(&tmp, "{ nope");
        assert!(matches!(
            validate_organizer_results(&path),
            Err(ValidationError::Malformed(_))
        ));

        assert!(matches!(
            validate_organizer_results(&tmp.path().join("absent.json")),
            Err(ValidationError::Missing(_))
        ));
    }

    #[test]
    fn test_add_runtime_info_injects_rounded_numbers() {
        let mut results = serde_json::json!({"indicator": [1.0]})
            .as_object()
            .unwrap()
            .clone();
        let metrics = MetricsSummary {
            cpu_peak: 87.5,
            memory_peak: 123.45,
        };
        add_runtime_info(&mut results, &metrics, 4.567_89);

        assert_eq!(
            results["runtimeInfo"],
            serde_json::json!({"cpu": 87.5, "memory": 123.45, "runtime": 4.57})
        );
    }
}
