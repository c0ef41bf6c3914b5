//! Error payload recovered from a failed job's EXIT file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Structured description of why a job failed.
///
/// Every field is optional; a job script may write an incomplete EXIT file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFailure {
    /// Name of the sub-job that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_job: Option<String>,
    /// Human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Captured standard error text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_capture: Option<String>,
    /// Path to the full stderr log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_file: Option<PathBuf>,
}

impl JobFailure {
    /// Payload used when failure was detected but the EXIT file is absent.
    pub fn missing_exit_file(exit_file: &Path) -> Self {
        Self {
            reason: Some(format!(
                "EXIT file: {} not found - load failure?",
                exit_file.display()
            )),
            ..Self::default()
        }
    }

    /// Payload carrying only a reason.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// True if no field is set.
    pub fn is_empty(&self) -> bool {
        self.failed_job.is_none()
            && self.reason.is_none()
            && self.stderr_capture.is_none()
            && self.stderr_file.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_exit_file_reason() {
        let failure = JobFailure::missing_exit_file(Path::new("/runs/real-0/EXIT"));
        assert_eq!(
            failure.reason.as_deref(),
            Some("EXIT file: /runs/real-0/EXIT not found - load failure?")
        );
        assert!(failure.failed_job.is_none());
        assert!(!failure.is_empty());
    }

    #[test]
    fn skips_unset_fields() {
        let failure = JobFailure::with_reason("boom");
        let json = serde_json::to_string(&failure).unwrap();
        assert_eq!(json, r#"{"reason":"boom"}"#);
    }
}
