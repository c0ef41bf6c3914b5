//! Job identity and read-only views of a job record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{JobFailure, JobStatus};

/// Unique identifier for a job, using ULID for chronological sorting.
///
/// The queue also hands out a dense slot index per job; the index is what the
/// query API takes, the id is what shows up in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Copy of a job record's state at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    /// Slot index in the queue.
    pub index: usize,
    pub job_name: String,
    pub run_path: PathBuf,
    pub status: JobStatus,
    pub submit_attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl JobSnapshot {
    /// Wall-clock run time, when both ends are known.
    pub fn run_duration(&self) -> Option<chrono::Duration> {
        match (self.run_start, self.run_end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
