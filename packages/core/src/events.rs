//! Event types for observing a queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobStatus, StatusSummary};

/// Events emitted by the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job was registered and is waiting for submission.
    JobAdded {
        index: usize,
        job_id: JobId,
        job_name: String,
        timestamp: DateTime<Utc>,
    },
    /// A job's status changed.
    StatusChanged {
        index: usize,
        job_id: JobId,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    /// The scheduling loop started.
    RunStarted {
        total_expected: usize,
        timestamp: DateTime<Utc>,
    },
    /// The scheduling loop returned.
    RunFinished {
        summary: StatusSummary,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            QueueEvent::JobAdded { timestamp, .. } => *timestamp,
            QueueEvent::StatusChanged { timestamp, .. } => *timestamp,
            QueueEvent::RunStarted { timestamp, .. } => *timestamp,
            QueueEvent::RunFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Get the slot index associated with this event, if any.
    pub fn job_index(&self) -> Option<usize> {
        match self {
            QueueEvent::JobAdded { index, .. } => Some(*index),
            QueueEvent::StatusChanged { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            QueueEvent::JobAdded {
                index, job_name, ..
            } => format!("Job {} ({}) added", index, job_name),
            QueueEvent::StatusChanged {
                index,
                old_status,
                new_status,
                ..
            } => format!("Job {} {} -> {}", index, old_status, new_status),
            QueueEvent::RunStarted { total_expected, .. } => {
                if *total_expected > 0 {
                    format!("Run started, expecting {} jobs", total_expected)
                } else {
                    "Run started".to_string()
                }
            }
            QueueEvent::RunFinished { summary, .. } => format!(
                "Run finished: {} complete, {} failed",
                summary.success, summary.failed
            ),
        }
    }
}
