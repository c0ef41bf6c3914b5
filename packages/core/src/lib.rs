//! Core domain types for the batch job queue.
//!
//! This crate contains the types shared by the queue engine and its callers:
//! - JobStatus and the per-status histogram used for progress and completion
//! - QueueConfig for tuning retries, sentinel files and polling
//! - JobFailure, the error payload recovered from a job's EXIT file
//! - Events for observing status changes

mod config;
mod error;
mod events;
mod failure;
mod job;
mod status;

pub use config::QueueConfig;
pub use error::QueueError;
pub use events::QueueEvent;
pub use failure::JobFailure;
pub use job::{JobId, JobSnapshot};
pub use status::{JobStatus, StatusHistogram, StatusSummary};
