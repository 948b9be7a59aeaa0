//! Job orchestration engine.
//!
//! A [`Job`] wraps one asynchronous operation with a lifecycle state machine. The
//! [`JobsRunner`] orders queued jobs by [`Priority`] and runs them under a concurrency
//! limit, the [`JobsRegistry`] keeps every job indexed by run-state for observability,
//! and [`JobsService`] is the deduplicating front door used by triggers and the API.

mod context;
mod error;
mod job;
mod priority;
mod registry;
mod runner;
mod service;

pub use context::{JobContext, RunLogEntry, RunLogLevel, RunLogger};
pub use error::JobError;
pub use job::{Job, JobIdentity, JobResult, JobState, JobSummary, Subjects, Trigger};
pub use priority::Priority;
pub use registry::{JobCriteria, JobsByRunState, JobsRegistry, RunState, DEFAULT_ARCHIVE_CAPACITY};
pub use runner::{JobsRunner, RunnerConfig};
pub use service::{JobsService, RunOptions};
