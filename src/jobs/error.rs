use super::job::JobState;
use uuid::Uuid;

/// Errors that can occur when driving or observing a job.
///
/// The type is `Clone` because a settled job result is handed out to every observer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job {0} has already been started")]
    AlreadyStarted(Uuid),

    #[error("job {uuid} cannot be canceled while {state}")]
    InvalidState { uuid: Uuid, state: JobState },

    #[error("job {0} does not observe its cancellation signal and cannot be aborted")]
    AbortNotSupported(Uuid),

    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    #[error("invalid priority: {0:?}")]
    InvalidPriority(String),

    #[error("operation failed: {0}")]
    OperationFailure(String),

    #[error("job was canceled before it started")]
    Canceled,

    #[error("job was aborted")]
    Aborted,
}
