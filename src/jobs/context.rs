use super::job::JobIdentity;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Severity of a captured run-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One event captured while a job was running.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogEntry {
    pub timestamp: String,
    pub level: RunLogLevel,
    pub message: String,
}

/// Job-scoped logger.
///
/// Every entry is emitted as a `tracing` event tagged with the job's uuid and operation,
/// and is also kept in the job's run-log so it can be inspected after the fact.
#[derive(Clone)]
pub struct RunLogger {
    job_uuid: Uuid,
    operation: String,
    entries: Arc<Mutex<Vec<RunLogEntry>>>,
}

impl RunLogger {
    pub(crate) fn new(job_uuid: Uuid, operation: &str) -> Self {
        Self {
            job_uuid,
            operation: operation.to_string(),
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(RunLogLevel::Debug, message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(RunLogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(RunLogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(RunLogLevel::Error, message.into());
    }

    fn log(&self, level: RunLogLevel, message: String) {
        let job_uuid = self.job_uuid;
        let operation = self.operation.as_str();
        match level {
            RunLogLevel::Debug => tracing::debug!(%job_uuid, operation, "{}", message),
            RunLogLevel::Info => tracing::info!(%job_uuid, operation, "{}", message),
            RunLogLevel::Warn => tracing::warn!(%job_uuid, operation, "{}", message),
            RunLogLevel::Error => tracing::error!(%job_uuid, operation, "{}", message),
        }

        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RunLogEntry {
                timestamp: Utc::now().to_rfc3339(),
                level,
                message,
            });
    }

    /// Snapshot of everything captured so far.
    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Context handed to a job body when it runs.
///
/// The body must observe the cancellation signal (through [`JobContext::cancellation_token`],
/// [`JobContext::cancelled`] or [`JobContext::is_cancelled`]) to be abortable. A job whose body
/// never does so refuses `abort()` with `JobError::AbortNotSupported`.
#[derive(Clone)]
pub struct JobContext {
    uuid: Uuid,
    identity: JobIdentity,
    cancellation_token: CancellationToken,
    observed: Arc<AtomicBool>,
    logger: RunLogger,
}

impl JobContext {
    pub(crate) fn new(
        uuid: Uuid,
        identity: JobIdentity,
        cancellation_token: CancellationToken,
        observed: Arc<AtomicBool>,
        logger: RunLogger,
    ) -> Self {
        Self {
            uuid,
            identity,
            cancellation_token,
            observed,
            logger,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Registers the caller as a cancellation observer and returns the job's token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.observed.store(true, Ordering::SeqCst);
        self.cancellation_token.clone()
    }

    /// Check if an abort has been requested.
    ///
    /// Long-running bodies should check this periodically and return early.
    pub fn is_cancelled(&self) -> bool {
        self.observed.store(true, Ordering::SeqCst);
        self.cancellation_token.is_cancelled()
    }

    /// Completes once an abort has been requested.
    pub async fn cancelled(&self) {
        self.observed.store(true, Ordering::SeqCst);
        self.cancellation_token.cancelled().await
    }
}
