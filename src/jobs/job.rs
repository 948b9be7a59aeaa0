use super::context::{JobContext, RunLogEntry, RunLogger};
use super::error::JobError;
use super::priority::Priority;
use crate::server::metrics;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Tags identifying what an operation targets (which backup, which repository, ...).
pub type Subjects = BTreeMap<String, String>;

/// Settled outcome of a job.
pub type JobResult = Result<JsonValue, JobError>;

type JobBody = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, anyhow::Result<JsonValue>> + Send>;

/// Callback invoked synchronously after every state transition of a job.
pub(crate) type TransitionListener = Arc<dyn Fn(&Arc<Job>, JobState) + Send + Sync>;

/// Where a job request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduler,
    FsWatcher,
    Api,
    None,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduler => "scheduler",
            Trigger::FsWatcher => "fswatcher",
            Trigger::Api => "api",
            Trigger::None => "none",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Running,
    Aborting,
    Success,
    Failure,
    Aborted,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Aborted | JobState::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Running => "running",
            JobState::Aborting => "aborting",
            JobState::Success => "success",
            JobState::Failure => "failure",
            JobState::Aborted => "aborted",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does and on what, plus where the request came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobIdentity {
    pub trigger: Trigger,
    pub operation: String,
    pub subjects: Subjects,
}

impl JobIdentity {
    pub fn new(trigger: Trigger, operation: impl Into<String>) -> Self {
        Self {
            trigger,
            operation: operation.into(),
            subjects: Subjects::new(),
        }
    }

    pub fn with_subject(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.subjects.insert(key.into(), value.into());
        self
    }

    pub fn with_subjects(mut self, subjects: Subjects) -> Self {
        self.subjects.extend(subjects);
        self
    }

    /// Two requests are equivalent when they target the same operation on the same subjects,
    /// whatever triggered them.
    pub fn is_equivalent(&self, other: &JobIdentity) -> bool {
        self.operation == other.operation && self.subjects == other.subjects
    }
}

/// JSON-serializable view of a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub uuid: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub state: JobState,
    pub priority: Priority,
    pub trigger: Trigger,
    pub operation: String,
    pub subjects: Subjects,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_logs: Option<Vec<RunLogEntry>>,
}

struct JobInner {
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<JobError>,
    body: Option<JobBody>,
    listeners: Vec<TransitionListener>,
}

/// A single unit of asynchronous work.
///
/// The job owns the resolution of its result: it is settled exactly once, either by the body
/// finishing or by `cancel()`.
pub struct Job {
    uuid: Uuid,
    identity: JobIdentity,
    priority: Priority,
    created_at: DateTime<Utc>,
    inner: Mutex<JobInner>,
    cancellation_token: CancellationToken,
    observed: Arc<AtomicBool>,
    result: watch::Sender<Option<JobResult>>,
    logger: RunLogger,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("uuid", &self.uuid)
            .field("identity", &self.identity)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

impl Job {
    pub fn new<F, Fut>(identity: JobIdentity, priority: Priority, body: F) -> Arc<Self>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        let uuid = Uuid::new_v4();
        let logger = RunLogger::new(uuid, &identity.operation);
        let (result, _) = watch::channel(None);
        let body: JobBody = Box::new(move |ctx| body(ctx).boxed());

        Arc::new(Self {
            uuid,
            identity,
            priority,
            created_at: Utc::now(),
            inner: Mutex::new(JobInner {
                state: JobState::New,
                started_at: None,
                ended_at: None,
                error: None,
                body: Some(body),
                listeners: Vec::new(),
            }),
            cancellation_token: CancellationToken::new(),
            observed: Arc::new(AtomicBool::new(false)),
            result,
            logger,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.identity
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ended_at
    }

    pub fn run_logs(&self) -> Vec<RunLogEntry> {
        self.logger.entries()
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a transition listener. Returns false when the job already ended, in which
    /// case no further transition will ever be reported.
    pub(crate) fn subscribe(&self, listener: TransitionListener) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.listeners.push(listener);
        true
    }

    fn notify(self: &Arc<Self>, listeners: &[TransitionListener], state: JobState) {
        for listener in listeners {
            listener(self, state);
        }
    }

    /// Runs the job body to completion.
    ///
    /// Fails with `AlreadyStarted` if the job is not `new`. The body's own failure is not
    /// returned here; it is observable through [`Job::result`] and the summary.
    pub async fn run(self: &Arc<Self>) -> Result<(), JobError> {
        self.start()?.await;
        Ok(())
    }

    /// Synchronously moves the job to `running` and returns the future driving the body.
    pub(crate) fn start(
        self: &Arc<Self>,
    ) -> Result<impl Future<Output = ()> + Send + 'static, JobError> {
        let (body, listeners) = {
            let mut inner = self.lock();
            if inner.state != JobState::New {
                return Err(JobError::AlreadyStarted(self.uuid));
            }
            let Some(body) = inner.body.take() else {
                return Err(JobError::AlreadyStarted(self.uuid));
            };
            inner.state = JobState::Running;
            inner.started_at = Some(Utc::now());
            (body, inner.listeners.clone())
        };

        self.logger.debug(format!(
            "starting {} (trigger: {}, priority: {})",
            self.identity.operation, self.identity.trigger, self.priority
        ));
        self.notify(&listeners, JobState::Running);

        let job = Arc::clone(self);
        Ok(async move { job.execute(body).await })
    }

    async fn execute(self: Arc<Self>, body: JobBody) {
        let ctx = JobContext::new(
            self.uuid,
            self.identity.clone(),
            self.cancellation_token.clone(),
            Arc::clone(&self.observed),
            self.logger.clone(),
        );
        let span = tracing::info_span!(
            "job.run",
            job_uuid = %self.uuid,
            operation = %self.identity.operation,
            trigger = %self.identity.trigger,
        );

        let outcome = AssertUnwindSafe(body(ctx))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("job body panicked")));

        self.settle(outcome);
    }

    fn settle(self: &Arc<Self>, outcome: anyhow::Result<JsonValue>) {
        let (state, result, listeners, elapsed) = {
            let mut inner = self.lock();
            let (state, result) = match (inner.state, outcome) {
                (JobState::Aborting, _) => (JobState::Aborted, Err(JobError::Aborted)),
                (_, Ok(value)) => (JobState::Success, Ok(value)),
                (_, Err(e)) => (
                    JobState::Failure,
                    Err(JobError::OperationFailure(format!("{:#}", e))),
                ),
            };
            let now = Utc::now();
            inner.state = state;
            inner.ended_at = Some(now);
            if state == JobState::Failure {
                inner.error = result.as_ref().err().cloned();
            }
            let elapsed = inner
                .started_at
                .and_then(|started| (now - started).to_std().ok())
                .unwrap_or_default();
            (state, result, std::mem::take(&mut inner.listeners), elapsed)
        };

        match &result {
            Ok(_) => self.logger.info(format!("finished in {:?}", elapsed)),
            Err(JobError::Aborted) => self.logger.warn(format!("aborted after {:?}", elapsed)),
            Err(e) => self.logger.error(format!("failed after {:?}: {}", elapsed, e)),
        }
        metrics::record_job_finished(&self.identity.operation, state, elapsed);

        self.notify(&listeners, state);
        self.resolve(result);
    }

    fn resolve(&self, result: JobResult) {
        let resolved = self.result.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
        if !resolved {
            warn!(job_uuid = %self.uuid, "job result was already settled");
        }
    }

    /// Requests a cooperative abort of a running job.
    ///
    /// No-op unless the job is `running`. The terminal state is decided by how the body
    /// actually settles once it notices the signal.
    pub fn abort(self: &Arc<Self>) -> Result<(), JobError> {
        let listeners = {
            let mut inner = self.lock();
            if inner.state != JobState::Running {
                return Ok(());
            }
            if !self.observed.load(Ordering::SeqCst) {
                return Err(JobError::AbortNotSupported(self.uuid));
            }
            inner.state = JobState::Aborting;
            inner.listeners.clone()
        };

        self.logger.warn("abort requested");
        // Listeners must see `aborting` before the body can wake up and settle.
        self.notify(&listeners, JobState::Aborting);
        self.cancellation_token.cancel();
        Ok(())
    }

    /// Cancels a job that has not started yet, discarding its body.
    pub fn cancel(self: &Arc<Self>) -> Result<(), JobError> {
        let listeners = {
            let mut inner = self.lock();
            if inner.state != JobState::New {
                return Err(JobError::InvalidState {
                    uuid: self.uuid,
                    state: inner.state,
                });
            }
            inner.state = JobState::Canceled;
            inner.ended_at = Some(Utc::now());
            inner.body = None;
            std::mem::take(&mut inner.listeners)
        };

        info!(job_uuid = %self.uuid, operation = %self.identity.operation, "job canceled");
        metrics::record_job_finished(
            &self.identity.operation,
            JobState::Canceled,
            std::time::Duration::ZERO,
        );
        self.notify(&listeners, JobState::Canceled);
        self.resolve(Err(JobError::Canceled));
        Ok(())
    }

    /// Waits for the job to settle. Can be awaited any number of times, by any number of
    /// observers.
    pub async fn result(&self) -> JobResult {
        let mut receiver = self.result.subscribe();
        let settled = match receiver.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        settled.unwrap_or(Err(JobError::Aborted))
    }

    /// The settled result, if any.
    pub fn try_result(&self) -> Option<JobResult> {
        self.result.borrow().clone()
    }

    pub fn to_summary(&self, include_logs: bool) -> JobSummary {
        let inner = self.lock();
        let error = match inner.state {
            JobState::Failure => inner.error.as_ref().map(|e| e.to_string()),
            _ => None,
        };

        JobSummary {
            uuid: self.uuid.to_string(),
            created_at: self.created_at.to_rfc3339(),
            started_at: inner.started_at.map(|dt| dt.to_rfc3339()),
            ended_at: inner.ended_at.map(|dt| dt.to_rfc3339()),
            state: inner.state,
            priority: self.priority,
            trigger: self.identity.trigger,
            operation: self.identity.operation.clone(),
            subjects: self.identity.subjects.clone(),
            error,
            run_logs: include_logs.then(|| self.logger.entries()),
        }
    }
}
