use super::context::JobContext;
use super::error::JobError;
use super::job::{Job, JobIdentity};
use super::priority::Priority;
use super::registry::JobsRegistry;
use super::runner::{JobsRunner, RunnerConfig};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Hand the job back to the caller so its result can be awaited.
    pub keep_result: bool,
}

impl RunOptions {
    pub fn keep_result() -> Self {
        Self { keep_result: true }
    }
}

/// Entry point for submitting work. Deduplicates equivalent pending requests, then
/// registers and queues new jobs.
#[derive(Clone)]
pub struct JobsService {
    registry: JobsRegistry,
    runner: JobsRunner,
    // Scan-then-insert must not interleave between two submissions.
    submit_lock: Arc<Mutex<()>>,
}

impl JobsService {
    pub fn new(runner_config: RunnerConfig, archive_capacity: usize) -> Self {
        Self {
            registry: JobsRegistry::new(archive_capacity),
            runner: JobsRunner::new(runner_config),
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn registry(&self) -> &JobsRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &JobsRunner {
        &self.runner
    }

    pub fn start(&self) {
        self.runner.start();
    }

    pub fn stop(&self) {
        self.runner.stop();
    }

    /// Submits a unit of work.
    ///
    /// If an equivalent job is already queued at the same priority, nothing new is created and
    /// the queued job is returned when `keep_result` is set. If it is queued at a different
    /// priority it is canceled and superseded by a new job. Returns `None` when the caller did
    /// not ask to keep the result.
    pub fn run<F, Fut>(
        &self,
        identity: JobIdentity,
        priority: Priority,
        body: F,
        options: RunOptions,
    ) -> Option<Arc<Job>>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        let _guard = self
            .submit_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let pending = self
            .runner
            .queued()
            .into_iter()
            .find(|job| job.identity().is_equivalent(&identity));

        if let Some(pending) = pending {
            if pending.priority().same_level(&priority) {
                debug!(
                    job_uuid = %pending.uuid(),
                    operation = %identity.operation,
                    trigger = %identity.trigger,
                    "equivalent job already queued, ignoring request"
                );
                return options.keep_result.then_some(pending);
            }

            info!(
                job_uuid = %pending.uuid(),
                operation = %identity.operation,
                from = %pending.priority(),
                to = %priority,
                "superseding queued job with a new priority"
            );
            if let Err(e) = pending.cancel() {
                // Already dispatched, so it no longer counts as pending
                debug!(job_uuid = %pending.uuid(), "could not cancel superseded job: {}", e);
            }
        }

        let job = Job::new(identity, priority, body);
        debug!(
            job_uuid = %job.uuid(),
            operation = %job.identity().operation,
            trigger = %job.identity().trigger,
            priority = %priority,
            "job submitted"
        );
        self.registry.add_job(Arc::clone(&job));
        self.runner.add(Arc::clone(&job));

        options.keep_result.then_some(job)
    }

    pub fn get_job(&self, uuid: Uuid) -> Result<Arc<Job>, JobError> {
        self.registry.get_job(uuid)
    }

    pub fn abort(&self, uuid: Uuid) -> Result<Arc<Job>, JobError> {
        let job = self.registry.get_job(uuid)?;
        job.abort()?;
        Ok(job)
    }

    pub fn cancel(&self, uuid: Uuid) -> Result<Arc<Job>, JobError> {
        let job = self.registry.get_job(uuid)?;
        job.cancel()?;
        Ok(job)
    }
}

impl Default for JobsService {
    fn default() -> Self {
        Self::new(RunnerConfig::default(), super::registry::DEFAULT_ARCHIVE_CAPACITY)
    }
}
