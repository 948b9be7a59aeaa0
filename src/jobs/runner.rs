//! Priority queue feeding a bounded pool of running jobs.

use super::job::{Job, JobState};
use super::priority::{insert_by_priority, Priority};
use crate::server::metrics;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of jobs in `running` at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// When set, an `immediate` job arriving while others are queued is dispatched
    /// even if every slot is taken.
    #[serde(default)]
    pub immediate_bypasses_limit: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            immediate_bypasses_limit: false,
        }
    }
}

#[derive(Default)]
struct RunnerState {
    started: bool,
    queue: VecDeque<Arc<Job>>,
    running: Vec<Arc<Job>>,
}

impl RunnerState {
    fn has_free_slot(&self, concurrency: usize) -> bool {
        self.running.len() < concurrency
    }
}

struct RunnerInner {
    config: RunnerConfig,
    state: Mutex<RunnerState>,
}

/// Orders queued jobs by priority and runs them, at most `concurrency` at a time.
///
/// A running job is never preempted. The runner reacts to jobs ending through the
/// transition listener it registers on each job it is given.
#[derive(Clone)]
pub struct JobsRunner {
    inner: Arc<RunnerInner>,
}

impl Default for JobsRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl JobsRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let config = RunnerConfig {
            concurrency: config.concurrency.max(1),
            ..config
        };
        Self {
            inner: Arc::new(RunnerInner {
                config,
                state: Mutex::new(RunnerState::default()),
            }),
        }
    }

    pub fn config(&self) -> RunnerConfig {
        self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a job. Must be called from within a tokio runtime.
    pub fn add(&self, job: Arc<Job>) {
        let runner = Arc::downgrade(&self.inner);
        let subscribed = job.subscribe(Arc::new(move |job, state| {
            if !state.is_terminal() {
                return;
            }
            if let Some(inner) = Weak::upgrade(&runner) {
                JobsRunner { inner }.on_job_ended(job);
            }
        }));
        if !subscribed || job.state() != JobState::New {
            warn!(job_uuid = %job.uuid(), state = %job.state(), "refusing to queue a job that already started");
            return;
        }

        let bypass = {
            let mut state = self.lock();
            let bypass = state.started
                && job.priority() == Priority::Immediate
                && !state.queue.is_empty()
                && (self.inner.config.immediate_bypasses_limit
                    || state.has_free_slot(self.inner.config.concurrency));
            if bypass {
                state.running.push(Arc::clone(&job));
            } else {
                insert_by_priority(&mut state.queue, Arc::clone(&job));
            }
            bypass
        };

        if bypass {
            info!(
                job_uuid = %job.uuid(),
                operation = %job.identity().operation,
                "dispatching immediate job ahead of the queue"
            );
            self.launch(job);
        } else {
            debug!(
                job_uuid = %job.uuid(),
                operation = %job.identity().operation,
                priority = %job.priority(),
                "job queued"
            );
        }
        self.pump();
    }

    /// Starts dispatching queued jobs.
    pub fn start(&self) {
        {
            let mut state = self.lock();
            if state.started {
                return;
            }
            state.started = true;
        }
        info!(concurrency = self.inner.config.concurrency, "jobs runner started");
        self.pump();
    }

    /// Cancels every queued job and requests an abort of every running one.
    ///
    /// Returns without waiting for running jobs to settle.
    pub fn stop(&self) {
        let (queued, running) = {
            let mut state = self.lock();
            state.started = false;
            (std::mem::take(&mut state.queue), state.running.clone())
        };
        info!(
            queued = queued.len(),
            running = running.len(),
            "stopping jobs runner"
        );

        for job in queued {
            if let Err(e) = job.cancel() {
                debug!(job_uuid = %job.uuid(), "queued job not canceled: {}", e);
            }
        }
        for job in running {
            if let Err(e) = job.abort() {
                warn!(job_uuid = %job.uuid(), "could not abort running job: {}", e);
            }
        }
        self.update_gauges();
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn queued(&self) -> Vec<Arc<Job>> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn running(&self) -> Vec<Arc<Job>> {
        self.lock().running.clone()
    }

    /// Dispatches queue heads while slots are free.
    fn pump(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                if !state.started || !state.has_free_slot(self.inner.config.concurrency) {
                    None
                } else if let Some(job) = state.queue.pop_front() {
                    state.running.push(Arc::clone(&job));
                    Some(job)
                } else {
                    None
                }
            };
            match next {
                Some(job) => self.launch(job),
                None => break,
            }
        }
        self.update_gauges();
    }

    fn launch(&self, job: Arc<Job>) {
        match job.start() {
            Ok(execution) => {
                tokio::spawn(execution);
            }
            Err(e) => {
                // Canceled between dequeue and start
                debug!(job_uuid = %job.uuid(), "skipping job: {}", e);
                self.lock().running.retain(|j| j.uuid() != job.uuid());
            }
        }
    }

    fn on_job_ended(&self, job: &Arc<Job>) {
        {
            let mut state = self.lock();
            state.queue.retain(|j| j.uuid() != job.uuid());
            state.running.retain(|j| j.uuid() != job.uuid());
        }
        self.pump();
    }

    fn update_gauges(&self) {
        let (queued, running) = {
            let state = self.lock();
            (state.queue.len(), state.running.len())
        };
        metrics::set_jobs_gauges(queued, running);
    }
}
