//! Bookkeeping of every job the engine knows about, split by run-state.

use super::error::JobError;
use super::job::{Job, JobState, Subjects};
use super::priority::insert_by_priority;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_ARCHIVE_CAPACITY: usize = 100;

/// Partition a job currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Archived,
}

impl RunState {
    fn of(state: JobState) -> Self {
        match state {
            JobState::New => RunState::Queued,
            JobState::Running | JobState::Aborting => RunState::Running,
            _ => RunState::Archived,
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunState::Queued),
            "running" => Ok(RunState::Running),
            "archived" => Ok(RunState::Archived),
            other => Err(format!("unknown run state: {}", other)),
        }
    }
}

/// Snapshot of the three partitions.
#[derive(Debug, Clone, Default)]
pub struct JobsByRunState {
    pub queued: Vec<Arc<Job>>,
    pub running: Vec<Arc<Job>>,
    pub archived: Vec<Arc<Job>>,
}

/// Filter for [`JobsRegistry::find_jobs`]. Empty criteria match every job.
#[derive(Debug, Clone, Default)]
pub struct JobCriteria {
    pub run_state: Option<RunState>,
    pub operation: Option<String>,
    /// Subset match: every listed tag must be present on the job with the same value.
    pub subjects: Subjects,
}

impl JobCriteria {
    fn matches(&self, job: &Job) -> bool {
        let identity = job.identity();
        if let Some(operation) = &self.operation {
            if &identity.operation != operation {
                return false;
            }
        }
        self.subjects
            .iter()
            .all(|(key, value)| identity.subjects.get(key) == Some(value))
    }
}

#[derive(Default)]
struct Partitions {
    queued: VecDeque<Arc<Job>>,
    running: Vec<Arc<Job>>,
    /// Oldest first.
    archived: VecDeque<Arc<Job>>,
}

impl Partitions {
    fn remove(&mut self, uuid: Uuid) {
        self.queued.retain(|job| job.uuid() != uuid);
        self.running.retain(|job| job.uuid() != uuid);
    }

    fn archive(&mut self, job: Arc<Job>, capacity: usize) {
        if self.archived.iter().any(|archived| archived.uuid() == job.uuid()) {
            return;
        }
        while self.archived.len() >= capacity {
            if let Some(evicted) = self.archived.pop_front() {
                debug!(job_uuid = %evicted.uuid(), "evicting job from archive");
            }
        }
        self.archived.push_back(job);
    }
}

struct RegistryInner {
    partitions: Mutex<Partitions>,
    archive_capacity: usize,
}

/// Indexes jobs into `queued`, `running` and a bounded `archived` ring.
///
/// Jobs move between partitions on their own: the registry listens to every job it is given.
#[derive(Clone)]
pub struct JobsRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for JobsRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_CAPACITY)
    }
}

impl JobsRegistry {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                partitions: Mutex::new(Partitions::default()),
                archive_capacity: archive_capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Partitions> {
        self.inner
            .partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_job(&self, job: Arc<Job>) {
        // Held across subscribe so a concurrent transition is applied after the placement.
        let mut partitions = self.lock();
        let registry = Arc::downgrade(&self.inner);
        let subscribed = job.subscribe(Arc::new(move |job, state| {
            if let Some(inner) = Weak::upgrade(&registry) {
                JobsRegistry { inner }.on_transition(job, state);
            }
        }));

        partitions.remove(job.uuid());
        if !subscribed {
            partitions.archive(job, self.inner.archive_capacity);
            return;
        }
        match RunState::of(job.state()) {
            RunState::Queued => insert_by_priority(&mut partitions.queued, job),
            RunState::Running => partitions.running.push(job),
            RunState::Archived => partitions.archive(job, self.inner.archive_capacity),
        }
    }

    fn on_transition(&self, job: &Arc<Job>, state: JobState) {
        let mut partitions = self.lock();
        match RunState::of(state) {
            RunState::Queued => {}
            // A late notification for a job that already settled
            RunState::Running if job.state().is_terminal() => {}
            RunState::Running => {
                if !partitions.running.iter().any(|j| j.uuid() == job.uuid()) {
                    partitions.queued.retain(|j| j.uuid() != job.uuid());
                    partitions.running.push(Arc::clone(job));
                }
            }
            RunState::Archived => {
                partitions.remove(job.uuid());
                partitions.archive(Arc::clone(job), self.inner.archive_capacity);
            }
        }
    }

    pub fn get_job(&self, uuid: Uuid) -> Result<Arc<Job>, JobError> {
        let partitions = self.lock();
        partitions
            .queued
            .iter()
            .chain(partitions.running.iter())
            .chain(partitions.archived.iter())
            .find(|job| job.uuid() == uuid)
            .cloned()
            .ok_or(JobError::UnknownJob(uuid))
    }

    pub fn get_jobs_by_run_state(&self) -> JobsByRunState {
        let partitions = self.lock();
        JobsByRunState {
            queued: partitions.queued.iter().cloned().collect(),
            running: partitions.running.clone(),
            archived: partitions.archived.iter().cloned().collect(),
        }
    }

    pub fn find_jobs(&self, criteria: &JobCriteria) -> Vec<Arc<Job>> {
        let partitions = self.lock();
        let queued = partitions.queued.iter().map(|job| (RunState::Queued, job));
        let running = partitions.running.iter().map(|job| (RunState::Running, job));
        let archived = partitions.archived.iter().map(|job| (RunState::Archived, job));

        queued
            .chain(running)
            .chain(archived)
            .filter(|(run_state, job)| {
                criteria.run_state.map_or(true, |wanted| wanted == *run_state)
                    && criteria.matches(job)
            })
            .map(|(_, job)| Arc::clone(job))
            .collect()
    }
}
