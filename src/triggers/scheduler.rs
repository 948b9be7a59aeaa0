use super::schedule_spec::ScheduleSpec;
use super::TriggerCallback;
use crate::jobs::Subjects;
use crate::server::metrics;
use chrono::{DateTime, Local, TimeZone, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a scheduler triggers: an operation on a set of subjects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScheduleId {
    pub operation: String,
    pub subjects: Subjects,
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.operation)?;
        for (key, value) in &self.subjects {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Display view of a scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub operation: String,
    pub subjects: Subjects,
    pub schedules: Vec<String>,
    pub run_on_start: bool,
    pub next_run_at: Option<String>,
}

#[derive(Default)]
struct SchedulerState {
    next_run_at: Option<DateTime<Utc>>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

/// Invokes a callback on the soonest of several cron/interval schedules.
///
/// The next fire time is recomputed from the current time at every firing, so interval
/// schedules are measured from the previous firing rather than from a fixed epoch.
pub struct FnScheduler {
    id: ScheduleId,
    schedules: Vec<ScheduleSpec>,
    run_on_start: bool,
    callback: TriggerCallback,
    state: Arc<Mutex<SchedulerState>>,
}

impl FnScheduler {
    pub fn new<F, Fut>(
        id: ScheduleId,
        schedules: Vec<ScheduleSpec>,
        run_on_start: bool,
        callback: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id,
            schedules,
            run_on_start,
            callback: Arc::new(move || callback().boxed()),
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    pub fn id(&self) -> &ScheduleId {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay until the soonest schedule fires, from the current local time.
    pub fn next_schedule_time(&self) -> Option<Duration> {
        self.next_schedule_time_after(&Local::now())
    }

    pub fn next_schedule_time_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<Duration> {
        next_delay(&self.schedules, now)
    }

    /// When the armed timer fires, if the scheduler is started.
    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.lock().next_run_at
    }

    pub fn is_started(&self) -> bool {
        self.lock().task.is_some()
    }

    pub fn info(&self) -> ScheduleInfo {
        ScheduleInfo {
            operation: self.id.operation.clone(),
            subjects: self.id.subjects.clone(),
            schedules: self.schedules.iter().map(|s| s.to_string()).collect(),
            run_on_start: self.run_on_start,
            next_run_at: self.next_run_at().map(|dt| dt.to_rfc3339()),
        }
    }

    /// Arms the timer. Fires right away when `run_on_start` is set. No-op if already started.
    pub fn start(&self) {
        let mut state = self.lock();
        if state.task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(schedule_loop(
            self.id.clone(),
            self.schedules.clone(),
            self.run_on_start,
            Arc::clone(&self.callback),
            Arc::clone(&self.state),
            token.clone(),
        ));
        state.task = Some((token, handle));
        info!(schedule = %self.id, "scheduler started");
    }

    /// Clears the pending timer. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some((token, _handle)) = state.task.take() {
            token.cancel();
            state.next_run_at = None;
            info!(schedule = %self.id, "scheduler stopped");
        }
    }
}

impl Drop for FnScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn next_delay<Tz: TimeZone>(schedules: &[ScheduleSpec], now: &DateTime<Tz>) -> Option<Duration> {
    schedules.iter().filter_map(|spec| spec.delay_after(now)).min()
}

async fn schedule_loop(
    id: ScheduleId,
    schedules: Vec<ScheduleSpec>,
    run_on_start: bool,
    callback: TriggerCallback,
    state: Arc<Mutex<SchedulerState>>,
    token: CancellationToken,
) {
    let mut startup = true;

    loop {
        // Re-arm before invoking the callback
        let delay = next_delay(&schedules, &Local::now());
        let deadline = delay.map(|d| Instant::now() + d);
        {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.next_run_at = delay
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .map(|d| Utc::now() + d);
        }
        match delay {
            Some(d) => debug!(schedule = %id, "next run in {:?}", d),
            None => warn!(schedule = %id, "no upcoming occurrence for any schedule"),
        }

        if !startup || run_on_start {
            // Detached so a slow callback never delays the next firing
            let id = id.clone();
            let callback = Arc::clone(&callback);
            tokio::spawn(async move { fire(&id, &callback).await });
        }
        startup = false;

        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = token.cancelled() => break,
                }
            }
            None => {
                token.cancelled().await;
                break;
            }
        }
    }

    debug!(schedule = %id, "schedule loop exited");
}

async fn fire(id: &ScheduleId, callback: &TriggerCallback) {
    debug!(schedule = %id, "scheduler firing");
    metrics::record_trigger_fire("scheduler");
    match AssertUnwindSafe(callback()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(schedule = %id, "scheduled callback failed: {:#}", e),
        Err(_) => error!(schedule = %id, "scheduled callback panicked"),
    }
}
