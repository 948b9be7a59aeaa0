//! Sources of job requests: cron/interval schedules and debounced filesystem changes.
//!
//! Both invoke a callback and swallow its failures (logging them), so a broken trigger
//! target never stops future firings.

mod debounce;
mod schedule_spec;
mod scheduler;
mod watcher;

use futures::future::BoxFuture;
use std::sync::Arc;

pub use schedule_spec::{parse_duration, ScheduleError, ScheduleSpec};
pub use scheduler::{FnScheduler, ScheduleId, ScheduleInfo};
pub use watcher::{FsWatcher, WatchConfig, WatchError};

/// Callback invoked when a trigger fires.
pub type TriggerCallback = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
