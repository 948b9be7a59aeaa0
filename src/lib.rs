//! Job engine of a backup-orchestration daemon: prioritized job queue, deduplicating
//! submission, cron/interval schedulers and debounced filesystem watchers.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod jobs;
pub mod server;
pub mod triggers;
