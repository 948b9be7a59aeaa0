//! Wires configuration, triggers and the jobs engine together.

use crate::config::{AppConfig, BackupSettings};
use crate::executor::{OperationExecutor, OperationRequest};
use crate::jobs::{Job, JobIdentity, JobsService, Priority, RunOptions, Trigger};
use crate::triggers::{FnScheduler, FsWatcher, ScheduleId, ScheduleInfo};
use anyhow::{Context, Result};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("unknown backup {0:?}")]
    UnknownBackup(String),

    #[error("backup {backup:?} has no operation {operation:?}")]
    UnknownOperation { backup: String, operation: String },
}

/// Turns operation requests into jobs run by the executor.
#[derive(Clone)]
pub struct OperationLauncher {
    service: JobsService,
    executor: Arc<dyn OperationExecutor>,
}

impl OperationLauncher {
    pub fn new(service: JobsService, executor: Arc<dyn OperationExecutor>) -> Self {
        Self { service, executor }
    }

    pub fn launch(
        &self,
        request: OperationRequest,
        trigger: Trigger,
        priority: Priority,
        options: RunOptions,
    ) -> Option<Arc<Job>> {
        let identity = JobIdentity::new(trigger, request.operation.clone())
            .with_subjects(request.subjects.clone());
        let executor = Arc::clone(&self.executor);
        self.service.run(
            identity,
            priority,
            move |ctx| async move { executor.execute(&ctx, &request).await },
            options,
        )
    }
}

fn operation_request(backup: &BackupSettings, operation: &str) -> Option<OperationRequest> {
    let settings = backup.operations.get(operation)?;
    Some(OperationRequest {
        backup: backup.name.clone(),
        operation: operation.to_string(),
        subjects: backup.subjects.clone(),
        command: settings.command.clone(),
    })
}

/// The running application: one jobs engine, plus a scheduler per scheduled operation and a
/// watcher per watched backup.
pub struct Daemon {
    config: AppConfig,
    service: JobsService,
    launcher: OperationLauncher,
    schedulers: Vec<FnScheduler>,
    watchers: Vec<FsWatcher>,
}

impl Daemon {
    pub fn new(config: AppConfig, executor: Arc<dyn OperationExecutor>) -> Result<Self> {
        let service = JobsService::new(config.jobs.runner, config.jobs.archive_capacity);
        let launcher = OperationLauncher::new(service.clone(), executor);

        let mut schedulers = Vec::new();
        let mut watchers = Vec::new();
        for backup in &config.backups {
            for (operation, settings) in &backup.operations {
                if settings.schedules.is_empty() && !settings.run_on_start {
                    continue;
                }
                let Some(request) = operation_request(backup, operation) else {
                    continue;
                };
                let launcher = launcher.clone();
                let priority = settings.priority;
                schedulers.push(FnScheduler::new(
                    ScheduleId {
                        operation: operation.clone(),
                        subjects: backup.subjects.clone(),
                    },
                    settings.schedules.clone(),
                    settings.run_on_start,
                    move || {
                        let launcher = launcher.clone();
                        let request = request.clone();
                        async move {
                            launcher.launch(
                                request,
                                Trigger::Scheduler,
                                priority,
                                RunOptions::default(),
                            );
                            Ok(())
                        }
                    },
                ));
            }

            if let Some(watch) = &backup.watch {
                let request = operation_request(backup, &watch.operation).with_context(|| {
                    format!(
                        "watch of backup {:?} triggers unknown operation {:?}",
                        backup.name, watch.operation
                    )
                })?;
                let launcher = launcher.clone();
                let priority = watch.priority;
                let watcher = FsWatcher::new(backup.name.clone(), watch.config.clone(), move || {
                    let launcher = launcher.clone();
                    let request = request.clone();
                    async move {
                        launcher.launch(request, Trigger::FsWatcher, priority, RunOptions::default());
                        Ok(())
                    }
                })
                .with_context(|| format!("Invalid watch for backup {:?}", backup.name))?;
                watchers.push(watcher);
            }
        }

        Ok(Self {
            config,
            service,
            launcher,
            schedulers,
            watchers,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service(&self) -> &JobsService {
        &self.service
    }

    /// Starts the runner, then every scheduler and watcher. A watcher that cannot start is
    /// logged and skipped. Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.service.start();
        for scheduler in &self.schedulers {
            scheduler.start();
        }
        for watcher in &self.watchers {
            if let Err(e) = watcher.start() {
                error!(watcher = %watcher.name(), "Failed to start watcher: {}", e);
            }
        }
        info!(
            backups = self.config.backups.len(),
            schedulers = self.schedulers.len(),
            watchers = self.watchers.len(),
            "daemon started"
        );
    }

    /// Stops triggers first so nothing new is queued, then the runner.
    pub fn shutdown(&self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
        for scheduler in &self.schedulers {
            scheduler.stop();
        }
        self.service.stop();
        info!("daemon stopped");
    }

    pub fn schedules(&self) -> Vec<ScheduleInfo> {
        self.schedulers.iter().map(|s| s.info()).collect()
    }

    /// Requests an operation of a configured backup. The returned job may be an already
    /// queued equivalent one.
    pub fn trigger(
        &self,
        backup: &str,
        operation: &str,
        trigger: Trigger,
        priority: Option<Priority>,
    ) -> Result<Option<Arc<Job>>, TriggerError> {
        let settings = self
            .config
            .backup(backup)
            .ok_or_else(|| TriggerError::UnknownBackup(backup.to_string()))?;
        let request =
            operation_request(settings, operation).ok_or_else(|| TriggerError::UnknownOperation {
                backup: backup.to_string(),
                operation: operation.to_string(),
            })?;
        let priority = priority.unwrap_or(settings.operations[operation].priority);

        info!(backup, operation, %trigger, %priority, "operation requested");
        Ok(self
            .launcher
            .launch(request, trigger, priority, RunOptions::keep_result()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliConfig, FileConfig};
    use crate::jobs::{JobContext, JobState};
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<OperationRequest>>,
    }

    #[async_trait]
    impl OperationExecutor for RecordingExecutor {
        async fn execute(
            &self,
            _ctx: &JobContext,
            request: &OperationRequest,
        ) -> anyhow::Result<JsonValue> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(json!({ "exit_code": 0 }))
        }
    }

    fn config(toml_text: &str) -> AppConfig {
        let file: FileConfig = toml::from_str(toml_text).unwrap();
        AppConfig::resolve(&CliConfig::default(), Some(file)).unwrap()
    }

    const CONFIG: &str = r#"
[[backups]]
name = "home"
subjects = { repository = "nas" }

  [backups.operations.backup]
  command = ["restic", "backup"]
  schedules = ["6h"]
  run_on_start = true

  [backups.operations.check]
  command = ["restic", "check"]
  priority = "inferior"
"#;

    #[tokio::test]
    async fn test_run_on_start_submits_a_scheduled_job() {
        let executor = Arc::new(RecordingExecutor::default());
        let daemon = Daemon::new(config(CONFIG), executor.clone()).unwrap();
        assert_eq!(daemon.schedules().len(), 1);

        daemon.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while executor.calls.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls[0].backup, "home");
        assert_eq!(calls[0].operation, "backup");
        assert_eq!(calls[0].subjects.get("repository").unwrap(), "nas");

        let info = &daemon.schedules()[0];
        assert_eq!(info.operation, "backup");
        assert!(info.next_run_at.is_some());

        daemon.shutdown();
        assert!(daemon.schedules()[0].next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_trigger_by_name() {
        let executor = Arc::new(RecordingExecutor::default());
        let daemon = Daemon::new(config(CONFIG), executor.clone()).unwrap();

        assert_eq!(
            daemon
                .trigger("work", "backup", Trigger::Api, None)
                .unwrap_err(),
            TriggerError::UnknownBackup("work".to_string())
        );
        assert!(matches!(
            daemon.trigger("home", "prune", Trigger::Api, None),
            Err(TriggerError::UnknownOperation { .. })
        ));

        // Not started yet, so both requests are queued and deduplicated
        let first = daemon
            .trigger("home", "check", Trigger::Api, None)
            .unwrap()
            .unwrap();
        assert_eq!(first.priority(), Priority::Inferior);
        let second = daemon
            .trigger("home", "check", Trigger::Api, None)
            .unwrap()
            .unwrap();
        assert_eq!(first.uuid(), second.uuid());

        let bumped = daemon
            .trigger("home", "check", Trigger::Api, Some(Priority::Immediate))
            .unwrap()
            .unwrap();
        assert_ne!(bumped.uuid(), first.uuid());
        assert_eq!(first.state(), JobState::Canceled);

        daemon.start();
        assert_eq!(bumped.result().await, Ok(json!({ "exit_code": 0 })));
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued_jobs() {
        let executor = Arc::new(RecordingExecutor::default());
        let daemon = Daemon::new(config(CONFIG), executor).unwrap();
        let queued = daemon
            .trigger("home", "check", Trigger::Api, None)
            .unwrap()
            .unwrap();

        daemon.shutdown();
        assert_eq!(queued.state(), JobState::Canceled);
    }
}
