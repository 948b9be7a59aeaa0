mod file_config;

pub use file_config::{
    BackupFileConfig, FileConfig, JobsFileConfig, OperationFileConfig, WatchFileConfig,
};

use crate::jobs::{Priority, RunnerConfig, Subjects, DEFAULT_ARCHIVE_CAPACITY};
use crate::triggers::{parse_duration, ScheduleSpec, WatchConfig};
use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Subject tag carrying the backup name on every job.
pub const BACKUP_SUBJECT: &str = "backup";

const DEFAULT_WATCH_OPERATION: &str = "backup";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub port: u16,
    pub concurrency: usize,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            port: 8484,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub jobs: JobsSettings,
    pub backups: Vec<BackupSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobsSettings {
    pub runner: RunnerConfig,
    pub archive_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub name: String,
    /// All subject tags, `backup = <name>` included.
    pub subjects: Subjects,
    pub operations: BTreeMap<String, OperationSettings>,
    pub watch: Option<WatchSettings>,
}

#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub command: Vec<String>,
    pub schedules: Vec<ScheduleSpec>,
    pub run_on_start: bool,
    pub priority: Priority,
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub config: WatchConfig,
    pub operation: String,
    pub priority: Priority,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let port = file.port.unwrap_or(cli.port);

        let jobs_file = file.jobs.unwrap_or_default();
        let concurrency = jobs_file.concurrency.unwrap_or(cli.concurrency);
        if concurrency == 0 {
            bail!("jobs.concurrency must be at least 1");
        }
        let archive_capacity = jobs_file
            .archive_capacity
            .unwrap_or(DEFAULT_ARCHIVE_CAPACITY);
        if archive_capacity == 0 {
            bail!("jobs.archive_capacity must be at least 1");
        }
        let jobs = JobsSettings {
            runner: RunnerConfig {
                concurrency,
                immediate_bypasses_limit: jobs_file.immediate_bypasses_limit.unwrap_or(false),
            },
            archive_capacity,
        };

        let mut names = HashSet::new();
        let mut backups = Vec::with_capacity(file.backups.len());
        for backup in file.backups {
            if backup.name.trim().is_empty() {
                bail!("Backup names must not be empty");
            }
            if !names.insert(backup.name.clone()) {
                bail!("Duplicate backup name: {}", backup.name);
            }
            let name = backup.name.clone();
            backups.push(
                resolve_backup(backup).with_context(|| format!("Invalid backup {:?}", name))?,
            );
        }

        Ok(Self {
            port,
            jobs,
            backups,
        })
    }

    pub fn backup(&self, name: &str) -> Option<&BackupSettings> {
        self.backups.iter().find(|b| b.name == name)
    }
}

fn resolve_backup(file: BackupFileConfig) -> Result<BackupSettings> {
    let mut subjects = file.subjects;
    if let Some(existing) = subjects.get(BACKUP_SUBJECT) {
        if existing != &file.name {
            bail!(
                "subject {:?} is reserved for the backup name",
                BACKUP_SUBJECT
            );
        }
    }
    subjects.insert(BACKUP_SUBJECT.to_string(), file.name.clone());

    let mut operations = BTreeMap::new();
    for (operation, op_file) in file.operations {
        let settings = resolve_operation(op_file)
            .with_context(|| format!("Invalid operation {:?}", operation))?;
        operations.insert(operation, settings);
    }

    let watch = match file.watch {
        Some(watch) => {
            let settings = resolve_watch(watch).context("Invalid watch section")?;
            if !operations.contains_key(&settings.operation) {
                bail!(
                    "watch triggers operation {:?} which is not configured",
                    settings.operation
                );
            }
            Some(settings)
        }
        None => None,
    };

    Ok(BackupSettings {
        name: file.name,
        subjects,
        operations,
        watch,
    })
}

fn resolve_operation(file: OperationFileConfig) -> Result<OperationSettings> {
    if file.command.is_empty() || file.command[0].trim().is_empty() {
        bail!("command must not be empty");
    }
    let schedules = file
        .schedules
        .iter()
        .map(|s| s.parse::<ScheduleSpec>())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OperationSettings {
        command: file.command,
        schedules,
        run_on_start: file.run_on_start,
        priority: parse_priority(file.priority.as_ref())?,
    })
}

fn resolve_watch(file: WatchFileConfig) -> Result<WatchSettings> {
    if file.paths.is_empty() {
        bail!("paths must not be empty");
    }
    let wait_min = file.wait_min.as_deref().map(parse_duration).transpose()?;
    let wait_max = file.wait_max.as_deref().map(parse_duration).transpose()?;

    let config = WatchConfig {
        paths: file.paths.iter().map(PathBuf::from).collect(),
        ignore: file.ignore,
        wait_min,
        wait_max,
    };
    config.validate()?;

    Ok(WatchSettings {
        config,
        operation: file
            .operation
            .unwrap_or_else(|| DEFAULT_WATCH_OPERATION.to_string()),
        priority: parse_priority(file.priority.as_ref())?,
    })
}

fn parse_priority(value: Option<&toml::Value>) -> Result<Priority> {
    match value {
        None => Ok(Priority::Normal),
        Some(toml::Value::Integer(n)) => Ok(Priority::Level(*n)),
        Some(toml::Value::String(s)) => Ok(s.parse()?),
        Some(other) => bail!("invalid priority: {}", other),
    }
}
