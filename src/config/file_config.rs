use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Can override CLI
    pub port: Option<u16>,

    pub jobs: Option<JobsFileConfig>,
    pub backups: Vec<BackupFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsFileConfig {
    pub concurrency: Option<usize>,
    pub archive_capacity: Option<usize>,
    pub immediate_bypasses_limit: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupFileConfig {
    pub name: String,
    /// Extra subject tags, on top of `backup = <name>`.
    #[serde(default)]
    pub subjects: BTreeMap<String, String>,
    #[serde(default)]
    pub operations: BTreeMap<String, OperationFileConfig>,
    pub watch: Option<WatchFileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OperationFileConfig {
    pub command: Vec<String>,
    /// Cron expressions or durations such as "6h".
    #[serde(default)]
    pub schedules: Vec<String>,
    #[serde(default)]
    pub run_on_start: bool,
    /// Symbolic level or integer.
    pub priority: Option<toml::Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchFileConfig {
    pub paths: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    pub wait_min: Option<String>,
    pub wait_max: Option<String>,
    /// Operation to trigger, "backup" if unset.
    pub operation: Option<String>,
    pub priority: Option<toml::Value>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
