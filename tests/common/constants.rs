//! Shared constants for end-to-end tests

/// Name of the only configured backup
pub const BACKUP_NAME: &str = "home";

/// Operation that prints a line and succeeds
pub const OP_BACKUP: &str = "backup";

/// Operation that writes to stderr and exits with code 3
pub const OP_FAILING: &str = "verify";

/// Operation that sleeps until aborted
pub const OP_SLOW: &str = "prune";

/// Daemon configuration used by every test server
pub const TEST_CONFIG: &str = r#"
[jobs]
concurrency = 1
archive_capacity = 10

[[backups]]
name = "home"
subjects = { repository = "local" }

  [backups.operations.backup]
  command = ["sh", "-c", "echo snapshot saved"]
  schedules = ["0 3 * * *"]

  [backups.operations.verify]
  command = ["sh", "-c", "echo corrupted pack >&2; exit 3"]

  [backups.operations.prune]
  command = ["sleep", "30"]
  priority = "inferior"
"#;

pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

pub const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How long to wait for a job to reach an expected state
pub const JOB_STATE_TIMEOUT_MS: u64 = 10_000;
