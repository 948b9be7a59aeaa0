//! Execution of configured backup operations.

mod command;

pub use command::CommandExecutor;

use crate::jobs::{JobContext, Subjects};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Everything needed to perform one operation of one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationRequest {
    pub backup: String,
    pub operation: String,
    pub subjects: Subjects,
    /// Program followed by its arguments, taken verbatim from configuration.
    pub command: Vec<String>,
}

/// Performs the actual work behind a job.
///
/// Implementations must watch `ctx`'s cancellation signal, stop the underlying work
/// promptly once it fires, and then return.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &JobContext,
        request: &OperationRequest,
    ) -> anyhow::Result<JsonValue>;
}
