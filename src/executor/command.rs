use super::{OperationExecutor, OperationRequest};
use crate::jobs::{JobContext, RunLogger};
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Runs an operation as a child process.
///
/// Output lines go to the job's run-log (stdout as info, stderr as warnings). The child is
/// killed when the job is aborted.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

fn forward_lines<R>(reader: R, logger: RunLogger, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_stderr => logger.warn(line),
                Ok(Some(line)) => logger.info(line),
                Ok(None) => break,
                Err(e) => {
                    logger.error(format!("error reading process output: {}", e));
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl OperationExecutor for CommandExecutor {
    async fn execute(
        &self,
        ctx: &JobContext,
        request: &OperationRequest,
    ) -> anyhow::Result<JsonValue> {
        let Some((program, args)) = request.command.split_first() else {
            bail!(
                "no command configured for {} of {}",
                request.operation,
                request.backup
            );
        };

        let logger = ctx.logger();
        logger.info(format!("running {}", request.command.join(" ")));

        let mut child = Command::new(program)
            .args(args)
            .env("BACKUPD_JOB_UUID", ctx.uuid().to_string())
            .env("BACKUPD_BACKUP", &request.backup)
            .env("BACKUPD_OPERATION", &request.operation)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program))?;

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, logger.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, logger.clone(), true));
        }

        let token = ctx.cancellation_token();
        let status = tokio::select! {
            status = child.wait() => status.with_context(|| format!("failed to wait for {}", program))?,
            _ = token.cancelled() => {
                logger.warn(format!("killing {}", program));
                child.kill().await.with_context(|| format!("failed to kill {}", program))?;
                bail!("{} was interrupted", program);
            }
        };

        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        match status.code() {
            Some(0) => Ok(json!({ "exit_code": 0 })),
            Some(code) => bail!("{} exited with code {}", program, code),
            None => bail!("{} was terminated by a signal", program),
        }
    }
}
