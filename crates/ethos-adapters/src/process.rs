//! Subprocess execution with a timeout

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult};

/// Run `command` to completion, capturing output; the child is killed when
/// `timeout` elapses
pub(crate) async fn run_command(mut command: Command, timeout: Duration) -> ExecutionResult {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ExecutionResult::failure(format!("failed to spawn: {e}")),
        Err(_) => {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "command timed out");
            return ExecutionResult::failure(format!("timed out after {}ms", timeout.as_millis()));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let code = output.status.code().unwrap_or(-1);
    let value = json!({ "stdout": stdout, "stderr": stderr, "code": code });

    let result = if output.status.success() {
        ExecutionResult::success(value)
    } else {
        ExecutionResult {
            result: Some(value),
            ..ExecutionResult::failure(format!("exited with status {code}"))
        }
    };
    result.with_status(code)
}

/// Executes `process` actions
#[derive(Debug, Clone)]
pub struct ProcessAdapter {
    timeout: Duration,
}

impl ProcessAdapter {
    /// Adapter whose children are killed after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ActionAdapter for ProcessAdapter {
    fn name(&self) -> &str {
        "process"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::Process { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::Process { program, args, cwd } = &action.payload else {
            return ExecutionResult::failure("process adapter received a non-process action");
        };
        let mut command = Command::new(program);
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        tracing::debug!(%program, ?args, "running process");
        run_command(command, self.timeout).await
    }
}
