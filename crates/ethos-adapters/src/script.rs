//! Shell scripts through PowerShell or `sh`

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult};

use crate::process::run_command;

/// Interpreter used for `powershell` actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// `powershell -NoProfile -NonInteractive -Command`
    PowerShell,
    /// `sh -c`
    Posix,
}

impl Shell {
    fn command(self, script: &str) -> Command {
        match self {
            Shell::PowerShell => {
                let mut command = Command::new("powershell");
                command.args(["-NoProfile", "-NonInteractive", "-Command", script]);
                command
            }
            Shell::Posix => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(script);
                command
            }
        }
    }
}

/// Executes `powershell` actions
#[derive(Debug, Clone)]
pub struct ScriptAdapter {
    shell: Shell,
    timeout: Duration,
}

impl ScriptAdapter {
    /// Adapter running scripts with `shell`
    #[must_use]
    pub fn new(shell: Shell, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

#[async_trait]
impl ActionAdapter for ScriptAdapter {
    fn name(&self) -> &str {
        "script"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::Powershell { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::Powershell { script } = &action.payload else {
            return ExecutionResult::failure("script adapter received a non-script action");
        };
        tracing::debug!(shell = ?self.shell, "running script");
        run_command(self.shell.command(script), self.timeout).await
    }
}
