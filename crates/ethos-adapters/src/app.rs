//! Detached application launches

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::process::Command;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult};

/// Executes `app` actions by spawning the application without waiting
#[derive(Debug, Clone, Default)]
pub struct AppAdapter;

impl AppAdapter {
    /// New adapter
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionAdapter for AppAdapter {
    fn name(&self) -> &str {
        "app"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::App { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::App { app, args } = &action.payload else {
            return ExecutionResult::failure("app adapter received a non-app action");
        };
        let spawned = Command::new(app)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(mut child) => {
                let pid = child.id();
                tracing::info!(%app, ?pid, "launched application");
                // reap in the background
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                ExecutionResult::success(json!({ "launched": app, "pid": pid }))
            }
            Err(e) => ExecutionResult::failure(format!("failed to launch {app}: {e}")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn app(name: &str, args: &[&str]) -> ActionDefinition {
        ActionDefinition::builder(ActionPayload::App {
            app: name.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        })
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn launch_returns_immediately() {
        let started = std::time::Instant::now();
        let result = AppAdapter::new().execute(&app("sleep", &["2"])).await;
        assert!(result.ok);
        assert!(result.result.unwrap()["pid"].is_u64());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unknown_application_fails() {
        let result = AppAdapter::new().execute(&app("no-such-app-anywhere", &[])).await;
        assert!(!result.ok);
    }
}
