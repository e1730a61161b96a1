//! Smart-device commands relayed through a device hub
//!
//! Each command is posted to `{hub}/devices/{device_id}/commands`, the id
//! percent-encoded as a single segment, as
//! `{"command": ..., "params": ...}`. The hub's reply becomes the result.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::time::Duration;
use tokio::sync::OnceCell;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult};

use crate::http::body_value;

/// Executes `device` actions against a hub
pub struct DeviceAdapter {
    hub_url: String,
    timeout: Duration,
    client: OnceCell<Client>,
}

impl DeviceAdapter {
    /// Adapter posting to `hub_url`
    #[must_use]
    pub fn new(hub_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            hub_url: hub_url.into().trim_end_matches('/').to_string(),
            timeout,
            client: OnceCell::new(),
        }
    }

    /// Hub base URL
    #[must_use]
    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    /// `{hub}/devices/{device_id}/commands` with `device_id` as one
    /// percent-encoded segment
    fn command_url(&self, device_id: &str) -> Result<Url, String> {
        let mut url = Url::parse(&self.hub_url).map_err(|e| format!("invalid device hub url: {e}"))?;
        url.path_segments_mut()
            .map_err(|()| format!("device hub url cannot take a path: {}", self.hub_url))?
            .pop_if_empty()
            .extend(["devices", device_id, "commands"]);
        Ok(url)
    }
}

impl std::fmt::Debug for DeviceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAdapter")
            .field("hub_url", &self.hub_url)
            .field("initialized", &self.client.initialized())
            .finish()
    }
}

#[async_trait]
impl ActionAdapter for DeviceAdapter {
    fn name(&self) -> &str {
        "device"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::Device { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::Device {
            device_id,
            command,
            params,
        } = &action.payload
        else {
            return ExecutionResult::failure("device adapter received a non-device action");
        };
        let client = match self
            .client
            .get_or_try_init(|| async { Client::builder().timeout(self.timeout).build() })
            .await
        {
            Ok(client) => client,
            Err(e) => return ExecutionResult::failure(format!("device hub client unavailable: {e}")),
        };

        let url = match self.command_url(device_id) {
            Ok(url) => url,
            Err(reason) => return ExecutionResult::failure(reason),
        };
        let response = match client
            .post(url)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%device_id, error = %e, "device hub unreachable");
                return ExecutionResult::failure(format!("device hub unreachable: {e}"));
            }
        };

        let status = response.status();
        let reply = body_value(response.text().await.unwrap_or_default());
        tracing::debug!(%device_id, %command, status = status.as_u16(), "device command sent");
        let result = if status.is_success() {
            ExecutionResult::success(reply)
        } else {
            ExecutionResult::failure(format!("device hub returned {}", status.as_u16()))
        };
        result.with_status(i32::from(status.as_u16()))
    }
}
