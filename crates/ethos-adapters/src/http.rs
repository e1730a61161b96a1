//! Outbound HTTP requests

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;

use ethos_core::{ActionAdapter, ActionDefinition, ActionPayload, ExecutionResult};

/// Executes `http` actions with a lazily built client
pub struct HttpAdapter {
    timeout: Duration,
    client: OnceCell<Client>,
}

impl HttpAdapter {
    /// Adapter whose requests give up after `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> reqwest::Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                tracing::debug!(timeout_ms = self.timeout.as_millis() as u64, "building HTTP client");
                Client::builder().timeout(self.timeout).build()
            })
            .await
    }
}

impl std::fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("timeout", &self.timeout)
            .field("initialized", &self.client.initialized())
            .finish()
    }
}

/// Body as JSON when it parses, otherwise as a string
pub(crate) fn body_value(text: String) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl ActionAdapter for HttpAdapter {
    fn name(&self) -> &str {
        "http"
    }

    fn can_handle(&self, action: &ActionDefinition) -> bool {
        matches!(action.payload, ActionPayload::Http { .. })
    }

    async fn execute(&self, action: &ActionDefinition) -> ExecutionResult {
        let ActionPayload::Http {
            method,
            url,
            headers,
            body,
        } = &action.payload
        else {
            return ExecutionResult::failure("http adapter received a non-http action");
        };

        let method = match Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(e) => return ExecutionResult::failure(format!("invalid method `{method}`: {e}")),
        };
        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => return ExecutionResult::failure(format!("http client unavailable: {e}")),
        };

        let mut request = client.request(method.clone(), url.as_str());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%url, error = %e, "http request failed");
                return ExecutionResult::failure(format!("request failed: {e}"));
            }
        };
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        tracing::debug!(%method, %url, status = status.as_u16(), "http request completed");

        let value = json!({ "status": status.as_u16(), "body": body_value(text) });
        let result = if status.is_success() {
            ExecutionResult::success(value)
        } else {
            ExecutionResult {
                result: Some(value),
                ..ExecutionResult::failure(format!("http status {}", status.as_u16()))
            }
        };
        result.with_status(i32::from(status.as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(method: &str, url: String, body: Option<Value>) -> ActionDefinition {
        let mut headers = BTreeMap::new();
        headers.insert("x-ethos".to_string(), "1".to_string());
        ActionDefinition::builder(ActionPayload::Http {
            method: method.into(),
            url,
            headers,
            body,
        })
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn get_returns_status_and_json_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .match_header("x-ethos", "1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"healthy":true}"#)
            .create_async()
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5));
        let result = adapter
            .execute(&request("get", format!("{}/status", server.url()), None))
            .await;

        mock.assert_async().await;
        assert!(result.ok);
        assert_eq!(result.status, Some(200));
        assert_eq!(result.result.unwrap()["body"], json!({ "healthy": true }));
    }

    #[tokio::test]
    async fn post_sends_json_and_reports_error_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/jobs")
            .match_body(mockito::Matcher::Json(json!({ "name": "sync" })))
            .with_status(503)
            .with_body("busy")
            .create_async()
            .await;

        let adapter = HttpAdapter::new(Duration::from_secs(5));
        let result = adapter
            .execute(&request(
                "POST",
                format!("{}/jobs", server.url()),
                Some(json!({ "name": "sync" })),
            ))
            .await;

        mock.assert_async().await;
        assert!(!result.ok);
        assert_eq!(result.status, Some(503));
        assert_eq!(result.error.as_deref(), Some("http status 503"));
        assert_eq!(result.result.unwrap()["body"], json!("busy"));
    }

    #[tokio::test]
    async fn client_is_built_on_first_use() {
        let adapter = HttpAdapter::new(Duration::from_millis(200));
        assert!(!adapter.client.initialized());
        let result = adapter
            .execute(&request("GET", "http://127.0.0.1:9/unreachable".into(), None))
            .await;
        assert!(!result.ok);
        assert!(adapter.client.initialized());
    }
}
