//! Minimal JSON-RPC 2.0 transport over HTTP.

use broker_core::error::LedgerCallError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Shared HTTP client issuing JSON-RPC calls to arbitrary endpoints.
#[derive(Debug)]
pub struct JsonRpcTransport {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, LedgerCallError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerCallError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method` and decode its `result`. A `null` result decodes as `T` when `T`
    /// accepts it (for example `Option<_>`).
    pub async fn call<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerCallError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!(url, method, id = request.id, "json-rpc request");

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerCallError::Transport(map_send_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LedgerCallError::Transport(format!(
                "{method}: http status {status}"
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerCallError::Decode(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            return Err(LedgerCallError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| LedgerCallError::Decode(format!("{method}: {e}")))
    }
}

fn map_send_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

/// How long to wait for a submitted transaction to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_polls: 120,
        }
    }
}
