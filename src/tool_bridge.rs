//! Tool Bridge Client (C1).
//!
//! Holds one connection to the remote tool service, exposes a typed
//! `run_tool` API, and forwards every tool response to an `on_log` callback.
//! Shaped after [`crate::clients`]-adjacent HTTP client conventions in the
//! upstream crate's `McpClientProtocol` (an HTTP-backed `ToolProtocol`
//! implementation with a TTL-cached tool list): a `reqwest::Client`, a
//! cached tool list behind a lock, and `{endpoint}/...` POST/GET calls.

use crate::error::ToolBridgeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Severity forwarded to the `on_log` callback, mirrored in `mcp_log` WS events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub schema: Value,
}

/// Callback invoked for every tool request/response so the UI can display
/// tool traffic. Boxed the same way `EventHandler` implementations are
/// shared as `Arc<dyn ...>` in the upstream crate.
pub type LogCallback = Arc<dyn Fn(&str, LogLevel) + Send + Sync>;

#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Called once at startup; returns the set of tools the remote service
    /// exposes (§6.5: at minimum `list_issues`, `get_issue`, `list_branches`,
    /// `list_merge_requests`, `create_or_update_file`, `get_file_contents`,
    /// `get_repo_tree`, `get_latest_pipeline_for_ref`, `get_pipeline`,
    /// `get_pipeline_jobs`, `get_job_trace`).
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolBridgeError>;

    /// Invoke a named tool with JSON arguments. Invocations are serialized
    /// per connection (§5 "the tool bridge is single-threaded per
    /// connection").
    async fn run_tool(&self, name: &str, args: Value) -> Result<String, ToolBridgeError>;
}

const RECONNECT_BACKOFFS_SECS: [u64; 3] = [1, 2, 4];

/// Default HTTP-backed implementation. One `RemoteToolBridge` per
/// supervisor run; calls are serialized through an internal mutex so a
/// single logical connection is maintained even when multiple tasks hold a
/// clone of the `Arc`.
pub struct RemoteToolBridge {
    endpoint: String,
    client: reqwest::Client,
    call_gate: Mutex<()>,
    consecutive_failures: AtomicU32,
    dead: std::sync::atomic::AtomicBool,
    tools_cache: RwLock<Option<Vec<ToolDescriptor>>>,
    on_log: Option<LogCallback>,
}

impl RemoteToolBridge {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("reqwest client builds with a fixed timeout");
        RemoteToolBridge {
            endpoint: endpoint.into(),
            client,
            call_gate: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
            dead: std::sync::atomic::AtomicBool::new(false),
            tools_cache: RwLock::new(None),
            on_log: None,
        }
    }

    pub fn with_log_callback(mut self, cb: LogCallback) -> Self {
        self.on_log = Some(cb);
        self
    }

    fn log(&self, message: &str, level: LogLevel) {
        if let Some(cb) = &self.on_log {
            cb(message, level);
        }
    }

    /// Attempt up to 3 reconnects with exponential backoff (1s, 2s, 4s).
    /// Returns `Ok(())` once a probe succeeds, `Err(ConnectionLost)` once
    /// all attempts are exhausted.
    async fn reconnect(&self) -> Result<(), ToolBridgeError> {
        for backoff in RECONNECT_BACKOFFS_SECS {
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            let probe = self.client.get(format!("{}/tools", self.endpoint)).send().await;
            if probe.is_ok() {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.dead.store(false, Ordering::SeqCst);
                self.log("tool bridge reconnected", LogLevel::Info);
                return Ok(());
            }
            self.log(&format!("reconnect attempt failed, retrying in next backoff"), LogLevel::Warn);
        }
        self.dead.store(true, Ordering::SeqCst);
        Err(ToolBridgeError::ConnectionLost)
    }
}

#[async_trait]
impl ToolBridge for RemoteToolBridge {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolBridgeError> {
        if let Some(cached) = self.tools_cache.read().await.clone() {
            return Ok(cached);
        }
        let _permit = self.call_gate.lock().await;
        let response = self
            .client
            .get(format!("{}/tools", self.endpoint))
            .send()
            .await
            .map_err(|e| ToolBridgeError::ToolError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolBridgeError::ToolError(format!(
                "list_tools returned status {}",
                response.status()
            )));
        }
        let tools: Vec<ToolDescriptor> = response
            .json()
            .await
            .map_err(|e| ToolBridgeError::ToolError(e.to_string()))?;
        *self.tools_cache.write().await = Some(tools.clone());
        Ok(tools)
    }

    async fn run_tool(&self, name: &str, args: Value) -> Result<String, ToolBridgeError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(ToolBridgeError::ConnectionLost);
        }
        let _permit = self.call_gate.lock().await;
        self.log(&format!("run_tool {} {}", name, args), LogLevel::Debug);

        const MAX_ATTEMPTS: u32 = 3;
        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .client
                .post(format!("{}/tools/{}", self.endpoint, name))
                .json(&args)
                .send()
                .await;

            let response = match result {
                Ok(r) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    r
                }
                Err(e) if e.is_timeout() => {
                    self.log(&format!("run_tool {} timed out", name), LogLevel::Warn);
                    return Err(ToolBridgeError::Timeout);
                }
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    self.log(
                        &format!("run_tool {} failed (attempt {}/{}): {}", name, attempt, MAX_ATTEMPTS, e),
                        LogLevel::Warn,
                    );
                    if attempt == MAX_ATTEMPTS {
                        self.dead.store(true, Ordering::SeqCst);
                        return Err(ToolBridgeError::ConnectionLost);
                    }
                    self.reconnect().await?;
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                self.log(&format!("run_tool {} returned {}: {}", name, status, body), LogLevel::Error);
                return Err(ToolBridgeError::ToolError(format!("{}: {}", status, body)));
            }

            let text = response
                .text()
                .await
                .map_err(|e| ToolBridgeError::ToolError(e.to_string()))?;
            self.log(&format!("run_tool {} ok", name), LogLevel::Debug);
            return Ok(text);
        }
        unreachable!("loop always returns on its final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dead_bridge_fails_fast_without_attempting_a_call() {
        let bridge = RemoteToolBridge::new("http://127.0.0.1:1", 1);
        bridge.dead.store(true, Ordering::SeqCst);
        let err = bridge.run_tool("list_issues", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ToolBridgeError::ConnectionLost));
    }
}
