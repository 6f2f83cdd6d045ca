use crate::config::AdapterSettings;
use crate::core::backend::{BackendConfig, Protocol};
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// One element of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
    pub data: Value,
    pub done: bool,
}

impl StreamChunk {
    /// Decode a streamed payload.
    ///
    /// The chunk body is `result`, else `data`, else the whole payload; a
    /// boolean `done` ends the stream and an `error` object fails it.
    pub fn from_payload(payload: Value) -> McpResult<Self> {
        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(McpError::Backend {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000) as i32,
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream error")
                    .to_string(),
            });
        }
        let done = payload.get("done").and_then(Value::as_bool).unwrap_or(false);
        let data = match payload.get("result").or_else(|| payload.get("data")) {
            Some(data) => data.clone(),
            None => payload,
        };
        Ok(Self { data, done })
    }
}

/// Lazy, finite, non-restartable sequence of chunks
pub type ChunkStream = BoxStream<'static, McpResult<StreamChunk>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealth {
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdapterHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            error: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_check: Utc::now(),
            error: Some(reason.into()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: Utc::now(),
            error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Lifecycle notifications published by an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Connected,
    /// Transport broke; the adapter is recovering on its own
    Errored(String),
    Reconnecting { attempt: u32 },
    Disconnected,
    /// The adapter gave up recovering
    Failed(String),
    /// Unsolicited message from the backend
    Notification(Value),
}

/// Counters kept by every adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStats {
    pub request_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Uniform contract over one backend connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Adapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Establish the transport
    async fn connect(&self) -> McpResult<()>;

    /// Send a request and wait for the correlated response
    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a request and read its response as a chunk stream
    async fn stream_request(&self, request: JsonRpcRequest) -> McpResult<ChunkStream>;

    async fn health(&self) -> AdapterHealth;

    /// Cancel pending calls and release the transport. Idempotent.
    async fn disconnect(&self) -> McpResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent>;

    fn stats(&self) -> AdapterStats;
}

/// Settings handed to a builder when the factory creates an adapter
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub backend_id: String,
    pub settings: AdapterSettings,
    pub health_check_interval: Duration,
}

/// Constructs adapters for one protocol
pub trait AdapterBuilder: Send + Sync {
    fn build(&self, config: &BackendConfig, ctx: &BuildContext) -> McpResult<Arc<dyn Adapter>>;
}
