//! Stateless HTTP adapter
//!
//! Calls are `POST {baseUrl}/request`; streamed calls are `POST
//! {baseUrl}/stream` answered with newline-delimited JSON chunks.

use crate::adapter::pending::ActivityTracker;
use crate::adapter::traits::{
    Adapter, AdapterEvent, AdapterHealth, AdapterStats, ChunkStream, StreamChunk,
};
use crate::config::HttpSettings;
use crate::core::backend::{HttpConfig, Protocol};
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::core::request_id::SharedRequestIdGenerator;
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Convert configured headers, rejecting names or values HTTP cannot carry.
pub(crate) fn build_headers(headers: &HashMap<String, String>) -> McpResult<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McpError::Configuration(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(&shellexpand::env(value).unwrap_or_else(|_| value.into()))
            .map_err(|e| McpError::Configuration(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub struct HttpAdapter {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    backend_id: String,
    base_url: Url,
    headers: HeaderMap,
    settings: HttpSettings,
    health_check_interval: Duration,
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    connected: AtomicBool,
    cancel: Mutex<CancellationToken>,
    ids: SharedRequestIdGenerator,
    activity: ActivityTracker,
    events: broadcast::Sender<AdapterEvent>,
}

impl HttpAdapter {
    pub fn new(
        backend_id: impl Into<String>,
        config: HttpConfig,
        settings: HttpSettings,
        health_check_interval: Duration,
    ) -> McpResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            McpError::Configuration(format!("invalid baseUrl '{}': {}", config.base_url, e))
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout())
            .build()
            .map_err(|e| McpError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(HttpInner {
                backend_id: backend_id.into(),
                base_url,
                headers: build_headers(&config.headers)?,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
                settings,
                health_check_interval,
                client,
                connected: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                ids: SharedRequestIdGenerator::new(),
                activity: ActivityTracker::new(),
                events,
            }),
        })
    }

    /// Requests currently holding a concurrency slot
    pub fn in_flight(&self) -> usize {
        self.inner.settings.max_concurrent_requests - self.inner.permits.available_permits()
    }
}

impl HttpInner {
    fn emit_event(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    fn endpoint(&self, segment: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), segment);
        url.set_path(&path);
        url
    }

    fn acquire(&self) -> McpResult<OwnedSemaphorePermit> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::Transport(format!(
                "backend '{}' is not connected",
                self.backend_id
            )));
        }
        self.permits.clone().try_acquire_owned().map_err(|_| {
            McpError::CapacityExceeded(format!(
                "backend '{}' already has {} requests in flight",
                self.backend_id, self.settings.max_concurrent_requests
            ))
        })
    }

    async fn post(&self, url: &Url, request: &JsonRpcRequest, accept: &str) -> McpResult<reqwest::Response> {
        let timeout = self.settings.timeout();
        let response = self
            .client
            .post(url.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::Timeout(timeout.as_millis() as u64)
                } else {
                    e.into()
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(McpError::UpstreamStatus {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    /// POST with doubling backoff; 4xx answers are returned at once.
    async fn post_with_retry(&self, url: &Url, request: &JsonRpcRequest, accept: &str) -> McpResult<reqwest::Response> {
        let mut attempt = 1;
        loop {
            match self.post(url, request, accept).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_client_error() || attempt >= self.settings.retry_attempts => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = self.settings.retry_delay(attempt);
                    warn!(
                        "Request to '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        self.backend_id, attempt, self.settings.retry_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call(&self, request: &JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let url = self.endpoint("request");
        debug!("POST {} to {}", request.method, url);
        let response = self.post_with_retry(&url, request, "application/json").await?;
        let body: Value = response.json().await?;
        self.activity.touch();
        Ok(decode_body(request, body))
    }

    async fn probe(&self) -> AdapterHealth {
        let url = self.endpoint("health");
        let result = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .timeout(self.settings.timeout())
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_server_error() => {
                self.activity.touch();
                AdapterHealth::healthy()
            }
            Ok(response) => {
                AdapterHealth::unhealthy(format!("health probe answered {}", response.status()))
            }
            Err(e) => AdapterHealth::unhealthy(format!("health probe failed: {}", e)),
        }
    }
}

/// A JSON-RPC envelope is taken as is; any other body becomes the result.
fn decode_body(request: &JsonRpcRequest, body: Value) -> JsonRpcResponse {
    let id = request
        .id
        .clone()
        .unwrap_or(crate::core::protocol::RequestId::Number(0));
    if JsonRpcResponse::is_response_envelope(&body) {
        if let Ok(mut response) = serde_json::from_value::<JsonRpcResponse>(body.clone()) {
            if response.id.is_none() {
                response.id = Some(id);
            }
            return response;
        }
    }
    JsonRpcResponse::success(id, body)
}

type LineReader = FramedRead<StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>, LinesCodec>;

struct ChunkState {
    lines: LineReader,
    inner: Arc<HttpInner>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
    finished: bool,
}

async fn next_chunk(mut state: ChunkState) -> Option<(McpResult<StreamChunk>, ChunkState)> {
    if state.finished {
        return None;
    }
    loop {
        let line = tokio::select! {
            line = state.lines.next() => line,
            _ = state.cancel.cancelled() => {
                state.finished = true;
                return Some((Err(McpError::Cancelled), state));
            }
        };
        let item = match line {
            None => return None,
            Some(Err(e)) => Err(McpError::Transport(format!("stream read failed: {}", e))),
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => serde_json::from_str::<Value>(&line)
                .map_err(|e| McpError::ProtocolParse(e.to_string()))
                .and_then(StreamChunk::from_payload),
        };
        state.inner.activity.touch();
        state.finished = item.as_ref().map(|c| c.done).unwrap_or(true);
        if item.is_err() {
            state.inner.activity.record_error();
        }
        return Some((item, state));
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    /// Marks the adapter usable; the first call is what reaches the network.
    async fn connect(&self) -> McpResult<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut cancel = self.inner.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        self.inner.activity.touch();
        info!("HTTP adapter for '{}' ready at {}", self.inner.backend_id, self.inner.base_url);
        self.inner.emit_event(AdapterEvent::Connected);
        Ok(())
    }

    async fn send_request(&self, mut request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let _permit = self.inner.acquire()?;
        if request.id.is_none() {
            request.id = Some(self.inner.ids.next_id());
        }
        self.inner.activity.record_request();

        let cancel = self.inner.cancel.lock().clone();
        let result = tokio::select! {
            result = self.inner.call(&request) => result,
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        };
        match &result {
            Ok(response) if response.error.is_some() => self.inner.activity.record_error(),
            Ok(_) => {}
            Err(_) => self.inner.activity.record_error(),
        }
        result
    }

    async fn stream_request(&self, mut request: JsonRpcRequest) -> McpResult<ChunkStream> {
        let permit = self.inner.acquire()?;
        if request.id.is_none() {
            request.id = Some(self.inner.ids.next_id());
        }
        self.inner.activity.record_request();

        let url = self.inner.endpoint("stream");
        debug!("POST {} to {} (streaming)", request.method, url);
        let cancel = self.inner.cancel.lock().clone();
        let response = tokio::select! {
            response = self.inner.post_with_retry(&url, &request, "application/x-ndjson") => response,
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.inner.activity.record_error();
                return Err(e);
            }
        };

        let body = response.bytes_stream().map_err(io::Error::other).boxed();
        let state = ChunkState {
            lines: FramedRead::new(StreamReader::new(body), LinesCodec::new()),
            inner: self.inner.clone(),
            cancel,
            _permit: permit,
            finished: false,
        };
        Ok(futures::stream::unfold(state, next_chunk).boxed())
    }

    async fn health(&self) -> AdapterHealth {
        let connected = self.inner.connected.load(Ordering::SeqCst);
        match self
            .inner
            .activity
            .assess(connected, self.inner.health_check_interval)
        {
            Some(health) => health,
            None => self.inner.probe().await,
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.cancel.lock().cancel();
        info!("HTTP adapter for '{}' disconnected", self.inner.backend_id);
        self.inner.emit_event(AdapterEvent::Disconnected);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }

    fn stats(&self) -> AdapterStats {
        self.inner.activity.stats()
    }
}
