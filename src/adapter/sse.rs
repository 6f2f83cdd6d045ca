//! Server-sent-event adapter
//!
//! Inbound traffic arrives on one long-lived event stream; outbound calls are
//! POSTed to a companion endpoint and correlated back by id.

use crate::adapter::http::build_headers;
use crate::adapter::pending::{ActivityTracker, PendingCalls};
use crate::adapter::traits::{
    Adapter, AdapterEvent, AdapterHealth, AdapterStats, ChunkStream, StreamChunk,
};
use crate::config::SseSettings;
use crate::core::backend::{Protocol, SseConfig};
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::core::request_id::SharedRequestIdGenerator;
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

const SESSION_HEADER: &str = "mcp-session-id";
/// How long `connect` waits for an `endpoint` event when no companion URL is configured
const ENDPOINT_WAIT: Duration = Duration::from_secs(1);

type ChunkSender = mpsc::UnboundedSender<McpResult<StreamChunk>>;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line is available, so events split
/// across network reads decode the same as whole ones.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: String,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Dispatch whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.process_line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "event" => self.event = Some(value.to_string()),
            // id and retry carry nothing the adapter uses
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

/// Companion endpoint used when none is configured or announced.
///
/// A trailing `/sse` path segment becomes `/request`; other URLs are used as is.
pub fn derive_message_url(stream_url: &Url) -> Url {
    let mut url = stream_url.clone();
    if let Some(prefix) = stream_url.path().strip_suffix("/sse") {
        url.set_path(&format!("{}/request", prefix));
    }
    url
}

pub struct SseAdapter {
    inner: Arc<SseInner>,
}

struct SseInner {
    backend_id: String,
    settings: SseSettings,
    health_check_interval: Duration,
    client: reqwest::Client,
    headers: HeaderMap,
    stream_url: Url,
    configured_message_url: Option<Url>,
    message_url: RwLock<Url>,
    endpoint_announced: Notify,
    session_id: RwLock<Option<String>>,
    pending: PendingCalls,
    streams: Arc<DashMap<RequestId, ChunkSender>>,
    connected: AtomicBool,
    terminal: Mutex<Option<String>>,
    reconnect_count: AtomicU32,
    ids: SharedRequestIdGenerator,
    activity: ActivityTracker,
    events: broadcast::Sender<AdapterEvent>,
    reader: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SseAdapter {
    pub fn new(
        backend_id: impl Into<String>,
        config: SseConfig,
        settings: SseSettings,
        health_check_interval: Duration,
    ) -> McpResult<Self> {
        let stream_url = Url::parse(&config.url)
            .map_err(|e| McpError::Configuration(format!("invalid SSE url '{}': {}", config.url, e)))?;
        let configured_message_url = config
            .message_url
            .as_deref()
            .map(|u| {
                stream_url
                    .join(u)
                    .map_err(|e| McpError::Configuration(format!("invalid messageUrl '{}': {}", u, e)))
            })
            .transpose()?;
        let message_url = configured_message_url
            .clone()
            .unwrap_or_else(|| derive_message_url(&stream_url));

        // No overall timeout: it would cut the long-lived event stream.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.request_timeout())
            .build()
            .map_err(|e| McpError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(SseInner {
                backend_id: backend_id.into(),
                headers: build_headers(&config.headers)?,
                settings,
                health_check_interval,
                client,
                stream_url,
                configured_message_url,
                message_url: RwLock::new(message_url),
                endpoint_announced: Notify::new(),
                session_id: RwLock::new(None),
                pending: PendingCalls::new(),
                streams: Arc::new(DashMap::new()),
                connected: AtomicBool::new(false),
                terminal: Mutex::new(None),
                reconnect_count: AtomicU32::new(0),
                ids: SharedRequestIdGenerator::new(),
                activity: ActivityTracker::new(),
                events,
                reader: Mutex::new(None),
            }),
        })
    }

    /// Endpoint outbound calls are currently POSTed to
    pub fn message_url(&self) -> Url {
        self.inner.message_url.read().clone()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnect_count.load(Ordering::SeqCst)
    }
}

impl SseInner {
    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    async fn open_stream(&self) -> McpResult<reqwest::Response> {
        info!("Connecting to SSE endpoint: {}", self.stream_url);
        let response = self
            .client
            .get(self.stream_url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| {
                McpError::Connection(format!("failed to open {}: {}", self.stream_url, e))
            })?;

        if !response.status().is_success() {
            return Err(McpError::Connection(format!(
                "{} answered {}",
                self.stream_url,
                response.status()
            )));
        }

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            debug!("SSE session for '{}': {}", self.backend_id, id);
            *self.session_id.write() = Some(id.to_string());
        }
        Ok(response)
    }

    fn request_url(&self) -> Url {
        let mut url = self.message_url.read().clone();
        if let Some(id) = self.session_id.read().as_deref() {
            if !url.query_pairs().any(|(k, _)| k == "session_id") {
                url.query_pairs_mut().append_pair("session_id", id);
            }
        }
        url
    }

    fn handle_event(&self, event: SseEvent) {
        if event.event.as_deref() == Some("endpoint") {
            match self.stream_url.join(event.data.trim()) {
                Ok(url) => {
                    if self.configured_message_url.is_none() {
                        info!("Backend '{}' announced endpoint {}", self.backend_id, url);
                        *self.message_url.write() = url;
                        self.endpoint_announced.notify_one();
                    }
                }
                Err(e) => warn!("Backend '{}' announced a bad endpoint: {}", self.backend_id, e),
            }
            return;
        }
        if event.data.trim().is_empty() {
            return;
        }

        self.activity.touch();
        self.reconnect_count.store(0, Ordering::SeqCst);
        debug!("SSE message from '{}': {}", self.backend_id, event.data);

        let value: Value = match serde_json::from_str(&event.data) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "{}",
                    McpError::ProtocolParse(format!("backend '{}': {}", self.backend_id, e))
                );
                return;
            }
        };

        let id = value
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value::<RequestId>(id).ok());

        if let Some(id) = &id {
            if let Some(sender) = self.streams.get(id).map(|s| s.clone()) {
                let chunk = StreamChunk::from_payload(value);
                let finished = chunk.as_ref().map(|c| c.done).unwrap_or(true);
                let _ = sender.send(chunk);
                if finished {
                    self.streams.remove(id);
                }
                return;
            }
        }

        if id.is_some() && JsonRpcResponse::is_response_envelope(&value) {
            match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                Ok(response) => {
                    if self.pending.resolve(response).is_some() {
                        debug!("SSE response with unknown id from '{}'", self.backend_id);
                        self.emit(AdapterEvent::Notification(value));
                    }
                }
                Err(e) => warn!("Malformed SSE response from '{}': {}", self.backend_id, e),
            }
        } else {
            self.emit(AdapterEvent::Notification(value));
        }
    }

    fn fail_streams(&self, make_error: impl Fn() -> McpError) {
        let ids: Vec<RequestId> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, sender)) = self.streams.remove(&id) {
                let _ = sender.send(Err(make_error()));
            }
        }
    }

    /// Read the event stream until it ends; returns why it ended.
    async fn read_stream(&self, response: reqwest::Response) -> String {
        let mut decoder = SseDecoder::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.feed(&bytes) {
                        self.handle_event(event);
                    }
                }
                Err(e) => return format!("event stream error: {}", e),
            }
        }
        if let Some(event) = decoder.finish() {
            self.handle_event(event);
        }
        "event stream closed".to_string()
    }

    async fn run_reader(self: Arc<Self>, mut response: reqwest::Response, cancel: CancellationToken) {
        loop {
            let reason = tokio::select! {
                reason = self.read_stream(response) => reason,
                _ = cancel.cancelled() => return,
            };

            self.connected.store(false, Ordering::SeqCst);
            self.pending
                .fail_all(|| McpError::Transport("event stream lost".to_string()));
            self.fail_streams(|| McpError::Transport("event stream lost".to_string()));
            warn!("Backend '{}': {}", self.backend_id, reason);
            self.emit(AdapterEvent::Errored(reason));

            response = match self.reconnect(&cancel).await {
                Some(response) => response,
                None => return,
            };
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Option<reqwest::Response> {
        loop {
            let attempts = self.reconnect_count.load(Ordering::SeqCst);
            if attempts >= self.settings.max_reconnects {
                let reason = format!(
                    "backend {} gave up after {} reconnect attempts",
                    self.backend_id, attempts
                );
                error!("{}", reason);
                *self.terminal.lock() = Some(reason.clone());
                self.emit(AdapterEvent::Failed(reason));
                return None;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay()) => {}
                _ = cancel.cancelled() => return None,
            }

            let attempt = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "Reconnecting backend '{}' (attempt {}/{})",
                self.backend_id, attempt, self.settings.max_reconnects
            );
            self.emit(AdapterEvent::Reconnecting { attempt });

            match self.open_stream().await {
                Ok(response) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.emit(AdapterEvent::Connected);
                    return Some(response);
                }
                Err(e) => warn!("Reconnect of '{}' failed: {}", self.backend_id, e),
            }
        }
    }

    /// POST one message to the companion endpoint.
    ///
    /// Returns the response body when it decodes as JSON.
    async fn post(&self, request: &JsonRpcRequest) -> McpResult<Option<Value>> {
        let url = self.request_url();
        debug!("POST {} to '{}'", request.method, url);

        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .timeout(self.settings.request_timeout())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(McpError::UpstreamStatus {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body).ok())
    }

    fn check_usable(&self) -> McpResult<()> {
        if let Some(reason) = self.terminal.lock().clone() {
            return Err(McpError::Connection(reason));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::Transport(format!(
                "backend '{}' is not connected",
                self.backend_id
            )));
        }
        Ok(())
    }

    async fn send_request(&self, mut request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        self.check_usable()?;

        let id = request.id.clone().unwrap_or_else(|| self.ids.next_id());
        request.id = Some(id.clone());
        let rx = self.pending.register(id.clone());

        let inline = match self.post(&request).await {
            Ok(inline) => inline,
            Err(e) => {
                self.pending.remove(&id);
                self.activity.record_error();
                return Err(e);
            }
        };
        self.activity.record_request();

        // Some servers answer on the POST itself instead of the stream.
        if let Some(value) = inline.filter(JsonRpcResponse::is_response_envelope) {
            if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
                if response.id.as_ref() == Some(&id) {
                    self.pending.resolve(response);
                }
            }
        }

        let timeout = self.settings.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                if response.error.is_some() {
                    self.activity.record_error();
                }
                Ok(response)
            }
            Ok(Ok(Err(e))) => {
                self.activity.record_error();
                Err(e)
            }
            Ok(Err(_)) => {
                self.activity.record_error();
                Err(McpError::Cancelled)
            }
            Err(_) => {
                self.pending.remove(&id);
                self.activity.record_error();
                Err(McpError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn handshake(&self) -> McpResult<()> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "mcphub", "version": env!("CARGO_PKG_VERSION")}
        });
        self.send_request(JsonRpcRequest::new("initialize", Some(params)))
            .await?
            .into_result()?;
        self.post(&JsonRpcRequest::new("notifications/initialized", None))
            .await
            .map(|_| ())
    }
}

/// Removes a stream's channel from the routing table when the stream is dropped
struct StreamSlot {
    streams: Arc<DashMap<RequestId, ChunkSender>>,
    id: RequestId,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
    }
}

struct ChunkState {
    rx: mpsc::UnboundedReceiver<McpResult<StreamChunk>>,
    _slot: StreamSlot,
    timeout: Duration,
    finished: bool,
}

#[async_trait]
impl Adapter for SseAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Sse
    }

    async fn connect(&self) -> McpResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.disconnect().await?;
        self.inner.reconnect_count.store(0, Ordering::SeqCst);
        *self.inner.terminal.lock() = None;

        let response = self.inner.open_stream().await?;
        // Set before the reader starts so a stream that ends at once is seen as lost.
        self.inner.connected.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run_reader(response, cancel.clone()));
        *self.inner.reader.lock() = Some((cancel, handle));

        if self.inner.configured_message_url.is_none() {
            let _ = tokio::time::timeout(ENDPOINT_WAIT, self.inner.endpoint_announced.notified()).await;
        }

        if self.inner.settings.handshake {
            if let Err(e) = self.inner.handshake().await {
                self.disconnect().await?;
                return Err(McpError::Connection(format!(
                    "initialize handshake with '{}' failed: {}",
                    self.inner.backend_id, e
                )));
            }
        }

        self.inner.activity.touch();
        info!("SSE connection to '{}' established", self.inner.backend_id);
        self.inner.emit(AdapterEvent::Connected);
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        self.inner.send_request(request).await
    }

    async fn stream_request(&self, mut request: JsonRpcRequest) -> McpResult<ChunkStream> {
        self.inner.check_usable()?;

        let id = request.id.clone().unwrap_or_else(|| self.inner.ids.next_id());
        request.id = Some(id.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.insert(id.clone(), tx);
        let slot = StreamSlot {
            streams: self.inner.streams.clone(),
            id,
        };

        let inline = match self.inner.post(&request).await {
            Ok(inline) => inline,
            Err(e) => {
                self.inner.activity.record_error();
                return Err(e);
            }
        };
        self.inner.activity.record_request();

        // An answer on the POST itself is the whole stream.
        if let Some(value) = inline.filter(JsonRpcResponse::is_response_envelope) {
            let answered = value
                .get("id")
                .cloned()
                .and_then(|id| serde_json::from_value::<RequestId>(id).ok())
                .is_some_and(|id| id == slot.id);
            if answered {
                if let Some((_, sender)) = self.inner.streams.remove(&slot.id) {
                    let chunk = StreamChunk::from_payload(value).map(|chunk| StreamChunk {
                        done: true,
                        ..chunk
                    });
                    let _ = sender.send(chunk);
                }
            }
        }

        let state = ChunkState {
            rx,
            _slot: slot,
            timeout: self.inner.settings.request_timeout(),
            finished: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            match tokio::time::timeout(state.timeout, state.rx.recv()).await {
                Ok(Some(Ok(chunk))) => {
                    state.finished = chunk.done;
                    Some((Ok(chunk), state))
                }
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    Some((Err(e), state))
                }
                Ok(None) => None,
                Err(_) => {
                    state.finished = true;
                    let ms = state.timeout.as_millis() as u64;
                    Some((Err(McpError::Timeout(ms)), state))
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn health(&self) -> AdapterHealth {
        let terminal = self.inner.terminal.lock().clone();
        if let Some(reason) = terminal {
            return AdapterHealth::unhealthy(reason);
        }
        let connected = self.inner.connected.load(Ordering::SeqCst);
        if let Some(health) = self
            .inner
            .activity
            .assess(connected, self.inner.health_check_interval)
        {
            return health;
        }

        let reading = self
            .inner
            .reader
            .lock()
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false);
        if reading {
            self.inner.activity.touch();
            AdapterHealth::healthy()
        } else {
            AdapterHealth::unhealthy("event stream reader stopped")
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        self.inner.pending.fail_all(|| McpError::Cancelled);
        self.inner.fail_streams(|| McpError::Cancelled);

        let reader = self.inner.reader.lock().take();
        if let Some((cancel, handle)) = reader {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("SSE reader for '{}' ended abnormally: {}", self.inner.backend_id, e);
            }
        }

        self.inner.pending.fail_all(|| McpError::Cancelled);
        self.inner.fail_streams(|| McpError::Cancelled);
        *self.inner.session_id.write() = None;
        if was_connected {
            info!("Closed SSE connection to '{}'", self.inner.backend_id);
            self.inner.emit(AdapterEvent::Disconnected);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }

    fn stats(&self) -> AdapterStats {
        self.inner.activity.stats()
    }
}
