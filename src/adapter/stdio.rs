//! Subprocess adapter: NDJSON over a child's stdin/stdout
//!
//! A supervisor task owns the child for its whole life. Non-zero exits are
//! restarted after `restart_delay` until `max_restarts` consecutive crashes
//! are used up, after which the adapter is terminally failed with
//! `MaxRestartsExceeded`. A restarted child that answers a call clears the
//! crash streak.

use crate::adapter::pending::{ActivityTracker, PendingCalls};
use crate::adapter::traits::{
    Adapter, AdapterEvent, AdapterHealth, AdapterStats, ChunkStream, StreamChunk,
};
use crate::config::StdioSettings;
use crate::core::backend::{Protocol, StdioConfig};
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::core::request_id::SharedRequestIdGenerator;
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct StdioAdapter {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    backend_id: String,
    config: StdioConfig,
    settings: StdioSettings,
    health_check_interval: Duration,
    pending: PendingCalls,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    connected: AtomicBool,
    terminal: Mutex<Option<String>>,
    restart_count: AtomicU32,
    crash_streak: AtomicU32,
    ids: SharedRequestIdGenerator,
    activity: ActivityTracker,
    events: broadcast::Sender<AdapterEvent>,
    supervisor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StdioAdapter {
    pub fn new(
        backend_id: impl Into<String>,
        config: StdioConfig,
        settings: StdioSettings,
        health_check_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(StdioInner {
                backend_id: backend_id.into(),
                config,
                settings,
                health_check_interval,
                pending: PendingCalls::new(),
                stdin: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                terminal: Mutex::new(None),
                restart_count: AtomicU32::new(0),
                crash_streak: AtomicU32::new(0),
                ids: SharedRequestIdGenerator::new(),
                activity: ActivityTracker::new(),
                events,
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Automatic restarts performed since the last `connect`
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }

    /// Restarts since the child last answered a call
    pub fn crash_streak(&self) -> u32 {
        self.inner.crash_streak.load(Ordering::SeqCst)
    }

    /// Number of calls waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }
}

impl StdioInner {
    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    fn max_restarts_error(&self) -> McpError {
        McpError::MaxRestartsExceeded {
            backend: self.backend_id.clone(),
            restarts: self.crash_streak.load(Ordering::SeqCst),
        }
    }

    /// Spawn the child and start its stdout/stderr readers.
    async fn spawn_child(self: &Arc<Self>) -> McpResult<Child> {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            command.current_dir(shellexpand::tilde(cwd).as_ref());
        }

        let mut child = command.spawn().map_err(|e| {
            McpError::Connection(format!(
                "failed to spawn '{}' for backend '{}': {}",
                self.config.command, self.backend_id, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Connection("failed to open stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Connection("failed to open stdout".to_string()))?;

        *self.stdin.lock().await = Some(stdin);
        self.start_reader(stdout);
        if let Some(stderr) = child.stderr.take() {
            self.start_stderr_logger(stderr);
        }

        info!(
            "Spawned backend '{}' (pid {:?}): {} {}",
            self.backend_id,
            child.id(),
            self.config.command,
            self.config.args.join(" ")
        );
        Ok(child)
    }

    fn start_reader(self: &Arc<Self>, stdout: ChildStdout) {
        let inner = self.clone();
        tokio::spawn(async move {
            // LinesCodec keeps partial lines buffered across reads.
            let mut lines = FramedRead::new(stdout, LinesCodec::new());

            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => inner.handle_line(&line),
                    Err(e) => {
                        warn!("Backend '{}' stdout read failed: {}", inner.backend_id, e);
                        break;
                    }
                }
            }

            debug!("Backend '{}' stdout closed", inner.backend_id);
            inner
                .pending
                .fail_all(|| McpError::Transport("backend stdout closed".to_string()));
        });
    }

    fn start_stderr_logger(self: &Arc<Self>, stderr: ChildStderr) {
        let backend_id = self.backend_id.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                debug!("[{}] stderr: {}", backend_id, line);
            }
        });
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.activity.touch();
        debug!("Received from '{}': {}", self.backend_id, line);

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "{}",
                    McpError::ProtocolParse(format!("backend '{}': {}", self.backend_id, e))
                );
                return;
            }
        };

        if value.get("id").is_some() && JsonRpcResponse::is_response_envelope(&value) {
            match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                Ok(response) => {
                    if self.pending.resolve(response).is_some() {
                        debug!("Backend '{}' answered an unknown id", self.backend_id);
                        self.emit(AdapterEvent::Notification(value));
                    }
                }
                Err(e) => warn!("Malformed response from '{}': {}", self.backend_id, e),
            }
        } else {
            self.emit(AdapterEvent::Notification(value));
        }
    }

    async fn write_line(&self, json: &str) -> McpResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("backend stdin closed".to_string()))?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn send_request(&self, mut request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        if self.terminal.lock().is_some() {
            return Err(self.max_restarts_error());
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::Transport(format!(
                "backend '{}' is not running",
                self.backend_id
            )));
        }

        let id = request.id.clone().unwrap_or_else(|| self.ids.next_id());
        request.id = Some(id.clone());
        let rx = self.pending.register(id.clone());

        let json = serde_json::to_string(&request)?;
        debug!("Sending to '{}': {}", self.backend_id, json);

        if let Err(e) = self.write_line(&json).await {
            self.pending.remove(&id);
            self.activity.record_error();
            return Err(e);
        }
        self.activity.record_request();

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

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let json = serde_json::to_string(&JsonRpcRequest::new(method, params))?;
        self.write_line(&json).await
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
        self.notify("notifications/initialized", None).await
    }

    /// Ask the child to stop, then kill it after the grace period.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(target_os = "linux")]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to backend '{}' failed: {}", self.backend_id, e);
            }
        }
        // Closing stdin is the portable stop request for NDJSON servers.
        *self.stdin.lock().await = None;

        match tokio::time::timeout(self.settings.kill_grace(), child.wait()).await {
            Ok(Ok(status)) => info!("Backend '{}' exited with: {}", self.backend_id, status),
            Ok(Err(e)) => error!("Failed to wait for backend '{}': {}", self.backend_id, e),
            Err(_) => {
                warn!(
                    "Backend '{}' ignored terminate, killing after {:?}",
                    self.backend_id,
                    self.settings.kill_grace()
                );
                if let Err(e) = child.kill().await {
                    error!("Failed to kill backend '{}': {}", self.backend_id, e);
                }
            }
        }
    }

    /// Watch the child, restarting it on non-zero exit.
    async fn supervise(self: Arc<Self>, mut child: Child, cancel: CancellationToken) {
        loop {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return;
                }
            };

            self.connected.store(false, Ordering::SeqCst);
            *self.stdin.lock().await = None;
            self.pending
                .fail_all(|| McpError::Transport("backend process exited".to_string()));

            let reason = match &status {
                Ok(status) if status.success() => {
                    info!("Backend '{}' exited cleanly", self.backend_id);
                    self.emit(AdapterEvent::Disconnected);
                    return;
                }
                Ok(status) => describe_exit(status),
                Err(e) => format!("wait failed: {}", e),
            };
            warn!("Backend '{}' {}", self.backend_id, reason);
            self.emit(AdapterEvent::Errored(reason));

            if self.crash_streak.load(Ordering::SeqCst) >= self.settings.max_restarts {
                let err = self.max_restarts_error();
                error!("{}", err);
                *self.terminal.lock() = Some(err.to_string());
                self.emit(AdapterEvent::Failed(err.to_string()));
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.restart_delay()) => {}
                _ = cancel.cancelled() => return,
            }

            let streak = self.crash_streak.fetch_add(1, Ordering::SeqCst) + 1;
            let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
            info!(
                "Restarting backend '{}' (restart {}, {}/{} in a row)",
                self.backend_id, attempt, streak, self.settings.max_restarts
            );
            self.emit(AdapterEvent::Reconnecting { attempt });

            match self.spawn_child().await {
                Ok(new_child) => {
                    child = new_child;
                    self.connected.store(true, Ordering::SeqCst);
                    if self.settings.handshake {
                        if let Err(e) = self.handshake().await {
                            warn!("Handshake with restarted '{}' failed: {}", self.backend_id, e);
                        }
                    }
                    self.emit(AdapterEvent::Connected);
                }
                Err(e) => {
                    error!("Restart of backend '{}' failed: {}", self.backend_id, e);
                    *self.terminal.lock() = Some(e.to_string());
                    self.emit(AdapterEvent::Failed(e.to_string()));
                    return;
                }
            }
        }
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

#[async_trait]
impl Adapter for StdioAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        // A previous supervisor may still hold a terminal failure.
        self.disconnect().await?;
        self.inner.restart_count.store(0, Ordering::SeqCst);
        self.inner.crash_streak.store(0, Ordering::SeqCst);
        *self.inner.terminal.lock() = None;

        let mut child = self.inner.spawn_child().await?;
        self.inner.connected.store(true, Ordering::SeqCst);

        if self.inner.settings.handshake {
            if let Err(e) = self.inner.handshake().await {
                self.inner.connected.store(false, Ordering::SeqCst);
                self.inner.terminate(&mut child).await;
                return Err(McpError::Connection(format!(
                    "initialize handshake with '{}' failed: {}",
                    self.inner.backend_id, e
                )));
            }
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().supervise(child, cancel.clone()));
        *self.inner.supervisor.lock() = Some((cancel, handle));

        self.inner.activity.touch();
        self.inner.emit(AdapterEvent::Connected);
        Ok(())
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let response = self.inner.send_request(request).await?;
        self.inner.crash_streak.store(0, Ordering::SeqCst);
        Ok(response)
    }

    async fn stream_request(&self, request: JsonRpcRequest) -> McpResult<ChunkStream> {
        // NDJSON backends answer once, so the stream is a single final chunk.
        let response = self.inner.send_request(request).await?;
        self.inner.crash_streak.store(0, Ordering::SeqCst);
        let data = response.into_result()?;
        let chunk = StreamChunk { data, done: true };
        Ok(futures::stream::once(futures::future::ready(Ok(chunk))).boxed())
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

        let running = self
            .inner
            .supervisor
            .lock()
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false);
        if running {
            self.inner.activity.touch();
            AdapterHealth::healthy()
        } else {
            AdapterHealth::unhealthy("process not running")
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        // Callers see Cancelled, not the transport errors the stopping child causes.
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        self.inner.pending.fail_all(|| McpError::Cancelled);

        let supervisor = self.inner.supervisor.lock().take();
        if let Some((cancel, handle)) = supervisor {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Supervisor for '{}' ended abnormally: {}", self.inner.backend_id, e);
            }
        }

        *self.inner.stdin.lock().await = None;
        self.inner.pending.fail_all(|| McpError::Cancelled);
        if was_connected {
            info!("Disconnected backend '{}'", self.inner.backend_id);
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
