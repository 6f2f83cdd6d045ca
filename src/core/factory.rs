//! Adapter lifecycle factory
//!
//! Owns every adapter instance: creation through the protocol builder table,
//! status tracking driven by adapter events and periodic health checks,
//! bounded auto-restart, and concurrent best-effort shutdown.

use crate::adapter::{
    default_builders, Adapter, AdapterBuilder, AdapterEvent, AdapterHealth, BuildContext,
    ChunkStream,
};
use crate::config::{AdapterSettings, FactoryConfig};
use crate::core::backend::{BackendConfig, Protocol};
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::utils::errors::{McpError, McpResult};
use crate::utils::shutdown::ShutdownCoordinator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of one adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterStatus {
    Initializing,
    Connected,
    Error,
    Reconnecting,
    Disconnected,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterStatus::Initializing => "initializing",
            AdapterStatus::Connected => "connected",
            AdapterStatus::Error => "error",
            AdapterStatus::Reconnecting => "reconnecting",
            AdapterStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMetadata {
    pub request_count: u64,
    pub error_count: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

/// Snapshot of one managed adapter
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInstance {
    pub id: String,
    pub backend_id: String,
    pub protocol: Protocol,
    pub status: AdapterStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub metadata: InstanceMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatistics {
    pub total: usize,
    pub by_protocol: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_uptime_secs: f64,
}

/// Outcome of a factory shutdown
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: usize,
    /// Instance id and error for every adapter that failed to stop cleanly
    pub failures: Vec<(String, McpError)>,
}

struct ManagedAdapter {
    adapter: Arc<dyn Adapter>,
    config: BackendConfig,
    info: RwLock<AdapterInstance>,
    started: Instant,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    pending_restart: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedAdapter {
    fn snapshot(&self) -> AdapterInstance {
        self.info.read().clone()
    }

    fn set_status(&self, status: AdapterStatus) {
        let mut info = self.info.write();
        if info.status != status {
            debug!("Adapter {} ({}): {} -> {}", info.id, info.backend_id, info.status, status);
            info.status = status;
        }
    }

    fn record_error(&self, reason: impl Into<String>) {
        self.info.write().metadata.last_error = Some(reason.into());
    }

    fn abort_tasks(&self) {
        if let Some(handle) = self.event_pump.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.pending_restart.lock().take() {
            handle.abort();
        }
    }
}

struct FactoryInner {
    config: FactoryConfig,
    settings: AdapterSettings,
    builders: RwLock<HashMap<Protocol, Arc<dyn AdapterBuilder>>>,
    instances: tokio::sync::RwLock<HashMap<String, Arc<ManagedAdapter>>>,
    by_backend: DashMap<String, String>,
    /// Serializes adapter creation per backend
    ensure_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shutdown: ShutdownCoordinator,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Creates, tracks and tears down adapters
#[derive(Clone)]
pub struct AdapterFactory {
    inner: Arc<FactoryInner>,
}

impl AdapterFactory {
    pub fn new(config: FactoryConfig, settings: AdapterSettings) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                config,
                settings,
                builders: RwLock::new(default_builders()),
                instances: tokio::sync::RwLock::new(HashMap::new()),
                by_backend: DashMap::new(),
                ensure_locks: DashMap::new(),
                shutdown: ShutdownCoordinator::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    /// Replace the builder used for a protocol
    pub fn register_builder(&self, protocol: Protocol, builder: Arc<dyn AdapterBuilder>) {
        self.inner.builders.write().insert(protocol, builder);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutdown()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }

    /// Build and connect an adapter for a backend; returns the instance id.
    ///
    /// Nothing is registered when the connect fails.
    pub async fn create_adapter(&self, backend_id: &str, config: BackendConfig) -> McpResult<String> {
        if self.is_shutting_down() {
            return Err(McpError::ShuttingDown);
        }
        config.validate()?;
        self.check_capacity().await?;

        let protocol = config.protocol();
        let builder = self
            .inner
            .builders
            .read()
            .get(&protocol)
            .cloned()
            .ok_or_else(|| McpError::Unsupported(protocol.to_string()))?;

        let ctx = BuildContext {
            backend_id: backend_id.to_string(),
            settings: self.inner.settings.clone(),
            health_check_interval: self.inner.config.health_check_interval(),
        };
        let adapter = builder.build(&config, &ctx)?;
        let events = adapter.subscribe();

        info!("Creating {} adapter for backend '{}'", protocol, backend_id);
        if let Err(e) = adapter.connect().await {
            error!("Failed to connect backend '{}': {}", backend_id, e);
            let _ = adapter.disconnect().await;
            return Err(e);
        }

        let id = Uuid::new_v4().to_string();
        let managed = Arc::new(ManagedAdapter {
            adapter: adapter.clone(),
            config,
            info: RwLock::new(AdapterInstance {
                id: id.clone(),
                backend_id: backend_id.to_string(),
                protocol,
                status: AdapterStatus::Connected,
                created_at: Utc::now(),
                last_used_at: None,
                metadata: InstanceMetadata::default(),
            }),
            started: Instant::now(),
            event_pump: Mutex::new(None),
            pending_restart: Mutex::new(None),
        });

        {
            let mut instances = self.inner.instances.write().await;
            let rejection = if self.is_shutting_down() {
                Some(McpError::ShuttingDown)
            } else if instances.len() >= self.inner.config.max_concurrent_adapters {
                Some(self.capacity_error())
            } else {
                None
            };
            if let Some(e) = rejection {
                drop(instances);
                let _ = adapter.disconnect().await;
                return Err(e);
            }
            instances.insert(id.clone(), managed.clone());
        }
        self.inner.by_backend.insert(backend_id.to_string(), id.clone());
        *managed.event_pump.lock() = Some(self.spawn_event_pump(id.clone(), events));

        info!("Adapter {} ready for backend '{}'", id, backend_id);
        Ok(id)
    }

    /// Instance id serving a backend, creating the adapter when there is none
    /// or when its transport configuration changed.
    pub async fn ensure_adapter(&self, backend_id: &str, config: BackendConfig) -> McpResult<String> {
        if let Some(id) = self.current_adapter(backend_id, &config).await {
            return Ok(id);
        }

        let lock = self
            .inner
            .ensure_locks
            .entry(backend_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(id) = self.adapter_for_backend(backend_id) {
            let existing = self.inner.instances.read().await.get(&id).cloned();
            match existing {
                Some(managed) if managed.config == config => return Ok(id),
                Some(_) => {
                    info!("Configuration of backend '{}' changed, replacing adapter", backend_id);
                    self.remove_adapter(&id).await?;
                }
                None => {
                    self.inner.by_backend.remove(backend_id);
                }
            }
        }
        self.create_adapter(backend_id, config).await
    }

    /// Instance already serving `backend_id` with exactly `config`
    async fn current_adapter(&self, backend_id: &str, config: &BackendConfig) -> Option<String> {
        let id = self.adapter_for_backend(backend_id)?;
        let instances = self.inner.instances.read().await;
        instances
            .get(&id)
            .filter(|managed| managed.config == *config)
            .map(|_| id)
    }

    /// Disconnect and forget an instance
    pub async fn remove_adapter(&self, id: &str) -> McpResult<()> {
        let managed = self
            .inner
            .instances
            .write()
            .await
            .remove(id)
            .ok_or_else(|| McpError::NotFound(format!("adapter {}", id)))?;

        let backend_id = managed.info.read().backend_id.clone();
        self.inner.by_backend.remove_if(&backend_id, |_, v| v.as_str() == id);
        managed.abort_tasks();
        managed.set_status(AdapterStatus::Disconnected);
        info!("Removing adapter {} for backend '{}'", id, backend_id);
        managed.adapter.disconnect().await
    }

    /// Disconnect and reconnect an instance
    pub async fn restart_adapter(&self, id: &str) -> McpResult<()> {
        let managed = self.managed(id).await?;
        restart_managed(&managed).await
    }

    pub async fn adapter_health(&self, id: &str) -> McpResult<AdapterHealth> {
        let managed = self.managed(id).await?;
        let health = managed.adapter.health().await;
        if let Some(error) = &health.error {
            managed.record_error(error.clone());
        }
        Ok(health)
    }

    pub fn adapter_for_backend(&self, backend_id: &str) -> Option<String> {
        self.inner.by_backend.get(backend_id).map(|id| id.clone())
    }

    pub async fn instance(&self, id: &str) -> Option<AdapterInstance> {
        self.inner
            .instances
            .read()
            .await
            .get(id)
            .map(|m| m.snapshot())
    }

    /// All instances, oldest first
    pub async fn instances(&self) -> Vec<AdapterInstance> {
        let mut all: Vec<AdapterInstance> = self
            .inner
            .instances
            .read()
            .await
            .values()
            .map(|m| m.snapshot())
            .collect();
        all.sort_by_key(|i| i.created_at);
        all
    }

    pub async fn send_request(&self, id: &str, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let managed = self.managed(id).await?;
        mark_used(&managed);

        let result = managed.adapter.send_request(request).await;
        let failure = match &result {
            Ok(response) => response.error.as_ref().map(|e| e.message.clone()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            let mut info = managed.info.write();
            info.metadata.error_count += 1;
            info.metadata.last_error = Some(reason);
        }
        result
    }

    pub async fn stream_request(&self, id: &str, request: JsonRpcRequest) -> McpResult<ChunkStream> {
        let managed = self.managed(id).await?;
        mark_used(&managed);

        let result = managed.adapter.stream_request(request).await;
        if let Err(e) = &result {
            let mut info = managed.info.write();
            info.metadata.error_count += 1;
            info.metadata.last_error = Some(e.to_string());
        }
        result
    }

    pub async fn statistics(&self) -> AdapterStatistics {
        let instances = self.inner.instances.read().await;
        let mut stats = AdapterStatistics {
            total: instances.len(),
            ..Default::default()
        };

        let mut uptime_total = 0.0;
        for managed in instances.values() {
            let info = managed.info.read();
            *stats.by_protocol.entry(info.protocol.to_string()).or_default() += 1;
            *stats.by_status.entry(info.status.to_string()).or_default() += 1;
            stats.total_requests += info.metadata.request_count;
            stats.total_errors += info.metadata.error_count;
            uptime_total += managed.started.elapsed().as_secs_f64();
        }
        if !instances.is_empty() {
            stats.average_uptime_secs = uptime_total / instances.len() as f64;
        }
        stats
    }

    /// Start polling every instance's health. Calling it again is a no-op.
    pub fn start_health_monitor(&self) {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let factory = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => break,
                }
                let Some(inner) = factory.upgrade() else { break };
                check_all(&inner).await;
            }
            debug!("Health monitor stopped");
        });

        info!("Health monitor started (every {:?})", period);
        *monitor = Some((cancel, handle));
    }

    /// Stop every adapter concurrently and clear the registry.
    ///
    /// Individual stop failures are collected, not propagated.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down adapter factory");
        // Reject new adapters before draining.
        self.inner.shutdown.shutdown();

        let monitor = self.inner.monitor.lock().take();
        if let Some((cancel, handle)) = monitor {
            cancel.cancel();
            let _ = handle.await;
        }

        let drained: Vec<(String, Arc<ManagedAdapter>)> =
            self.inner.instances.write().await.drain().collect();
        self.inner.by_backend.clear();

        let stops = drained.into_iter().map(|(id, managed)| async move {
            managed.abort_tasks();
            managed.set_status(AdapterStatus::Disconnected);
            managed.adapter.disconnect().await.map_err(|e| (id, e))
        });

        let mut report = ShutdownReport::default();
        for result in futures::future::join_all(stops).await {
            match result {
                Ok(()) => report.stopped += 1,
                Err((id, e)) => {
                    warn!("Adapter {} did not stop cleanly: {}", id, e);
                    report.failures.push((id, e));
                }
            }
        }

        info!(
            "Adapter factory stopped ({} adapters, {} failures)",
            report.stopped,
            report.failures.len()
        );
        report
    }

    async fn managed(&self, id: &str) -> McpResult<Arc<ManagedAdapter>> {
        self.inner
            .instances
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::NotFound(format!("adapter {}", id)))
    }

    fn capacity_error(&self) -> McpError {
        McpError::CapacityExceeded(format!(
            "factory already manages {} adapters",
            self.inner.config.max_concurrent_adapters
        ))
    }

    async fn check_capacity(&self) -> McpResult<()> {
        if self.inner.instances.read().await.len() >= self.inner.config.max_concurrent_adapters {
            return Err(self.capacity_error());
        }
        Ok(())
    }

    fn spawn_event_pump(&self, id: String, mut events: broadcast::Receiver<AdapterEvent>) -> JoinHandle<()> {
        let factory = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Adapter {} dropped {} events", id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = factory.upgrade() else { break };
                let managed = inner.instances.read().await.get(&id).cloned();
                let Some(managed) = managed else { break };
                handle_event(&inner, &managed, event);
            }
        })
    }
}

fn mark_used(managed: &ManagedAdapter) {
    let mut info = managed.info.write();
    info.last_used_at = Some(Utc::now());
    info.metadata.request_count += 1;
}

fn handle_event(inner: &Arc<FactoryInner>, managed: &Arc<ManagedAdapter>, event: AdapterEvent) {
    match event {
        AdapterEvent::Connected => managed.set_status(AdapterStatus::Connected),
        AdapterEvent::Errored(reason) => {
            managed.record_error(reason);
            managed.set_status(AdapterStatus::Error);
        }
        AdapterEvent::Reconnecting { attempt } => {
            debug!("Adapter {} reconnecting (attempt {})", managed.info.read().id, attempt);
            managed.set_status(AdapterStatus::Reconnecting);
        }
        AdapterEvent::Disconnected => managed.set_status(AdapterStatus::Disconnected),
        AdapterEvent::Failed(reason) => {
            error!("Adapter {} failed: {}", managed.info.read().id, reason);
            managed.record_error(reason);
            managed.set_status(AdapterStatus::Error);
            schedule_restart(inner, managed);
        }
        AdapterEvent::Notification(value) => {
            debug!("Notification from '{}': {}", managed.info.read().backend_id, value);
        }
    }
}

/// Queue one delayed restart if the auto-restart budget allows it.
fn schedule_restart(inner: &Arc<FactoryInner>, managed: &Arc<ManagedAdapter>) {
    if !inner.config.enable_auto_restart || inner.shutdown.is_shutdown() {
        return;
    }
    let (id, restarts) = {
        let info = managed.info.read();
        (info.id.clone(), info.metadata.restart_count)
    };
    if restarts >= inner.config.max_auto_restarts {
        warn!("Adapter {} used all {} auto-restarts", id, inner.config.max_auto_restarts);
        return;
    }

    let mut pending = managed.pending_restart.lock();
    if pending.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
        return;
    }

    let delay = inner.config.restart_delay();
    let factory = Arc::downgrade(inner);
    let target = Arc::downgrade(managed);
    info!("Restarting adapter {} in {:?}", id, delay);

    *pending = Some(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let (Some(inner), Some(managed)) = (factory.upgrade(), target.upgrade()) else {
            return;
        };
        if inner.shutdown.is_shutdown() {
            return;
        }
        if restart_managed(&managed).await.is_err() {
            // Clear our own handle so the next attempt can be queued.
            managed.pending_restart.lock().take();
            schedule_restart(&inner, &managed);
        }
    }));
}

async fn restart_managed(managed: &ManagedAdapter) -> McpResult<()> {
    let id = {
        let mut info = managed.info.write();
        info.metadata.restart_count += 1;
        info.status = AdapterStatus::Reconnecting;
        info.id.clone()
    };
    info!("Restarting adapter {}", id);

    if let Err(e) = managed.adapter.disconnect().await {
        warn!("Disconnect before restart of {} failed: {}", id, e);
    }
    match managed.adapter.connect().await {
        Ok(()) => {
            managed.set_status(AdapterStatus::Connected);
            Ok(())
        }
        Err(e) => {
            error!("Restart of adapter {} failed: {}", id, e);
            managed.record_error(e.to_string());
            managed.set_status(AdapterStatus::Error);
            Err(e)
        }
    }
}

async fn check_all(inner: &Arc<FactoryInner>) {
    let instances: Vec<Arc<ManagedAdapter>> = inner.instances.read().await.values().cloned().collect();

    for managed in instances {
        let health = managed.adapter.health().await;
        if health.is_healthy() {
            continue;
        }
        let (id, status) = {
            let info = managed.info.read();
            (info.id.clone(), info.status)
        };
        let reason = health.error.unwrap_or_else(|| "unhealthy".to_string());
        warn!("Adapter {} is unhealthy: {}", id, reason);
        managed.record_error(reason);

        if status == AdapterStatus::Connected {
            managed.set_status(AdapterStatus::Error);
            schedule_restart(inner, &managed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::traits::MockAdapter;
    use crate::adapter::{AdapterStats, HealthStatus};
    use crate::core::backend::HttpConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockBuilder {
        events: broadcast::Sender<AdapterEvent>,
        connects: Arc<AtomicUsize>,
        fail_connect: bool,
        healthy: bool,
    }

    impl MockBuilder {
        fn new() -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                events,
                connects: Arc::new(AtomicUsize::new(0)),
                fail_connect: false,
                healthy: true,
            }
        }
    }

    impl AdapterBuilder for MockBuilder {
        fn build(&self, _config: &BackendConfig, _ctx: &BuildContext) -> McpResult<Arc<dyn Adapter>> {
            let mut mock = MockAdapter::new();
            let fail = self.fail_connect;
            let connects = self.connects.clone();
            mock.expect_connect().returning(move || {
                connects.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(McpError::Connection("refused".to_string()))
                } else {
                    Ok(())
                }
            });
            mock.expect_disconnect().returning(|| Ok(()));
            let events = self.events.clone();
            mock.expect_subscribe().returning(move || events.subscribe());
            let healthy = self.healthy;
            mock.expect_health().returning(move || {
                if healthy {
                    AdapterHealth::healthy()
                } else {
                    AdapterHealth::unhealthy("probe failed")
                }
            });
            mock.expect_protocol().returning(|| Protocol::Http);
            mock.expect_stats().returning(AdapterStats::default);
            mock.expect_send_request()
                .returning(|req| Ok(JsonRpcResponse::success(req.id.unwrap_or(crate::core::protocol::RequestId::Number(0)), serde_json::json!({}))));
            Ok(Arc::new(mock))
        }
    }

    fn http_config() -> BackendConfig {
        BackendConfig::Http(HttpConfig {
            base_url: "http://localhost:1".to_string(),
            headers: HashMap::new(),
        })
    }

    fn factory(config: FactoryConfig, builder: MockBuilder) -> AdapterFactory {
        let factory = AdapterFactory::new(config, AdapterSettings::default());
        factory.register_builder(Protocol::Http, Arc::new(builder));
        factory
    }

    fn quick_config() -> FactoryConfig {
        FactoryConfig {
            health_check_interval_ms: 20,
            restart_delay_ms: 10,
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_create_registers_connected_instance() {
        let factory = factory(quick_config(), MockBuilder::new());
        let id = factory.create_adapter("b1", http_config()).await.unwrap();

        let instance = factory.instance(&id).await.unwrap();
        assert_eq!(instance.status, AdapterStatus::Connected);
        assert_eq!(instance.backend_id, "b1");
        assert_eq!(factory.adapter_for_backend("b1"), Some(id));
    }

    #[tokio::test]
    async fn test_connect_failure_registers_nothing() {
        let mut builder = MockBuilder::new();
        builder.fail_connect = true;
        let factory = factory(quick_config(), builder);

        let err = factory.create_adapter("b1", http_config()).await.unwrap_err();
        assert!(matches!(err, McpError::Connection(_)));
        assert!(factory.instances().await.is_empty());
        assert!(factory.adapter_for_backend("b1").is_none());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let config = FactoryConfig {
            max_concurrent_adapters: 1,
            ..quick_config()
        };
        let factory = factory(config, MockBuilder::new());
        factory.create_adapter("b1", http_config()).await.unwrap();
        let err = factory.create_adapter("b2", http_config()).await.unwrap_err();
        assert!(matches!(err, McpError::CapacityExceeded(_)));
    }

    #[tokio::test]
    async fn test_ensure_reuses_instance() {
        let factory = factory(quick_config(), MockBuilder::new());
        let first = factory.ensure_adapter("b1", http_config()).await.unwrap();
        let second = factory.ensure_adapter("b1", http_config()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(factory.instances().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_updates_metadata() {
        let factory = factory(quick_config(), MockBuilder::new());
        let id = factory.create_adapter("b1", http_config()).await.unwrap();
        factory
            .send_request(&id, JsonRpcRequest::new("tools/list", None))
            .await
            .unwrap();

        let instance = factory.instance(&id).await.unwrap();
        assert_eq!(instance.metadata.request_count, 1);
        assert!(instance.last_used_at.is_some());

        let stats = factory.statistics().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.by_protocol.get("http"), Some(&1));
        assert_eq!(stats.by_status.get("connected"), Some(&1));
    }

    #[tokio::test]
    async fn test_failed_event_triggers_auto_restart() {
        let builder = MockBuilder::new();
        let events = builder.events.clone();
        let connects = builder.connects.clone();
        let factory = factory(quick_config(), builder);
        let id = factory.create_adapter("b1", http_config()).await.unwrap();

        events.send(AdapterEvent::Failed("crashed".to_string())).unwrap();

        wait_for(|| connects.load(Ordering::SeqCst) == 2).await;
        let f = factory.clone();
        let id2 = id.clone();
        tokio::time::timeout(Duration::from_secs(5), async move {
            loop {
                let instance = f.instance(&id2).await.unwrap();
                if instance.status == AdapterStatus::Connected && instance.metadata.restart_count == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let instance = factory.instance(&id).await.unwrap();
        assert_eq!(instance.metadata.last_error.as_deref(), Some("crashed"));
    }

    #[tokio::test]
    async fn test_auto_restart_disabled() {
        let builder = MockBuilder::new();
        let events = builder.events.clone();
        let connects = builder.connects.clone();
        let config = FactoryConfig {
            enable_auto_restart: false,
            ..quick_config()
        };
        let factory = factory(config, builder);
        let id = factory.create_adapter("b1", http_config()).await.unwrap();

        events.send(AdapterEvent::Failed("crashed".to_string())).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(factory.instance(&id).await.unwrap().status, AdapterStatus::Error);
    }

    #[tokio::test]
    async fn test_health_monitor_restarts_unhealthy() {
        let mut builder = MockBuilder::new();
        builder.healthy = false;
        let connects = builder.connects.clone();
        let factory = factory(quick_config(), builder);
        let id = factory.create_adapter("b1", http_config()).await.unwrap();

        let health = factory.adapter_health(&id).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);

        factory.start_health_monitor();
        wait_for(|| connects.load(Ordering::SeqCst) >= 2).await;
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_and_rejects() {
        let factory = factory(quick_config(), MockBuilder::new());
        let mut signal = factory.subscribe_shutdown();
        factory.create_adapter("b1", http_config()).await.unwrap();
        factory.create_adapter("b2", http_config()).await.unwrap();

        let report = factory.shutdown().await;
        assert_eq!(report.stopped, 2);
        assert!(report.failures.is_empty());
        assert!(factory.instances().await.is_empty());
        assert!(signal.recv().await.is_ok());

        let err = factory.create_adapter("b3", http_config()).await.unwrap_err();
        assert!(matches!(err, McpError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_remove_unknown_adapter() {
        let factory = factory(quick_config(), MockBuilder::new());
        assert!(matches!(
            factory.remove_adapter("nope").await,
            Err(McpError::NotFound(_))
        ));
    }
}
