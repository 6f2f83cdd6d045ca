//! In-flight call correlation and activity bookkeeping shared by adapters

use crate::adapter::traits::{AdapterHealth, AdapterStats};
use crate::core::protocol::{JsonRpcResponse, RequestId};
use crate::utils::errors::{McpError, McpResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

type Completion = oneshot::Sender<McpResult<JsonRpcResponse>>;

/// Calls waiting for a correlated response, keyed by request id
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<RequestId, Completion>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: RequestId) -> oneshot::Receiver<McpResult<JsonRpcResponse>> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        rx
    }

    /// Complete the call matching the response id.
    ///
    /// Returns the response back when nothing is waiting for it.
    pub fn resolve(&self, response: JsonRpcResponse) -> Option<JsonRpcResponse> {
        let Some(id) = response.id.clone() else {
            return Some(response);
        };
        match self.calls.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(response));
                None
            }
            None => Some(response),
        }
    }

    pub fn remove(&self, id: &RequestId) {
        self.calls.remove(id);
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.calls.contains_key(id)
    }

    /// Fail every waiting call
    pub fn fail_all(&self, make_error: impl Fn() -> McpError) {
        let ids: Vec<RequestId> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.calls.remove(&id) {
                let _ = tx.send(Err(make_error()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

/// Request/error counters plus last-activity time
pub struct ActivityTracker {
    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new((Instant::now(), Utc::now())),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = (Instant::now(), Utc::now());
    }

    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().0.elapsed()
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            request_count: self.request_count.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
            last_activity: Some(self.last_activity.lock().1),
        }
    }

    /// Health from connection state and recency.
    ///
    /// Returns `None` when the adapter is connected but idle past twice the
    /// health-check interval, meaning the caller should run a liveness probe.
    pub fn assess(&self, connected: bool, health_check_interval: Duration) -> Option<AdapterHealth> {
        if !connected {
            return Some(AdapterHealth::unhealthy("not connected"));
        }
        if self.idle() < health_check_interval * 2 {
            return Some(AdapterHealth::healthy());
        }
        None
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
