//! Correlation id generation for backend requests

use crate::core::protocol::RequestId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sequential request id generator, one per adapter.
///
/// Ids are numeric so that every backend sees plain JSON-RPC integers.
#[derive(Debug)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.counter.fetch_add(1, Ordering::SeqCst) as i64)
    }

    /// Current counter value (for debugging)
    pub fn current_value(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe shared request ID generator
#[derive(Debug, Clone, Default)]
pub struct SharedRequestIdGenerator {
    inner: Arc<RequestIdGenerator>,
}

impl SharedRequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        self.inner.next_id()
    }

    pub fn current_value(&self) -> u64 {
        self.inner.current_value()
    }
}
