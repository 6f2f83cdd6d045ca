//! Per-protocol backend adapters and the builders the factory dispatches to

pub mod http;
pub mod pending;
pub mod sse;
pub mod stdio;
pub mod traits;

pub use http::HttpAdapter;
pub use sse::{SseAdapter, SseDecoder, SseEvent};
pub use stdio::StdioAdapter;
pub use traits::{
    Adapter, AdapterBuilder, AdapterEvent, AdapterHealth, AdapterStats, BuildContext, ChunkStream,
    HealthStatus, StreamChunk,
};

use crate::core::backend::{BackendConfig, Protocol};
use crate::utils::errors::{McpError, McpResult};
use std::collections::HashMap;
use std::sync::Arc;

fn mismatch(expected: Protocol, config: &BackendConfig) -> McpError {
    McpError::Configuration(format!(
        "{} builder cannot build a {} backend",
        expected,
        config.protocol()
    ))
}

pub struct StdioBuilder;

impl AdapterBuilder for StdioBuilder {
    fn build(&self, config: &BackendConfig, ctx: &BuildContext) -> McpResult<Arc<dyn Adapter>> {
        match config {
            BackendConfig::Stdio(cfg) => Ok(Arc::new(StdioAdapter::new(
                ctx.backend_id.clone(),
                cfg.clone(),
                ctx.settings.stdio.clone(),
                ctx.health_check_interval,
            ))),
            other => Err(mismatch(Protocol::Stdio, other)),
        }
    }
}

pub struct SseBuilder;

impl AdapterBuilder for SseBuilder {
    fn build(&self, config: &BackendConfig, ctx: &BuildContext) -> McpResult<Arc<dyn Adapter>> {
        match config {
            BackendConfig::Sse(cfg) => Ok(Arc::new(SseAdapter::new(
                ctx.backend_id.clone(),
                cfg.clone(),
                ctx.settings.sse.clone(),
                ctx.health_check_interval,
            )?)),
            other => Err(mismatch(Protocol::Sse, other)),
        }
    }
}

pub struct HttpBuilder;

impl AdapterBuilder for HttpBuilder {
    fn build(&self, config: &BackendConfig, ctx: &BuildContext) -> McpResult<Arc<dyn Adapter>> {
        match config {
            BackendConfig::Http(cfg) => Ok(Arc::new(HttpAdapter::new(
                ctx.backend_id.clone(),
                cfg.clone(),
                ctx.settings.http.clone(),
                ctx.health_check_interval,
            )?)),
            other => Err(mismatch(Protocol::Http, other)),
        }
    }
}

/// Builder table with an entry for every built-in protocol
pub fn default_builders() -> HashMap<Protocol, Arc<dyn AdapterBuilder>> {
    let mut builders: HashMap<Protocol, Arc<dyn AdapterBuilder>> = HashMap::new();
    builders.insert(Protocol::Stdio, Arc::new(StdioBuilder));
    builders.insert(Protocol::Sse, Arc::new(SseBuilder));
    builders.insert(Protocol::Http, Arc::new(HttpBuilder));
    builders
}
