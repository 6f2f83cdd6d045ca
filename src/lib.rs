//! mcphub: multi-protocol MCP gateway core
//!
//! Adapters normalize stdio, SSE and HTTP backends behind one contract, the
//! factory supervises their lifecycle, and the router picks a backend for
//! each tool call.

pub mod adapter;
pub mod config;
pub mod core;
pub mod utils;

pub use config::GatewayConfig;
