//! Backend transport configuration
//!
//! A backend is described by a protocol discriminator plus exactly one
//! transport payload. The enum makes a protocol/payload mismatch
//! unrepresentable; `BackendConfig::from_parts` is the checked entry point
//! for loosely-typed records coming from the persistence layer.

use crate::utils::errors::{McpError, McpResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Backend protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Local subprocess speaking NDJSON over stdin/stdout
    Stdio,
    /// Server-Sent Events stream plus a companion request endpoint
    Sse,
    /// Plain HTTP request/response
    Http,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Stdio, Protocol::Sse, Protocol::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Stdio => "stdio",
            Protocol::Sse => "sse",
            Protocol::Http => "http",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" => Ok(Protocol::Stdio),
            "sse" => Ok(Protocol::Sse),
            "http" | "https" => Ok(Protocol::Http),
            _ => Err(McpError::Unsupported(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SseConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Companion endpoint for outbound calls; derived from `url` when absent
    #[serde(default, alias = "message_url")]
    pub message_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(alias = "base_url")]
    pub base_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Transport configuration for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum BackendConfig {
    Stdio(StdioConfig),
    Sse(SseConfig),
    Http(HttpConfig),
}

impl BackendConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            BackendConfig::Stdio(_) => Protocol::Stdio,
            BackendConfig::Sse(_) => Protocol::Sse,
            BackendConfig::Http(_) => Protocol::Http,
        }
    }

    /// Build from a protocol name and its JSON payload.
    pub fn from_parts(protocol: &str, payload: &Value) -> McpResult<Self> {
        let protocol: Protocol = protocol.parse()?;
        if !payload.is_object() {
            return Err(McpError::Configuration(format!(
                "{} backend requires a config object",
                protocol
            )));
        }

        let config = match protocol {
            Protocol::Stdio => BackendConfig::Stdio(decode_payload(protocol, payload)?),
            Protocol::Sse => BackendConfig::Sse(decode_payload(protocol, payload)?),
            Protocol::Http => BackendConfig::Http(decode_payload(protocol, payload)?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the payload is usable for its protocol.
    pub fn validate(&self) -> McpResult<()> {
        match self {
            BackendConfig::Stdio(cfg) => {
                if cfg.command.trim().is_empty() {
                    return Err(McpError::Configuration(
                        "stdio backend requires a command".to_string(),
                    ));
                }
            }
            BackendConfig::Sse(cfg) => {
                check_url("url", &cfg.url)?;
                if let Some(message_url) = &cfg.message_url {
                    check_url("messageUrl", message_url)?;
                }
            }
            BackendConfig::Http(cfg) => check_url("baseUrl", &cfg.base_url)?,
        }
        Ok(())
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(protocol: Protocol, payload: &Value) -> McpResult<T> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        McpError::Configuration(format!("invalid {} backend config: {}", protocol, e))
    })
}

fn check_url(field: &str, value: &str) -> McpResult<()> {
    let url = url::Url::parse(value)
        .map_err(|e| McpError::Configuration(format!("invalid {} '{}': {}", field, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(McpError::Configuration(format!(
            "{} must be http(s), got '{}'",
            field, other
        ))),
    }
}
