use crate::core::load_balancer::LoadBalancerConfig;
use crate::core::models::{Endpoint, Group, RegisteredServer};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub factory: FactoryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub adapters: AdapterSettings,
    #[serde(default)]
    #[validate(nested)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub servers: Vec<RegisteredServer>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level or `EnvFilter` directive, e.g. `info` or `mcphub=debug`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Adapter lifecycle factory settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct FactoryConfig {
    #[validate(range(min = 1))]
    pub max_concurrent_adapters: usize,
    #[validate(range(min = 10))]
    pub health_check_interval_ms: u64,
    pub enable_auto_restart: bool,
    pub restart_delay_ms: u64,
    pub max_auto_restarts: u32,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_adapters: 100,
            health_check_interval_ms: 30_000,
            enable_auto_restart: true,
            restart_delay_ms: 5_000,
            max_auto_restarts: 3,
        }
    }
}

impl FactoryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Per-protocol adapter defaults
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
#[serde(default)]
pub struct AdapterSettings {
    #[validate(nested)]
    pub stdio: StdioSettings,
    #[validate(nested)]
    pub sse: SseSettings,
    #[validate(nested)]
    pub http: HttpSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct StdioSettings {
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    /// Time between the terminate signal and a forced kill
    pub kill_grace_ms: u64,
    /// Run the MCP `initialize` handshake after spawning
    pub handshake: bool,
}

impl Default for StdioSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_restarts: 3,
            restart_delay_ms: 1_000,
            kill_grace_ms: 5_000,
            handshake: true,
        }
    }
}

impl StdioSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct SseSettings {
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
    pub handshake: bool,
}

impl Default for SseSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_reconnects: 5,
            reconnect_delay_ms: 1_000,
            handshake: true,
        }
    }
}

impl SseSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct HttpSettings {
    #[validate(range(min = 1))]
    pub timeout_ms: u64,
    /// Total attempts per request, including the first
    #[validate(range(min = 1))]
    pub retry_attempts: u32,
    /// Base delay, doubled after every failed attempt
    pub retry_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_concurrent_requests: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            max_concurrent_requests: 10,
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.factory.max_concurrent_adapters, 100);
        assert_eq!(config.factory.max_auto_restarts, 3);
        assert!(config.factory.enable_auto_restart);
        assert!(!config.load_balancer.enabled);
        assert_eq!(config.adapters.http.max_concurrent_requests, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let http = HttpSettings {
            retry_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(http.retry_delay(1), Duration::from_millis(100));
        assert_eq!(http.retry_delay(2), Duration::from_millis(200));
        assert_eq!(http.retry_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_range_validation() {
        let mut config = GatewayConfig::default();
        config.adapters.http.max_concurrent_requests = 0;
        assert!(config.validate().is_err());
    }
}
