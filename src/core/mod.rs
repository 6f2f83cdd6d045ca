pub mod backend;
pub mod circuit_breaker;
pub mod factory;
pub mod load_balancer;
pub mod models;
pub mod namespace;
pub mod protocol;
pub mod request_id;
pub mod routing;
pub mod store;

pub use backend::{BackendConfig, HttpConfig, Protocol, SseConfig, StdioConfig};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use factory::{AdapterFactory, AdapterInstance, AdapterStatistics, AdapterStatus, ShutdownReport};
pub use load_balancer::{LoadBalancer, LoadBalancerConfig, LoadBalancingStrategy};
pub use models::{Endpoint, Group, RegisteredServer, RoutingRule, RuleCondition, ServerHealth, ServerStatus, ToolDescriptor};
pub use request_id::{RequestIdGenerator, SharedRequestIdGenerator};
pub use routing::Router;
pub use store::{InMemoryStore, RegistryStore};
