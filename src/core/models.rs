//! Records owned by the persistence collaborator and read by the router

use crate::core::backend::BackendConfig;
use crate::utils::errors::McpResult;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Registration status of a backend server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Active => write!(f, "active"),
            ServerStatus::Inactive => write!(f, "inactive"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

/// A backend registered by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredServer {
    pub id: String,
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub status: ServerStatus,
}

impl RegisteredServer {
    pub fn is_active(&self) -> bool {
        self.status == ServerStatus::Active
    }

    /// Namespace with empty strings treated as absent
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().filter(|ns| !ns.is_empty())
    }

    /// Typed transport configuration
    pub fn backend_config(&self) -> McpResult<BackendConfig> {
        BackendConfig::from_parts(&self.protocol, &self.config)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default, alias = "tool_name")]
    pub tool_name: Option<String>,
}

impl RuleCondition {
    /// Exact tool-name equality. A condition without a tool name never matches.
    pub fn matches(&self, base_name: &str) -> bool {
        self.tool_name.as_deref() == Some(base_name)
    }
}

/// Priority-ordered override of the default backend choice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub id: String,
    #[serde(default)]
    pub condition: RuleCondition,
    #[serde(alias = "target_server_id", alias = "targetBackendId")]
    pub target_server_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "server_ids")]
    pub server_ids: Vec<String>,
    #[serde(default, alias = "routing_rules")]
    pub routing_rules: Vec<RoutingRule>,
}

/// Caller-facing handle: either all of a user's backends, or one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    #[serde(alias = "user_id")]
    pub user_id: String,
    #[serde(default, alias = "group_id")]
    pub group_id: Option<String>,
}

/// A tool as exposed to callers, namespaced by its backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    pub server_id: String,
}

/// Health of one backend as seen by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealth {
    pub server_id: String,
    pub status: ServerStatus,
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
