//! Tool-call routing
//!
//! Resolves which backend serves a tool call: candidates come from an
//! endpoint (all of its user's servers, or one group) and are narrowed by the
//! tool's namespace. Enabled routing rules are tried by descending priority;
//! otherwise the load balancer picks when configured, else the first active
//! candidate wins.

use crate::adapter::{ChunkStream, HealthStatus};
use crate::core::factory::AdapterFactory;
use crate::core::load_balancer::{LoadBalancer, LoadBalancerConfig};
use crate::core::models::{
    Group, RegisteredServer, RoutingRule, ServerHealth, ServerStatus, ToolDescriptor,
};
use crate::core::namespace::{apply_namespace, parse_tool_name};
use crate::core::protocol::JsonRpcRequest;
use crate::core::store::RegistryStore;
use crate::utils::errors::{McpError, McpResult};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Candidate set for one endpoint or group
#[derive(Debug, Clone)]
struct Candidates {
    /// Key for per-group load balancer state
    key: String,
    servers: Vec<RegisteredServer>,
    rules: Vec<RoutingRule>,
}

/// Target of the first enabled rule, by descending priority, that matches
/// `base_name` and points at an active candidate.
pub fn match_rule<'a>(
    rules: &[RoutingRule],
    candidates: &'a [RegisteredServer],
    base_name: &str,
) -> Option<&'a RegisteredServer> {
    let mut ordered: Vec<&RoutingRule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    ordered
        .into_iter()
        .filter(|rule| rule.condition.matches(base_name))
        .find_map(|rule| {
            let target = candidates
                .iter()
                .find(|s| s.id == rule.target_server_id && s.is_active());
            if target.is_none() {
                debug!("Rule '{}' skipped: target '{}' unavailable", rule.id, rule.target_server_id);
            }
            target
        })
}

/// Candidates whose namespace equals the call's; no namespace keeps all.
pub fn filter_by_namespace(candidates: &[RegisteredServer], namespace: Option<&str>) -> Vec<RegisteredServer> {
    match namespace {
        Some(ns) => candidates
            .iter()
            .filter(|s| s.namespace() == Some(ns))
            .cloned()
            .collect(),
        None => candidates.to_vec(),
    }
}

pub struct Router {
    store: Arc<dyn RegistryStore>,
    factory: AdapterFactory,
    balancer: Option<Arc<LoadBalancer>>,
}

impl Router {
    pub fn new(store: Arc<dyn RegistryStore>, factory: AdapterFactory, balancer: &LoadBalancerConfig) -> Self {
        let balancer = balancer
            .enabled
            .then(|| Arc::new(LoadBalancer::new(balancer)));
        Self {
            store,
            factory,
            balancer,
        }
    }

    pub fn factory(&self) -> &AdapterFactory {
        &self.factory
    }

    pub fn balancer(&self) -> Option<&Arc<LoadBalancer>> {
        self.balancer.as_ref()
    }

    /// Route a tool call and return the backend's result.
    pub async fn route_tool_call(&self, endpoint_or_group: &str, tool_name: &str, params: Value) -> McpResult<Value> {
        let (server, base_name) = self.resolve_target(endpoint_or_group, tool_name).await?;
        info!("Routing '{}' to server '{}'", tool_name, server.id);

        let request = JsonRpcRequest::call_tool(base_name, params);
        let _guard = self.balancer.as_ref().map(|lb| lb.track(&server.id));

        let result = async {
            let instance = self.adapter_for(&server).await?;
            self.factory.send_request(&instance, request).await?.into_result()
        }
        .await;
        self.report(&server.id, &result);
        result
    }

    /// Route a tool call and return its chunk stream.
    pub async fn stream_tool_call(&self, endpoint_or_group: &str, tool_name: &str, params: Value) -> McpResult<ChunkStream> {
        let (server, base_name) = self.resolve_target(endpoint_or_group, tool_name).await?;
        info!("Streaming '{}' from server '{}'", tool_name, server.id);

        let request = JsonRpcRequest::call_tool(base_name, params);
        let guard = self.balancer.as_ref().map(|lb| lb.track(&server.id));

        let result = async {
            let instance = self.adapter_for(&server).await?;
            self.factory.stream_request(&instance, request).await
        }
        .await;
        if result.is_err() {
            self.report(&server.id, &result);
        }

        // The in-flight count lasts as long as the stream; the breaker hears
        // about the terminal chunk.
        let balancer = self.balancer.clone();
        let server_id = server.id;
        Ok(result?
            .map(move |chunk| {
                let _held = &guard;
                if chunk.as_ref().map(|c| c.done).unwrap_or(true) {
                    report_outcome(balancer.as_deref(), &server_id, &chunk);
                }
                chunk
            })
            .boxed())
    }

    /// Namespaced tools of every active candidate.
    ///
    /// Backends that fail to list are logged and skipped. A name appears at
    /// most once per backend.
    pub async fn get_available_tools(&self, endpoint_id: &str) -> McpResult<Vec<ToolDescriptor>> {
        let candidates = self.candidates(endpoint_id).await?;
        let active: Vec<&RegisteredServer> = candidates.servers.iter().filter(|s| s.is_active()).collect();

        let listings = futures::future::join_all(active.iter().map(|s| self.list_tools(s))).await;

        let mut tools = Vec::new();
        for (server, listing) in active.iter().zip(listings) {
            match listing {
                Ok(list) => tools.extend(list),
                Err(e) => warn!("Failed to list tools of '{}': {}", server.id, e),
            }
        }
        Ok(tools)
    }

    pub async fn get_server_tools(&self, server_id: &str) -> McpResult<Vec<ToolDescriptor>> {
        let server = self.server(server_id).await?;
        self.list_tools(&server).await
    }

    pub async fn get_server_health(&self, server_id: &str) -> McpResult<ServerHealth> {
        let server = self.server(server_id).await?;
        Ok(self.health_of(&server.id).await)
    }

    pub async fn get_group_health(&self, group_id: &str) -> McpResult<Vec<ServerHealth>> {
        let group = self.group(group_id).await?;
        Ok(futures::future::join_all(group.server_ids.iter().map(|id| self.health_of(id))).await)
    }

    /// Replace a group's rules, sorted by descending priority.
    ///
    /// Every rule must target a member of the group.
    pub async fn set_routing_rules(&self, group_id: &str, mut rules: Vec<RoutingRule>) -> McpResult<()> {
        let group = self.group(group_id).await?;
        if let Some(rule) = rules
            .iter()
            .find(|r| !group.server_ids.contains(&r.target_server_id))
        {
            return Err(McpError::Configuration(format!(
                "rule '{}' targets '{}', which is not a member of group '{}'",
                rule.id, rule.target_server_id, group_id
            )));
        }

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!("Saving {} routing rules for group '{}'", rules.len(), group_id);
        self.store.save_routing_rules(group_id, rules).await
    }

    pub async fn get_routing_rules(&self, group_id: &str) -> McpResult<Vec<RoutingRule>> {
        let mut rules = self.group(group_id).await?.routing_rules;
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    /// Pick the server for a call and confirm it is still active.
    async fn resolve_target<'n>(&self, endpoint_or_group: &str, tool_name: &'n str) -> McpResult<(RegisteredServer, &'n str)> {
        let (namespace, base_name) = parse_tool_name(tool_name);
        let candidates = self.candidates(endpoint_or_group).await?;
        let filtered = filter_by_namespace(&candidates.servers, namespace);

        let (chosen, balanced) = match match_rule(&candidates.rules, &filtered, base_name) {
            Some(server) => (server.clone(), false),
            None => self.default_choice(&candidates.key, &filtered, tool_name)?,
        };

        let chosen_id = chosen.id.clone();
        let confirmed = self.confirm_active(chosen, &filtered, tool_name).await;
        if balanced {
            if let Some(lb) = &self.balancer {
                if confirmed.as_ref().map(|s| s.id != chosen_id).unwrap_or(true) {
                    lb.release(&chosen_id);
                }
            }
        }
        Ok((confirmed?, base_name))
    }

    /// First active candidate, or the load balancer's pick (flagged `true`).
    fn default_choice(&self, key: &str, filtered: &[RegisteredServer], tool_name: &str) -> McpResult<(RegisteredServer, bool)> {
        let active: Vec<RegisteredServer> = filtered.iter().filter(|s| s.is_active()).cloned().collect();
        if active.is_empty() {
            return Err(McpError::NoServerAvailable(format!(
                "no active server for tool '{}'",
                tool_name
            )));
        }
        match &self.balancer {
            Some(lb) => lb.select(key, &active).map(|server| (server, true)),
            None => Ok((active[0].clone(), false)),
        }
    }

    /// Re-read the chosen server; if it went inactive, fall back once to
    /// another active candidate in the same namespace.
    async fn confirm_active(&self, chosen: RegisteredServer, filtered: &[RegisteredServer], tool_name: &str) -> McpResult<RegisteredServer> {
        if let Some(current) = self.store.get_server(&chosen.id).await? {
            if current.is_active() {
                return Ok(current);
            }
        }

        warn!("Server '{}' is no longer active, trying one fallback", chosen.id);
        for candidate in filtered
            .iter()
            .filter(|s| s.id != chosen.id && s.namespace() == chosen.namespace())
        {
            if let Some(current) = self.store.get_server(&candidate.id).await? {
                if current.is_active() {
                    info!("Falling back from '{}' to '{}'", chosen.id, current.id);
                    return Ok(current);
                }
            }
        }

        Err(McpError::NoServerAvailable(format!(
            "server '{}' for tool '{}' is inactive and no fallback is available",
            chosen.id, tool_name
        )))
    }

    async fn candidates(&self, endpoint_or_group: &str) -> McpResult<Candidates> {
        if let Some(endpoint) = self.store.get_endpoint(endpoint_or_group).await? {
            return match endpoint.group_id.as_deref() {
                Some(group_id) => self.group_candidates(self.group(group_id).await?).await,
                None => Ok(Candidates {
                    key: endpoint.id.clone(),
                    servers: self.store.servers_for_user(&endpoint.user_id).await?,
                    rules: Vec::new(),
                }),
            };
        }
        match self.store.get_group(endpoint_or_group).await? {
            Some(group) => self.group_candidates(group).await,
            None => Err(McpError::NotFound(format!(
                "endpoint or group '{}'",
                endpoint_or_group
            ))),
        }
    }

    async fn group_candidates(&self, group: Group) -> McpResult<Candidates> {
        let mut servers = Vec::with_capacity(group.server_ids.len());
        for id in &group.server_ids {
            match self.store.get_server(id).await? {
                Some(server) => servers.push(server),
                None => warn!("Group '{}' lists unknown server '{}'", group.id, id),
            }
        }
        Ok(Candidates {
            key: group.id,
            servers,
            rules: group.routing_rules,
        })
    }

    async fn group(&self, group_id: &str) -> McpResult<Group> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| McpError::NotFound(format!("group '{}'", group_id)))
    }

    async fn server(&self, server_id: &str) -> McpResult<RegisteredServer> {
        self.store
            .get_server(server_id)
            .await?
            .ok_or_else(|| McpError::NotFound(format!("server '{}'", server_id)))
    }

    async fn adapter_for(&self, server: &RegisteredServer) -> McpResult<String> {
        let config = server.backend_config()?;
        self.factory.ensure_adapter(&server.id, config).await
    }

    async fn list_tools(&self, server: &RegisteredServer) -> McpResult<Vec<ToolDescriptor>> {
        let instance = self.adapter_for(server).await?;
        let result = self
            .factory
            .send_request(&instance, JsonRpcRequest::list_tools())
            .await?
            .into_result()?;

        let mut seen = HashSet::new();
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| tools.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?;
                if !seen.insert(name.to_string()) {
                    return None;
                }
                Some(ToolDescriptor {
                    name: apply_namespace(server.namespace(), name),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    input_schema: tool.get("inputSchema").cloned(),
                    server_id: server.id.clone(),
                })
            })
            .collect();
        Ok(tools)
    }

    async fn health_of(&self, server_id: &str) -> ServerHealth {
        let Some(instance) = self.factory.adapter_for_backend(server_id) else {
            return ServerHealth {
                server_id: server_id.to_string(),
                status: ServerStatus::Inactive,
                last_check: None,
                error: None,
            };
        };

        match self.factory.adapter_health(&instance).await {
            Ok(health) => ServerHealth {
                server_id: server_id.to_string(),
                status: match health.status {
                    HealthStatus::Healthy => ServerStatus::Active,
                    HealthStatus::Unhealthy => ServerStatus::Error,
                    HealthStatus::Unknown => ServerStatus::Inactive,
                },
                last_check: Some(health.last_check),
                error: health.error,
            },
            Err(e) => ServerHealth {
                server_id: server_id.to_string(),
                status: ServerStatus::Inactive,
                last_check: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn report<T>(&self, server_id: &str, result: &McpResult<T>) {
        report_outcome(self.balancer.as_deref(), server_id, result);
    }
}

/// Feed an outcome to the circuit breaker. A JSON-RPC error from the
/// backend means it answered, so it is not a breaker failure.
fn report_outcome<T>(balancer: Option<&LoadBalancer>, server_id: &str, result: &McpResult<T>) {
    let Some(lb) = balancer else { return };
    match result {
        Ok(_) | Err(McpError::Backend { .. }) => lb.record_success(server_id),
        Err(_) => lb.record_failure(server_id),
    }
}
