//! Registry store seam
//!
//! Servers, groups and endpoints are owned by an external persistence layer.
//! The router only talks to it through [`RegistryStore`]. [`InMemoryStore`]
//! backs the CLI (seeded from the config file) and the tests.

use crate::core::models::{Endpoint, Group, RegisteredServer, RoutingRule, ServerStatus};
use crate::utils::errors::{McpError, McpResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn get_endpoint(&self, endpoint_id: &str) -> McpResult<Option<Endpoint>>;

    async fn get_group(&self, group_id: &str) -> McpResult<Option<Group>>;

    async fn get_server(&self, server_id: &str) -> McpResult<Option<RegisteredServer>>;

    /// All servers owned by a user, in registration order
    async fn servers_for_user(&self, user_id: &str) -> McpResult<Vec<RegisteredServer>>;

    /// Replace a group's routing rules
    async fn save_routing_rules(&self, group_id: &str, rules: Vec<RoutingRule>) -> McpResult<()>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryStore {
    // Vec keeps registration order, which decides "first active candidate".
    servers: RwLock<Vec<RegisteredServer>>,
    groups: DashMap<String, Group>,
    endpoints: DashMap<String, Endpoint>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from configuration records
    pub fn from_records(
        servers: Vec<RegisteredServer>,
        groups: Vec<Group>,
        endpoints: Vec<Endpoint>,
    ) -> Self {
        let store = Self::new();
        for server in servers {
            store.upsert_server(server);
        }
        for group in groups {
            store.upsert_group(group);
        }
        for endpoint in endpoints {
            store.upsert_endpoint(endpoint);
        }
        store
    }

    pub fn upsert_server(&self, server: RegisteredServer) {
        let mut servers = self.servers.write();
        match servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }
    }

    pub fn upsert_group(&self, group: Group) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn upsert_endpoint(&self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint.id.clone(), endpoint);
    }

    pub fn set_server_status(&self, server_id: &str, status: ServerStatus) -> McpResult<()> {
        let mut servers = self.servers.write();
        let server = servers
            .iter_mut()
            .find(|s| s.id == server_id)
            .ok_or_else(|| McpError::NotFound(format!("server '{}'", server_id)))?;
        server.status = status;
        Ok(())
    }

    pub fn all_servers(&self) -> Vec<RegisteredServer> {
        self.servers.read().clone()
    }
}

#[async_trait]
impl RegistryStore for InMemoryStore {
    async fn get_endpoint(&self, endpoint_id: &str) -> McpResult<Option<Endpoint>> {
        Ok(self.endpoints.get(endpoint_id).map(|e| e.clone()))
    }

    async fn get_group(&self, group_id: &str) -> McpResult<Option<Group>> {
        Ok(self.groups.get(group_id).map(|g| g.clone()))
    }

    async fn get_server(&self, server_id: &str) -> McpResult<Option<RegisteredServer>> {
        Ok(self.servers.read().iter().find(|s| s.id == server_id).cloned())
    }

    async fn servers_for_user(&self, user_id: &str) -> McpResult<Vec<RegisteredServer>> {
        Ok(self
            .servers
            .read()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save_routing_rules(&self, group_id: &str, rules: Vec<RoutingRule>) -> McpResult<()> {
        let mut group = self
            .groups
            .get_mut(group_id)
            .ok_or_else(|| McpError::NotFound(format!("group '{}'", group_id)))?;
        group.routing_rules = rules;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(id: &str, user: &str) -> RegisteredServer {
        RegisteredServer {
            id: id.into(),
            user_id: user.into(),
            name: id.into(),
            protocol: "stdio".into(),
            config: json!({"command": "true"}),
            namespace: None,
            status: ServerStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_servers_for_user_keeps_order() {
        let store = InMemoryStore::new();
        store.upsert_server(server("b", "u1"));
        store.upsert_server(server("a", "u1"));
        store.upsert_server(server("c", "u2"));

        let ids: Vec<_> = store
            .servers_for_user("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_set_status_unknown_server() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.set_server_status("missing", ServerStatus::Inactive),
            Err(McpError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_rules_requires_group() {
        let store = InMemoryStore::new();
        let err = store.save_routing_rules("g1", vec![]).await.unwrap_err();
        assert!(matches!(err, McpError::NotFound(_)));
    }
}
