//! Configuration validation: field ranges plus cross-references between
//! servers, groups, routing rules and endpoints

use crate::config::{ConfigManager, GatewayConfig};
use schemars::schema_for;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Configuration validator
pub struct ConfigValidator {
    schema: Value,
}

impl ConfigValidator {
    /// Create a new validator with the generated schema
    pub fn new() -> Self {
        let schema = schema_for!(GatewayConfig);
        Self {
            schema: serde_json::to_value(&schema).unwrap_or_default(),
        }
    }

    /// Get the JSON Schema for the configuration
    pub fn get_schema(&self) -> &Value {
        &self.schema
    }

    /// Export the schema to a JSON string
    pub fn export_schema(&self) -> String {
        serde_json::to_string_pretty(&self.schema).unwrap_or_default()
    }

    /// Load and validate a configuration file
    pub fn validate_file(&self, path: &str) -> Result<GatewayConfig, Vec<ValidationError>> {
        let expanded = shellexpand::tilde(path).to_string();
        let config = ConfigManager::load(Path::new(&expanded)).map_err(|e| {
            vec![ValidationError {
                path: expanded.clone(),
                message: e.to_string(),
            }]
        })?;
        self.validate(&config)?;
        Ok(config)
    }

    pub fn validate(&self, config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(validation_errors) = config.validate() {
            flatten_errors("", &validation_errors, &mut errors);
        }

        self.validate_circuit_breaker(config, &mut errors);
        self.validate_servers(config, &mut errors);
        self.validate_groups(config, &mut errors);
        self.validate_endpoints(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_circuit_breaker(&self, config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
        let breaker = &config.load_balancer.circuit_breaker;
        // More successes than trial slots could never close the circuit.
        if breaker.success_threshold > breaker.half_open_max_requests {
            errors.push(ValidationError {
                path: "load_balancer.circuit_breaker.success_threshold".to_string(),
                message: format!(
                    "success_threshold ({}) cannot exceed half_open_max_requests ({})",
                    breaker.success_threshold, breaker.half_open_max_requests
                ),
            });
        }
    }

    fn validate_servers(&self, config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
        let mut ids = HashSet::new();

        for (idx, server) in config.servers.iter().enumerate() {
            if server.id.is_empty() {
                errors.push(ValidationError {
                    path: format!("servers[{}].id", idx),
                    message: "Server id cannot be empty".to_string(),
                });
            } else if !ids.insert(server.id.as_str()) {
                errors.push(ValidationError {
                    path: format!("servers[{}].id", idx),
                    message: format!("Duplicate server id: {}", server.id),
                });
            }

            if let Err(e) = server.backend_config() {
                errors.push(ValidationError {
                    path: format!("servers[{}].config", idx),
                    message: e.to_string(),
                });
            }
        }
    }

    fn validate_groups(&self, config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
        let servers: HashSet<&str> = config.servers.iter().map(|s| s.id.as_str()).collect();

        for (idx, group) in config.groups.iter().enumerate() {
            for member in &group.server_ids {
                if !servers.contains(member.as_str()) {
                    errors.push(ValidationError {
                        path: format!("groups[{}].serverIds", idx),
                        message: format!("Unknown server: {}", member),
                    });
                }
            }

            for (rule_idx, rule) in group.routing_rules.iter().enumerate() {
                if !group.server_ids.contains(&rule.target_server_id) {
                    errors.push(ValidationError {
                        path: format!("groups[{}].routingRules[{}]", idx, rule_idx),
                        message: format!(
                            "Target {} is not a member of group {}",
                            rule.target_server_id, group.id
                        ),
                    });
                }
            }
        }
    }

    fn validate_endpoints(&self, config: &GatewayConfig, errors: &mut Vec<ValidationError>) {
        let groups: HashSet<&str> = config.groups.iter().map(|g| g.id.as_str()).collect();

        for (idx, endpoint) in config.endpoints.iter().enumerate() {
            if let Some(group_id) = &endpoint.group_id {
                if !groups.contains(group_id.as_str()) {
                    errors.push(ValidationError {
                        path: format!("endpoints[{}].groupId", idx),
                        message: format!("Unknown group: {}", group_id),
                    });
                }
            }
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn flatten_errors(prefix: &str, errors: &ValidationErrors, out: &mut Vec<ValidationError>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for e in field_errors {
                    out.push(ValidationError {
                        path: path.clone(),
                        message: e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("failed '{}' check", e.code)),
                    });
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten_errors(&path, inner, out),
            ValidationErrorsKind::List(items) => {
                for (i, inner) in items {
                    flatten_errors(&format!("{}[{}]", path, i), inner, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Endpoint, Group, RegisteredServer, RoutingRule, RuleCondition, ServerStatus};
    use serde_json::json;

    fn server(id: &str) -> RegisteredServer {
        RegisteredServer {
            id: id.into(),
            user_id: "u1".into(),
            name: id.into(),
            protocol: "http".into(),
            config: json!({"baseUrl": "http://localhost:9000"}),
            namespace: None,
            status: ServerStatus::Active,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::new().validate(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_nested_range_error_has_path() {
        let mut config = GatewayConfig::default();
        config.factory.max_concurrent_adapters = 0;
        let errors = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.path == "factory.max_concurrent_adapters"));
    }

    #[test]
    fn test_breaker_needs_enough_trials_to_close() {
        let mut config = GatewayConfig::default();
        config.load_balancer.circuit_breaker.half_open_max_requests = 1;
        config.load_balancer.circuit_breaker.success_threshold = 2;
        let errors = ConfigValidator::new().validate(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "load_balancer.circuit_breaker.success_threshold");

        config.load_balancer.circuit_breaker.half_open_max_requests = 2;
        assert!(ConfigValidator::new().validate(&config).is_ok());
    }

    #[test]
    fn test_cross_references() {
        let mut config = GatewayConfig::default();
        let mut bad = server("b");
        bad.protocol = "carrier-pigeon".into();
        config.servers = vec![server("a"), server("a"), bad];
        config.groups = vec![Group {
            id: "g".into(),
            name: None,
            server_ids: vec!["a".into(), "ghost".into()],
            routing_rules: vec![RoutingRule {
                id: "r".into(),
                condition: RuleCondition::default(),
                target_server_id: "b".into(),
                priority: 1,
                enabled: true,
            }],
        }];
        config.endpoints = vec![Endpoint {
            id: "e".into(),
            user_id: "u1".into(),
            group_id: Some("missing".into()),
        }];

        let errors = ConfigValidator::new().validate(&config).unwrap_err();
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains("Duplicate server id: a")));
        assert!(messages.iter().any(|m| m.contains("servers[2].config")));
        assert!(messages.iter().any(|m| m.contains("Unknown server: ghost")));
        assert!(messages.iter().any(|m| m.contains("not a member of group g")));
        assert!(messages.iter().any(|m| m.contains("Unknown group: missing")));
    }

    #[test]
    fn test_schema_export() {
        let validator = ConfigValidator::new();
        let schema = validator.export_schema();
        assert!(schema.contains("GatewayConfig"));
        assert!(validator.get_schema()["properties"]["factory"].is_object());
    }
}
