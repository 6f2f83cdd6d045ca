//! Configuration loading, persistence and validation tests

use mcphub::config::{ConfigEvent, ConfigManager, ConfigValidator, LogFormat};
use mcphub::core::{BackendConfig, LoadBalancingStrategy};
use std::fs;
use tempfile::TempDir;

const GATEWAY_YAML: &str = r#"
logging:
  level: debug
  format: json
factory:
  max_concurrent_adapters: 20
  enable_auto_restart: false
adapters:
  stdio:
    handshake: false
  http:
    retry_attempts: 5
load_balancer:
  enabled: true
  strategy: least_connections
  circuit_breaker:
    failure_threshold: 3
servers:
  - id: github
    userId: u1
    name: GitHub
    protocol: http
    namespace: gh
    config:
      baseUrl: https://mcp.example.com/github
      headers:
        Authorization: Bearer token
  - id: files
    userId: u1
    name: Files
    protocol: stdio
    status: inactive
    config:
      command: mcp-fs
      args: ["--root", "/srv"]
groups:
  - id: dev
    serverIds: [github, files]
    routingRules:
      - id: issues-to-github
        condition:
          toolName: create_issue
        targetServerId: github
        priority: 10
endpoints:
  - id: e1
    userId: u1
    groupId: dev
"#;

fn write(dir: &TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path.display().to_string()
}

#[test]
fn test_full_yaml_config() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "gateway.yaml", GATEWAY_YAML);
    let config = ConfigManager::new(&path).unwrap().get_config();

    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.factory.max_concurrent_adapters, 20);
    assert!(!config.factory.enable_auto_restart);
    assert_eq!(config.factory.max_auto_restarts, 3);
    assert!(!config.adapters.stdio.handshake);
    assert_eq!(config.adapters.http.retry_attempts, 5);
    assert_eq!(config.adapters.http.max_concurrent_requests, 10);
    assert!(config.load_balancer.enabled);
    assert_eq!(config.load_balancer.strategy, LoadBalancingStrategy::LeastConnections);
    assert_eq!(config.load_balancer.circuit_breaker.failure_threshold, 3);

    let github = &config.servers[0];
    assert_eq!(github.namespace(), Some("gh"));
    match github.backend_config().unwrap() {
        BackendConfig::Http(http) => {
            assert_eq!(http.base_url, "https://mcp.example.com/github");
            assert_eq!(http.headers["Authorization"], "Bearer token");
        }
        other => panic!("unexpected backend: {:?}", other),
    }
    assert!(!config.servers[1].is_active());

    let rule = &config.groups[0].routing_rules[0];
    assert_eq!(rule.condition.tool_name.as_deref(), Some("create_issue"));
    assert!(rule.enabled);
    assert_eq!(config.endpoints[0].group_id.as_deref(), Some("dev"));

    assert!(ConfigValidator::new().validate(&config).is_ok());
}

#[tokio::test]
async fn test_save_then_reload() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "gateway.json", "{}");
    let manager = ConfigManager::new(&path).unwrap();
    assert!(manager.get_config().servers.is_empty());

    let mut config = manager.get_config();
    config.factory.max_auto_restarts = 9;
    config.adapters.sse.max_reconnects = 1;
    manager.save(&config).await.unwrap();

    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["factory"]["max_auto_restarts"], 9);

    let reopened = ConfigManager::new(&path).unwrap().get_config();
    assert_eq!(reopened.factory.max_auto_restarts, 9);
    assert_eq!(reopened.adapters.sse.max_reconnects, 1);
}

#[test]
fn test_failed_reload_keeps_previous_config() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "gateway.toml", "[factory]\nmax_concurrent_adapters = 7\n");
    let manager = ConfigManager::new(&path).unwrap();
    let mut events = manager.subscribe();

    fs::write(&path, "[factory\nbroken").unwrap();
    assert!(manager.reload().is_err());
    assert_eq!(manager.get_config().factory.max_concurrent_adapters, 7);
    assert!(matches!(events.try_recv(), Ok(ConfigEvent::Error(_))));

    fs::write(&path, "[factory]\nmax_concurrent_adapters = 8\n").unwrap();
    manager.reload().unwrap();
    assert_eq!(manager.get_config().factory.max_concurrent_adapters, 8);
    assert!(matches!(events.try_recv(), Ok(ConfigEvent::Reloaded)));
}

#[test]
fn test_validate_file_reports_every_problem() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "gateway.yaml",
        r#"
adapters:
  http:
    max_concurrent_requests: 0
servers:
  - id: a
    userId: u1
    name: A
    protocol: http
    config:
      baseUrl: ftp://example.com
groups:
  - id: g
    serverIds: [a, ghost]
"#,
    );

    let errors = ConfigValidator::new().validate_file(&path).unwrap_err();
    let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
    assert!(paths.contains(&"adapters.http.max_concurrent_requests"));
    assert!(paths.contains(&"servers[0].config"));
    assert!(paths.contains(&"groups[0].serverIds"));

    let missing = ConfigValidator::new()
        .validate_file(&dir.path().join("absent.yaml").display().to_string())
        .unwrap_err();
    assert_eq!(missing.len(), 1);
}
