//! Adapter factory tests with real subprocess backends

use mcphub::config::{AdapterSettings, FactoryConfig, StdioSettings};
use mcphub::core::protocol::JsonRpcRequest;
use mcphub::core::{AdapterFactory, AdapterStatus, BackendConfig, Protocol, StdioConfig};
use mcphub::utils::McpError;
use std::collections::HashMap;
use std::time::Duration;

const ECHO_SERVER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
  fi
done"#;

fn stdio(script: &str, cwd: Option<String>) -> BackendConfig {
    BackendConfig::Stdio(StdioConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
        cwd,
    })
}

fn settings(max_restarts: u32) -> AdapterSettings {
    AdapterSettings {
        stdio: StdioSettings {
            request_timeout_ms: 2_000,
            max_restarts,
            restart_delay_ms: 10,
            kill_grace_ms: 200,
            handshake: false,
        },
        ..Default::default()
    }
}

fn factory_config() -> FactoryConfig {
    FactoryConfig {
        max_concurrent_adapters: 4,
        health_check_interval_ms: 30_000,
        enable_auto_restart: true,
        restart_delay_ms: 20,
        max_auto_restarts: 2,
    }
}

#[tokio::test]
async fn test_stdio_instance_lifecycle() {
    let factory = AdapterFactory::new(factory_config(), settings(3));
    let id = factory.create_adapter("echo", stdio(ECHO_SERVER, None)).await.unwrap();

    let instance = factory.instance(&id).await.unwrap();
    assert_eq!(instance.backend_id, "echo");
    assert_eq!(instance.protocol, Protocol::Stdio);
    assert_eq!(instance.status, AdapterStatus::Connected);
    assert!(instance.last_used_at.is_none());
    assert_eq!(factory.adapter_for_backend("echo").as_deref(), Some(id.as_str()));

    let response = factory
        .send_request(&id, JsonRpcRequest::list_tools())
        .await
        .unwrap();
    assert_eq!(response.result.unwrap()["ok"], true);

    let instance = factory.instance(&id).await.unwrap();
    assert_eq!(instance.metadata.request_count, 1);
    assert!(instance.last_used_at.is_some());

    let stats = factory.statistics().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_protocol.get("stdio"), Some(&1));
    assert_eq!(stats.by_status.get("connected"), Some(&1));
    assert_eq!(stats.total_requests, 1);

    assert!(factory.adapter_health(&id).await.unwrap().is_healthy());

    factory.remove_adapter(&id).await.unwrap();
    assert!(factory.instance(&id).await.is_none());
    assert!(factory.adapter_for_backend("echo").is_none());
    assert!(matches!(
        factory.send_request(&id, JsonRpcRequest::list_tools()).await,
        Err(McpError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_changed_config_replaces_adapter() {
    let factory = AdapterFactory::new(factory_config(), settings(3));

    let first = factory.ensure_adapter("echo", stdio(ECHO_SERVER, None)).await.unwrap();
    let again = factory.ensure_adapter("echo", stdio(ECHO_SERVER, None)).await.unwrap();
    assert_eq!(first, again);

    let dir = tempfile::tempdir().unwrap();
    let moved = stdio(ECHO_SERVER, Some(dir.path().display().to_string()));
    let replaced = factory.ensure_adapter("echo", moved).await.unwrap();
    assert_ne!(first, replaced);
    assert!(factory.instance(&first).await.is_none());
    assert_eq!(factory.instances().await.len(), 1);

    factory.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_and_spawn_failure_register_nothing() {
    let factory = AdapterFactory::new(factory_config(), settings(3));
    let missing = BackendConfig::Stdio(StdioConfig {
        command: "  ".to_string(),
        args: vec![],
        env: HashMap::new(),
        cwd: None,
    });
    assert!(matches!(
        factory.create_adapter("missing", missing).await,
        Err(McpError::Configuration(_))
    ));

    let unspawnable = BackendConfig::Stdio(StdioConfig {
        command: "/definitely/not/a/binary".to_string(),
        args: vec![],
        env: HashMap::new(),
        cwd: None,
    });
    assert!(matches!(
        factory.create_adapter("unspawnable", unspawnable).await,
        Err(McpError::Connection(_))
    ));
    assert!(factory.instances().await.is_empty());
}

#[tokio::test]
async fn test_failed_adapter_is_restarted_by_factory() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!(
        "if [ ! -f crashed ]; then touch crashed; exit 1; fi\n{}",
        ECHO_SERVER
    );
    // The adapter gives up at the first crash, leaving recovery to the factory.
    let factory = AdapterFactory::new(factory_config(), settings(0));
    let id = factory
        .create_adapter("flaky", stdio(&script, Some(dir.path().display().to_string())))
        .await
        .unwrap();

    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(instance) = factory.instance(&id).await {
                if instance.metadata.restart_count == 1 && instance.status == AdapterStatus::Connected {
                    return instance;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(recovered.metadata.last_error.unwrap().contains("exceeded 0 restarts"));

    let response = factory.send_request(&id, JsonRpcRequest::list_tools()).await.unwrap();
    assert_eq!(response.result.unwrap()["ok"], true);

    factory.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let factory = AdapterFactory::new(factory_config(), settings(3));
    factory.create_adapter("one", stdio(ECHO_SERVER, None)).await.unwrap();
    factory.create_adapter("two", stdio(ECHO_SERVER, None)).await.unwrap();
    factory.start_health_monitor();

    let report = factory.shutdown().await;
    assert_eq!(report.stopped, 2);
    assert!(report.failures.is_empty());
    assert!(factory.is_shutting_down());
    assert!(factory.instances().await.is_empty());

    assert!(matches!(
        factory.create_adapter("three", stdio(ECHO_SERVER, None)).await,
        Err(McpError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_capacity_is_enforced() {
    let factory = AdapterFactory::new(
        FactoryConfig {
            max_concurrent_adapters: 1,
            ..factory_config()
        },
        settings(3),
    );
    factory.create_adapter("one", stdio(ECHO_SERVER, None)).await.unwrap();
    assert!(matches!(
        factory.create_adapter("two", stdio(ECHO_SERVER, None)).await,
        Err(McpError::CapacityExceeded(_))
    ));
    factory.shutdown().await;
}

#[tokio::test]
async fn test_slow_backend_does_not_block_others() {
    let mut handshaking = settings(3);
    handshaking.stdio.handshake = true;
    handshaking.stdio.request_timeout_ms = 3_000;
    let factory = AdapterFactory::new(factory_config(), handshaking);

    // Never answers the initialize handshake, so its connect runs to the timeout.
    let slow = {
        let factory = factory.clone();
        tokio::spawn(async move { factory.ensure_adapter("slow", stdio("sleep 30", None)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let fast = factory.ensure_adapter("fast", stdio(ECHO_SERVER, None)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(factory.adapter_for_backend("fast").as_deref(), Some(fast.as_str()));

    assert!(matches!(slow.await.unwrap(), Err(McpError::Connection(_))));
    factory.shutdown().await;
}
