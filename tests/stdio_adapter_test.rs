//! Subprocess adapter tests driven by small shell backends

use mcphub::adapter::{Adapter, AdapterEvent, StdioAdapter};
use mcphub::config::StdioSettings;
use mcphub::core::protocol::JsonRpcRequest;
use mcphub::core::StdioConfig;
use mcphub::utils::McpError;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

const EXTRACT_ID: &str = r#"sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p'"#;

fn script_config(script: String, cwd: Option<String>, env: HashMap<String, String>) -> StdioConfig {
    StdioConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script],
        env,
        cwd,
    }
}

fn settings() -> StdioSettings {
    StdioSettings {
        request_timeout_ms: 2_000,
        max_restarts: 3,
        restart_delay_ms: 20,
        kill_grace_ms: 200,
        handshake: false,
    }
}

fn echo_loop(result: &str) -> String {
    format!(
        r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | {extract})
  if [ -n "$id" ]; then
    printf '{{"jsonrpc":"2.0","id":%s,"result":{result}}}\n' "$id"
  fi
done"#,
        extract = EXTRACT_ID,
        result = result
    )
}

async fn wait_for(events: &mut broadcast::Receiver<AdapterEvent>, wanted: impl Fn(&AdapterEvent) -> bool) -> AdapterEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("event not observed in time")
}

#[tokio::test]
async fn test_env_and_cwd_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = HashMap::new();
    env.insert("GREETING".to_string(), "hello".to_string());
    let script = echo_loop(r#"{"greeting":"'"$GREETING"'","cwd":"'"$(pwd)"'"}"#);

    let adapter = StdioAdapter::new(
        "env",
        script_config(script, Some(dir.path().display().to_string()), env),
        settings(),
        Duration::from_secs(30),
    );
    adapter.connect().await.unwrap();

    let result = adapter
        .send_request(JsonRpcRequest::new("ping", None))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result["greeting"], "hello");
    let dir_name = dir.path().file_name().unwrap().to_str().unwrap();
    assert!(result["cwd"].as_str().unwrap().ends_with(dir_name));

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_responses_are_correlated() {
    let script = format!(
        r#"IFS= read -r a; IFS= read -r b
ida=$(printf '%s' "$a" | {extract})
idb=$(printf '%s' "$b" | {extract})
printf '{{"jsonrpc":"2.0","id":%s,"result":{{"seen":%s}}}}\n' "$idb" "$idb"
printf '{{"jsonrpc":"2.0","id":%s,"result":{{"seen":%s}}}}\n' "$ida" "$ida"
cat > /dev/null"#,
        extract = EXTRACT_ID
    );
    let adapter = StdioAdapter::new("ooo", script_config(script, None, HashMap::new()), settings(), Duration::from_secs(30));
    adapter.connect().await.unwrap();

    let (first, second) = tokio::join!(
        adapter.send_request(JsonRpcRequest::new("one", None)),
        adapter.send_request(JsonRpcRequest::new("two", None)),
    );
    for response in [first.unwrap(), second.unwrap()] {
        let id = serde_json::to_value(response.id.clone().unwrap()).unwrap();
        assert_eq!(response.result.unwrap()["seen"], id);
    }
    assert_eq!(adapter.pending_calls(), 0);

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_crashed_process_is_restarted() {
    let dir = tempfile::tempdir().unwrap();
    // First run crashes; the restarted process finds the marker and serves.
    let script = format!(
        "if [ ! -f crashed ]; then touch crashed; exit 1; fi\n{}",
        echo_loop(r#"{"restarted":true}"#)
    );
    let adapter = StdioAdapter::new(
        "flaky",
        script_config(script, Some(dir.path().display().to_string()), HashMap::new()),
        settings(),
        Duration::from_secs(30),
    );
    let mut events = adapter.subscribe();
    adapter.connect().await.unwrap();

    wait_for(&mut events, |e| matches!(e, AdapterEvent::Errored(_))).await;
    let reconnecting = wait_for(&mut events, |e| matches!(e, AdapterEvent::Reconnecting { .. })).await;
    assert_eq!(reconnecting, AdapterEvent::Reconnecting { attempt: 1 });
    wait_for(&mut events, |e| *e == AdapterEvent::Connected).await;

    let response = adapter.send_request(JsonRpcRequest::new("ping", None)).await.unwrap();
    assert_eq!(response.result.unwrap()["restarted"], true);
    assert_eq!(adapter.restart_count(), 1);
    assert!(adapter.health().await.is_healthy());

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_recovered_backend_regains_restart_budget() {
    let dir = tempfile::tempdir().unwrap();
    // First run crashes at once; later runs serve until asked to crash.
    let script = format!(
        r#"if [ ! -f started ]; then touch started; exit 1; fi
while IFS= read -r line; do
  case "$line" in *'"crash"'*) exit 1;; esac
  id=$(printf '%s' "$line" | {extract})
  if [ -n "$id" ]; then
    printf '{{"jsonrpc":"2.0","id":%s,"result":{{"up":true}}}}\n' "$id"
  fi
done"#,
        extract = EXTRACT_ID
    );
    let adapter = StdioAdapter::new(
        "phoenix",
        script_config(script, Some(dir.path().display().to_string()), HashMap::new()),
        StdioSettings {
            max_restarts: 1,
            ..settings()
        },
        Duration::from_secs(30),
    );
    let mut events = adapter.subscribe();
    adapter.connect().await.unwrap();

    wait_for(&mut events, |e| *e == AdapterEvent::Reconnecting { attempt: 1 }).await;
    wait_for(&mut events, |e| *e == AdapterEvent::Connected).await;
    assert_eq!(adapter.crash_streak(), 1);

    adapter.send_request(JsonRpcRequest::new("ping", None)).await.unwrap();
    assert_eq!(adapter.crash_streak(), 0);

    assert!(adapter.send_request(JsonRpcRequest::new("crash", None)).await.is_err());
    wait_for(&mut events, |e| *e == AdapterEvent::Reconnecting { attempt: 2 }).await;
    wait_for(&mut events, |e| *e == AdapterEvent::Connected).await;

    let response = adapter.send_request(JsonRpcRequest::new("ping", None)).await.unwrap();
    assert_eq!(response.result.unwrap()["up"], true);
    assert_eq!(adapter.restart_count(), 2);
    assert!(adapter.health().await.is_healthy());

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_restart_bound_fails_terminally() {
    let adapter = StdioAdapter::new(
        "doomed",
        script_config("exit 7".to_string(), None, HashMap::new()),
        StdioSettings {
            max_restarts: 1,
            ..settings()
        },
        Duration::from_secs(30),
    );
    let mut events = adapter.subscribe();
    adapter.connect().await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, AdapterEvent::Failed(_))).await;
    assert_eq!(failed, AdapterEvent::Failed("backend doomed exceeded 1 restarts".to_string()));

    let err = adapter.send_request(JsonRpcRequest::new("ping", None)).await.unwrap_err();
    assert!(matches!(err, McpError::MaxRestartsExceeded { restarts: 1, .. }));
    assert!(!adapter.health().await.is_healthy());
    assert_eq!(adapter.restart_count(), 1);

    adapter.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_error_response_is_returned_not_raised() {
    let script = echo_loop("null").replace(
        r#""result":null"#,
        r#""error":{"code":-32601,"message":"method not found"}"#,
    );
    let adapter = StdioAdapter::new("err", script_config(script, None, HashMap::new()), settings(), Duration::from_secs(30));
    adapter.connect().await.unwrap();

    let response = adapter.send_request(JsonRpcRequest::new("nope", None)).await.unwrap();
    assert_eq!(response.error.as_ref().unwrap().code, -32601);
    assert_eq!(adapter.stats().error_count, 1);
    assert!(matches!(
        response.into_result(),
        Err(McpError::Backend { code: -32601, .. })
    ));

    adapter.disconnect().await.unwrap();
}
