//! End-to-end tests against real V8 isolates
#![cfg(feature = "v8")]

use assert_matches::assert_matches;
use scriptbox_sandbox::{
    ExecutionBridge, ExecutionRequest, PolicyViolation, PoolConfig, SandboxConfig, SandboxError,
    SandboxPolicy, Variables,
};
use serde_json::json;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("scriptbox=debug,scriptbox_sandbox=debug")
        .try_init();
}

fn bridge_with(policy: SandboxPolicy) -> ExecutionBridge<scriptbox_sandbox::V8Engine> {
    init_tracing();
    let config = SandboxConfig {
        policy,
        pool: PoolConfig {
            capacity: 2,
            ..PoolConfig::default()
        },
    };
    ExecutionBridge::v8(&config).unwrap()
}

fn bridge() -> ExecutionBridge<scriptbox_sandbox::V8Engine> {
    bridge_with(SandboxPolicy::strict())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_arithmetic() {
    let bridge = bridge();
    assert_eq!(bridge.execute("2 + 2").await.unwrap(), json!(4));
    assert_eq!(bridge.execute("1 / 4").await.unwrap(), json!(0.25));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_injected_variable() {
    let bridge = bridge();
    let mut variables = Variables::new();
    variables.insert("x".to_string(), json!(41));
    assert_eq!(bridge.execute_with("x + 1", variables).await.unwrap(), json!(42));

    // Injected variables do not outlive the run
    assert_eq!(
        bridge.execute("typeof x").await.unwrap(),
        json!("undefined")
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_structured_values_round_trip() {
    let bridge = bridge();
    let source = "({ name: user.name.toUpperCase(), tags: user.tags.length, none: null })";
    let request = ExecutionRequest::new(source)
        .with_variable("user", json!({"name": "ada", "tags": ["a", "b", "c"]}));
    assert_eq!(
        bridge.execute_request(request).await.unwrap(),
        json!({"name": "ADA", "tags": 3, "none": null})
    );
    assert_eq!(bridge.execute("undefined").await.unwrap(), json!(null));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_infinite_loop_times_out() {
    let bridge = bridge();
    let started = Instant::now();
    let result = bridge
        .execute_request(ExecutionRequest::new("while (true) {}").with_timeout_ms(100))
        .await;
    assert_matches!(result, Err(SandboxError::Timeout { timeout_ms: 100, .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    let stats = bridge.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.borrowed, 0);

    // A fresh isolate takes its place
    assert_eq!(bridge.execute("2 + 2").await.unwrap(), json!(4));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thrown_error_keeps_isolate() {
    let bridge = bridge();
    let result = bridge.execute("throw new Error('boom')").await;
    assert_matches!(
        result,
        Err(SandboxError::Script { ref message, discarded: false }) if message.contains("boom")
    );
    assert_eq!(bridge.stats().discarded, 0);
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_promise_result_is_awaited() {
    let bridge = bridge();
    let value = bridge
        .execute("(async () => { await null; return 'done'; })()")
        .await
        .unwrap();
    assert_eq!(value, json!("done"));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_console_is_available() {
    let bridge = bridge();
    let value = bridge
        .execute("console.log('hello', { n: 1 }); 'logged'")
        .await
        .unwrap();
    assert_eq!(value, json!("logged"));
    assert_eq!(bridge.execute("typeof Deno").await.unwrap(), json!("undefined"));
    assert_eq!(
        bridge.execute("typeof __bootstrap").await.unwrap(),
        json!("undefined")
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_policy_hides_capabilities() {
    let bridge = bridge();
    assert_eq!(bridge.execute("typeof fetch").await.unwrap(), json!("undefined"));
    assert_eq!(bridge.execute("typeof io").await.unwrap(), json!("undefined"));

    assert_matches!(
        bridge
            .execute_request(ExecutionRequest::new("1").with_network())
            .await,
        Err(SandboxError::PolicyViolation(PolicyViolation::NetworkNotPermitted))
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_io_requires_per_run_grant() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("note.txt");
    std::fs::write(&path, "from disk").unwrap();
    let path = path.to_string_lossy().to_string();

    let bridge = bridge_with(SandboxPolicy::strict().with_io(true));

    let read = ExecutionRequest::new("io.readText(path)")
        .with_variable("path", path.clone())
        .with_io();
    assert_eq!(bridge.execute_request(read).await.unwrap(), json!("from disk"));

    // Installed by policy, but this run did not ask for IO
    let denied = ExecutionRequest::new("io.readText(path)").with_variable("path", path);
    assert_matches!(
        bridge.execute_request(denied).await,
        Err(SandboxError::Script { ref message, .. }) if message.contains("Permission denied")
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_network_requires_per_run_grant() {
    let bridge = bridge_with(SandboxPolicy::strict().with_network(true));
    assert_eq!(bridge.execute("typeof fetch").await.unwrap(), json!("function"));

    // Installed by policy, but this run did not ask for the network
    let denied = ExecutionRequest::new("fetch('http://127.0.0.1:9/').then((r) => r.status)");
    assert_matches!(
        bridge.execute_request(denied).await,
        Err(SandboxError::Script { ref message, discarded: false })
            if message.contains("Permission denied")
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heap_exhaustion_discards_isolate() {
    let policy = SandboxPolicy::strict()
        .with_max_heap_bytes(32 * 1024 * 1024)
        .with_max_cpu_millis(30_000);
    let bridge = bridge_with(policy);

    let hoard = "const hoard = []; while (true) { hoard.push(new Array(1000).fill('x')); }";
    assert_matches!(
        bridge.execute(hoard).await,
        Err(SandboxError::Script { discarded: true, .. })
    );
    let stats = bridge.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.borrowed, 0);

    assert_eq!(bridge.execute("1 + 1").await.unwrap(), json!(2));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sparse_array_result_is_rejected() {
    let bridge = bridge();
    assert_matches!(
        bridge.execute("new Array(4294967295)").await,
        Err(SandboxError::Script { ref message, discarded: false }) if message.contains("elements")
    );

    // Large but within the mapping budget
    assert_eq!(
        bridge.execute("new Array(1000).fill(0).length").await.unwrap(),
        json!(1000)
    );
    let value = bridge.execute("new Array(1000).fill(1)").await.unwrap();
    assert_eq!(value.as_array().map(Vec::len), Some(1000));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_script_runs_twice_on_one_isolate() {
    init_tracing();
    let config = SandboxConfig {
        pool: PoolConfig {
            capacity: 1,
            ..PoolConfig::default()
        },
        ..SandboxConfig::default()
    };
    let bridge = ExecutionBridge::v8(&config).unwrap();

    for _ in 0..2 {
        assert_eq!(bridge.execute("let t = 1; t").await.unwrap(), json!(1));
        assert_eq!(
            bridge.execute("const c = 2; class K {} function f() { return c; } f()").await.unwrap(),
            json!(2)
        );
    }
    assert_eq!(bridge.stats().created, 1);
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_globals_reset_between_runs() {
    init_tracing();
    let config = SandboxConfig {
        pool: PoolConfig {
            capacity: 1,
            ..PoolConfig::default()
        },
        ..SandboxConfig::default()
    };
    let bridge = ExecutionBridge::v8(&config).unwrap();

    bridge
        .execute("globalThis.leaked = 1; Math = null; var hoisted = 2; 0")
        .await
        .unwrap();
    assert_eq!(bridge.execute("typeof leaked").await.unwrap(), json!("undefined"));
    assert_eq!(bridge.execute("typeof hoisted").await.unwrap(), json!("undefined"));
    assert_eq!(bridge.execute("Math.max(1, 3)").await.unwrap(), json!(3));

    // A failed run is cleaned up too
    assert!(bridge.execute("globalThis.partial = 1; throw new Error('x')").await.is_err());
    assert_eq!(bridge.execute("typeof partial").await.unwrap(), json!("undefined"));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_syntax() {
    let bridge = bridge();
    assert!(bridge.check_syntax("const a = 1; a * 2").await.is_ok());
    assert_matches!(
        bridge.check_syntax("const = ;").await,
        Err(SandboxError::Script { discarded: false, .. })
    );
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prelude_runs_in_each_isolate() {
    init_tracing();
    let config = SandboxConfig {
        pool: PoolConfig {
            capacity: 1,
            prelude: vec!["globalThis.answer = 42;".to_string()],
            ..PoolConfig::default()
        },
        ..SandboxConfig::default()
    };
    let bridge = ExecutionBridge::v8(&config).unwrap();
    assert_eq!(bridge.execute("answer").await.unwrap(), json!(42));

    // Prelude globals are part of every run's starting state
    bridge.execute("answer = 0").await.unwrap();
    assert_eq!(bridge.execute("answer").await.unwrap(), json!(42));
    bridge.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_after_shutdown_fails_fast() {
    let bridge = bridge();
    bridge.execute("1").await.unwrap();
    bridge.shutdown();

    let started = Instant::now();
    assert_matches!(
        bridge.execute("1").await,
        Err(SandboxError::PoolExhausted(_))
    );
    assert!(started.elapsed() < Duration::from_millis(500));
}
