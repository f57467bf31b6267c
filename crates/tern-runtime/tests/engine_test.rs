//! Integration tests for the worker-pool engine

use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tern_runtime::{
    ENV_POOL_SIZE, ENV_TIMEOUT_MS, Engine, Extension, HeapLimits, RuntimeConfig, RuntimeError, op_sync,
};

fn small_engine() -> Engine {
    Engine::builder()
        .pool_size(2)
        .enable_console(false)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_eval_values() {
    let engine = small_engine();
    let handle = engine.handle();

    assert_eq!(handle.eval("1 + 1").await.unwrap(), json!(2));
    assert_eq!(handle.eval("'tern' + '!'").await.unwrap(), json!("tern!"));
    assert_eq!(
        handle.eval("({name: 'a', tags: [1, true, null]})").await.unwrap(),
        json!({"name": "a", "tags": [1, true, null]})
    );
    assert_eq!(
        handle.eval("[1, 2, 3].map(x => x * 2)").await.unwrap(),
        json!([2, 4, 6])
    );
    assert_eq!(handle.eval("undefined").await.unwrap(), json!(null));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_call_global_function() {
    let engine = Engine::builder()
        .pool_size(1)
        .enable_console(false)
        .build()
        .unwrap();
    let handle = engine.handle();

    handle
        .eval("globalThis.greet = function (who, n) { return {msg: 'hi ' + who, n: n + 1}; }")
        .await
        .unwrap();
    let result = handle.call("greet", vec![json!("bob"), json!(41)]).await.unwrap();
    assert_eq!(result, json!({"msg": "hi bob", "n": 42}));

    let err = handle.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Bridge(_)));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_promise_results_are_settled() {
    let engine = small_engine();
    let handle = engine.handle();

    let fulfilled = handle
        .eval("Promise.resolve(20).then(x => ({value: x + 1}))")
        .await
        .unwrap();
    assert_eq!(fulfilled, json!({"value": 21}));

    let rejected = handle
        .eval("Promise.reject(new RangeError('too far'))")
        .await
        .unwrap_err();
    assert!(rejected.is_script_error());
    assert!(rejected.to_string().contains("RangeError: too far"));

    let pending = handle.eval("new Promise(function () {})").await.unwrap_err();
    assert!(!pending.is_script_error());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_script_errors_keep_location() {
    let engine = small_engine();
    let handle = engine.handle();

    let err = handle
        .eval_with_source("let x = 1;\nx.nope.deeper", "job.js")
        .await
        .unwrap_err();
    assert!(err.is_script_error());
    match err {
        RuntimeError::Bridge(bridge) => {
            assert!(bridge.location().unwrap().starts_with("job.js:"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The worker survives a failed job
    assert_eq!(handle.eval("2 * 21").await.unwrap(), json!(42));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_runaway_script_times_out() {
    let engine = Engine::builder()
        .pool_size(1)
        .timeout_ms(50)
        .enable_console(false)
        .build()
        .unwrap();
    let handle = engine.handle();

    let err = handle.eval("while (true) {}").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Timeout(50)));

    // Termination is cleared before the next job
    assert_eq!(handle.eval("'alive'").await.unwrap(), json!("alive"));

    let stats = engine.stats().snapshot();
    assert_eq!(stats.jobs_timed_out, 1);
    assert_eq!(stats.jobs_failed, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_garbage_from_earlier_jobs_is_reclaimed() {
    let engine = Engine::builder()
        .pool_size(1)
        .enable_console(false)
        .heap_limits(HeapLimits {
            max_objects: 5000,
            ..HeapLimits::default()
        })
        .build()
        .unwrap();
    let handle = engine.handle();

    // Far more arrays in total than the heap can hold at once
    let job = "var n = 0; for (var i = 0; i < 50; i++) { n += [i].length; } n";
    for _ in 0..300 {
        assert_eq!(handle.eval(job).await.unwrap(), json!(50));
    }

    let stats = engine.stats().snapshot();
    assert_eq!(stats.jobs_failed, 0);
    assert_eq!(stats.jobs_completed, 300);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_extension_ops() {
    struct Calls(AtomicU64);

    let seen = Arc::new(AtomicU64::new(0));
    let seen_by_op = seen.clone();
    let ext = Extension::new("kv")
        .with_init(|state| state.put(Calls(AtomicU64::new(0))))
        .with_ops(vec![
            op_sync("kv_echo", move |ctx, args| {
                seen_by_op.fetch_add(1, Ordering::SeqCst);
                let calls = ctx.state().get::<Calls>().map_or(0, |calls| {
                    calls.0.fetch_add(1, Ordering::SeqCst) + 1
                });
                Ok(json!({"args": args, "calls": calls}))
            }),
            op_sync("kv_fail", |_, _| Err(RuntimeError::op("store offline"))),
        ])
        .with_js("globalThis.kv = { echo: kv_echo, fail: kv_fail };");

    let engine = Engine::builder()
        .pool_size(1)
        .enable_console(false)
        .extension(ext)
        .build()
        .unwrap();
    let handle = engine.handle();

    let result = handle.eval("kv.echo('a', [1, 2])").await.unwrap();
    assert_eq!(result, json!({"args": ["a", [1, 2]], "calls": 1}));
    let result = handle.eval("kv.echo().calls").await.unwrap();
    assert_eq!(result, json!(2));

    let caught = handle
        .eval("try { kv.fail() } catch (e) { e.message }")
        .await
        .unwrap();
    assert_eq!(caught, json!("store offline"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_try_eval_reports_full_queue() {
    let engine = Engine::builder()
        .pool_size(1)
        .queue_capacity(1)
        .timeout_ms(200)
        .enable_console(false)
        .build()
        .unwrap();
    let handle = engine.handle();

    // Occupy the only worker, then fill the only queue slot
    let busy = tokio::spawn({
        let handle = handle.clone();
        async move { handle.eval("while (true) {}").await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let queued = tokio::spawn({
        let handle = handle.clone();
        async move { handle.eval("'queued'").await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let err = handle.try_eval("1").await.unwrap_err();
    assert!(matches!(err, RuntimeError::QueueFull));

    assert!(busy.await.unwrap().unwrap_err().is_timeout());
    assert_eq!(queued.await.unwrap().unwrap(), json!("queued"));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stats_and_shutdown() {
    let engine = small_engine();
    let handle = engine.handle();
    assert!(engine.is_running());
    assert_eq!(engine.pool_size(), 2);

    handle.eval("1").await.unwrap();
    handle.eval("throw new Error('x')").await.unwrap_err();

    let stats = handle.stats().snapshot();
    assert_eq!(stats.jobs_submitted, 2);
    assert_eq!(stats.jobs_completed, 2);
    assert_eq!(stats.jobs_failed, 1);
    assert_eq!(stats.success_rate(), 50.0);
    assert_eq!(handle.stats().jobs_in_flight(), 0);

    engine.shutdown().await;
    assert!(matches!(
        handle.eval("1").await.unwrap_err(),
        RuntimeError::Shutdown
    ));
}

#[test]
#[serial]
fn test_config_from_env() {
    // SAFETY: serialized with the other environment tests
    unsafe {
        std::env::set_var(ENV_POOL_SIZE, "3");
        std::env::set_var(ENV_TIMEOUT_MS, "250");
    }
    let config = RuntimeConfig::from_env().unwrap();
    assert_eq!(config.pool_size, 3);
    assert_eq!(config.timeout_ms, 250);

    unsafe {
        std::env::set_var(ENV_TIMEOUT_MS, "soon");
    }
    assert!(matches!(
        RuntimeConfig::from_env(),
        Err(RuntimeError::Config(_))
    ));

    unsafe {
        std::env::remove_var(ENV_POOL_SIZE);
        std::env::remove_var(ENV_TIMEOUT_MS);
    }
}
