//! Engine behavior through the public raw surface

use std::thread;
use std::time::Duration;
use tern_engine::{
    CallbackInfo, EngineResult, ErrorKind, HeapLimits, Persistent, RawContext, RawIsolate, RawPromiseState,
    RawValue, Throw, ValueKind,
};

fn setup() -> (RawIsolate, RawContext) {
    let isolate = RawIsolate::default();
    let context = RawContext::new(&isolate).unwrap();
    (isolate, context)
}

fn eval(context: &RawContext, source: &str) -> RawValue {
    context.run_script(source, "test.js").unwrap()
}

fn eval_string(context: &RawContext, source: &str) -> String {
    let value = eval(context, source);
    context.to_string(&value)
}

fn exception(result: EngineResult<RawValue>) -> tern_engine::ExceptionDetails {
    match result {
        Err(Throw::Exception(details)) => details,
        other => panic!("expected an exception, got {other:?}"),
    }
}

#[test]
fn test_completion_value() {
    let (_isolate, context) = setup();
    assert_eq!(eval(&context, "let x = 2; x * 21").as_number(), Some(42.0));
    assert_eq!(eval_string(&context, "'tern' + '-' + 1"), "tern-1");
    assert!(eval(&context, "var y = 1;").is_undefined());
}

#[test]
fn test_closures_capture_their_environment() {
    let (_isolate, context) = setup();
    let source = r#"
        function counter() {
            let n = 0;
            return () => { n += 1; return n; };
        }
        const c = counter();
        c(); c(); c()
    "#;
    assert_eq!(eval(&context, source).as_number(), Some(3.0));
}

#[test]
fn test_type_error_location() {
    let (_isolate, context) = setup();
    let details = exception(context.run_script("null.foo", "test.js"));
    assert_eq!(
        details.message,
        "TypeError: Cannot read properties of null (reading 'foo')"
    );
    assert!(details.location.unwrap().starts_with("test.js:1:"));
    assert_eq!(context.value_kind(&details.exception), ValueKind::Error);
}

#[test]
fn test_stack_names_functions() {
    let (_isolate, context) = setup();
    let source = "function fail() { throw new Error('boom'); }\nfail();";
    let details = exception(context.run_script(source, "stack.js"));
    assert_eq!(details.message, "Error: boom");
    let stack = details.stack.unwrap();
    assert!(stack.starts_with("Error: boom\n"));
    assert!(stack.contains("at fail (stack.js:1:"), "{stack}");
    assert!(stack.contains("at stack.js:2:"), "{stack}");
}

#[test]
fn test_reference_and_const_errors() {
    let (_isolate, context) = setup();
    let details = exception(context.run_script("missing + 1", "test.js"));
    assert_eq!(details.message, "ReferenceError: missing is not defined");
    assert_eq!(eval_string(&context, "typeof missing"), "undefined");

    let details = exception(context.run_script("function f() { const k = 1; k = 2; } f()", "test.js"));
    assert_eq!(details.message, "TypeError: Assignment to constant variable.");
}

#[test]
fn test_try_catch_finally() {
    let (_isolate, context) = setup();
    let source = r#"
        let log = [];
        try {
            throw new TypeError("bad");
        } catch (e) {
            log.push(e.name + ":" + e.message);
        } finally {
            log.push("done");
        }
        log.join("|")
    "#;
    assert_eq!(eval_string(&context, source), "TypeError:bad|done");
}

#[test]
fn test_syntax_error() {
    let (_isolate, context) = setup();
    let details = exception(context.run_script("let = ;", "broken.js"));
    assert!(details.message.starts_with("SyntaxError:"), "{}", details.message);
    assert!(details.location.unwrap().starts_with("broken.js:1:"));
}

#[test]
fn test_microtasks_drain_after_script() {
    let (_isolate, context) = setup();
    let source = r#"
        var out = [];
        Promise.resolve(1).then(v => { out.push(v + 1); });
        out.length
    "#;
    assert_eq!(eval(&context, source).as_number(), Some(0.0));
    assert_eq!(eval(&context, "out[0]").as_number(), Some(2.0));
}

#[test]
fn test_promise_chains() {
    let (_isolate, context) = setup();
    eval(
        &context,
        r#"
        var result, caught;
        new Promise((resolve) => resolve(20)).then(v => v * 2).then(v => { result = v; });
        Promise.reject(new Error("nope")).catch(e => { caught = e.message; });
    "#,
    );
    assert_eq!(eval(&context, "result").as_number(), Some(40.0));
    assert_eq!(eval_string(&context, "caught"), "nope");
}

#[test]
fn test_host_resolver() {
    let (_isolate, context) = setup();
    let resolver = context.new_promise_resolver().unwrap();
    let promise = context.resolver_promise(&resolver).unwrap();
    assert_eq!(context.promise_state(&promise), Some(RawPromiseState::Pending));

    assert!(context.resolve(&resolver, RawValue::Number(5.0)).unwrap());
    assert!(!context.reject(&resolver, RawValue::Null).unwrap());
    assert_eq!(context.promise_state(&promise), Some(RawPromiseState::Fulfilled));
    assert_eq!(context.promise_result(&promise).unwrap().as_number(), Some(5.0));
}

#[test]
fn test_json_round_trip() {
    let (_isolate, context) = setup();
    let text = r#"{"a":[1,2,{"b":null}],"c":"s","d":1.5}"#;
    let value = context.json_parse(text).unwrap();
    assert_eq!(context.json_stringify(&value).unwrap().as_deref(), Some(text));

    let source = "JSON.stringify({a: undefined, b: function() {}, c: [undefined]})";
    assert_eq!(eval_string(&context, source), r#"{"c":[null]}"#);
    assert_eq!(context.json_stringify(&RawValue::Undefined).unwrap(), None);
}

#[test]
fn test_json_errors() {
    let (_isolate, context) = setup();
    let details = exception(context.run_script("var o = {}; o.self = o; JSON.stringify(o)", "test.js"));
    assert_eq!(details.message, "TypeError: Converting circular structure to JSON");

    match context.json_parse("{oops") {
        Err(Throw::Exception(details)) => assert!(details.message.starts_with("SyntaxError:")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_terminate_from_another_thread() {
    let (isolate, context) = setup();
    let remote = isolate.clone();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.terminate_execution();
    });
    let result = context.run_script("while (true) {}", "spin.js");
    killer.join().unwrap();
    assert!(matches!(result, Err(Throw::Terminated)));
    assert!(!isolate.is_execution_terminating());
    assert_eq!(eval(&context, "1 + 1").as_number(), Some(2.0));
}

#[test]
fn test_call_depth_limit() {
    thread::Builder::new()
        .stack_size(32 * 1024 * 1024)
        .spawn(|| {
            let (_isolate, context) = setup();
            let details = exception(context.run_script("function f() { return f(); } f()", "deep.js"));
            assert_eq!(details.message, "RangeError: Maximum call stack size exceeded");
        })
        .unwrap()
        .join()
        .unwrap();
}

#[test]
fn test_heap_limit_terminates() {
    let isolate = RawIsolate::new(HeapLimits {
        max_objects: 2_000,
        ..HeapLimits::default()
    });
    let context = RawContext::new(&isolate).unwrap();
    let result = context.run_script("var a = []; while (true) { a.push({}); }", "grow.js");
    assert!(matches!(result, Err(Throw::Terminated)));
    assert!(!isolate.is_execution_terminating());
}

#[test]
fn test_collection_keeps_reachable_objects() {
    let (isolate, context) = setup();
    eval(
        &context,
        "var keep = (function () { let secret = 7; return () => secret; })();",
    );
    let garbage = context.new_object().unwrap();
    let before = isolate.heap_statistics().live_objects;

    assert!(isolate.collect_garbage());
    assert!(isolate.heap_statistics().live_objects < before);
    assert!(!context.contains(&garbage));
    assert_eq!(eval(&context, "keep()").as_number(), Some(7.0));
}

#[test]
fn test_persistent_roots() {
    let (isolate, context) = setup();
    let object = context.new_object().unwrap();
    let root = Persistent::new(&isolate, object.clone());
    let copy = root.clone();
    drop(root);
    isolate.collect_garbage();
    assert!(context.contains(&object));
    assert!(copy.belongs_to(&isolate));
    drop(copy);
    isolate.collect_garbage();
    assert!(!context.contains(&object));
}

fn add(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let context = info.context();
    Ok(RawValue::Number(
        context.to_number(&info.arg(0)) + context.to_number(&info.arg(1)) + f64::from(info.data()),
    ))
}

#[test]
fn test_native_functions() {
    let (_isolate, context) = setup();
    let function = context.new_function(add, 100, "add").unwrap();
    let global = context.global().unwrap();
    context.set(&global, "add", function.clone()).unwrap();

    assert_eq!(eval(&context, "add(2, 3)").as_number(), Some(105.0));
    assert_eq!(eval_string(&context, "add.name"), "add");
    let direct = context
        .call(&function, &RawValue::Undefined, &[RawValue::Number(1.0)])
        .unwrap();
    assert!(direct.as_number().unwrap().is_nan());
}

#[test]
fn test_error_objects_from_host() {
    let (_isolate, context) = setup();
    let error = context.new_error(ErrorKind::RangeError, "out of range").unwrap();
    assert_eq!(context.to_string(&error), "RangeError: out of range");
    assert_eq!(context.get(&error, "message").unwrap().as_str(), Some("out of range"));
    assert_eq!(context.own_keys(&error).unwrap(), Vec::<String>::new());
}

#[test]
fn test_compiled_script_runs_per_context() {
    let isolate = RawIsolate::default();
    let first = RawContext::new(&isolate).unwrap();
    let second = RawContext::new(&isolate).unwrap();
    let script = isolate
        .compile("var hits = (typeof hits === 'undefined' ? 0 : hits) + 1; hits", "shared.js")
        .unwrap();

    assert_eq!(first.run_compiled(&script).unwrap().as_number(), Some(1.0));
    assert_eq!(first.run_compiled(&script).unwrap().as_number(), Some(2.0));
    assert_eq!(second.run_compiled(&script).unwrap().as_number(), Some(1.0));
    assert_eq!(isolate.heap_statistics().contexts, 2);

    second.dispose();
    assert!(matches!(second.run_compiled(&script), Err(Throw::Disposed("context"))));
}

#[test]
fn test_embedder_data_and_dispose() {
    let (isolate, context) = setup();
    context.set_embedder_data(1, RawValue::Number(9.0));
    assert_eq!(context.embedder_data(1).unwrap().as_number(), Some(9.0));
    assert!(context.embedder_data(7).is_none());

    isolate.dispose();
    assert!(isolate.is_disposed());
    assert!(matches!(context.run_script("1", "x.js"), Err(Throw::Disposed(_))));
}

fn explode(_: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    panic!("native blew up");
}

fn install_explode(context: &RawContext) {
    let function = context.new_function(explode, 0, "explode").unwrap();
    let global = context.global().unwrap();
    context.set(&global, "explode", function).unwrap();
}

#[test]
fn test_panicking_native_leaves_isolate_usable() {
    let (isolate, context) = setup();
    install_explode(&context);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        context.run_script("function outer() { explode(); } outer()", "panic.js")
    }));
    assert!(outcome.is_err());

    assert!(!isolate.is_executing());
    assert!(isolate.collect_garbage());
    let source = r#"
        var seen = [];
        Promise.resolve(7).then(v => { seen.push(v); });
        seen.length
    "#;
    assert_eq!(eval(&context, source).as_number(), Some(0.0));
    assert_eq!(eval(&context, "seen[0]").as_number(), Some(7.0));
}

#[test]
fn test_panicking_reaction_does_not_stall_the_queue() {
    let (isolate, context) = setup();
    install_explode(&context);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        context.run_script(
            r#"
            var later;
            Promise.resolve(1).then(explode);
            var chained = Promise.resolve(2).then(v => { later = v; return v * 10; });
            "#,
            "reactions.js",
        )
    }));
    assert!(outcome.is_err());
    assert!(!isolate.is_executing());

    isolate.perform_microtask_checkpoint().unwrap();
    let chained = eval(&context, "chained");
    assert_eq!(context.promise_state(&chained), Some(RawPromiseState::Fulfilled));
    assert_eq!(context.promise_result(&chained).unwrap().as_number(), Some(20.0));
    assert_eq!(eval(&context, "later").as_number(), Some(2.0));
}
