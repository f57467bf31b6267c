//! Bridge properties: scope rewind, handle isolation, lock discipline,
//! callback round trips and termination

use parking_lot::Mutex;
use proptest::prelude::*;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tern_core::{
    BridgeError, BridgeResult, Context, HandleRef, HandleTable, Isolate, LockStats, Value,
};
use tern_engine::{ErrorKind, Persistent, RawIsolate, RawValue};

fn setup() -> (Isolate, Context) {
    let isolate = Isolate::new();
    let context = Context::new(&isolate).unwrap();
    (isolate, context)
}

#[derive(Debug, Clone, Copy)]
enum TableOp {
    Add,
    Push,
    Pop,
}

fn table_op() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        2 => Just(TableOp::Add),
        1 => Just(TableOp::Push),
        1 => Just(TableOp::Pop),
    ]
}

proptest! {
    #[test]
    fn test_scope_rewind_correctness(ops in prop::collection::vec(table_op(), 1..200)) {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        // (scope id, length at push, handles minted inside)
        let mut open: Vec<(u32, usize, Vec<HandleRef>)> = Vec::new();
        let mut released: Vec<HandleRef> = Vec::new();

        for (step, op) in ops.into_iter().enumerate() {
            match op {
                TableOp::Add => {
                    let handle = table.add_value(Persistent::new(&isolate, RawValue::Number(step as f64)));
                    if let Some((_, _, minted)) = open.last_mut() {
                        minted.push(handle);
                    }
                }
                TableOp::Push => open.push((table.push_scope(), table.len(), Vec::new())),
                TableOp::Pop => {
                    let Some((scope, length, minted)) = open.pop() else {
                        continue;
                    };
                    prop_assert!(table.pop_scope(scope));
                    prop_assert_eq!(table.len(), length);
                    prop_assert!(minted.iter().all(|handle| handle.index as usize >= length));
                    released.extend(minted);
                    // A popped scope id never becomes current again, so
                    // released handles stay obsolete even once their index
                    // is reused.
                    for handle in &released {
                        prop_assert!(matches!(
                            table.get_value(*handle),
                            Err(BridgeError::ObsoleteHandle { .. })
                        ), "released handle was not rejected as obsolete");
                    }
                }
            }
        }
        prop_assert_eq!(table.depth(), open.len());
    }
}

#[test]
fn test_scope_mismatch_rejection() {
    let (_isolate, context) = setup();
    let outer = context.push_scope().unwrap();
    let kept = context.integer(1).unwrap();
    let inner = context.push_scope().unwrap();
    context.integer(2).unwrap();
    let before = context.handle_count();

    assert!(!context.pop_scope(outer).unwrap());
    assert!(!context.pop_scope(inner + 1000).unwrap());
    assert_eq!(context.handle_count(), before);
    assert_eq!(kept.to_number().unwrap(), 1.0);

    assert!(context.pop_scope(inner).unwrap());
    assert!(context.pop_scope(outer).unwrap());
    assert!(!context.pop_scope(outer).unwrap());
}

#[test]
fn test_handle_isolation() {
    let (isolate, first) = setup();
    let second = Context::new(&isolate).unwrap();
    for _ in 0..4 {
        second.integer(0).unwrap();
    }
    let value = first.string("mine").unwrap();

    assert!(first.value_from_handle(value.handle()).is_ok());
    assert!(matches!(
        second.value_from_handle(value.handle()),
        Err(BridgeError::ObsoleteHandle { .. })
    ));
}

#[test]
fn test_round_trip_of_representative_values() {
    let (_isolate, context) = setup();
    let object = context.new_object().unwrap();
    object.set("a", &context.integer(1).unwrap()).unwrap();

    let values: Vec<Value> = vec![
        context.boolean(true).unwrap(),
        context.boolean(false).unwrap(),
        context.integer(0).unwrap(),
        context.integer(-1).unwrap(),
        context.string("hi").unwrap(),
        object.clone().into_value(),
    ];
    for value in &values {
        let again = context.value_from_handle(value.handle()).unwrap();
        assert!(again.same_value(value).unwrap(), "{value:?}");
    }
    assert!(values[0].to_boolean().unwrap());
    assert!(!values[1].to_boolean().unwrap());
    assert_eq!(values[2].to_number().unwrap(), 0.0);
    assert_eq!(values[3].to_int32().unwrap(), -1);
    assert_eq!(values[4].to_string().unwrap(), "hi");
    let a = values[5].as_object().unwrap().get("a").unwrap();
    assert_eq!(a.to_number().unwrap(), 1.0);
}

fn assert_one_lock_cycle<T>(isolate: &Isolate, op: impl FnOnce() -> BridgeResult<T>) -> BridgeResult<T> {
    let before = isolate.lock_stats();
    let result = op();
    let after = isolate.lock_stats();
    assert_eq!(
        after,
        LockStats {
            acquires: before.acquires + 1,
            releases: before.releases + 1,
        }
    );
    assert!(!isolate.execution_lock().is_locked());
    result
}

#[test]
fn test_lock_discipline() {
    let (isolate, context) = setup();
    let object = context.new_object().unwrap();
    let function = context
        .eval("(function (x) { if (x) { throw new Error('boom'); } return 1; })")
        .unwrap()
        .as_function()
        .unwrap();
    let yes = context.boolean(true).unwrap();
    let undefined = context.undefined().unwrap();

    assert_one_lock_cycle(&isolate, || context.eval("1 + 1")).unwrap();
    assert_one_lock_cycle(&isolate, || context.eval("throw new Error('x')")).unwrap_err();
    assert_one_lock_cycle(&isolate, || context.eval("syntax error here")).unwrap_err();
    assert_one_lock_cycle(&isolate, || object.set("k", &yes)).unwrap();
    assert_one_lock_cycle(&isolate, || object.get("k")).unwrap();
    assert_one_lock_cycle(&isolate, || object.has_idx(0)).unwrap();
    assert_one_lock_cycle(&isolate, || object.delete("k")).unwrap();
    assert_one_lock_cycle(&isolate, || function.call(&undefined, &[])).unwrap();
    assert_one_lock_cycle(&isolate, || function.call(&undefined, &[&yes])).unwrap_err();
    assert_one_lock_cycle(&isolate, || context.json_parse("{\"a\":1}")).unwrap();
    assert_one_lock_cycle(&isolate, || context.json_parse("{")).unwrap_err();
    assert_one_lock_cycle(&isolate, || context.push_scope()).unwrap();

    let scope = context.push_scope().unwrap();
    let stale = context.integer(5).unwrap();
    context.pop_scope(scope).unwrap();
    assert_one_lock_cycle(&isolate, || stale.to_number()).unwrap_err();
}

#[test]
fn test_lock_discipline_through_callbacks() {
    let (isolate, context) = setup();
    let echo = isolate
        .new_function_template(|info| info.arg(0).cloned())
        .get_function(&context)
        .unwrap();
    context.global().unwrap().set("echo", &echo).unwrap();

    // The trampoline re-enters the lock the script already holds
    let before = isolate.lock_stats();
    context.eval("echo(1)").unwrap();
    let after = isolate.lock_stats();
    assert_eq!(after.acquires - before.acquires, after.releases - before.releases);
    assert!(!isolate.execution_lock().is_locked());
}

#[test]
fn test_callback_round_trip() {
    let (isolate, context) = setup();
    let other = Context::new(&isolate).unwrap();
    let seen: Arc<Mutex<Option<(u32, HandleRef)>>> = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let identity = isolate
        .new_function_template(move |info| {
            let first = info.arg(0)?.clone();
            *sink.lock() = Some((info.context().id(), first.handle()));
            Some(first)
        })
        .get_function(&context)
        .unwrap();
    context.global().unwrap().set("identity", &identity).unwrap();

    let result = context.eval("identity(42)").unwrap();
    assert_eq!(result.to_number().unwrap(), 42.0);

    let (context_id, handle) = seen.lock().take().unwrap();
    assert_eq!(context_id, context.id());
    let rooted = context.value_from_handle(handle).unwrap();
    assert_eq!(rooted.to_number().unwrap(), 42.0);
    assert!(other.value_from_handle(handle).is_err());
}

#[test]
fn test_scenario_popped_scope_values_are_obsolete() {
    let (_isolate, context) = setup();
    let scope = context.push_scope().unwrap();
    let values = [
        context.integer(1).unwrap(),
        context.string("two").unwrap(),
        context.new_object().unwrap().into_value(),
    ];
    assert!(context.pop_scope(scope).unwrap());

    for value in &values {
        assert!(matches!(
            value.to_string(),
            Err(BridgeError::ObsoleteHandle { .. })
        ));
        assert!(matches!(
            context.value_from_handle(value.handle()),
            Err(BridgeError::ObsoleteHandle { .. })
        ));
    }
}

#[test]
fn test_scenario_cross_context_resolution_fails() {
    let (isolate, first) = setup();
    let second = Context::new(&isolate).unwrap();
    let value = first.eval("({made: 'in first'})").unwrap();
    assert!(second.value_from_handle(value.handle()).is_err());
}

#[test]
fn test_scenario_termination_from_another_thread() {
    let (isolate, context) = setup();
    let remote = isolate.clone();
    let terminator = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.terminate_execution();
    });

    let err = context.eval("while (true) {}").unwrap_err();
    terminator.join().unwrap();
    assert!(err.is_terminated(), "{err:?}");
    assert!(!err.is_script_error());
    assert!(err.stack_trace().is_none());

    assert!(!isolate.is_execution_terminating());
    assert_eq!(context.eval("2 + 2").unwrap().to_number().unwrap(), 4.0);
}

#[test]
fn test_operations_wait_for_pinned_lock() {
    let (isolate, context) = setup();
    isolate.lock();
    let remote = context.clone();
    let worker = thread::spawn(move || remote.eval("'done'").unwrap().to_string().unwrap());
    thread::sleep(Duration::from_millis(50));
    assert!(!worker.is_finished());
    isolate.unlock();
    assert_eq!(worker.join().unwrap(), "done");
}

#[test]
fn test_collected_after_scope_pop() {
    let (isolate, context) = setup();
    let baseline = isolate.heap_statistics().live_objects;
    context
        .with_scope(|cx| {
            for _ in 0..100 {
                cx.new_object().unwrap();
            }
        })
        .unwrap();
    isolate.collect_garbage();
    assert!(isolate.heap_statistics().live_objects <= baseline);
}

#[test]
fn test_dispose_drops_callbacks() {
    let (isolate, context) = setup();
    isolate.new_function_template(|_| None);
    assert_eq!(isolate.callback_count(), 1);
    assert_eq!(isolate.context_count(), 1);
    isolate.dispose();
    assert_eq!(isolate.callback_count(), 0);
    assert_eq!(isolate.context_count(), 0);
    assert!(context.is_closed());
}

#[test]
#[serial]
fn test_scope_ids_are_process_unique() {
    tern_core::init();
    tern_core::init();
    let (isolate, first) = setup();
    let second = Context::new(&isolate).unwrap();
    let a = first.push_scope().unwrap();
    let b = second.push_scope().unwrap();
    let c = first.push_scope().unwrap();
    assert!(a < b && b < c);
}

#[test]
fn test_function_of_closed_context_returns_undefined() {
    let (isolate, home) = setup();
    let away = Context::new(&isolate).unwrap();
    let answer = isolate
        .new_function_template(|info| info.context().integer(42).ok())
        .get_function(&home)
        .unwrap();
    away.global().unwrap().set("answer", &answer).unwrap();
    assert_eq!(away.eval("answer()").unwrap().to_number().unwrap(), 42.0);

    home.close();
    assert!(away.eval("answer()").unwrap().is_undefined().unwrap());
    assert_eq!(away.eval("typeof answer()").unwrap().to_string().unwrap(), "undefined");
}

#[test]
fn test_throw_exception_requires_a_running_callback() {
    let (isolate, context) = setup();
    let error = context.new_error(ErrorKind::Error, "stray").unwrap();
    assert!(matches!(
        isolate.throw_exception(&error),
        Err(BridgeError::NoActiveCallback)
    ));

    // Nothing was left behind for the next callback to raise
    let echo = isolate
        .new_function_template(|info| info.arg(0).cloned())
        .get_function(&context)
        .unwrap();
    context.global().unwrap().set("echo", &echo).unwrap();
    assert_eq!(context.eval("echo(5)").unwrap().to_number().unwrap(), 5.0);
}

#[test]
fn test_nested_callbacks_keep_their_own_exception() {
    let (isolate, context) = setup();
    let inner = isolate
        .new_function_template(|info| info.context().integer(5).ok())
        .get_function(&context)
        .unwrap();
    let nested: Arc<Mutex<Option<f64>>> = Arc::new(Mutex::new(None));
    let sink = nested.clone();
    let outer = isolate
        .new_function_template(move |info| {
            let error = info.context().new_error(ErrorKind::TypeError, "outer failed").ok()?;
            info.isolate().throw_exception(&error).ok()?;
            let value = info.context().eval("inner()").ok()?;
            *sink.lock() = value.to_number().ok();
            None
        })
        .get_function(&context)
        .unwrap();
    let global = context.global().unwrap();
    global.set("inner", &inner).unwrap();
    global.set("outer", &outer).unwrap();

    let caught = context
        .eval("try { outer(); 'no' } catch (e) { e.name + ': ' + e.message }")
        .unwrap();
    assert_eq!(caught.to_string().unwrap(), "TypeError: outer failed");
    assert_eq!(*nested.lock(), Some(5.0));
}

#[test]
fn test_stale_callback_result_raises() {
    let (isolate, context) = setup();
    let stale = isolate
        .new_function_template(|info| info.context().with_scope(|cx| cx.integer(5).unwrap()).ok())
        .get_function(&context)
        .unwrap();
    context.global().unwrap().set("stale", &stale).unwrap();

    let caught = context
        .eval("try { stale(); 'no' } catch (e) { e.message }")
        .unwrap()
        .to_string()
        .unwrap();
    assert!(caught.contains("unusable value"), "{caught}");
}
