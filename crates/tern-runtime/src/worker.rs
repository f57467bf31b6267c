//! Worker thread implementation for script execution
//!
//! Each worker owns one isolate and one context and processes jobs from a
//! shared queue. Every job runs inside its own handle scope, so a worker's
//! handle table does not grow across jobs. Once a job's scope is gone the
//! worker collects the heap if it is at least half full, so garbage from
//! earlier jobs never counts against a later one. Panics during a job are
//! caught and reported through the job's response channel.

use crate::engine::EngineStats;
use crate::error::{RuntimeError, RuntimeResult};
use crate::extension::to_json;
use crate::watchdog::WorkerSlot;
use crossbeam_channel::Receiver;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tern_core::{BridgeError, BridgeResult, Context, JsError, PromiseState, Value};
use tokio::sync::oneshot;
use tracing::{debug, error, info_span, trace};

/// Job submitted to the engine for execution
pub(crate) enum Job {
    /// Evaluate script source
    Eval {
        script: String,
        source_url: Option<String>,
        response: oneshot::Sender<RuntimeResult<serde_json::Value>>,
    },
    /// Call a global function
    Call {
        function: String,
        args: Vec<serde_json::Value>,
        response: oneshot::Sender<RuntimeResult<serde_json::Value>>,
    },
    /// Shutdown signal
    Shutdown,
}

/// Process jobs on `context` until shutdown is signalled or the queue
/// disconnects, then dispose the worker's isolate
pub(crate) fn run_worker(
    job_rx: Receiver<Job>,
    context: Context,
    slot: Arc<WorkerSlot>,
    stats: Arc<EngineStats>,
) {
    let thread_name = std::thread::current()
        .name()
        .unwrap_or("tern-worker")
        .to_string();

    let _span = info_span!("worker", name = %thread_name).entered();
    debug!(context = context.id(), "Worker starting");

    while let Ok(job) = job_rx.recv() {
        if matches!(job, Job::Shutdown) {
            debug!("Received shutdown signal");
            break;
        }
        execute_job(&context, &slot, job, &stats);
        reclaim(&context);
    }

    let isolate = context.isolate().clone();
    context.close();
    isolate.dispose();
    debug!("Worker stopped");
}

fn execute_job(context: &Context, slot: &WorkerSlot, job: Job, stats: &EngineStats) {
    match job {
        Job::Shutdown => {}
        Job::Eval {
            script,
            source_url,
            response,
        } => {
            let origin = source_url.as_deref().unwrap_or("<eval>");
            let _span = info_span!("eval", source = origin).entered();
            let result = run_with_deadline(slot, || execute_eval(context, &script, origin));
            update_stats(stats, &result);
            let _ = response.send(result);
        }
        Job::Call {
            function,
            args,
            response,
        } => {
            let _span = info_span!("call", function = %function).entered();
            let result = run_with_deadline(slot, || execute_call(context, &function, args));
            update_stats(stats, &result);
            let _ = response.send(result);
        }
    }
}

/// Collect once live objects reach half the heap limit
fn reclaim(context: &Context) {
    let isolate = context.isolate();
    let before = isolate.heap_statistics();
    if before.live_objects < before.max_objects / 2 {
        return;
    }
    if isolate.collect_garbage() {
        let after = isolate.heap_statistics();
        debug!(
            before = before.live_objects,
            after = after.live_objects,
            "Collected worker heap"
        );
    }
}

/// Run a job under the worker's deadline, turning a watchdog termination
/// into [`RuntimeError::Timeout`]
fn run_with_deadline<F>(slot: &WorkerSlot, f: F) -> RuntimeResult<serde_json::Value>
where
    F: FnOnce() -> RuntimeResult<serde_json::Value>,
{
    slot.begin();
    let result = execute_with_panic_handler(f);
    let timed_out = slot.finish();
    match result {
        Err(RuntimeError::Bridge(BridgeError::Terminated)) if timed_out => {
            Err(RuntimeError::Timeout(slot.timeout_ms()))
        }
        other => other,
    }
}

/// Execute a closure with panic handling
fn execute_with_panic_handler<F>(f: F) -> RuntimeResult<serde_json::Value>
where
    F: FnOnce() -> RuntimeResult<serde_json::Value>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Worker panic: {}", s)
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Worker panic: {}", s)
            } else {
                "Worker panic: unknown error".to_string()
            };
            error!("{}", message);
            Err(RuntimeError::internal(message))
        }
    }
}

/// Update engine statistics based on job result
fn update_stats(stats: &EngineStats, result: &RuntimeResult<serde_json::Value>) {
    stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
    match result {
        Ok(_) => {}
        Err(err) => {
            stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
            if err.is_timeout() {
                stats.jobs_timed_out.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn execute_eval(context: &Context, script: &str, origin: &str) -> RuntimeResult<serde_json::Value> {
    context.with_scope(|cx| -> RuntimeResult<serde_json::Value> {
        let value = cx.run_script(script, origin)?;
        settle(cx, value)
    })?
}

fn execute_call(
    context: &Context,
    function: &str,
    args: Vec<serde_json::Value>,
) -> RuntimeResult<serde_json::Value> {
    context.with_scope(|cx| -> RuntimeResult<serde_json::Value> {
        let callee = cx.global()?.get(function)?.as_function()?;
        let args = args
            .iter()
            .map(|arg| cx.serialize(arg))
            .collect::<BridgeResult<Vec<_>>>()?;
        let args: Vec<&Value> = args.iter().collect();
        let value = callee.call(&cx.undefined()?, &args)?;
        settle(cx, value)
    })?
}

/// JSON form of a job's result, unwrapping promises
fn settle(context: &Context, value: Value) -> RuntimeResult<serde_json::Value> {
    if !value.is_promise()? {
        return Ok(to_json(&value)?);
    }
    let promise = value.as_promise()?;
    context.isolate().perform_microtask_checkpoint()?;
    let state = promise.state()?;
    trace!(?state, "Settled promise result");
    match state {
        PromiseState::Fulfilled => Ok(to_json(&promise.result()?)?),
        PromiseState::Rejected => Err(rejection(&promise.result()?).into()),
        PromiseState::Pending => Err(RuntimeError::internal(
            "Promise is still pending after the microtask checkpoint",
        )),
    }
}

/// Structured error for a rejected promise
fn rejection(reason: &Value) -> BridgeError {
    let message = reason
        .to_detail_string()
        .unwrap_or_else(|err| err.to_string());
    let stack = if reason.is_error().unwrap_or(false) {
        reason
            .as_object()
            .and_then(|error| error.get("stack"))
            .and_then(|stack| stack.to_string())
            .ok()
    } else {
        None
    };
    BridgeError::Engine(JsError {
        message,
        location: None,
        stack,
    })
}
