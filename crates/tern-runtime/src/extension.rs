//! Extension API for registering host ops.
//!
//! An op is a host function that takes its arguments as JSON values and
//! returns a JSON value. Ops are installed as globals in every worker
//! context; an op error becomes an `Error` thrown into the script.

use crate::error::{RuntimeError, RuntimeResult};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;
use tern_core::{Context, ErrorKind, FunctionCallbackInfo, Value};
use tracing::debug;

pub type OpResult = RuntimeResult<serde_json::Value>;
/// Type alias for extension initialization functions.
pub type ExtensionInitFn = Arc<dyn Fn(&ExtensionState) + Send + Sync>;

/// Typed state shared by the ops of one worker
#[derive(Clone, Default)]
pub struct ExtensionState {
    inner: Arc<Mutex<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl ExtensionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send + Sync>(&self, value: T) {
        self.inner.lock().insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.inner.lock().get(&TypeId::of::<T>())?.clone();
        value.downcast::<T>().ok()
    }
}

/// What an op sees besides its arguments
#[derive(Clone)]
pub struct OpContext {
    state: ExtensionState,
}

impl OpContext {
    pub fn state(&self) -> ExtensionState {
        self.state.clone()
    }
}

pub type OpHandler = Arc<dyn Fn(OpContext, Vec<serde_json::Value>) -> OpResult + Send + Sync>;

#[derive(Clone)]
pub struct OpDecl {
    name: String,
    handler: OpHandler,
}

impl OpDecl {
    pub fn name(&self) -> &str {
        &self.name
    }
}

pub fn op_sync<F>(name: &str, handler: F) -> OpDecl
where
    F: Fn(OpContext, Vec<serde_json::Value>) -> OpResult + Send + Sync + 'static,
{
    OpDecl {
        name: name.to_string(),
        handler: Arc::new(handler),
    }
}

#[derive(Clone)]
pub struct Extension {
    name: String,
    ops: Vec<OpDecl>,
    init: Option<ExtensionInitFn>,
    /// Script run after the ops are installed, typically wrappers around them
    js_code: Option<String>,
}

impl Extension {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ops: Vec::new(),
            init: None,
            js_code: None,
        }
    }

    /// Get the name of this extension
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> &[OpDecl] {
        &self.ops
    }

    pub fn with_ops(mut self, ops: Vec<OpDecl>) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_init<F>(mut self, init: F) -> Self
    where
        F: Fn(&ExtensionState) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    /// Add script code to run after the ops are installed.
    /// The code sees every op as a global function.
    pub fn with_js(mut self, js_code: &str) -> Self {
        self.js_code = Some(js_code.to_string());
        self
    }

    pub fn js_code(&self) -> Option<&str> {
        self.js_code.as_deref()
    }

    /// Run the init hook, install the ops as globals of `context`, then run
    /// the extension's script
    pub fn install(&self, context: &Context, state: &ExtensionState) -> RuntimeResult<()> {
        debug!(extension = %self.name, ops_count = self.ops.len(), "Registering extension");
        if let Some(init) = &self.init {
            init(state);
        }

        let isolate = context.isolate();
        let global = context.global()?;
        for op in &self.ops {
            let handler = op.handler.clone();
            let op_name = op.name.clone();
            let op_state = state.clone();
            let function = isolate
                .new_function_template(move |info| {
                    call_op(info, &op_name, &handler, op_state.clone())
                })
                .with_name(&op.name)
                .get_function(context)?;
            global.set(&op.name, &function)?;
        }

        if let Some(js_code) = &self.js_code {
            context.run_script(js_code, &format!("ext:{}", self.name))?;
        }
        Ok(())
    }
}

/// Bridge one script call into an op
fn call_op(
    info: &FunctionCallbackInfo,
    name: &str,
    handler: &OpHandler,
    state: ExtensionState,
) -> Option<Value> {
    let context = info.context();
    let result = info
        .args()
        .iter()
        .map(|arg| to_json(arg).map_err(RuntimeError::from))
        .collect::<RuntimeResult<Vec<_>>>()
        .and_then(|args| handler(OpContext { state }, args))
        .and_then(|value| Ok(context.serialize(&value)?));

    match result {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(op = name, error = %err, "Op failed");
            let message = match err {
                RuntimeError::Op(message) => message,
                other => other.to_string(),
            };
            let error = context.new_error(ErrorKind::Error, &message).ok()?;
            info.isolate().throw_exception(&error).ok()
        }
    }
}

/// JSON form of a value; values without one become `null`
pub(crate) fn to_json(value: &Value) -> tern_core::BridgeResult<serde_json::Value> {
    if value.is_undefined()? {
        return Ok(serde_json::Value::Null);
    }
    let text = value.context().json_stringify(value)?;
    if text == "undefined" {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tern_core::Isolate;

    struct Counter(AtomicU64);

    fn counter_extension() -> Extension {
        Extension::new("counter")
            .with_init(|state| state.put(Counter(AtomicU64::new(0))))
            .with_ops(vec![
                op_sync("counter_add", |ctx, args| {
                    let state = ctx.state();
                    let counter = state.get::<Counter>().ok_or_else(|| RuntimeError::op("no counter"))?;
                    let by = args.first().and_then(|v| v.as_u64()).unwrap_or(1);
                    Ok(json!(counter.0.fetch_add(by, Ordering::SeqCst) + by))
                }),
                op_sync("fail", |_, args| {
                    Err(RuntimeError::op(format!("failed with {}", args.len())))
                }),
            ])
            .with_js("function addTwice(n) { counter_add(n); return counter_add(n); }")
    }

    #[test]
    fn test_state_round_trip() {
        let state = ExtensionState::new();
        state.put(42_u32);
        assert_eq!(*state.get::<u32>().unwrap(), 42);
        assert!(state.get::<String>().is_none());
    }

    #[test]
    fn test_ops_callable_from_script() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        counter_extension()
            .install(&context, &ExtensionState::new())
            .unwrap();

        let value = context.eval("addTwice(5)").unwrap();
        assert_eq!(value.to_number().unwrap(), 10.0);
        let caught = context
            .eval("try { fail(1, 2) } catch (e) { e.message }")
            .unwrap();
        assert_eq!(caught.to_string().unwrap(), "failed with 2");
    }

    #[test]
    fn test_to_json() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let value = context.eval("({a: [1, 'x', null], f: function () {}})").unwrap();
        assert_eq!(to_json(&value).unwrap(), json!({"a": [1, "x", null]}));
        assert_eq!(to_json(&context.undefined().unwrap()).unwrap(), json!(null));
    }
}
