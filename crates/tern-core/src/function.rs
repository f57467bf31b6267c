//! Host functions exposed to scripts and the native trampoline behind them

use crate::context::{CONTEXT_ID_SLOT, Context};
use crate::error::{BridgeError, BridgeResult};
use crate::isolate::Isolate;
use crate::object::Object;
use crate::value::Value;
use std::ops::Deref;
use std::sync::Arc;
use scopeguard::ScopeGuard;
use tern_engine::{CallbackInfo, EngineResult, ErrorKind, RawValue};
use tracing::warn;

/// A host closure callable from script. Returning `None` yields undefined.
pub type HostCallback = Arc<dyn Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync>;

/// What a host callback sees of the script call that invoked it.
///
/// The receiver and arguments are rooted in the table of the context the
/// function was created in.
pub struct FunctionCallbackInfo {
    context: Context,
    this: Value,
    args: Vec<Value>,
    construct: bool,
}

impl FunctionCallbackInfo {
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn isolate(&self) -> &Isolate {
        self.context.isolate()
    }

    pub fn this(&self) -> &Value {
        &self.this
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Called with `new`
    pub fn is_construct_call(&self) -> bool {
        self.construct
    }
}

/// A callback registered with an isolate, ready to be instantiated as a
/// function in any of its contexts
#[derive(Debug, Clone)]
pub struct FunctionTemplate {
    isolate: Isolate,
    callback: u32,
    name: Arc<str>,
}

impl FunctionTemplate {
    pub(crate) fn new(isolate: Isolate, callback: u32) -> Self {
        Self {
            isolate,
            callback,
            name: Arc::from(""),
        }
    }

    /// Name reported by the function's `name` property and stack frames
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Arc::from(name);
        self
    }

    /// Id of the callback in its isolate's registry
    pub fn callback_id(&self) -> u32 {
        self.callback
    }

    pub fn get_function(&self, context: &Context) -> BridgeResult<Function> {
        if !context.isolate().ptr_eq(&self.isolate) {
            return Err(BridgeError::IsolateMismatch);
        }
        let _guard = context.guard()?;
        let data = callback_data(self.callback)?;
        let function = context.finish(context.raw().new_function(trampoline, data, &self.name))?;
        Ok(Function::from_object(Object::from_value(function)))
    }
}

/// Callback ids travel through the engine as `i32` function data
pub(crate) fn callback_data(id: u32) -> BridgeResult<i32> {
    i32::try_from(id).map_err(|_| BridgeError::internal("callback id space exhausted"))
}

/// A callable object
#[derive(Clone, Debug)]
pub struct Function {
    object: Object,
}

impl Deref for Function {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        function.object.into_value()
    }
}

impl Function {
    pub(crate) fn from_object(object: Object) -> Self {
        Self { object }
    }

    /// Call with `recv` as `this`
    pub fn call(&self, recv: &Value, args: &[&Value]) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let function = self.raw()?;
        let this = context.resolve(recv)?;
        let args = args
            .iter()
            .map(|arg| context.resolve(arg))
            .collect::<BridgeResult<Vec<_>>>()?;
        context.finish(context.raw().call(&function, &this, &args))
    }

    /// Call as a constructor
    pub fn new_instance(&self, args: &[&Value]) -> BridgeResult<Object> {
        let context = self.context();
        let _guard = context.guard()?;
        let function = self.raw()?;
        let args = args
            .iter()
            .map(|arg| context.resolve(arg))
            .collect::<BridgeResult<Vec<_>>>()?;
        context
            .finish(context.raw().construct(&function, &args))
            .map(Object::from_value)
    }
}

/// Native entry point shared by every host function.
///
/// Unresolvable ids mean the context or callback went away while the
/// engine still held the function; the call then returns undefined. A
/// result handle that no longer resolves is raised as an `Error`.
pub(crate) fn trampoline(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let Some(isolate) = Isolate::from_raw(info.isolate()) else {
        warn!("Native callback on an isolate without a bridge");
        return Ok(RawValue::Undefined);
    };
    let _guard = isolate.inner.lock.acquire();

    let context_id = info
        .context()
        .embedder_data(CONTEXT_ID_SLOT)
        .and_then(|id| id.as_number())
        .map(|id| id as u32);
    let Some(context) = context_id
        .and_then(|id| isolate.inner.contexts.lookup(id))
        .map(Context::from_inner)
    else {
        warn!(context = ?context_id, "Native callback for an unknown context");
        return Ok(RawValue::Undefined);
    };

    let this = context.root(info.this().clone());
    let args = info
        .args()
        .iter()
        .map(|arg| context.root(arg.clone()))
        .collect();

    let callback_id = info.data() as u32;
    let Some(callback) = isolate.inner.callbacks.lookup(callback_id) else {
        warn!(context = context.id(), callback = callback_id, "Native callback with an unknown id");
        return Ok(RawValue::Undefined);
    };

    let call = FunctionCallbackInfo {
        context: context.clone(),
        this,
        args,
        construct: info.is_construct_call(),
    };
    isolate.enter_callback();
    let frame = scopeguard::guard(&isolate, |isolate| {
        isolate.exit_callback();
    });
    let result = callback(&call);
    let scheduled = ScopeGuard::into_inner(frame).exit_callback();

    if let Some(exception) = scheduled {
        return Err(info.context().throw_value(exception.value().clone()));
    }
    let Some(result) = result else {
        return Ok(RawValue::Undefined);
    };
    context.resolve(&result).or_else(|err| {
        warn!(context = context.id(), error = %err, "Native callback returned an unusable value");
        let message = format!("Host callback returned an unusable value: {err}");
        Err(match info.context().new_error(ErrorKind::Error, &message) {
            Ok(error) => info.context().throw_value(error),
            Err(throw) => throw,
        })
    })
}
