//! Contexts: a global object plus the operations that need one

use crate::builtins;
use crate::callback::NativeFunction;
use crate::error::{EngineResult, ErrorKind, Throw};
use crate::heap::{Callable, HeapObject, ObjectKind, PromiseState};
use crate::isolate::{CompiledScript, ContextState, EMBEDDER_DATA_SLOTS, RawIsolate};
use crate::script::parser::parse_program;
use crate::value::{ObjectId, RawValue, ValueKind};
use crate::vm::Vm;
use crate::{convert, json, promise};
use std::fmt;
use std::sync::Arc;

/// State of a promise as seen from outside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl From<PromiseState> for RawPromiseState {
    fn from(state: PromiseState) -> Self {
        match state {
            PromiseState::Pending => Self::Pending,
            PromiseState::Fulfilled => Self::Fulfilled,
            PromiseState::Rejected => Self::Rejected,
        }
    }
}

/// An execution context inside an isolate.
///
/// Values are not bound to the context that created them; the context
/// decides which global object scripts see and which realm new objects
/// belong to.
#[derive(Clone)]
pub struct RawContext {
    isolate: RawIsolate,
    id: u32,
}

impl fmt::Debug for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawContext").field("id", &self.id).finish()
    }
}

impl RawContext {
    /// Create a context with a fresh global object and the builtins installed
    pub fn new(isolate: &RawIsolate) -> EngineResult<Self> {
        if isolate.is_disposed() {
            return Err(Throw::Disposed("isolate"));
        }
        let core = isolate.core();
        let global = core.alloc(HeapObject::new(ObjectKind::Ordinary, None))?;
        let array_proto = core.alloc(HeapObject::new(ObjectKind::Ordinary, None))?;
        let promise_proto = core.alloc(HeapObject::new(ObjectKind::Ordinary, None))?;
        let id = core.next_context_id();
        core.contexts.lock().insert(
            id,
            ContextState {
                global,
                array_proto,
                promise_proto,
                embedder: Default::default(),
            },
        );
        let context = Self {
            isolate: isolate.clone(),
            id,
        };
        if let Err(throw) = builtins::install(&context) {
            context.dispose();
            return Err(throw);
        }
        Ok(context)
    }

    pub(crate) fn from_parts(isolate: RawIsolate, id: u32) -> Self {
        Self { isolate, id }
    }

    pub fn isolate(&self) -> &RawIsolate {
        &self.isolate
    }

    /// Engine-internal identifier, unique within the isolate
    pub fn id(&self) -> u32 {
        self.id
    }

    fn vm(&self) -> Vm<'_> {
        Vm::new(&self.isolate)
    }

    fn check_alive(&self) -> EngineResult<()> {
        if self.is_disposed() {
            Err(Throw::Disposed("context"))
        } else {
            Ok(())
        }
    }

    pub fn is_disposed(&self) -> bool {
        !self.isolate.core().contexts.lock().contains_key(&self.id)
    }

    /// Detach the global object and embedder data. Objects reachable from
    /// elsewhere survive; everything else becomes garbage.
    pub fn dispose(&self) {
        self.isolate.core().contexts.lock().remove(&self.id);
    }

    pub fn global(&self) -> EngineResult<RawValue> {
        self.vm().global(self.id).map(RawValue::Object)
    }

    /// Store `value` in embedder slot `index`. Out-of-range slots are ignored.
    pub fn set_embedder_data(&self, index: usize, value: RawValue) {
        if let Some(state) = self.isolate.core().contexts.lock().get_mut(&self.id) {
            if let Some(slot) = state.embedder.get_mut(index) {
                *slot = value;
            }
        }
    }

    pub fn embedder_data(&self, index: usize) -> Option<RawValue> {
        if index >= EMBEDDER_DATA_SLOTS {
            return None;
        }
        self.isolate
            .core()
            .contexts
            .lock()
            .get(&self.id)
            .map(|state| state.embedder[index].clone())
    }

    // Script execution

    /// Parse and run `source`, returning the completion value
    pub fn run_script(&self, source: &str, origin: &str) -> EngineResult<RawValue> {
        self.check_alive()?;
        let program = match parse_program(source, origin) {
            Ok(program) => Arc::new(program),
            Err(err) => return Err(self.isolate.syntax_error(err, origin)),
        };
        self.isolate
            .execute(|| self.vm().run_program(self.id, &program))
    }

    pub fn run_compiled(&self, script: &CompiledScript) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.isolate
            .execute(|| self.vm().run_program(self.id, &script.program))
    }

    pub fn call(&self, function: &RawValue, this: &RawValue, args: &[RawValue]) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.isolate.execute(|| {
            let vm = self.vm();
            if vm.kind_of(function) != ValueKind::Function {
                return Err(vm.throw_error(ErrorKind::TypeError, "value is not a function"));
            }
            vm.call(function, this.clone(), args)
        })
    }

    pub fn construct(&self, function: &RawValue, args: &[RawValue]) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.isolate
            .execute(|| self.vm().construct(function, args))
    }

    // Object model

    pub fn new_object(&self) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.vm().new_object().map(RawValue::Object)
    }

    /// Plain object with `count` internal fields that scripts cannot see
    pub fn new_object_with_internal_fields(&self, count: usize) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.isolate
            .core()
            .alloc(HeapObject::with_internal_fields(count))
            .map(RawValue::Object)
    }

    /// Number of internal fields, 0 for primitives and dead objects
    pub fn internal_field_count(&self, object: &RawValue) -> usize {
        let Some(id) = object.as_object() else { return 0 };
        self.isolate
            .core()
            .heap
            .lock()
            .get(id)
            .map_or(0, |object| object.internal.len())
    }

    /// Internal field `index`, `None` when out of range
    pub fn internal_field(&self, object: &RawValue, index: usize) -> Option<RawValue> {
        let id = object.as_object()?;
        let heap = self.isolate.core().heap.lock();
        heap.get(id)?.internal.get(index).cloned()
    }

    /// Store into internal field `index`. Returns `false` when out of range.
    pub fn set_internal_field(&self, object: &RawValue, index: usize, value: RawValue) -> EngineResult<bool> {
        self.check_alive()?;
        let Some(id) = object.as_object() else { return Ok(false) };
        let mut heap = self.isolate.core().heap.lock();
        let Some(slot) = heap.get_mut(id).and_then(|object| object.internal.get_mut(index)) else {
            return Ok(false);
        };
        *slot = value;
        Ok(true)
    }

    pub fn new_array(&self, elements: Vec<RawValue>) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.vm().new_array(self.id, elements).map(RawValue::Object)
    }

    pub fn new_error(&self, kind: ErrorKind, message: &str) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.vm().make_error(kind, message)
    }

    /// Package `exception` as a throw from the current call site. Natives
    /// return this to raise a value of their choosing.
    pub fn throw_value(&self, exception: RawValue) -> Throw {
        self.vm().throw_value(exception)
    }

    /// Create a native function carrying `data`
    pub fn new_function(&self, callback: NativeFunction, data: i32, name: &str) -> EngineResult<RawValue> {
        self.check_alive()?;
        let callable = Callable::Native {
            callback,
            data,
            realm: self.id,
            name: name.into(),
        };
        self.isolate
            .core()
            .alloc(HeapObject::new(ObjectKind::Function(callable), None))
            .map(RawValue::Object)
    }

    pub fn get(&self, object: &RawValue, key: &str) -> EngineResult<RawValue> {
        self.check_alive()?;
        self.vm().get(object, key)
    }

    pub fn set(&self, object: &RawValue, key: &str, value: RawValue) -> EngineResult<()> {
        self.check_alive()?;
        self.vm().set(object, key, value)
    }

    pub fn has(&self, object: &RawValue, key: &str) -> EngineResult<bool> {
        self.check_alive()?;
        self.vm().has(object, key)
    }

    pub fn delete(&self, object: &RawValue, key: &str) -> EngineResult<bool> {
        self.check_alive()?;
        self.vm().delete(object, key)
    }

    pub fn get_index(&self, object: &RawValue, index: u32) -> EngineResult<RawValue> {
        self.get(object, &index.to_string())
    }

    pub fn set_index(&self, object: &RawValue, index: u32, value: RawValue) -> EngineResult<()> {
        self.set(object, &index.to_string(), value)
    }

    pub fn has_index(&self, object: &RawValue, index: u32) -> EngineResult<bool> {
        self.has(object, &index.to_string())
    }

    pub fn delete_index(&self, object: &RawValue, index: u32) -> EngineResult<bool> {
        self.delete(object, &index.to_string())
    }

    /// Own enumerable keys in insertion order, array indices first
    pub fn own_keys(&self, object: &RawValue) -> EngineResult<Vec<String>> {
        self.check_alive()?;
        let Some(id) = object.as_object() else {
            return Ok(Vec::new());
        };
        Ok(self.vm().own_keys(id).iter().map(|k| k.to_string()).collect())
    }

    /// Length of an array, `None` for anything else
    pub fn array_length(&self, value: &RawValue) -> Option<usize> {
        self.vm().array_length(value)
    }

    // Promises

    /// Create a resolver and its pending promise
    pub fn new_promise_resolver(&self) -> EngineResult<RawValue> {
        self.check_alive()?;
        let vm = self.vm();
        let promise = vm.new_promise(self.id)?;
        self.isolate
            .core()
            .alloc(HeapObject::new(ObjectKind::Resolver(promise), None))
            .map(RawValue::Object)
    }

    pub fn resolver_promise(&self, resolver: &RawValue) -> Option<RawValue> {
        let id = resolver.as_object()?;
        let heap = self.isolate.core().heap.lock();
        match heap.get(id).map(|object| &object.kind) {
            Some(ObjectKind::Resolver(promise)) => Some(RawValue::Object(*promise)),
            _ => None,
        }
    }

    /// Fulfil the resolver's promise. Returns `false` if it was already settled.
    pub fn resolve(&self, resolver: &RawValue, value: RawValue) -> EngineResult<bool> {
        self.settle_resolver(resolver, value, false)
    }

    /// Reject the resolver's promise. Returns `false` if it was already settled.
    pub fn reject(&self, resolver: &RawValue, reason: RawValue) -> EngineResult<bool> {
        self.settle_resolver(resolver, reason, true)
    }

    fn settle_resolver(&self, resolver: &RawValue, value: RawValue, reject: bool) -> EngineResult<bool> {
        self.check_alive()?;
        let vm = self.vm();
        let Some(promise) = self.resolver_promise(resolver).and_then(|p| p.as_object()) else {
            return Err(vm.throw_error(ErrorKind::TypeError, "value is not a promise resolver"));
        };
        if vm.promise_state(promise) != Some(PromiseState::Pending) {
            return Ok(false);
        }
        if reject {
            promise::reject(&vm, promise, value);
        } else {
            promise::resolve(&vm, promise, value)?;
        }
        Ok(true)
    }

    pub fn promise_state(&self, promise: &RawValue) -> Option<RawPromiseState> {
        self.vm()
            .promise_state(promise.as_object()?)
            .map(RawPromiseState::from)
    }

    /// Settled value of a promise; undefined while pending
    pub fn promise_result(&self, promise: &RawValue) -> Option<RawValue> {
        self.vm().promise_result(promise.as_object()?)
    }

    /// Register reactions; returns the derived promise
    pub fn promise_then(
        &self,
        promise: &RawValue,
        on_fulfilled: Option<RawValue>,
        on_rejected: Option<RawValue>,
    ) -> EngineResult<RawValue> {
        self.check_alive()?;
        let vm = self.vm();
        let Some(id) = promise.as_object().filter(|id| vm.promise_state(*id).is_some()) else {
            return Err(vm.throw_error(ErrorKind::TypeError, "value is not a promise"));
        };
        promise::then(&vm, self.id, id, on_fulfilled, on_rejected).map(RawValue::Object)
    }

    // JSON

    pub fn json_parse(&self, text: &str) -> EngineResult<RawValue> {
        self.check_alive()?;
        json::parse(&self.vm(), self.id, text)
    }

    /// `None` when the value has no JSON form (undefined, functions)
    pub fn json_stringify(&self, value: &RawValue) -> EngineResult<Option<String>> {
        self.check_alive()?;
        json::stringify(&self.vm(), value, None)
    }

    // Conversions

    pub fn value_kind(&self, value: &RawValue) -> ValueKind {
        self.vm().kind_of(value)
    }

    pub fn type_of(&self, value: &RawValue) -> &'static str {
        self.vm().type_of(value)
    }

    pub fn to_string(&self, value: &RawValue) -> String {
        self.vm().to_string(value).to_string()
    }

    /// Like [`to_string`](Self::to_string) but never fails on exotic values
    pub fn to_detail_string(&self, value: &RawValue) -> String {
        self.vm().to_detail_string(value)
    }

    pub fn to_number(&self, value: &RawValue) -> f64 {
        self.vm().to_number(value)
    }

    pub fn to_boolean(&self, value: &RawValue) -> bool {
        self.vm().to_boolean(value)
    }

    pub fn to_int32(&self, value: &RawValue) -> i32 {
        convert::to_int32(self.to_number(value))
    }

    pub fn same_value(&self, a: &RawValue, b: &RawValue) -> bool {
        convert::same_value(a, b)
    }

    pub fn strict_equals(&self, a: &RawValue, b: &RawValue) -> bool {
        convert::strict_equals(a, b)
    }

    /// Look up an object id; used to reject ids from other isolates
    pub fn contains(&self, value: &RawValue) -> bool {
        match value.as_object() {
            Some(id) => self.object_exists(id),
            None => true,
        }
    }

    fn object_exists(&self, id: ObjectId) -> bool {
        self.isolate.core().heap.lock().get(id).is_some()
    }
}
