//! Tree-walking interpreter and object model

use crate::callback::{CallbackInfo, NativeFunction};
use crate::context::RawContext;
use crate::convert::{self, array_index, number_to_string, string_to_number};
use crate::error::{EngineResult, ErrorKind, ExceptionDetails, Throw};
use crate::heap::{Binding, Callable, HeapObject, ObjectKind, PromiseState};
use crate::isolate::{ContextState, Frame, IsolateCore, Microtask, RawIsolate};
use crate::promise;
use crate::script::ast::*;
use crate::value::{ObjectId, RawValue, ValueKind};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::Arc;

/// Largest array the engine will grow to through index or length writes
const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Longest prototype chain walked before giving up
const MAX_PROTO_DEPTH: usize = 64;

struct Activation {
    /// Innermost environment; `None` means the realm's global object
    env: Option<ObjectId>,
    this: RawValue,
    realm: u32,
    /// Completion value of top-level code
    completion: Option<RefCell<RawValue>>,
}

enum Flow {
    Normal,
    Return(RawValue),
    Break,
    Continue,
}

enum Reference {
    Binding(Arc<str>),
    Property(RawValue, Arc<str>),
}

enum CallTarget {
    Script {
        code: Arc<FunctionCode>,
        env: Option<ObjectId>,
        realm: u32,
        this: Option<RawValue>,
    },
    Native {
        callback: NativeFunction,
        data: i32,
        realm: u32,
    },
    Resolving {
        promise: ObjectId,
        reject: bool,
    },
}

struct FrameGuard<'a>(&'a IsolateCore);

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.0.frames.lock().pop();
    }
}

pub(crate) struct Vm<'a> {
    isolate: &'a RawIsolate,
    core: &'a IsolateCore,
}

impl<'a> Vm<'a> {
    pub fn new(isolate: &'a RawIsolate) -> Self {
        Self {
            isolate,
            core: isolate.core(),
        }
    }

    // Allocation and realms

    fn with_context<R>(&self, realm: u32, f: impl FnOnce(&ContextState) -> R) -> EngineResult<R> {
        self.core
            .contexts
            .lock()
            .get(&realm)
            .map(f)
            .ok_or(Throw::Disposed("context"))
    }

    pub fn global(&self, realm: u32) -> EngineResult<ObjectId> {
        self.with_context(realm, |state| state.global)
    }

    pub fn array_proto(&self, realm: u32) -> EngineResult<ObjectId> {
        self.with_context(realm, |state| state.array_proto)
    }

    pub fn promise_proto(&self, realm: u32) -> EngineResult<ObjectId> {
        self.with_context(realm, |state| state.promise_proto)
    }

    pub fn alloc(&self, kind: ObjectKind, proto: Option<ObjectId>) -> EngineResult<ObjectId> {
        self.core.alloc(HeapObject::new(kind, proto))
    }

    pub fn new_object(&self) -> EngineResult<ObjectId> {
        self.alloc(ObjectKind::Ordinary, None)
    }

    pub fn new_array(&self, realm: u32, elements: Vec<RawValue>) -> EngineResult<ObjectId> {
        let proto = self.array_proto(realm)?;
        self.alloc(ObjectKind::Array(elements), Some(proto))
    }

    pub fn new_function(&self, realm: u32, name: &str, callback: NativeFunction, data: i32) -> EngineResult<ObjectId> {
        let callable = Callable::Native {
            callback,
            data,
            realm,
            name: name.into(),
        };
        self.alloc(ObjectKind::Function(callable), None)
    }

    pub fn define(&self, object: ObjectId, key: &str, value: RawValue) {
        if let Some(object) = self.core.heap.lock().get_mut(object) {
            object.props.insert(key.into(), value);
        }
    }

    // Errors

    fn check_terminated(&self) -> EngineResult<()> {
        if self.core.is_terminating() {
            Err(Throw::Terminated)
        } else {
            Ok(())
        }
    }

    fn mark(&self, pos: Pos) {
        if let Some(frame) = self.core.frames.lock().last_mut() {
            frame.pos = pos;
        }
    }

    fn push_frame(&self, function: Option<Arc<str>>, origin: Arc<str>, pos: Pos) -> EngineResult<FrameGuard<'a>> {
        let mut frames = self.core.frames.lock();
        if frames.len() >= self.core.limits.max_call_depth {
            drop(frames);
            return Err(self.throw_error(ErrorKind::RangeError, "Maximum call stack size exceeded"));
        }
        frames.push(Frame {
            function,
            origin,
            pos,
        });
        Ok(FrameGuard(self.core))
    }

    fn capture_stack(&self, name: &str, message: &str) -> String {
        let mut stack = if message.is_empty() {
            name.to_string()
        } else {
            format!("{name}: {message}")
        };
        for frame in self.core.frames.lock().iter().rev() {
            let (line, column) = (frame.pos.line, frame.pos.column);
            let _ = match frame.function.as_deref() {
                None => write!(stack, "\n    at {}:{line}:{column}", frame.origin),
                Some("") => write!(stack, "\n    at <anonymous> ({}:{line}:{column})", frame.origin),
                Some(function) => write!(stack, "\n    at {function} ({}:{line}:{column})", frame.origin),
            };
        }
        stack
    }

    pub fn make_error(&self, kind: ErrorKind, message: &str) -> EngineResult<RawValue> {
        let stack = self.capture_stack(kind.name(), message);
        self.alloc(
            ObjectKind::Error {
                kind,
                message: message.into(),
                stack: stack.into(),
            },
            None,
        )
        .map(RawValue::Object)
    }

    pub fn throw_error(&self, kind: ErrorKind, message: impl AsRef<str>) -> Throw {
        match self.make_error(kind, message.as_ref()) {
            Ok(exception) => self.throw_value(exception),
            Err(throw) => throw,
        }
    }

    /// Package a thrown value with the current location
    pub fn throw_value(&self, exception: RawValue) -> Throw {
        let location = self
            .core
            .frames
            .lock()
            .last()
            .map(|f| format!("{}:{}:{}", f.origin, f.pos.line, f.pos.column));
        let stack = exception.as_object().and_then(|id| {
            let heap = self.core.heap.lock();
            match heap.get(id).map(|o| &o.kind) {
                Some(ObjectKind::Error { stack, .. }) => Some(stack.to_string()),
                _ => None,
            }
        });
        let message = self.to_detail_string(&exception);
        Throw::Exception(ExceptionDetails {
            exception,
            message,
            location,
            stack,
        })
    }

    // Classification and conversion

    pub fn kind_of(&self, value: &RawValue) -> ValueKind {
        match value {
            RawValue::Undefined => ValueKind::Undefined,
            RawValue::Null => ValueKind::Null,
            RawValue::Boolean(_) => ValueKind::Boolean,
            RawValue::Number(_) => ValueKind::Number,
            RawValue::String(_) => ValueKind::String,
            RawValue::Object(id) => match self.core.heap.lock().get(*id).map(|o| &o.kind) {
                Some(ObjectKind::Array(_)) => ValueKind::Array,
                Some(ObjectKind::Function(_)) => ValueKind::Function,
                Some(ObjectKind::Error { .. }) => ValueKind::Error,
                Some(ObjectKind::Promise(_)) => ValueKind::Promise,
                _ => ValueKind::Object,
            },
        }
    }

    pub fn type_of(&self, value: &RawValue) -> &'static str {
        match self.kind_of(value) {
            ValueKind::Undefined => "undefined",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Function => "function",
            _ => "object",
        }
    }

    pub fn to_boolean(&self, value: &RawValue) -> bool {
        match value {
            RawValue::Undefined | RawValue::Null => false,
            RawValue::Boolean(b) => *b,
            RawValue::Number(n) => *n != 0.0 && !n.is_nan(),
            RawValue::String(s) => !s.is_empty(),
            RawValue::Object(_) => true,
        }
    }

    pub fn to_number(&self, value: &RawValue) -> f64 {
        match value {
            RawValue::Undefined => f64::NAN,
            RawValue::Null => 0.0,
            RawValue::Boolean(b) => f64::from(u8::from(*b)),
            RawValue::Number(n) => *n,
            RawValue::String(s) => string_to_number(s),
            RawValue::Object(_) => string_to_number(&self.to_string(value)),
        }
    }

    pub fn to_string(&self, value: &RawValue) -> Arc<str> {
        match value {
            RawValue::Undefined => "undefined".into(),
            RawValue::Null => "null".into(),
            RawValue::Boolean(b) => Arc::from(if *b { "true" } else { "false" }),
            RawValue::Number(n) => number_to_string(*n).into(),
            RawValue::String(s) => s.clone(),
            RawValue::Object(id) => self.object_to_string(*id, &mut Vec::new()).into(),
        }
    }

    /// Diagnostic rendering used for exception messages
    pub fn to_detail_string(&self, value: &RawValue) -> String {
        match self.kind_of(value) {
            ValueKind::Object => "#<Object>".to_string(),
            ValueKind::Promise => "#<Promise>".to_string(),
            _ => self.to_string(value).to_string(),
        }
    }

    fn object_to_string(&self, id: ObjectId, visiting: &mut Vec<ObjectId>) -> String {
        enum Shape {
            Elements(Vec<RawValue>),
            Text(String),
        }
        let shape = {
            let heap = self.core.heap.lock();
            let Some(object) = heap.get(id) else {
                return String::new();
            };
            match &object.kind {
                ObjectKind::Array(elements) => Shape::Elements(elements.clone()),
                ObjectKind::Function(Callable::Native { name, .. }) => {
                    Shape::Text(format!("function {name}() {{ [native code] }}"))
                }
                ObjectKind::Function(callable) => {
                    Shape::Text(format!("function {}() {{ [code] }}", callable.name()))
                }
                ObjectKind::Error { kind, message, .. } => {
                    let name = object
                        .props
                        .get("name")
                        .and_then(RawValue::as_str)
                        .unwrap_or(kind.name());
                    let message = object
                        .props
                        .get("message")
                        .and_then(RawValue::as_str)
                        .unwrap_or(&**message);
                    if message.is_empty() {
                        Shape::Text(name.to_string())
                    } else {
                        Shape::Text(format!("{name}: {message}"))
                    }
                }
                ObjectKind::Promise(_) => Shape::Text("[object Promise]".into()),
                _ => Shape::Text("[object Object]".into()),
            }
        };
        match shape {
            Shape::Text(text) => text,
            Shape::Elements(elements) => {
                if visiting.contains(&id) {
                    return String::new();
                }
                visiting.push(id);
                let parts: Vec<String> = elements
                    .iter()
                    .map(|element| match element {
                        RawValue::Undefined | RawValue::Null => String::new(),
                        RawValue::Object(inner) => self.object_to_string(*inner, visiting),
                        other => self.to_string(other).to_string(),
                    })
                    .collect();
                visiting.pop();
                parts.join(",")
            }
        }
    }

    fn to_primitive(&self, value: &RawValue) -> RawValue {
        match value {
            RawValue::Object(_) => RawValue::String(self.to_string(value)),
            other => other.clone(),
        }
    }

    fn property_key(&self, value: &RawValue) -> Arc<str> {
        match value {
            RawValue::String(s) => s.clone(),
            other => self.to_string(other),
        }
    }

    fn loose_equals(&self, a: &RawValue, b: &RawValue) -> bool {
        use RawValue::*;
        match (a, b) {
            (Undefined | Null, Undefined | Null) => true,
            (Undefined | Null, _) | (_, Undefined | Null) => false,
            (Number(x), String(s)) | (String(s), Number(x)) => *x == string_to_number(s),
            (Boolean(x), _) => self.loose_equals(&Number(f64::from(u8::from(*x))), b),
            (_, Boolean(y)) => self.loose_equals(a, &Number(f64::from(u8::from(*y)))),
            (Object(_), Number(_) | String(_)) => self.loose_equals(&self.to_primitive(a), b),
            (Number(_) | String(_), Object(_)) => self.loose_equals(a, &self.to_primitive(b)),
            _ => convert::strict_equals(a, b),
        }
    }

    // Properties

    fn own_property(object: &HeapObject, key: &str) -> Option<RawValue> {
        if let Some(value) = object.props.get(key) {
            return Some(value.clone());
        }
        match &object.kind {
            ObjectKind::Array(elements) => {
                if key == "length" {
                    Some(RawValue::Number(elements.len() as f64))
                } else {
                    array_index(key).and_then(|i| elements.get(i).cloned())
                }
            }
            ObjectKind::Error { kind, message, stack } => match key {
                "name" => Some(RawValue::string(kind.name())),
                "message" => Some(RawValue::String(message.clone())),
                "stack" => Some(RawValue::String(stack.clone())),
                _ => None,
            },
            ObjectKind::Function(callable) => match (key, callable) {
                ("name", _) => Some(RawValue::String(callable.name())),
                ("length", Callable::Script { code, .. }) => Some(RawValue::Number(code.params.len() as f64)),
                ("length", _) => Some(RawValue::Number(0.0)),
                _ => None,
            },
            _ => None,
        }
    }

    fn lookup_property(&self, id: ObjectId, key: &str) -> Option<RawValue> {
        let heap = self.core.heap.lock();
        let mut current = Some(id);
        for _ in 0..MAX_PROTO_DEPTH {
            let object = heap.get(current?)?;
            if let Some(value) = Self::own_property(object, key) {
                return Some(value);
            }
            current = object.proto;
        }
        None
    }

    pub fn get(&self, target: &RawValue, key: &str) -> EngineResult<RawValue> {
        match target {
            RawValue::Undefined | RawValue::Null => Err(self.throw_error(
                ErrorKind::TypeError,
                format!(
                    "Cannot read properties of {} (reading '{key}')",
                    self.to_string(target)
                ),
            )),
            RawValue::String(s) => Ok(if key == "length" {
                RawValue::Number(s.encode_utf16().count() as f64)
            } else {
                array_index(key)
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| RawValue::string(c.to_string()))
                    .unwrap_or_default()
            }),
            RawValue::Object(id) => Ok(self.lookup_property(*id, key).unwrap_or_default()),
            _ => Ok(RawValue::Undefined),
        }
    }

    pub fn set(&self, target: &RawValue, key: &str, value: RawValue) -> EngineResult<()> {
        let id = match target {
            RawValue::Undefined | RawValue::Null => {
                return Err(self.throw_error(
                    ErrorKind::TypeError,
                    format!(
                        "Cannot set properties of {} (setting '{key}')",
                        self.to_string(target)
                    ),
                ));
            }
            RawValue::Object(id) => *id,
            _ => return Ok(()),
        };
        let new_length = (key == "length").then(|| self.to_number(&value));
        let index = array_index(key);

        let mut heap = self.core.heap.lock();
        let Some(object) = heap.get_mut(id) else {
            return Ok(());
        };
        if let ObjectKind::Array(elements) = &mut object.kind {
            if let Some(length) = new_length {
                if length.fract() != 0.0 || length < 0.0 || length > MAX_ARRAY_LENGTH as f64 {
                    drop(heap);
                    return Err(self.throw_error(ErrorKind::RangeError, "Invalid array length"));
                }
                elements.resize(length as usize, RawValue::Undefined);
                return Ok(());
            }
            if let Some(index) = index {
                if index >= MAX_ARRAY_LENGTH {
                    drop(heap);
                    return Err(self.throw_error(ErrorKind::RangeError, "Invalid array length"));
                }
                if index >= elements.len() {
                    elements.resize(index + 1, RawValue::Undefined);
                }
                elements[index] = value;
                return Ok(());
            }
        }
        object.props.insert(key.into(), value);
        Ok(())
    }

    pub fn has(&self, target: &RawValue, key: &str) -> EngineResult<bool> {
        match target {
            RawValue::Object(id) => Ok(self.lookup_property(*id, key).is_some()),
            other => Err(self.throw_error(
                ErrorKind::TypeError,
                format!(
                    "Cannot use 'in' operator to search for '{key}' in {}",
                    self.to_string(other)
                ),
            )),
        }
    }

    pub fn delete(&self, target: &RawValue, key: &str) -> EngineResult<bool> {
        let id = match target {
            RawValue::Undefined | RawValue::Null => {
                return Err(self.throw_error(
                    ErrorKind::TypeError,
                    "Cannot convert undefined or null to object",
                ));
            }
            RawValue::Object(id) => *id,
            _ => return Ok(true),
        };
        let mut heap = self.core.heap.lock();
        let Some(object) = heap.get_mut(id) else {
            return Ok(true);
        };
        if object.props.shift_remove(key).is_some() {
            return Ok(true);
        }
        if let ObjectKind::Array(elements) = &mut object.kind {
            if key == "length" {
                return Ok(false);
            }
            if let Some(slot) = array_index(key).and_then(|i| elements.get_mut(i)) {
                *slot = RawValue::Undefined;
            }
        }
        Ok(true)
    }

    pub fn own_keys(&self, id: ObjectId) -> Vec<Arc<str>> {
        let heap = self.core.heap.lock();
        let Some(object) = heap.get(id) else {
            return Vec::new();
        };
        let mut keys: Vec<Arc<str>> = match &object.kind {
            ObjectKind::Array(elements) => (0..elements.len()).map(|i| i.to_string().into()).collect(),
            _ => Vec::new(),
        };
        keys.extend(object.props.keys().cloned());
        keys
    }

    pub fn array_length(&self, value: &RawValue) -> Option<usize> {
        let heap = self.core.heap.lock();
        match heap.get(value.as_object()?).map(|o| &o.kind) {
            Some(ObjectKind::Array(elements)) => Some(elements.len()),
            _ => None,
        }
    }

    pub fn array_elements(&self, value: &RawValue) -> Option<Vec<RawValue>> {
        let heap = self.core.heap.lock();
        match heap.get(value.as_object()?).map(|o| &o.kind) {
            Some(ObjectKind::Array(elements)) => Some(elements.clone()),
            _ => None,
        }
    }

    pub fn with_array_mut<R>(&self, value: &RawValue, f: impl FnOnce(&mut Vec<RawValue>) -> R) -> Option<R> {
        let mut heap = self.core.heap.lock();
        match heap.get_mut(value.as_object()?).map(|o| &mut o.kind) {
            Some(ObjectKind::Array(elements)) => Some(f(elements)),
            _ => None,
        }
    }

    // Promises

    pub fn promise_state(&self, id: ObjectId) -> Option<PromiseState> {
        match self.core.heap.lock().get(id).map(|o| &o.kind) {
            Some(ObjectKind::Promise(slot)) => Some(slot.state),
            _ => None,
        }
    }

    pub fn promise_result(&self, id: ObjectId) -> Option<RawValue> {
        match self.core.heap.lock().get(id).map(|o| &o.kind) {
            Some(ObjectKind::Promise(slot)) => Some(slot.result.clone()),
            _ => None,
        }
    }

    pub fn new_promise(&self, realm: u32) -> EngineResult<ObjectId> {
        promise::new_promise(self, realm)
    }

    pub fn run_microtask(&self, job: Microtask) -> EngineResult<()> {
        promise::run_job(self, job)
    }

    pub(crate) fn core(&self) -> &IsolateCore {
        self.core
    }

    // Calls

    fn call_target(&self, function: &RawValue) -> Option<CallTarget> {
        let heap = self.core.heap.lock();
        match &heap.get(function.as_object()?)?.kind {
            ObjectKind::Function(Callable::Script {
                code,
                env,
                realm,
                this,
            }) => Some(CallTarget::Script {
                code: code.clone(),
                env: *env,
                realm: *realm,
                this: this.clone(),
            }),
            ObjectKind::Function(Callable::Native {
                callback,
                data,
                realm,
                ..
            }) => Some(CallTarget::Native {
                callback: *callback,
                data: *data,
                realm: *realm,
            }),
            ObjectKind::Function(Callable::Resolving { promise, reject, .. }) => {
                Some(CallTarget::Resolving {
                    promise: *promise,
                    reject: *reject,
                })
            }
            _ => None,
        }
    }

    pub fn call(&self, function: &RawValue, this: RawValue, args: &[RawValue]) -> EngineResult<RawValue> {
        self.check_terminated()?;
        let Some(target) = self.call_target(function) else {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                format!("{} is not a function", self.to_detail_string(function)),
            ));
        };
        match target {
            CallTarget::Script {
                code,
                env,
                realm,
                this: lexical_this,
            } => self.call_script(&code, env, realm, lexical_this.unwrap_or(this), args),
            CallTarget::Native {
                callback,
                data,
                realm,
            } => self.call_native(callback, data, realm, this, args, false),
            CallTarget::Resolving { promise, reject } => {
                let value = args.first().cloned().unwrap_or_default();
                if reject {
                    promise::reject(self, promise, value);
                } else {
                    promise::resolve(self, promise, value)?;
                }
                Ok(RawValue::Undefined)
            }
        }
    }

    pub fn construct(&self, function: &RawValue, args: &[RawValue]) -> EngineResult<RawValue> {
        self.check_terminated()?;
        let result = match self.call_target(function) {
            Some(CallTarget::Script {
                code, env, realm, ..
            }) if !code.arrow => {
                let this = RawValue::Object(self.new_object()?);
                let result = self.call_script(&code, env, realm, this.clone(), args)?;
                (result, this)
            }
            Some(CallTarget::Native {
                callback,
                data,
                realm,
            }) => {
                let this = RawValue::Object(self.new_object()?);
                let result = self.call_native(callback, data, realm, this.clone(), args, true)?;
                (result, this)
            }
            _ => {
                return Err(self.throw_error(
                    ErrorKind::TypeError,
                    format!("{} is not a constructor", self.to_detail_string(function)),
                ));
            }
        };
        Ok(match result {
            (result @ RawValue::Object(_), _) => result,
            (_, this) => this,
        })
    }

    fn call_native(
        &self,
        callback: NativeFunction,
        data: i32,
        realm: u32,
        this: RawValue,
        args: &[RawValue],
        construct: bool,
    ) -> EngineResult<RawValue> {
        let info = CallbackInfo {
            context: RawContext::from_parts(self.isolate.clone(), realm),
            this,
            args,
            data,
            construct,
        };
        let result = callback(&info);
        self.check_terminated()?;
        result
    }

    fn call_script(
        &self,
        code: &Arc<FunctionCode>,
        env: Option<ObjectId>,
        realm: u32,
        this: RawValue,
        args: &[RawValue],
    ) -> EngineResult<RawValue> {
        let name = code.name.clone().unwrap_or_else(|| "".into());
        let _frame = self.push_frame(Some(name), code.origin.clone(), code.pos)?;
        let vars = code
            .params
            .iter()
            .enumerate()
            .map(|(i, param)| {
                let binding = Binding {
                    value: args.get(i).cloned().unwrap_or_default(),
                    mutable: true,
                };
                (param.clone(), binding)
            })
            .collect::<FxHashMap<_, _>>();
        let scope = self.alloc(ObjectKind::Environment { vars, parent: env }, None)?;
        let activation = Activation {
            env: Some(scope),
            this,
            realm,
            completion: None,
        };
        self.hoist(&activation, &code.body)?;
        match self.exec_block(&activation, &code.body)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(RawValue::Undefined),
        }
    }

    pub fn run_program(&self, realm: u32, program: &Program) -> EngineResult<RawValue> {
        let global = self.global(realm)?;
        let _frame = self.push_frame(None, program.origin.clone(), Pos { line: 1, column: 1 })?;
        let activation = Activation {
            env: None,
            this: RawValue::Object(global),
            realm,
            completion: Some(RefCell::new(RawValue::Undefined)),
        };
        self.hoist(&activation, &program.body)?;
        self.exec_block(&activation, &program.body)?;
        Ok(activation
            .completion
            .map(RefCell::into_inner)
            .unwrap_or_default())
    }

    // Bindings

    fn declare(&self, act: &Activation, name: &Arc<str>, value: RawValue, mutable: bool) -> EngineResult<()> {
        let target = match act.env {
            Some(env) => env,
            None => {
                let global = self.global(act.realm)?;
                self.define(global, name, value);
                return Ok(());
            }
        };
        let mut heap = self.core.heap.lock();
        if let Some(ObjectKind::Environment { vars, .. }) = heap.get_mut(target).map(|o| &mut o.kind) {
            vars.insert(name.clone(), Binding { value, mutable });
        }
        Ok(())
    }

    fn is_declared_here(&self, act: &Activation, name: &str) -> EngineResult<bool> {
        let target = match act.env {
            Some(env) => env,
            None => self.global(act.realm)?,
        };
        let heap = self.core.heap.lock();
        Ok(match heap.get(target) {
            Some(HeapObject {
                kind: ObjectKind::Environment { vars, .. },
                ..
            }) => vars.contains_key(name),
            Some(object) => object.props.contains_key(name),
            None => false,
        })
    }

    fn lookup(&self, act: &Activation, name: &str) -> EngineResult<Option<RawValue>> {
        {
            let heap = self.core.heap.lock();
            let mut env = act.env;
            while let Some(id) = env {
                match heap.get(id).map(|o| &o.kind) {
                    Some(ObjectKind::Environment { vars, parent }) => {
                        if let Some(binding) = vars.get(name) {
                            return Ok(Some(binding.value.clone()));
                        }
                        env = *parent;
                    }
                    _ => break,
                }
            }
        }
        let global = self.global(act.realm)?;
        let heap = self.core.heap.lock();
        Ok(heap.get(global).and_then(|g| g.props.get(name).cloned()))
    }

    fn assign_binding(&self, act: &Activation, name: &Arc<str>, value: RawValue) -> EngineResult<()> {
        let mut constant = false;
        {
            let mut heap = self.core.heap.lock();
            let mut env = act.env;
            while let Some(id) = env {
                match heap.get_mut(id).map(|o| &mut o.kind) {
                    Some(ObjectKind::Environment { vars, parent }) => {
                        if let Some(binding) = vars.get_mut(name) {
                            if binding.mutable {
                                binding.value = value;
                                return Ok(());
                            }
                            constant = true;
                            break;
                        }
                        env = *parent;
                    }
                    _ => break,
                }
            }
        }
        if constant {
            return Err(self.throw_error(ErrorKind::TypeError, "Assignment to constant variable."));
        }
        let global = self.global(act.realm)?;
        self.define(global, name, value);
        Ok(())
    }

    fn make_function(&self, act: &Activation, code: &Arc<FunctionCode>) -> EngineResult<RawValue> {
        let callable = Callable::Script {
            code: code.clone(),
            env: act.env,
            realm: act.realm,
            this: code.arrow.then(|| act.this.clone()),
        };
        self.alloc(ObjectKind::Function(callable), None)
            .map(RawValue::Object)
    }

    fn hoist(&self, act: &Activation, body: &[Stmt]) -> EngineResult<()> {
        for stmt in body {
            self.hoist_stmt(act, stmt)?;
        }
        Ok(())
    }

    fn hoist_stmt(&self, act: &Activation, stmt: &Stmt) -> EngineResult<()> {
        match stmt {
            Stmt::Function(code) => {
                let function = self.make_function(act, code)?;
                if let Some(name) = &code.name {
                    self.declare(act, name, function, true)?;
                }
                Ok(())
            }
            Stmt::Block(body) => self.hoist(act, body),
            Stmt::If {
                then, otherwise, ..
            } => {
                self.hoist_stmt(act, then)?;
                match otherwise {
                    Some(otherwise) => self.hoist_stmt(act, otherwise),
                    None => Ok(()),
                }
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => self.hoist_stmt(act, body),
            Stmt::Try {
                block, finalizer, ..
            } => {
                self.hoist(act, block)?;
                match finalizer {
                    Some(finalizer) => self.hoist(act, finalizer),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    // Statements

    fn exec_block(&self, act: &Activation, body: &[Stmt]) -> EngineResult<Flow> {
        for stmt in body {
            match self.exec(act, stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, act: &Activation, stmt: &Stmt) -> EngineResult<Flow> {
        match stmt {
            Stmt::Decl { kind, decls, pos } => {
                self.mark(*pos);
                for (name, init) in decls {
                    match init {
                        Some(init) => {
                            let value = self.eval(act, init)?;
                            self.declare(act, name, value, *kind != DeclKind::Const)?;
                        }
                        None if *kind == DeclKind::Var && self.is_declared_here(act, name)? => {}
                        None => self.declare(act, name, RawValue::Undefined, true)?,
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Expr(expr, pos) => {
                self.mark(*pos);
                let value = self.eval(act, expr)?;
                if let Some(completion) = &act.completion {
                    *completion.borrow_mut() = value;
                }
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval(act, cond)?;
                if self.to_boolean(&cond) {
                    self.exec(act, then)
                } else if let Some(otherwise) = otherwise {
                    self.exec(act, otherwise)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                loop {
                    self.check_terminated()?;
                    let value = self.eval(act, cond)?;
                    if !self.to_boolean(&value) {
                        break;
                    }
                    match self.exec(act, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.exec(act, init)?;
                }
                loop {
                    self.check_terminated()?;
                    if let Some(cond) = cond {
                        let value = self.eval(act, cond)?;
                        if !self.to_boolean(&value) {
                            break;
                        }
                    }
                    match self.exec(act, body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        self.eval(act, update)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => self.exec_block(act, body),
            Stmt::Return(value, pos) => {
                self.mark(*pos);
                let value = match value {
                    Some(expr) => self.eval(act, expr)?,
                    None => RawValue::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Throw(expr, pos) => {
                let value = self.eval(act, expr)?;
                self.mark(*pos);
                Err(self.throw_value(value))
            }
            Stmt::Try {
                block,
                param,
                handler,
                finalizer,
            } => self.exec_try(act, block, param.as_ref(), handler.as_deref(), finalizer.as_deref()),
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
        }
    }

    fn exec_try(
        &self,
        act: &Activation,
        block: &[Stmt],
        param: Option<&Arc<str>>,
        handler: Option<&[Stmt]>,
        finalizer: Option<&[Stmt]>,
    ) -> EngineResult<Flow> {
        let mut result = self.exec_block(act, block);
        let caught = match (&result, handler) {
            (Err(Throw::Exception(details)), Some(handler)) => Some((details.exception.clone(), handler)),
            _ => None,
        };
        if let Some((exception, handler)) = caught {
            let mut vars = FxHashMap::default();
            if let Some(param) = param {
                vars.insert(
                    param.clone(),
                    Binding {
                        value: exception,
                        mutable: true,
                    },
                );
            }
            result = self
                .alloc(ObjectKind::Environment { vars, parent: act.env }, None)
                .and_then(|env| {
                    let inner = Activation {
                        env: Some(env),
                        this: act.this.clone(),
                        realm: act.realm,
                        completion: None,
                    };
                    self.exec_block(&inner, handler)
                });
        }
        if let Some(finalizer) = finalizer {
            if matches!(result, Err(Throw::Terminated)) {
                return result;
            }
            match self.exec_block(act, finalizer)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        result
    }

    // Expressions

    fn eval(&self, act: &Activation, expr: &Expr) -> EngineResult<RawValue> {
        match expr {
            Expr::Number(n) => Ok(RawValue::Number(*n)),
            Expr::Str(s) => Ok(RawValue::String(s.clone())),
            Expr::Bool(b) => Ok(RawValue::Boolean(*b)),
            Expr::Null => Ok(RawValue::Null),
            Expr::This => Ok(act.this.clone()),
            Expr::Ident(name) => self.lookup(act, name)?.ok_or_else(|| {
                self.throw_error(ErrorKind::ReferenceError, format!("{name} is not defined"))
            }),
            Expr::Array(elements) => {
                let values = elements
                    .iter()
                    .map(|e| self.eval(act, e))
                    .collect::<EngineResult<Vec<_>>>()?;
                self.new_array(act.realm, values).map(RawValue::Object)
            }
            Expr::Object(props) => {
                let object = self.new_object()?;
                for (key, value) in props {
                    let value = self.eval(act, value)?;
                    self.define(object, key, value);
                }
                Ok(RawValue::Object(object))
            }
            Expr::Function(code) => self.make_function(act, code),
            Expr::Unary(op, operand) => self.eval_unary(act, *op, operand),
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let reference = self.reference(act, target)?;
                let old = self.to_number(&self.read(act, &reference)?);
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write(act, &reference, RawValue::Number(new))?;
                Ok(RawValue::Number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(act, left)?;
                let right = self.eval(act, right)?;
                Ok(self.binary(*op, &left, &right))
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(act, left)?;
                match (op, self.to_boolean(&left)) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(left),
                    _ => self.eval(act, right),
                }
            }
            Expr::Conditional(cond, then, otherwise) => {
                let cond = self.eval(act, cond)?;
                if self.to_boolean(&cond) {
                    self.eval(act, then)
                } else {
                    self.eval(act, otherwise)
                }
            }
            Expr::Assign { op, target, value } => {
                let reference = self.reference(act, target)?;
                let value = match op {
                    None => self.eval(act, value)?,
                    Some(op) => {
                        let old = self.read(act, &reference)?;
                        let rhs = self.eval(act, value)?;
                        self.binary(*op, &old, &rhs)
                    }
                };
                self.write(act, &reference, value.clone())?;
                Ok(value)
            }
            Expr::Member(object, name) => {
                let object = self.eval(act, object)?;
                self.get(&object, name)
            }
            Expr::Index(object, index) => {
                let object = self.eval(act, object)?;
                let index = self.eval(act, index)?;
                self.get(&object, &self.property_key(&index))
            }
            Expr::Call { callee, args, pos } => self.eval_call(act, callee, args, *pos),
            Expr::New { callee, args, pos } => {
                let function = self.eval(act, callee)?;
                let args = self.eval_args(act, args)?;
                self.mark(*pos);
                if self.kind_of(&function) != ValueKind::Function {
                    return Err(self.throw_error(
                        ErrorKind::TypeError,
                        format!("{} is not a constructor", describe(callee)),
                    ));
                }
                self.construct(&function, &args)
            }
        }
    }

    fn eval_args(&self, act: &Activation, args: &[Expr]) -> EngineResult<Vec<RawValue>> {
        args.iter().map(|arg| self.eval(act, arg)).collect()
    }

    fn eval_call(&self, act: &Activation, callee: &Expr, args: &[Expr], pos: Pos) -> EngineResult<RawValue> {
        let (function, this) = match callee {
            Expr::Member(object, name) => {
                let object = self.eval(act, object)?;
                (self.get(&object, name)?, object)
            }
            Expr::Index(object, index) => {
                let object = self.eval(act, object)?;
                let index = self.eval(act, index)?;
                (self.get(&object, &self.property_key(&index))?, object)
            }
            other => (self.eval(act, other)?, RawValue::Undefined),
        };
        let args = self.eval_args(act, args)?;
        self.mark(pos);
        if self.kind_of(&function) != ValueKind::Function {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                format!("{} is not a function", describe(callee)),
            ));
        }
        self.call(&function, this, &args)
    }

    fn eval_unary(&self, act: &Activation, op: UnaryOp, operand: &Expr) -> EngineResult<RawValue> {
        if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, operand) {
            let value = self.lookup(act, name)?.unwrap_or_default();
            return Ok(RawValue::string(self.type_of(&value)));
        }
        let value = self.eval(act, operand)?;
        Ok(match op {
            UnaryOp::Not => RawValue::Boolean(!self.to_boolean(&value)),
            UnaryOp::Neg => RawValue::Number(-self.to_number(&value)),
            UnaryOp::Plus => RawValue::Number(self.to_number(&value)),
            UnaryOp::TypeOf => RawValue::string(self.type_of(&value)),
            UnaryOp::Void => RawValue::Undefined,
        })
    }

    fn binary(&self, op: BinaryOp, a: &RawValue, b: &RawValue) -> RawValue {
        let number = |f: fn(f64, f64) -> f64| RawValue::Number(f(self.to_number(a), self.to_number(b)));
        match op {
            BinaryOp::Add => {
                let (a, b) = (self.to_primitive(a), self.to_primitive(b));
                if matches!(a, RawValue::String(_)) || matches!(b, RawValue::String(_)) {
                    let mut s = self.to_string(&a).to_string();
                    s.push_str(&self.to_string(&b));
                    RawValue::string(s)
                } else {
                    RawValue::Number(self.to_number(&a) + self.to_number(&b))
                }
            }
            BinaryOp::Sub => number(|x, y| x - y),
            BinaryOp::Mul => number(|x, y| x * y),
            BinaryOp::Div => number(|x, y| x / y),
            BinaryOp::Rem => number(|x, y| x % y),
            BinaryOp::Lt => RawValue::Boolean(self.compare(a, b) == Some(Ordering::Less)),
            BinaryOp::Gt => RawValue::Boolean(self.compare(a, b) == Some(Ordering::Greater)),
            BinaryOp::Le => RawValue::Boolean(matches!(
                self.compare(a, b),
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinaryOp::Ge => RawValue::Boolean(matches!(
                self.compare(a, b),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinaryOp::Eq => RawValue::Boolean(self.loose_equals(a, b)),
            BinaryOp::Ne => RawValue::Boolean(!self.loose_equals(a, b)),
            BinaryOp::StrictEq => RawValue::Boolean(convert::strict_equals(a, b)),
            BinaryOp::StrictNe => RawValue::Boolean(!convert::strict_equals(a, b)),
        }
    }

    fn compare(&self, a: &RawValue, b: &RawValue) -> Option<Ordering> {
        let (a, b) = (self.to_primitive(a), self.to_primitive(b));
        match (&a, &b) {
            (RawValue::String(x), RawValue::String(y)) => Some(x.cmp(y)),
            _ => self.to_number(&a).partial_cmp(&self.to_number(&b)),
        }
    }

    fn reference(&self, act: &Activation, target: &Expr) -> EngineResult<Reference> {
        match target {
            Expr::Ident(name) => Ok(Reference::Binding(name.clone())),
            Expr::Member(object, name) => Ok(Reference::Property(self.eval(act, object)?, name.clone())),
            Expr::Index(object, index) => {
                let object = self.eval(act, object)?;
                let index = self.eval(act, index)?;
                Ok(Reference::Property(object, self.property_key(&index)))
            }
            _ => Err(self.throw_error(ErrorKind::SyntaxError, "Invalid assignment target")),
        }
    }

    fn read(&self, act: &Activation, reference: &Reference) -> EngineResult<RawValue> {
        match reference {
            Reference::Binding(name) => self.lookup(act, name)?.ok_or_else(|| {
                self.throw_error(ErrorKind::ReferenceError, format!("{name} is not defined"))
            }),
            Reference::Property(object, key) => self.get(object, key),
        }
    }

    fn write(&self, act: &Activation, reference: &Reference, value: RawValue) -> EngineResult<()> {
        match reference {
            Reference::Binding(name) => self.assign_binding(act, name, value),
            Reference::Property(object, key) => self.set(object, key, value),
        }
    }
}

/// Source-like rendering of a callee for error messages
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.to_string(),
        Expr::This => "this".to_string(),
        Expr::Member(object, name) => format!("{}.{name}", describe(object)),
        Expr::Index(object, _) => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        Expr::Str(s) => format!("\"{s}\""),
        Expr::Number(n) => number_to_string(*n),
        _ => "expression".to_string(),
    }
}
