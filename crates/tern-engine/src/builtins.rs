//! Globals installed into every new context

use crate::callback::{CallbackInfo, NativeFunction};
use crate::context::RawContext;
use crate::convert;
use crate::error::{EngineResult, ErrorKind, Throw};
use crate::promise;
use crate::value::{ObjectId, RawValue, ValueKind};
use crate::vm::Vm;

fn method(vm: &Vm<'_>, realm: u32, target: ObjectId, name: &str, callback: NativeFunction) -> EngineResult<ObjectId> {
    let function = vm.new_function(realm, name, callback, 0)?;
    vm.define(target, name, RawValue::Object(function));
    Ok(function)
}

pub(crate) fn install(context: &RawContext) -> EngineResult<()> {
    let vm = Vm::new(context.isolate());
    let realm = context.id();
    let global = vm.global(realm)?;

    vm.define(global, "globalThis", RawValue::Object(global));
    vm.define(global, "undefined", RawValue::Undefined);
    vm.define(global, "NaN", RawValue::Number(f64::NAN));
    vm.define(global, "Infinity", RawValue::Number(f64::INFINITY));

    for kind in ErrorKind::ALL {
        let constructor = vm.new_function(realm, kind.name(), error_constructor, kind.index())?;
        vm.define(global, kind.name(), RawValue::Object(constructor));
    }

    let json = vm.new_object()?;
    method(&vm, realm, json, "parse", json_parse)?;
    method(&vm, realm, json, "stringify", json_stringify)?;
    vm.define(global, "JSON", RawValue::Object(json));

    method(&vm, realm, global, "String", string)?;
    method(&vm, realm, global, "Number", number)?;
    method(&vm, realm, global, "Boolean", boolean)?;

    let array_ctor = method(&vm, realm, global, "Array", array)?;
    method(&vm, realm, array_ctor, "isArray", array_is_array)?;
    let object_ctor = method(&vm, realm, global, "Object", object)?;
    method(&vm, realm, object_ctor, "keys", object_keys)?;

    let array_proto = vm.array_proto(realm)?;
    method(&vm, realm, array_proto, "push", array_push)?;
    method(&vm, realm, array_proto, "pop", array_pop)?;
    method(&vm, realm, array_proto, "join", array_join)?;
    method(&vm, realm, array_proto, "indexOf", array_index_of)?;
    method(&vm, realm, array_proto, "map", array_map)?;
    method(&vm, realm, array_proto, "forEach", array_for_each)?;
    method(&vm, realm, array_proto, "filter", array_filter)?;

    let promise_ctor = method(&vm, realm, global, "Promise", promise_constructor)?;
    method(&vm, realm, promise_ctor, "resolve", promise_resolve)?;
    method(&vm, realm, promise_ctor, "reject", promise_reject)?;
    let promise_proto = vm.promise_proto(realm)?;
    method(&vm, realm, promise_proto, "then", promise_then)?;
    method(&vm, realm, promise_proto, "catch", promise_catch)?;
    Ok(())
}

fn error_constructor(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let kind = ErrorKind::from_index(info.data()).unwrap_or(ErrorKind::Error);
    let message = match info.arg(0) {
        RawValue::Undefined => "".into(),
        other => vm.to_string(&other),
    };
    vm.make_error(kind, &message)
}

fn json_parse(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let text = vm.to_string(&info.arg(0));
    crate::json::parse(&vm, info.context().id(), &text)
}

fn json_stringify(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let indent = info
        .arg(2)
        .as_number()
        .map(|width| width.clamp(0.0, 10.0) as usize);
    Ok(crate::json::stringify(&vm, &info.arg(0), indent)?
        .map(RawValue::string)
        .unwrap_or_default())
}

fn string(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    match info.args().first() {
        Some(value) => Ok(RawValue::String(Vm::new(info.isolate()).to_string(value))),
        None => Ok(RawValue::string("")),
    }
}

fn number(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    match info.args().first() {
        Some(value) => Ok(RawValue::Number(Vm::new(info.isolate()).to_number(value))),
        None => Ok(RawValue::Number(0.0)),
    }
}

fn boolean(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    Ok(RawValue::Boolean(Vm::new(info.isolate()).to_boolean(&info.arg(0))))
}

fn array(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    vm.new_array(info.context().id(), info.args().to_vec())
        .map(RawValue::Object)
}

fn array_is_array(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    Ok(RawValue::Boolean(vm.kind_of(&info.arg(0)) == ValueKind::Array))
}

fn object(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    match info.arg(0) {
        value @ RawValue::Object(_) => Ok(value),
        _ => Vm::new(info.isolate()).new_object().map(RawValue::Object),
    }
}

fn object_keys(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let keys = match info.arg(0) {
        RawValue::Undefined | RawValue::Null => {
            return Err(vm.throw_error(
                ErrorKind::TypeError,
                "Cannot convert undefined or null to object",
            ));
        }
        RawValue::Object(id) => vm
            .own_keys(id)
            .into_iter()
            .map(RawValue::String)
            .collect(),
        _ => Vec::new(),
    };
    vm.new_array(info.context().id(), keys)
        .map(RawValue::Object)
}

fn this_array(vm: &Vm<'_>, info: &CallbackInfo<'_>, method: &str) -> EngineResult<Vec<RawValue>> {
    vm.array_elements(info.this()).ok_or_else(|| {
        vm.throw_error(
            ErrorKind::TypeError,
            format!("Array.prototype.{method} called on non-array"),
        )
    })
}

fn callback_arg(vm: &Vm<'_>, info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let callback = info.arg(0);
    if vm.kind_of(&callback) != ValueKind::Function {
        return Err(vm.throw_error(
            ErrorKind::TypeError,
            format!("{} is not a function", vm.to_detail_string(&callback)),
        ));
    }
    Ok(callback)
}

fn array_push(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let length = vm.with_array_mut(info.this(), |elements| {
        elements.extend_from_slice(info.args());
        elements.len()
    });
    match length {
        Some(length) => Ok(RawValue::Number(length as f64)),
        None => Err(vm.throw_error(
            ErrorKind::TypeError,
            "Array.prototype.push called on non-array",
        )),
    }
}

fn array_pop(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    match vm.with_array_mut(info.this(), Vec::pop) {
        Some(popped) => Ok(popped.unwrap_or_default()),
        None => Err(vm.throw_error(
            ErrorKind::TypeError,
            "Array.prototype.pop called on non-array",
        )),
    }
}

fn array_join(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let elements = this_array(&vm, info, "join")?;
    let separator = match info.arg(0) {
        RawValue::Undefined => ",".into(),
        other => vm.to_string(&other),
    };
    let parts: Vec<String> = elements
        .iter()
        .map(|element| {
            if element.is_nullish() {
                String::new()
            } else {
                vm.to_string(element).to_string()
            }
        })
        .collect();
    Ok(RawValue::string(parts.join(&*separator)))
}

fn array_index_of(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let needle = info.arg(0);
    let position = this_array(&vm, info, "indexOf")?
        .iter()
        .position(|element| convert::strict_equals(element, &needle));
    Ok(RawValue::Number(position.map_or(-1.0, |i| i as f64)))
}

fn array_map(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let elements = this_array(&vm, info, "map")?;
    let callback = callback_arg(&vm, info)?;
    let mut mapped = Vec::with_capacity(elements.len());
    for (i, element) in elements.into_iter().enumerate() {
        let args = [element, RawValue::Number(i as f64), info.this().clone()];
        mapped.push(vm.call(&callback, RawValue::Undefined, &args)?);
    }
    vm.new_array(info.context().id(), mapped)
        .map(RawValue::Object)
}

fn array_for_each(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let elements = this_array(&vm, info, "forEach")?;
    let callback = callback_arg(&vm, info)?;
    for (i, element) in elements.into_iter().enumerate() {
        let args = [element, RawValue::Number(i as f64), info.this().clone()];
        vm.call(&callback, RawValue::Undefined, &args)?;
    }
    Ok(RawValue::Undefined)
}

fn array_filter(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let elements = this_array(&vm, info, "filter")?;
    let callback = callback_arg(&vm, info)?;
    let mut kept = Vec::new();
    for (i, element) in elements.into_iter().enumerate() {
        let args = [element.clone(), RawValue::Number(i as f64), info.this().clone()];
        if vm.to_boolean(&vm.call(&callback, RawValue::Undefined, &args)?) {
            kept.push(element);
        }
    }
    vm.new_array(info.context().id(), kept)
        .map(RawValue::Object)
}

fn promise_constructor(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    if !info.is_construct_call() {
        return Err(vm.throw_error(
            ErrorKind::TypeError,
            "Promise constructor cannot be invoked without 'new'",
        ));
    }
    let executor = info.arg(0);
    if vm.kind_of(&executor) != ValueKind::Function {
        return Err(vm.throw_error(
            ErrorKind::TypeError,
            format!("Promise resolver {} is not a function", vm.to_detail_string(&executor)),
        ));
    }
    let realm = info.context().id();
    let promise = promise::new_promise(&vm, realm)?;
    let (resolve, reject) = promise::resolving_functions(&vm, realm, promise)?;
    match vm.call(&executor, RawValue::Undefined, &[resolve, reject]) {
        Ok(_) => {}
        Err(Throw::Exception(details)) => promise::reject(&vm, promise, details.exception),
        Err(other) => return Err(other),
    }
    Ok(RawValue::Object(promise))
}

fn promise_resolve(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let value = info.arg(0);
    if vm.kind_of(&value) == ValueKind::Promise {
        return Ok(value);
    }
    let promise = promise::new_promise(&vm, info.context().id())?;
    promise::resolve(&vm, promise, value)?;
    Ok(RawValue::Object(promise))
}

fn promise_reject(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let promise = promise::new_promise(&vm, info.context().id())?;
    promise::reject(&vm, promise, info.arg(0));
    Ok(RawValue::Object(promise))
}

fn this_promise(vm: &Vm<'_>, info: &CallbackInfo<'_>, method: &str) -> EngineResult<ObjectId> {
    info.this()
        .as_object()
        .filter(|id| vm.promise_state(*id).is_some())
        .ok_or_else(|| {
            vm.throw_error(
                ErrorKind::TypeError,
                format!("Method Promise.prototype.{method} called on incompatible receiver"),
            )
        })
}

fn promise_then(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let promise = this_promise(&vm, info, "then")?;
    promise::then(
        &vm,
        info.context().id(),
        promise,
        Some(info.arg(0)),
        Some(info.arg(1)),
    )
    .map(RawValue::Object)
}

fn promise_catch(info: &CallbackInfo<'_>) -> EngineResult<RawValue> {
    let vm = Vm::new(info.isolate());
    let promise = this_promise(&vm, info, "catch")?;
    promise::then(&vm, info.context().id(), promise, None, Some(info.arg(0)))
        .map(RawValue::Object)
}
