//! Host-side references to engine values

use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::function::Function;
use crate::handle::HandleRef;
use crate::object::Object;
use crate::promise::Promise;
use std::fmt;
use tern_engine::{RawContext, RawValue, ValueKind};

/// A value rooted in a context's handle table.
///
/// Holds no pointer into the engine: only the owning [`Context`] and a
/// [`HandleRef`]. Once the handle's scope is popped or the context closes,
/// every operation fails with [`BridgeError::ObsoleteHandle`] or
/// [`BridgeError::ContextClosed`], the `is_*` predicates included.
#[derive(Clone)]
pub struct Value {
    context: Context,
    handle: HandleRef,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("context", &self.context.id())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Value {
    pub(crate) fn new(context: Context, handle: HandleRef) -> Self {
        Self { context, handle }
    }

    pub fn handle(&self) -> HandleRef {
        self.handle
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The engine value, without locking
    pub(crate) fn raw(&self) -> BridgeResult<RawValue> {
        self.context.resolve_handle(self.handle)
    }

    fn with_raw<R>(&self, f: impl FnOnce(&RawContext, &RawValue) -> R) -> BridgeResult<R> {
        let _guard = self.context.guard()?;
        let raw = self.raw()?;
        Ok(f(self.context.raw(), &raw))
    }

    pub fn value_type(&self) -> BridgeResult<ValueKind> {
        self.with_raw(|cx, value| cx.value_kind(value))
    }

    /// Kind predicates fail on a handle that no longer resolves rather than
    /// answering `false`
    fn kind_is(&self, check: impl FnOnce(ValueKind) -> bool) -> BridgeResult<bool> {
        self.value_type().map(check)
    }

    pub fn is_undefined(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Undefined)
    }

    pub fn is_null(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Null)
    }

    pub fn is_nullish(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| matches!(kind, ValueKind::Undefined | ValueKind::Null))
    }

    pub fn is_boolean(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Boolean)
    }

    pub fn is_number(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Number)
    }

    pub fn is_string(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::String)
    }

    /// True for every object kind, including arrays, functions and promises
    pub fn is_object(&self) -> BridgeResult<bool> {
        self.kind_is(ValueKind::is_object)
    }

    pub fn is_array(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Array)
    }

    pub fn is_function(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Function)
    }

    pub fn is_promise(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Promise)
    }

    pub fn is_error(&self) -> BridgeResult<bool> {
        self.kind_is(|kind| kind == ValueKind::Error)
    }

    pub fn type_of(&self) -> BridgeResult<&'static str> {
        self.with_raw(|cx, value| cx.type_of(value))
    }

    pub fn to_string(&self) -> BridgeResult<String> {
        self.with_raw(|cx, value| cx.to_string(value))
    }

    /// String form suitable for diagnostics (`#<Object>` for plain objects)
    pub fn to_detail_string(&self) -> BridgeResult<String> {
        self.with_raw(|cx, value| cx.to_detail_string(value))
    }

    pub fn to_number(&self) -> BridgeResult<f64> {
        self.with_raw(|cx, value| cx.to_number(value))
    }

    pub fn to_boolean(&self) -> BridgeResult<bool> {
        self.with_raw(|cx, value| cx.to_boolean(value))
    }

    pub fn to_int32(&self) -> BridgeResult<i32> {
        self.with_raw(|cx, value| cx.to_int32(value))
    }

    /// ToUint32: the number modulo 2^32
    pub fn uint32(&self) -> BridgeResult<u32> {
        self.with_raw(|cx, value| cx.to_int32(value) as u32)
    }

    /// Number truncated toward zero, saturating at the `i64` range; NaN is 0
    pub fn integer(&self) -> BridgeResult<i64> {
        self.with_raw(|cx, value| {
            let n = cx.to_number(value);
            if n.is_nan() { 0 } else { n.trunc() as i64 }
        })
    }

    /// The array index this value names, if any: an integral number below
    /// 2^32 - 1, or a string in the canonical form of one
    pub fn array_index(&self) -> BridgeResult<Option<u32>> {
        self.with_raw(|cx, value| match cx.value_kind(value) {
            ValueKind::Number => {
                let n = cx.to_number(value);
                (n >= 0.0 && n < f64::from(u32::MAX) && n.fract() == 0.0).then_some(n as u32)
            }
            ValueKind::String => {
                let text = cx.to_string(value);
                text.parse::<u32>()
                    .ok()
                    .filter(|index| *index != u32::MAX && index.to_string() == text)
            }
            _ => None,
        })
    }

    /// `Object.is` semantics; `other` may live in any context of the isolate
    pub fn same_value(&self, other: &Value) -> BridgeResult<bool> {
        let _guard = self.context.guard()?;
        let a = self.raw()?;
        let b = self.context.resolve(other)?;
        Ok(self.context.raw().same_value(&a, &b))
    }

    /// `===` semantics
    pub fn strict_equals(&self, other: &Value) -> BridgeResult<bool> {
        let _guard = self.context.guard()?;
        let a = self.raw()?;
        let b = self.context.resolve(other)?;
        Ok(self.context.raw().strict_equals(&a, &b))
    }

    fn expect_kind(&self, check: fn(ValueKind) -> bool, expected: &str) -> BridgeResult<Value> {
        let kind = self.value_type()?;
        if check(kind) {
            Ok(self.clone())
        } else {
            Err(BridgeError::type_error(expected, kind.name()))
        }
    }

    pub fn as_object(&self) -> BridgeResult<Object> {
        self.expect_kind(ValueKind::is_object, "object")
            .map(Object::from_value)
    }

    pub fn as_function(&self) -> BridgeResult<Function> {
        self.expect_kind(|kind| kind == ValueKind::Function, "function")
            .map(|value| Function::from_object(Object::from_value(value)))
    }

    pub fn as_promise(&self) -> BridgeResult<Promise> {
        self.expect_kind(|kind| kind == ValueKind::Promise, "promise")
            .map(|value| Promise::from_object(Object::from_value(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::Isolate;

    #[test]
    fn test_predicates() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        assert!(context.undefined().unwrap().is_undefined().unwrap());
        assert!(context.null().unwrap().is_nullish().unwrap());
        assert!(context.boolean(true).unwrap().is_boolean().unwrap());
        assert!(context.string("hi").unwrap().is_string().unwrap());
        assert!(context.eval("[1, 2]").unwrap().is_array().unwrap());
        assert!(context.eval("[1, 2]").unwrap().is_object().unwrap());
        assert!(context.eval("(function () {})").unwrap().is_function().unwrap());
        assert!(context.eval("Promise.resolve(1)").unwrap().is_promise().unwrap());
        assert!(context.eval("new TypeError('x')").unwrap().is_error().unwrap());
        assert!(!context.integer(1).unwrap().is_object().unwrap());
    }

    #[test]
    fn test_integer_conversions() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        assert_eq!(context.integer(-1).unwrap().uint32().unwrap(), u32::MAX);
        assert_eq!(context.number(4294967297.0).unwrap().uint32().unwrap(), 1);
        assert_eq!(context.number(-7.9).unwrap().integer().unwrap(), -7);
        assert_eq!(context.number(f64::NAN).unwrap().integer().unwrap(), 0);
        assert_eq!(context.number(1e300).unwrap().integer().unwrap(), i64::MAX);
        assert_eq!(context.string("12").unwrap().integer().unwrap(), 12);

        assert_eq!(context.integer(3).unwrap().array_index().unwrap(), Some(3));
        assert_eq!(context.string("42").unwrap().array_index().unwrap(), Some(42));
        assert_eq!(context.string("042").unwrap().array_index().unwrap(), None);
        assert_eq!(context.number(1.5).unwrap().array_index().unwrap(), None);
        assert_eq!(context.integer(-1).unwrap().array_index().unwrap(), None);
        assert_eq!(context.boolean(true).unwrap().array_index().unwrap(), None);
    }

    #[test]
    fn test_predicates_fail_on_obsolete_handles() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let stale = context.with_scope(|cx| cx.integer(1).unwrap()).unwrap();
        assert!(matches!(
            stale.is_number(),
            Err(BridgeError::ObsoleteHandle { .. })
        ));
        assert!(stale.is_undefined().is_err());
    }

    #[test]
    fn test_conversions() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let value = context.eval("'42'").unwrap();
        assert_eq!(value.to_number().unwrap(), 42.0);
        assert_eq!(value.to_int32().unwrap(), 42);
        assert!(value.to_boolean().unwrap());
        assert_eq!(value.type_of().unwrap(), "string");
        assert_eq!(
            context.eval("({a: 1})").unwrap().to_detail_string().unwrap(),
            "#<Object>"
        );
    }

    #[test]
    fn test_typed_downcast_failure() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let err = context.integer(5).unwrap().as_function().unwrap_err();
        assert!(matches!(
            err,
            BridgeError::TypeError { ref expected, ref actual }
                if expected == "function" && actual == "number"
        ));
    }

    #[test]
    fn test_equality_across_contexts() {
        let isolate = Isolate::new();
        let first = Context::new(&isolate).unwrap();
        let second = Context::new(&isolate).unwrap();
        let object = first.new_object().unwrap();
        let global = second.global().unwrap();
        global.set("shared", &object).unwrap();
        let back = global.get("shared").unwrap();
        assert!(back.strict_equals(&object).unwrap());
        assert!(!back.same_value(&first.new_object().unwrap()).unwrap());
    }

    #[test]
    fn test_values_of_other_isolates_are_rejected() {
        let a = Isolate::new();
        let b = Isolate::new();
        let ca = Context::new(&a).unwrap();
        let cb = Context::new(&b).unwrap();
        let x = ca.integer(1).unwrap();
        let y = cb.integer(1).unwrap();
        assert!(matches!(x.strict_equals(&y), Err(BridgeError::IsolateMismatch)));
    }
}
