//! Deferred values: resolvers, promises and host reactions

use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::function::{FunctionCallbackInfo, HostCallback, callback_data, trampoline};
use crate::object::Object;
use crate::value::Value;
use std::ops::Deref;
use std::sync::Arc;
use tern_engine::{RawPromiseState, RawValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

impl From<RawPromiseState> for PromiseState {
    fn from(state: RawPromiseState) -> Self {
        match state {
            RawPromiseState::Pending => Self::Pending,
            RawPromiseState::Fulfilled => Self::Fulfilled,
            RawPromiseState::Rejected => Self::Rejected,
        }
    }
}

/// The settling side of a promise created by the host
#[derive(Clone, Debug)]
pub struct PromiseResolver {
    object: Object,
}

impl PromiseResolver {
    pub fn new(context: &Context) -> BridgeResult<Self> {
        let _guard = context.guard()?;
        let resolver = context.finish(context.raw().new_promise_resolver())?;
        Ok(Self {
            object: Object::from_value(resolver),
        })
    }

    pub fn promise(&self) -> BridgeResult<Promise> {
        let context = self.object.context();
        let _guard = context.guard()?;
        let resolver = self.object.raw()?;
        let promise = context
            .raw()
            .resolver_promise(&resolver)
            .ok_or_else(|| BridgeError::internal("resolver lost its promise"))?;
        Ok(Promise::from_object(Object::from_value(context.root(promise))))
    }

    /// Fulfil the promise. Returns `false` if it was already settled.
    pub fn resolve(&self, value: &Value) -> BridgeResult<bool> {
        self.settle(value, false)
    }

    /// Reject the promise. Returns `false` if it was already settled.
    pub fn reject(&self, reason: &Value) -> BridgeResult<bool> {
        self.settle(reason, true)
    }

    fn settle(&self, value: &Value, reject: bool) -> BridgeResult<bool> {
        let context = self.object.context();
        let _guard = context.guard()?;
        let resolver = self.object.raw()?;
        let value = context.resolve(value)?;
        let settled = if reject {
            context.raw().reject(&resolver, value)?
        } else {
            context.raw().resolve(&resolver, value)?
        };
        Ok(settled)
    }
}

/// A promise object
#[derive(Clone, Debug)]
pub struct Promise {
    object: Object,
}

impl Deref for Promise {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.object
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        promise.object.into_value()
    }
}

impl Promise {
    pub(crate) fn from_object(object: Object) -> Self {
        Self { object }
    }

    pub fn state(&self) -> BridgeResult<PromiseState> {
        let context = self.context();
        let _guard = context.guard()?;
        let promise = self.raw()?;
        context
            .raw()
            .promise_state(&promise)
            .map(PromiseState::from)
            .ok_or_else(|| BridgeError::type_error("promise", "object"))
    }

    /// Fulfilment value or rejection reason; undefined while pending
    pub fn result(&self) -> BridgeResult<Value> {
        let context = self.context();
        let _guard = context.guard()?;
        let promise = self.raw()?;
        let result = context
            .raw()
            .promise_result(&promise)
            .ok_or_else(|| BridgeError::type_error("promise", "object"))?;
        Ok(context.root(result))
    }

    /// React to fulfilment. Reactions run at the next microtask checkpoint.
    pub fn then<F>(&self, on_fulfilled: F) -> BridgeResult<Promise>
    where
        F: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
    {
        self.chain(Some(Arc::new(on_fulfilled)), None)
    }

    pub fn then2<F, R>(&self, on_fulfilled: F, on_rejected: R) -> BridgeResult<Promise>
    where
        F: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
        R: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
    {
        self.chain(Some(Arc::new(on_fulfilled)), Some(Arc::new(on_rejected)))
    }

    pub fn catch<R>(&self, on_rejected: R) -> BridgeResult<Promise>
    where
        R: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
    {
        self.chain(None, Some(Arc::new(on_rejected)))
    }

    fn chain(
        &self,
        on_fulfilled: Option<HostCallback>,
        on_rejected: Option<HostCallback>,
    ) -> BridgeResult<Promise> {
        let context = self.context();
        let _guard = context.guard()?;
        let promise = self.raw()?;

        // Handlers stay unrooted: nothing collects before the engine links
        // them into the promise's reactions.
        let handler = |callback: Option<HostCallback>| -> BridgeResult<Option<RawValue>> {
            let Some(callback) = callback else {
                return Ok(None);
            };
            let id = context.isolate().inner.callbacks.register(callback);
            let function = context.raw().new_function(trampoline, callback_data(id)?, "")?;
            Ok(Some(function))
        };
        let on_fulfilled = handler(on_fulfilled)?;
        let on_rejected = handler(on_rejected)?;

        let derived = context.finish(context.raw().promise_then(&promise, on_fulfilled, on_rejected))?;
        Ok(Promise::from_object(Object::from_value(derived)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::Isolate;
    use parking_lot::Mutex;

    #[test]
    fn test_resolver_lifecycle() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let resolver = PromiseResolver::new(&context).unwrap();
        let promise = resolver.promise().unwrap();
        assert_eq!(promise.state().unwrap(), PromiseState::Pending);
        assert!(promise.result().unwrap().is_undefined().unwrap());

        assert!(resolver.resolve(&context.integer(7).unwrap()).unwrap());
        assert!(!resolver.reject(&context.integer(8).unwrap()).unwrap());
        assert_eq!(promise.state().unwrap(), PromiseState::Fulfilled);
        assert_eq!(promise.result().unwrap().to_number().unwrap(), 7.0);
    }

    #[test]
    fn test_then_runs_at_checkpoint() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let resolver = PromiseResolver::new(&context).unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let derived = resolver
            .promise()
            .unwrap()
            .then(move |info| {
                let value = info.arg(0)?.to_number().ok()?;
                *sink.lock() = Some(value);
                info.context().number(value * 2.0).ok()
            })
            .unwrap();

        resolver.resolve(&context.integer(21).unwrap()).unwrap();
        assert_eq!(*seen.lock(), None);
        isolate.perform_microtask_checkpoint().unwrap();
        assert_eq!(*seen.lock(), Some(21.0));
        assert_eq!(derived.result().unwrap().to_number().unwrap(), 42.0);
    }

    #[test]
    fn test_catch_and_then2() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let rejected = context
            .eval("Promise.reject(new Error('nope'))")
            .unwrap()
            .as_promise()
            .unwrap();
        let recovered = rejected
            .catch(|info| info.context().string("recovered").ok())
            .unwrap();
        let both = rejected
            .then2(|_| None, |info| info.arg(0).cloned())
            .unwrap();
        isolate.perform_microtask_checkpoint().unwrap();

        assert_eq!(recovered.state().unwrap(), PromiseState::Fulfilled);
        assert_eq!(recovered.result().unwrap().to_string().unwrap(), "recovered");
        assert!(both.result().unwrap().is_error().unwrap());
    }

    #[test]
    fn test_script_awaits_host_promise() {
        let isolate = Isolate::new();
        let context = Context::new(&isolate).unwrap();
        let resolver = PromiseResolver::new(&context).unwrap();
        let global = context.global().unwrap();
        global.set("pending", &resolver.promise().unwrap()).unwrap();
        context
            .eval("var out = 0; pending.then(function (v) { out = v + 1; });")
            .unwrap();
        resolver.resolve(&context.integer(1).unwrap()).unwrap();
        isolate.perform_microtask_checkpoint().unwrap();
        assert_eq!(global.get("out").unwrap().to_number().unwrap(), 2.0);
    }
}
