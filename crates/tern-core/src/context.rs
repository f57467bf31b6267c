//! Execution contexts and their handle tables

use crate::error::{BridgeError, BridgeResult};
use crate::handle::HandleRef;
use crate::isolate::Isolate;
use crate::lock::ExecutionGuard;
use crate::object::Object;
use crate::table::{HandleTable, TableStats};
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tern_engine::{EngineResult, ErrorKind, Persistent, RawContext, RawValue};
use tracing::{debug, trace};

/// Engine embedder slot holding the bridge's context id
pub const CONTEXT_ID_SLOT: usize = 1;

pub(crate) struct ContextInner {
    pub id: u32,
    pub isolate: Isolate,
    pub raw: RawContext,
    pub table: Mutex<HandleTable>,
    closed: AtomicBool,
}

impl ContextInner {
    /// Release every root, detach the engine context and leave the registry.
    /// Runs once; later calls return immediately.
    pub fn teardown(&self) {
        let _guard = self.isolate.inner.lock.acquire();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.isolate.inner.contexts.unregister(self.id);
        let stats = {
            let mut table = self.table.lock();
            let stats = table.stats();
            table.clear();
            stats
        };
        self.raw.dispose();
        trace!(
            context = self.id,
            created = stats.created,
            high_water = stats.high_water,
            "Context closed"
        );
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A global scope inside an [`Isolate`] plus the handle table that roots
/// every value the bridge hands out for it.
///
/// Cloning is cheap. The context closes when [`close`](Self::close) is
/// called, when its isolate is disposed, or when the last clone (including
/// the clones held by its values) is dropped.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Context {
    pub fn new(isolate: &Isolate) -> BridgeResult<Self> {
        let _guard = isolate.guard()?;
        let raw = RawContext::new(isolate.raw())?;
        let inner = isolate.inner.contexts.register(|id| {
            raw.set_embedder_data(CONTEXT_ID_SLOT, RawValue::Number(f64::from(id)));
            Arc::new(ContextInner {
                id,
                isolate: isolate.clone(),
                raw,
                table: Mutex::new(HandleTable::new()),
                closed: AtomicBool::new(false),
            })
        });
        debug!(context = inner.id, "Context created");
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// Id under which the context is registered with its isolate
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn isolate(&self) -> &Isolate {
        &self.inner.isolate
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the context now. Every value of this context becomes obsolete.
    pub fn close(&self) {
        self.inner.teardown();
    }

    // Internal plumbing. None of these take the execution lock; callers do.

    pub(crate) fn guard(&self) -> BridgeResult<ExecutionGuard<'_>> {
        let guard = self.inner.isolate.guard()?;
        if self.is_closed() {
            return Err(BridgeError::ContextClosed);
        }
        Ok(guard)
    }

    pub(crate) fn raw(&self) -> &RawContext {
        &self.inner.raw
    }

    /// Root `value` in the current scope of this context's table
    pub(crate) fn root(&self, value: RawValue) -> Value {
        let persistent = Persistent::new(self.inner.isolate.raw(), value);
        let handle = self.inner.table.lock().add_value(persistent);
        Value::new(self.clone(), handle)
    }

    /// Root a successful engine result; failures root nothing
    pub(crate) fn finish(&self, result: EngineResult<RawValue>) -> BridgeResult<Value> {
        Ok(self.root(result?))
    }

    pub(crate) fn resolve_handle(&self, handle: HandleRef) -> BridgeResult<RawValue> {
        let table = self.inner.table.lock();
        Ok(table.get_value(handle)?.value().clone())
    }

    /// Engine value behind `value`, which may belong to any context of
    /// this isolate
    pub(crate) fn resolve(&self, value: &Value) -> BridgeResult<RawValue> {
        if !value.context().isolate().ptr_eq(self.isolate()) {
            return Err(BridgeError::IsolateMismatch);
        }
        value.context().resolve_handle(value.handle())
    }

    fn primitive(&self, value: RawValue) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        Ok(self.root(value))
    }

    // Script execution

    pub fn run_script(&self, source: &str, origin: &str) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        self.finish(self.raw().run_script(source, origin))
    }

    pub fn eval(&self, source: &str) -> BridgeResult<Value> {
        self.run_script(source, "<eval>")
    }

    pub fn global(&self) -> BridgeResult<Object> {
        let _guard = self.guard()?;
        self.finish(self.raw().global()).map(Object::from_value)
    }

    // Value constructors

    pub fn undefined(&self) -> BridgeResult<Value> {
        self.primitive(RawValue::Undefined)
    }

    pub fn null(&self) -> BridgeResult<Value> {
        self.primitive(RawValue::Null)
    }

    pub fn boolean(&self, value: bool) -> BridgeResult<Value> {
        self.primitive(RawValue::Boolean(value))
    }

    pub fn integer(&self, value: i32) -> BridgeResult<Value> {
        self.primitive(RawValue::Number(f64::from(value)))
    }

    pub fn number(&self, value: f64) -> BridgeResult<Value> {
        self.primitive(RawValue::Number(value))
    }

    pub fn string(&self, value: &str) -> BridgeResult<Value> {
        self.primitive(RawValue::string(value))
    }

    pub fn new_object(&self) -> BridgeResult<Object> {
        let _guard = self.guard()?;
        self.finish(self.raw().new_object()).map(Object::from_value)
    }

    pub fn new_array(&self, elements: &[&Value]) -> BridgeResult<Object> {
        let _guard = self.guard()?;
        let elements = elements
            .iter()
            .map(|element| self.resolve(element))
            .collect::<BridgeResult<Vec<_>>>()?;
        self.finish(self.raw().new_array(elements))
            .map(Object::from_value)
    }

    /// Error object of the given kind, with a stack captured at creation
    pub fn new_error(&self, kind: ErrorKind, message: &str) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        self.finish(self.raw().new_error(kind, message))
    }

    /// Re-mint a handle of this context's table as a [`Value`]. Fails with
    /// [`BridgeError::ObsoleteHandle`] if the table did not mint it or has
    /// since released it.
    pub fn value_from_handle(&self, handle: HandleRef) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        self.resolve_handle(handle)?;
        Ok(Value::new(self.clone(), handle))
    }

    // Scopes

    /// Open a handle scope; values created until the matching
    /// [`pop_scope`](Self::pop_scope) are released together
    pub fn push_scope(&self) -> BridgeResult<u32> {
        let _guard = self.guard()?;
        Ok(self.inner.table.lock().push_scope())
    }

    /// Close `scope`. Returns `false` without releasing anything if
    /// `scope` is not the innermost open scope.
    pub fn pop_scope(&self, scope: u32) -> BridgeResult<bool> {
        let _guard = self.guard()?;
        Ok(self.inner.table.lock().pop_scope(scope))
    }

    /// Run `f` inside a fresh scope that is popped however `f` exits.
    /// Values created inside are obsolete afterwards; convert what you need
    /// to host data before returning.
    pub fn with_scope<R>(&self, f: impl FnOnce(&Context) -> R) -> BridgeResult<R> {
        let scope = self.push_scope()?;
        let context = scopeguard::guard(self, |context| {
            if !matches!(context.pop_scope(scope), Ok(true)) {
                tracing::warn!(context = context.id(), scope, "Scope was not innermost on exit");
            }
        });
        Ok(f(&context))
    }

    /// Slots currently held by this context's table
    pub fn handle_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn table_stats(&self) -> TableStats {
        self.inner.table.lock().stats()
    }
}
