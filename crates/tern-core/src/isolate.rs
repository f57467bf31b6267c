//! Engine instances and their shared bridge state

use crate::context::ContextInner;
use crate::error::{BridgeError, BridgeResult};
use crate::function::{FunctionCallbackInfo, FunctionTemplate};
use crate::lock::{ExecutionGuard, ExecutionLock, LockStats};
use crate::registry::{CallbackRegistry, ContextRegistry};
use crate::template::ObjectTemplate;
use crate::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use tern_engine::{HeapLimits, HeapStatistics, Persistent, RawIsolate, RawValue};
use tracing::debug;

static INIT: Once = Once::new();

/// One-time process setup. Idempotent; [`Isolate::new`] calls it, so
/// calling it explicitly only moves the cost to a point of your choosing.
pub fn init() {
    INIT.call_once(|| {
        debug!(version = env!("CARGO_PKG_VERSION"), "tern initialized");
    });
}

/// Stored in the engine isolate so native callbacks can find their way back
struct IsolateLink(Weak<IsolateInner>);

pub(crate) struct IsolateInner {
    pub raw: RawIsolate,
    pub lock: ExecutionLock,
    pub callbacks: CallbackRegistry,
    pub contexts: ContextRegistry,
    /// One pending exception slot per running host callback, innermost last
    callback_frames: Mutex<Vec<Option<Persistent>>>,
    disposed: AtomicBool,
}

impl Drop for IsolateInner {
    fn drop(&mut self) {
        self.raw.dispose();
    }
}

/// An engine instance with its own heap.
///
/// Cloning is cheap; clones share the instance. Every operation on the
/// isolate or on anything created from it runs under the isolate's
/// [`ExecutionLock`], so the isolate can be shared between threads while
/// only one of them drives the engine at a time.
#[derive(Clone)]
pub struct Isolate {
    pub(crate) inner: Arc<IsolateInner>,
}

impl Default for Isolate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Isolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Isolate")
            .field("contexts", &self.inner.contexts.len())
            .field("callbacks", &self.inner.callbacks.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Isolate {
    pub fn new() -> Self {
        Self::with_heap_limits(HeapLimits::default())
    }

    pub fn with_heap_limits(limits: HeapLimits) -> Self {
        init();
        let inner = Arc::new(IsolateInner {
            raw: RawIsolate::new(limits),
            lock: ExecutionLock::new(),
            callbacks: CallbackRegistry::new(),
            contexts: ContextRegistry::new(),
            callback_frames: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        inner
            .raw
            .set_embedder_data(Arc::new(IsolateLink(Arc::downgrade(&inner))));
        debug!(
            max_objects = limits.max_objects,
            max_call_depth = limits.max_call_depth,
            "Isolate created"
        );
        Self { inner }
    }

    /// Recover the bridge isolate that owns `raw`
    pub(crate) fn from_raw(raw: &RawIsolate) -> Option<Self> {
        let link = raw.embedder_data()?.downcast::<IsolateLink>().ok()?;
        link.0.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn raw(&self) -> &RawIsolate {
        &self.inner.raw
    }

    /// Acquire the execution lock, failing once the isolate is disposed
    pub(crate) fn guard(&self) -> BridgeResult<ExecutionGuard<'_>> {
        let guard = self.inner.lock.acquire();
        if self.is_disposed() {
            return Err(BridgeError::IsolateDisposed);
        }
        Ok(guard)
    }

    pub fn ptr_eq(&self, other: &Isolate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn execution_lock(&self) -> &ExecutionLock {
        &self.inner.lock
    }

    /// Hold the execution lock until [`unlock`](Self::unlock).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread already called `lock` without unlocking.
    pub fn lock(&self) {
        self.inner.lock.pin();
    }

    /// # Panics
    ///
    /// Panics if the calling thread did not call [`lock`](Self::lock).
    pub fn unlock(&self) {
        self.inner.lock.unpin();
    }

    pub fn lock_stats(&self) -> LockStats {
        self.inner.lock.stats()
    }

    /// Stop the script currently running on this isolate. Callable from any
    /// thread without the lock; the interrupted call fails with
    /// [`BridgeError::Terminated`].
    pub fn terminate_execution(&self) {
        debug!("Terminating execution");
        self.inner.raw.terminate_execution();
    }

    /// Withdraw a termination request that no script has observed yet
    pub fn cancel_terminate_execution(&self) {
        self.inner.raw.cancel_terminate_execution();
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.inner.raw.is_execution_terminating()
    }

    pub fn heap_statistics(&self) -> HeapStatistics {
        let _guard = self.inner.lock.acquire();
        self.inner.raw.heap_statistics()
    }

    /// Run a full collection of the engine heap
    pub fn collect_garbage(&self) -> bool {
        let _guard = self.inner.lock.acquire();
        self.inner.raw.collect_garbage()
    }

    /// Run pending promise reactions
    pub fn perform_microtask_checkpoint(&self) -> BridgeResult<()> {
        let _guard = self.guard()?;
        Ok(self.inner.raw.perform_microtask_checkpoint()?)
    }

    /// Schedule `exception` to be thrown into the script once the innermost
    /// running host callback returns. Returns undefined, which the callback
    /// can hand back as its result.
    ///
    /// Fails with [`BridgeError::NoActiveCallback`] outside a callback.
    pub fn throw_exception(&self, exception: &Value) -> BridgeResult<Value> {
        let _guard = self.guard()?;
        let context = exception.context();
        if !context.isolate().ptr_eq(self) {
            return Err(BridgeError::IsolateMismatch);
        }
        let raw = context.resolve_handle(exception.handle())?;
        let mut frames = self.inner.callback_frames.lock();
        let Some(slot) = frames.last_mut() else {
            return Err(BridgeError::NoActiveCallback);
        };
        *slot = Some(Persistent::new(&self.inner.raw, raw));
        Ok(context.root(RawValue::Undefined))
    }

    /// Open an exception slot for a host callback about to run
    pub(crate) fn enter_callback(&self) {
        self.inner.callback_frames.lock().push(None);
    }

    /// Close the innermost callback's slot, returning what it scheduled
    pub(crate) fn exit_callback(&self) -> Option<Persistent> {
        self.inner.callback_frames.lock().pop().flatten()
    }

    /// Register `callback` so contexts of this isolate can expose it as a
    /// script function
    pub fn new_function_template<F>(&self, callback: F) -> FunctionTemplate
    where
        F: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
    {
        let id = self.inner.callbacks.register(Arc::new(callback));
        FunctionTemplate::new(self.clone(), id)
    }

    /// Blueprint for objects with preset properties and internal fields
    pub fn new_object_template(&self) -> ObjectTemplate {
        ObjectTemplate::new(self)
    }

    /// Live contexts created from this isolate
    pub fn context_count(&self) -> usize {
        self.inner.contexts.len()
    }

    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.len()
    }

    /// Close every context, drop every registered callback and free the
    /// engine heap. Later operations fail with
    /// [`BridgeError::IsolateDisposed`].
    pub fn dispose(&self) {
        let _guard = self.inner.lock.acquire();
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let contexts: Vec<Arc<ContextInner>> = self.inner.contexts.drain();
        for context in &contexts {
            context.teardown();
        }
        self.inner.callbacks.clear();
        self.inner.callback_frames.lock().clear();
        self.inner.raw.dispose();
        debug!(contexts = contexts.len(), "Isolate disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Isolate>();
    }

    #[test]
    fn test_raw_link_round_trip() {
        let isolate = Isolate::new();
        let found = Isolate::from_raw(isolate.raw()).unwrap();
        assert!(found.ptr_eq(&isolate));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let isolate = Isolate::new();
        isolate.dispose();
        isolate.dispose();
        assert!(isolate.is_disposed());
        assert!(matches!(
            isolate.perform_microtask_checkpoint(),
            Err(BridgeError::IsolateDisposed)
        ));
    }

    #[test]
    #[should_panic(expected = "unlock called without first being locked")]
    fn test_unlock_without_lock_panics() {
        Isolate::new().unlock();
    }
}
