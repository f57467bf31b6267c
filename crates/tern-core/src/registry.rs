//! Integer-keyed registries the callback trampoline resolves through
//!
//! The engine can only carry small integers back into host code: the
//! callback id travels as a function's data and the context id as context
//! embedder data. Both registries hand out ids from a monotonic counter and
//! never reuse them, so a stale id fails its lookup instead of reaching the
//! wrong entry.

use crate::context::ContextInner;
use crate::function::HostCallback;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Host closures exposed to scripts, keyed by callback id
pub struct CallbackRegistry {
    next: AtomicU32,
    entries: RwLock<FxHashMap<u32, HostCallback>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, callback: HostCallback) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, callback);
        id
    }

    pub fn lookup(&self, id: u32) -> Option<HostCallback> {
        self.entries.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry. Ids keep counting up.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Live contexts of one isolate, keyed by the id stored in their embedder data
pub(crate) struct ContextRegistry {
    next: AtomicU32,
    entries: RwLock<FxHashMap<u32, Weak<ContextInner>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    /// Register the context built by `build` under a fresh id
    pub fn register(&self, build: impl FnOnce(u32) -> Arc<ContextInner>) -> Arc<ContextInner> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let context = build(id);
        self.entries.write().insert(id, Arc::downgrade(&context));
        context
    }

    pub fn unregister(&self, id: u32) {
        self.entries.write().remove(&id);
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<ContextInner>> {
        self.entries.read().get(&id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove and return every context that is still alive
    pub fn drain(&self) -> Vec<Arc<ContextInner>> {
        self.entries
            .write()
            .drain()
            .filter_map(|(_, context)| context.upgrade())
            .collect()
    }
}
