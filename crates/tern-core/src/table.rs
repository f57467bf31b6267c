//! Per-context arena of rooted values with checkpoint/rewind scopes

use crate::error::{BridgeError, BridgeResult};
use crate::handle::HandleRef;
use std::sync::atomic::{AtomicU32, Ordering};
use tern_engine::Persistent;

/// Scope ids are unique across every table in the process, so a handle
/// minted by one table can never match a slot of another.
static NEXT_SCOPE: AtomicU32 = AtomicU32::new(1);

fn next_scope_id() -> u32 {
    claim_id(&NEXT_SCOPE)
}

/// Take the next id from `counter`.
///
/// # Panics
///
/// Panics once the id space is exhausted; wrapping would let a stale
/// handle alias a live scope.
fn claim_id(counter: &AtomicU32) -> u32 {
    match counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1)) {
        Ok(id) => id,
        Err(id) => {
            tracing::error!(last = id, "Handle scope ids exhausted");
            panic!("handle scope ids exhausted");
        }
    }
}

/// Counters kept over the lifetime of a table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Values ever added
    pub created: u64,
    /// Largest number of slots held at once
    pub high_water: usize,
}

/// Arena of strong roots owned by one context.
///
/// Values are appended with the id of the scope that is current at the
/// time; [`pop_scope`](Self::pop_scope) truncates back to the length
/// recorded by the matching [`push_scope`](Self::push_scope), which is the
/// only way slots are released. Callers must hold the isolate's execution
/// lock; the table does no locking of its own.
pub struct HandleTable {
    slots: Vec<(u32, Persistent)>,
    scopes: Vec<(u32, usize)>,
    current: u32,
    stats: TableStats,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            scopes: Vec::new(),
            current: next_scope_id(),
            stats: TableStats::default(),
        }
    }

    /// Root `value` in the current scope
    pub fn add_value(&mut self, value: Persistent) -> HandleRef {
        let index = self.slots.len() as u32;
        self.slots.push((self.current, value));
        self.stats.created += 1;
        self.stats.high_water = self.stats.high_water.max(self.slots.len());
        HandleRef::new(self.current, index)
    }

    /// Resolve `handle`, failing if its scope has been popped or it was
    /// minted by another table
    pub fn get_value(&self, handle: HandleRef) -> BridgeResult<&Persistent> {
        match self.slots.get(handle.index as usize) {
            Some((scope, value)) if *scope == handle.scope => Ok(value),
            _ => {
                tracing::warn!(
                    scope = handle.scope,
                    index = handle.index,
                    current = self.current,
                    len = self.slots.len(),
                    "Dereferenced obsolete handle"
                );
                Err(BridgeError::ObsoleteHandle {
                    scope: handle.scope,
                    index: handle.index,
                })
            }
        }
    }

    /// Whether `handle` would resolve, without logging
    pub fn contains(&self, handle: HandleRef) -> bool {
        matches!(self.slots.get(handle.index as usize), Some((scope, _)) if *scope == handle.scope)
    }

    /// Open a scope; values added from now on are released by the matching pop
    pub fn push_scope(&mut self) -> u32 {
        self.scopes.push((self.current, self.slots.len()));
        self.current = next_scope_id();
        tracing::trace!(scope = self.current, depth = self.scopes.len(), "Pushed handle scope");
        self.current
    }

    /// Close the current scope. Returns `false` and changes nothing if
    /// `expected` is not the current scope.
    pub fn pop_scope(&mut self, expected: u32) -> bool {
        if expected != self.current {
            return false;
        }
        let Some((saved, length)) = self.scopes.pop() else {
            return false;
        };
        let released = self.slots.len() - length;
        self.slots.truncate(length);
        self.current = saved;
        tracing::trace!(scope = expected, released, "Popped handle scope");
        true
    }

    pub fn current_scope(&self) -> u32 {
        self.current
    }

    /// Number of open scopes above the base scope
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        self.stats
    }

    /// Release every slot and scope, invalidating all outstanding handles
    pub fn clear(&mut self) {
        self.slots.clear();
        self.scopes.clear();
        self.current = next_scope_id();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_engine::{RawContext, RawIsolate, RawValue};

    fn number(isolate: &RawIsolate, n: f64) -> Persistent {
        Persistent::new(isolate, RawValue::Number(n))
    }

    #[test]
    fn test_scope_ids_do_not_wrap() {
        let counter = AtomicU32::new(u32::MAX - 1);
        assert_eq!(claim_id(&counter), u32::MAX - 1);
        let exhausted = std::panic::catch_unwind(|| claim_id(&counter));
        assert!(exhausted.is_err());
        assert_eq!(counter.load(Ordering::Relaxed), u32::MAX);
    }

    #[test]
    fn test_add_and_get() {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        let handle = table.add_value(number(&isolate, 1.0));
        assert_eq!(handle.index, 0);
        assert_eq!(handle.scope, table.current_scope());
        assert_eq!(table.get_value(handle).unwrap().value().as_number(), Some(1.0));
    }

    #[test]
    fn test_rewind_invalidates_inner_handles() {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        let outer = table.add_value(number(&isolate, 1.0));
        let scope = table.push_scope();
        let inner = table.add_value(number(&isolate, 2.0));
        assert!(table.pop_scope(scope));

        assert_eq!(table.len(), 1);
        assert!(table.get_value(outer).is_ok());
        assert!(matches!(
            table.get_value(inner),
            Err(BridgeError::ObsoleteHandle { .. })
        ));
    }

    #[test]
    fn test_reused_index_does_not_resolve_old_handle() {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        let scope = table.push_scope();
        let stale = table.add_value(number(&isolate, 1.0));
        assert!(table.pop_scope(scope));

        let fresh = table.add_value(number(&isolate, 2.0));
        assert_eq!(stale.index, fresh.index);
        assert!(!table.contains(stale));
        assert_eq!(table.get_value(fresh).unwrap().value().as_number(), Some(2.0));
    }

    #[test]
    fn test_pop_rejects_mismatch() {
        let mut table = HandleTable::new();
        let base = table.current_scope();
        assert!(!table.pop_scope(base));

        let outer = table.push_scope();
        let inner = table.push_scope();
        assert!(!table.pop_scope(outer));
        assert_eq!(table.depth(), 2);
        assert!(table.pop_scope(inner));
        assert!(table.pop_scope(outer));
        assert_eq!(table.current_scope(), base);
    }

    #[test]
    fn test_popping_releases_roots() {
        let isolate = RawIsolate::default();
        let context = RawContext::new(&isolate).unwrap();
        let object = context.new_object().unwrap();
        let mut table = HandleTable::new();

        let scope = table.push_scope();
        table.add_value(Persistent::new(&isolate, object.clone()));
        isolate.collect_garbage();
        assert!(context.contains(&object));

        assert!(table.pop_scope(scope));
        isolate.collect_garbage();
        assert!(!context.contains(&object));
    }

    #[test]
    fn test_stats_track_high_water() {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        let scope = table.push_scope();
        for i in 0..5 {
            table.add_value(number(&isolate, f64::from(i)));
        }
        table.pop_scope(scope);
        table.add_value(number(&isolate, 0.0));

        let stats = table.stats();
        assert_eq!(stats.created, 6);
        assert_eq!(stats.high_water, 5);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_clear() {
        let isolate = RawIsolate::default();
        let mut table = HandleTable::new();
        let handle = table.add_value(number(&isolate, 1.0));
        table.push_scope();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.depth(), 0);
        assert!(table.get_value(handle).is_err());
    }
}
