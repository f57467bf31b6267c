//! Object heap and mark-sweep collector

use crate::callback::NativeFunction;
use crate::error::ErrorKind;
use crate::script::ast::FunctionCode;
use crate::value::{ObjectId, RawValue};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Heap and stack limits for an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapLimits {
    /// Live objects allowed before execution is terminated (default: 1M)
    pub max_objects: usize,
    /// Nested script calls allowed before a RangeError (default: 100)
    pub max_call_depth: usize,
}

impl Default for HeapLimits {
    fn default() -> Self {
        Self {
            max_objects: 1 << 20,
            max_call_depth: 100,
        }
    }
}

/// Point-in-time view of an isolate's heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Objects currently allocated
    pub live_objects: usize,
    /// Allocated slots, live or free
    pub heap_capacity: usize,
    /// Configured object limit
    pub max_objects: usize,
    /// Objects with at least one persistent root
    pub rooted_objects: usize,
    /// Sum of all root counts
    pub total_roots: usize,
    /// Live contexts
    pub contexts: usize,
    /// Completed collections
    pub collections: u64,
    /// Objects reclaimed by the last collection
    pub last_reclaimed: usize,
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub(crate) struct GcStats {
    pub collections: u64,
    pub total_time_ns: u64,
    pub last_reclaimed: usize,
    pub last_marked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

pub(crate) struct Reaction {
    /// Promise settled with the handler's outcome
    pub derived: Option<ObjectId>,
    pub on_fulfilled: Option<RawValue>,
    pub on_rejected: Option<RawValue>,
}

pub(crate) struct PromiseSlot {
    pub state: PromiseState,
    pub result: RawValue,
    pub reactions: Vec<Reaction>,
}

pub(crate) struct Binding {
    pub value: RawValue,
    pub mutable: bool,
}

pub(crate) enum Callable {
    Script {
        code: Arc<FunctionCode>,
        env: Option<ObjectId>,
        realm: u32,
        /// Lexical `this` of arrow functions
        this: Option<RawValue>,
    },
    Native {
        callback: NativeFunction,
        data: i32,
        realm: u32,
        name: Arc<str>,
    },
    Resolving {
        promise: ObjectId,
        reject: bool,
        realm: u32,
    },
}

impl Callable {
    pub fn realm(&self) -> u32 {
        match self {
            Self::Script { realm, .. }
            | Self::Native { realm, .. }
            | Self::Resolving { realm, .. } => *realm,
        }
    }

    pub fn name(&self) -> Arc<str> {
        match self {
            Self::Script { code, .. } => code.name.clone().unwrap_or_else(|| "".into()),
            Self::Native { name, .. } => name.clone(),
            Self::Resolving { .. } => "".into(),
        }
    }
}

pub(crate) enum ObjectKind {
    Ordinary,
    Array(Vec<RawValue>),
    Function(Callable),
    Error {
        kind: ErrorKind,
        message: Arc<str>,
        stack: Arc<str>,
    },
    Promise(PromiseSlot),
    Resolver(ObjectId),
    Environment {
        vars: FxHashMap<Arc<str>, Binding>,
        parent: Option<ObjectId>,
    },
}

pub(crate) struct HeapObject {
    pub kind: ObjectKind,
    pub proto: Option<ObjectId>,
    pub props: IndexMap<Arc<str>, RawValue>,
    /// Embedder slots invisible to script, fixed at allocation
    pub internal: Box<[RawValue]>,
}

impl HeapObject {
    pub fn new(kind: ObjectKind, proto: Option<ObjectId>) -> Self {
        Self {
            kind,
            proto,
            props: IndexMap::new(),
            internal: Box::default(),
        }
    }

    /// Ordinary object carrying `count` internal fields, all undefined
    pub fn with_internal_fields(count: usize) -> Self {
        Self {
            internal: vec![RawValue::Undefined; count].into_boxed_slice(),
            ..Self::new(ObjectKind::Ordinary, None)
        }
    }

    fn trace(&self, out: &mut VecDeque<ObjectId>) {
        fn push(out: &mut VecDeque<ObjectId>, value: &RawValue) {
            if let Some(id) = value.as_object() {
                out.push_back(id);
            }
        }
        out.extend(self.proto);
        for value in self.props.values().chain(self.internal.iter()) {
            push(out, value);
        }
        match &self.kind {
            ObjectKind::Ordinary | ObjectKind::Error { .. } => {}
            ObjectKind::Array(elements) => {
                for value in elements {
                    push(out, value);
                }
            }
            ObjectKind::Function(Callable::Script { env, this, .. }) => {
                out.extend(*env);
                if let Some(this) = this {
                    push(out, this);
                }
            }
            ObjectKind::Function(Callable::Native { .. }) => {}
            ObjectKind::Function(Callable::Resolving { promise, .. }) => out.push_back(*promise),
            ObjectKind::Promise(slot) => {
                push(out, &slot.result);
                for reaction in &slot.reactions {
                    out.extend(reaction.derived);
                    for handler in [&reaction.on_fulfilled, &reaction.on_rejected]
                        .into_iter()
                        .flatten()
                    {
                        push(out, handler);
                    }
                }
            }
            ObjectKind::Resolver(promise) => out.push_back(*promise),
            ObjectKind::Environment { vars, parent } => {
                for binding in vars.values() {
                    push(out, &binding.value);
                }
                out.extend(*parent);
            }
        }
    }
}

struct Slot {
    generation: u32,
    roots: u32,
    object: Option<HeapObject>,
}

/// Returned when an allocation would exceed the object limit
pub(crate) struct HeapExhausted(pub HeapObject);

pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    max_objects: usize,
    stats: GcStats,
}

impl Heap {
    pub fn new(max_objects: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_objects,
            stats: GcStats::default(),
        }
    }

    pub fn alloc(&mut self, object: HeapObject) -> Result<ObjectId, HeapExhausted> {
        if self.live >= self.max_objects {
            return Err(HeapExhausted(object));
        }
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.roots = 0;
            return Ok(ObjectId {
                index,
                generation: slot.generation,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            roots: 0,
            object: Some(object),
        });
        Ok(ObjectId {
            index,
            generation: 0,
        })
    }

    fn slot(&self, id: ObjectId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.object.is_some())
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.object.is_some())
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.slot(id).and_then(|slot| slot.object.as_ref())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.slot_mut(id).and_then(|slot| slot.object.as_mut())
    }

    pub fn root(&mut self, id: ObjectId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.roots += 1;
        }
    }

    pub fn unroot(&mut self, id: ObjectId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.roots = slot.roots.saturating_sub(1);
        }
    }

    pub fn root_count(&self, id: ObjectId) -> u32 {
        self.slot(id).map_or(0, |slot| slot.roots)
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Drop every object, leaving generations bumped so old ids stay dead
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                slot.roots = 0;
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }

    /// Run a full mark-sweep cycle.
    ///
    /// `extra_roots` are values reachable from outside the heap (context
    /// globals, embedder data, queued jobs); every slot with a non-zero root
    /// count is a root as well.
    pub fn collect(&mut self, extra_roots: &[RawValue]) -> usize {
        let start = Instant::now();
        let mut marked = vec![false; self.slots.len()];
        let mut worklist: VecDeque<ObjectId> =
            extra_roots.iter().filter_map(RawValue::as_object).collect();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.roots > 0 && slot.object.is_some() {
                worklist.push_back(ObjectId {
                    index: index as u32,
                    generation: slot.generation,
                });
            }
        }

        let mut marked_count = 0;
        while let Some(id) = worklist.pop_front() {
            let Some(object) = self.get(id) else { continue };
            let seen = &mut marked[id.index as usize];
            if *seen {
                continue;
            }
            *seen = true;
            marked_count += 1;
            object.trace(&mut worklist);
        }

        let mut reclaimed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_some() && !marked[index] {
                slot.object = None;
                slot.roots = 0;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                reclaimed += 1;
            }
        }
        self.live -= reclaimed;

        self.stats.collections += 1;
        self.stats.total_time_ns += start.elapsed().as_nanos() as u64;
        self.stats.last_reclaimed = reclaimed;
        self.stats.last_marked = marked_count;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            marked = marked_count,
            reclaimed,
            live = self.live,
            "GC cycle complete"
        );

        reclaimed
    }

    pub fn statistics(&self) -> HeapStatistics {
        let mut rooted_objects = 0;
        let mut total_roots = 0;
        for slot in &self.slots {
            if slot.object.is_some() && slot.roots > 0 {
                rooted_objects += 1;
                total_roots += slot.roots as usize;
            }
        }
        HeapStatistics {
            live_objects: self.live,
            heap_capacity: self.slots.len(),
            max_objects: self.max_objects,
            rooted_objects,
            total_roots,
            contexts: 0,
            collections: self.stats.collections,
            last_reclaimed: self.stats.last_reclaimed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordinary() -> HeapObject {
        HeapObject::new(ObjectKind::Ordinary, None)
    }

    #[test]
    fn test_collect_reclaims_unreachable() {
        let mut heap = Heap::new(16);
        let rooted = heap.alloc(ordinary()).ok().unwrap();
        let child = heap.alloc(ordinary()).ok().unwrap();
        let garbage = heap.alloc(ordinary()).ok().unwrap();
        heap.get_mut(rooted)
            .unwrap()
            .props
            .insert("child".into(), RawValue::Object(child));
        heap.root(rooted);

        assert_eq!(heap.collect(&[]), 1);
        assert!(heap.get(rooted).is_some());
        assert!(heap.get(child).is_some());
        assert!(heap.get(garbage).is_none());
        assert_eq!(heap.live(), 2);
    }

    #[test]
    fn test_internal_fields_are_traced() {
        let mut heap = Heap::new(16);
        let holder = heap.alloc(HeapObject::with_internal_fields(2)).ok().unwrap();
        let held = heap.alloc(ordinary()).ok().unwrap();
        heap.get_mut(holder).unwrap().internal[1] = RawValue::Object(held);
        heap.root(holder);

        assert_eq!(heap.collect(&[]), 0);
        assert!(heap.get(held).is_some());
        assert_eq!(heap.get(holder).unwrap().internal.len(), 2);
    }

    #[test]
    fn test_reused_slot_does_not_alias() {
        let mut heap = Heap::new(16);
        let first = heap.alloc(ordinary()).ok().unwrap();
        heap.collect(&[]);
        let second = heap.alloc(ordinary()).ok().unwrap();
        assert_eq!(first.index, second.index);
        assert_ne!(first, second);
        assert!(heap.get(first).is_none());
    }

    #[test]
    fn test_extra_roots_and_unroot() {
        let mut heap = Heap::new(16);
        let a = heap.alloc(ordinary()).ok().unwrap();
        heap.root(a);
        heap.unroot(a);
        assert_eq!(heap.root_count(a), 0);
        assert_eq!(heap.collect(&[RawValue::Object(a)]), 0);
        assert_eq!(heap.collect(&[]), 1);
    }

    #[test]
    fn test_limit() {
        let mut heap = Heap::new(1);
        assert!(heap.alloc(ordinary()).is_ok());
        assert!(heap.alloc(ordinary()).is_err());
    }

    #[test]
    fn test_statistics() {
        let mut heap = Heap::new(8);
        let a = heap.alloc(ordinary()).ok().unwrap();
        heap.root(a);
        heap.root(a);
        let stats = heap.statistics();
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.rooted_objects, 1);
        assert_eq!(stats.total_roots, 2);
    }
}
