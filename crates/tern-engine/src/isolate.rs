//! Isolates: one heap, its contexts, and the execution state shared by them

use crate::error::{EngineResult, ErrorKind, Throw};
use crate::heap::{Heap, HeapExhausted, HeapLimits, HeapObject, HeapStatistics};
use crate::script::ast::{Pos, Program};
use crate::script::parser::{ParseError, parse_program};
use crate::value::{ObjectId, RawValue};
use crate::vm::Vm;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Number of embedder data slots per context
pub const EMBEDDER_DATA_SLOTS: usize = 4;

pub(crate) struct ContextState {
    pub global: ObjectId,
    pub array_proto: ObjectId,
    pub promise_proto: ObjectId,
    pub embedder: [RawValue; EMBEDDER_DATA_SLOTS],
}

/// A script call currently on the stack
pub(crate) struct Frame {
    pub function: Option<Arc<str>>,
    pub origin: Arc<str>,
    pub pos: Pos,
}

/// A queued promise reaction
pub(crate) struct Microtask {
    pub handler: Option<RawValue>,
    pub derived: Option<ObjectId>,
    pub argument: RawValue,
    pub rejected: bool,
}

pub(crate) struct IsolateCore {
    pub heap: Mutex<Heap>,
    pub contexts: Mutex<FxHashMap<u32, ContextState>>,
    pub frames: Mutex<Vec<Frame>>,
    pub microtasks: Mutex<VecDeque<Microtask>>,
    pub limits: HeapLimits,
    next_context: AtomicU32,
    terminating: AtomicBool,
    executing: AtomicU32,
    draining: AtomicBool,
    disposed: AtomicBool,
    embedder: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl IsolateCore {
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst) > 0
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Allocate, terminating execution when the object limit is hit
    pub fn alloc(&self, object: HeapObject) -> EngineResult<ObjectId> {
        match self.heap.lock().alloc(object) {
            Ok(id) => Ok(id),
            Err(HeapExhausted(_)) => {
                if self.is_executing() {
                    self.terminating.store(true, Ordering::SeqCst);
                }
                Err(Throw::Terminated)
            }
        }
    }

    pub fn next_context_id(&self) -> u32 {
        self.next_context.fetch_add(1, Ordering::Relaxed)
    }

    /// Everything outside the heap that keeps objects alive
    fn external_roots(&self) -> Vec<RawValue> {
        let mut roots = Vec::new();
        for state in self.contexts.lock().values() {
            roots.push(RawValue::Object(state.global));
            roots.push(RawValue::Object(state.array_proto));
            roots.push(RawValue::Object(state.promise_proto));
            roots.extend(state.embedder.iter().cloned());
        }
        for job in self.microtasks.lock().iter() {
            roots.extend(job.handler.iter().cloned());
            roots.extend(job.derived.map(RawValue::Object));
            roots.push(job.argument.clone());
        }
        roots
    }
}

/// Handle to an engine instance.
///
/// Cloning is cheap and every clone refers to the same heap. The isolate
/// itself performs no execution locking; callers serialize access.
/// [`terminate_execution`](Self::terminate_execution) is the only operation
/// meant to be issued concurrently with a running script.
#[derive(Clone)]
pub struct RawIsolate {
    core: Arc<IsolateCore>,
}

impl fmt::Debug for RawIsolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawIsolate")
            .field("ptr", &Arc::as_ptr(&self.core))
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Default for RawIsolate {
    fn default() -> Self {
        Self::new(HeapLimits::default())
    }
}

impl RawIsolate {
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            core: Arc::new(IsolateCore {
                heap: Mutex::new(Heap::new(limits.max_objects)),
                contexts: Mutex::new(FxHashMap::default()),
                frames: Mutex::new(Vec::new()),
                microtasks: Mutex::new(VecDeque::new()),
                limits,
                next_context: AtomicU32::new(1),
                terminating: AtomicBool::new(false),
                executing: AtomicU32::new(0),
                draining: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                embedder: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<IsolateCore> {
        &self.core
    }

    pub fn limits(&self) -> HeapLimits {
        self.core.limits
    }

    /// Both handles refer to the same isolate
    pub fn ptr_eq(&self, other: &RawIsolate) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Ask the running script to stop. Safe to call from any thread.
    ///
    /// The request stays pending until a script observes it, so a request
    /// issued while nothing runs terminates the next execution unless it is
    /// cancelled first.
    pub fn terminate_execution(&self) {
        self.core.terminating.store(true, Ordering::SeqCst);
    }

    pub fn cancel_terminate_execution(&self) {
        self.core.terminating.store(false, Ordering::SeqCst);
    }

    pub fn is_execution_terminating(&self) -> bool {
        self.core.is_terminating()
    }

    /// A script or native callback is on the stack
    pub fn is_executing(&self) -> bool {
        self.core.is_executing()
    }

    pub fn heap_statistics(&self) -> HeapStatistics {
        let mut stats = self.core.heap.lock().statistics();
        stats.contexts = self.core.contexts.lock().len();
        stats
    }

    /// Run a full collection. Returns `false` without collecting while a
    /// script is executing.
    pub fn collect_garbage(&self) -> bool {
        if self.is_executing() || self.is_disposed() {
            return false;
        }
        let roots = self.core.external_roots();
        self.core.heap.lock().collect(&roots);
        true
    }

    /// Run queued promise reactions until the queue is empty
    pub fn perform_microtask_checkpoint(&self) -> EngineResult<()> {
        self.execute(|| self.drain_microtasks())
    }

    /// Parse `source` once so it can run in any context of this isolate
    pub fn compile(&self, source: &str, origin: &str) -> EngineResult<CompiledScript> {
        if self.is_disposed() {
            return Err(Throw::Disposed("isolate"));
        }
        match parse_program(source, origin) {
            Ok(program) => Ok(CompiledScript {
                program: Arc::new(program),
            }),
            Err(err) => Err(self.syntax_error(err, origin)),
        }
    }

    pub fn set_embedder_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.core.embedder.lock() = Some(data);
    }

    pub fn embedder_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.core.embedder.lock().clone()
    }

    /// Tear down every context and free the whole heap.
    ///
    /// Outstanding [`Persistent`](crate::Persistent) roots become inert and
    /// every later operation reports [`Throw::Disposed`].
    pub fn dispose(&self) {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.contexts.lock().clear();
        self.core.microtasks.lock().clear();
        self.core.frames.lock().clear();
        self.core.heap.lock().clear();
        *self.core.embedder.lock() = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Run `f` as script execution.
    ///
    /// The outermost execution drains the microtask queue on success and
    /// consumes a termination request on the way out. The execution count
    /// and the frame stack are restored even when a native callback panics.
    pub(crate) fn execute<R>(&self, f: impl FnOnce() -> EngineResult<R>) -> EngineResult<R> {
        if self.is_disposed() {
            return Err(Throw::Disposed("isolate"));
        }
        let outermost = self.core.executing.fetch_add(1, Ordering::SeqCst) == 0;
        let result = {
            let _exit = scopeguard::guard((), |_| {
                self.core.executing.fetch_sub(1, Ordering::SeqCst);
                if outermost {
                    self.core.frames.lock().clear();
                }
            });
            let result = if self.core.is_terminating() {
                Err(Throw::Terminated)
            } else {
                f()
            };
            match result {
                Ok(value) if outermost => self.drain_microtasks().map(|()| value),
                other => other,
            }
        };
        if outermost && matches!(result, Err(Throw::Terminated)) {
            self.cancel_terminate_execution();
        }
        result
    }

    fn drain_microtasks(&self) -> EngineResult<()> {
        if self.core.draining.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _drained = scopeguard::guard((), |_| {
            self.core.draining.store(false, Ordering::SeqCst);
        });
        let vm = Vm::new(self);
        loop {
            let job = self.core.microtasks.lock().pop_front();
            let Some(job) = job else { return Ok(()) };
            if let Err(Throw::Terminated) = vm.run_microtask(job) {
                return Err(Throw::Terminated);
            }
            if self.core.is_terminating() {
                return Err(Throw::Terminated);
            }
        }
    }

    pub(crate) fn syntax_error(&self, err: ParseError, origin: &str) -> Throw {
        let location = format!("{}:{}:{}", origin, err.pos.line, err.pos.column);
        let vm = Vm::new(self);
        match vm.make_error(ErrorKind::SyntaxError, &err.message) {
            Ok(exception) => {
                let mut throw = vm.throw_value(exception);
                if let Throw::Exception(details) = &mut throw {
                    details.location = Some(location);
                }
                throw
            }
            Err(throw) => throw,
        }
    }
}

/// A parsed script that can run in any context of the isolate that compiled it
#[derive(Clone)]
pub struct CompiledScript {
    pub(crate) program: Arc<Program>,
}

impl CompiledScript {
    pub fn origin(&self) -> &str {
        &self.program.origin
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("origin", &self.origin())
            .finish()
    }
}
