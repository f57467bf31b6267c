//! Embedded script engine for tern.
//!
//! This crate is the garbage-collected engine that `tern-core` bridges to.
//! It exposes the engine's native surface: isolates that own a heap,
//! contexts that own a global object, raw values that are ids into the heap,
//! and [`Persistent`] roots that keep objects alive across collections.
//!
//! # Example
//!
//! ```
//! use tern_engine::{RawContext, RawIsolate, RawValue};
//!
//! let isolate = RawIsolate::default();
//! let context = RawContext::new(&isolate).unwrap();
//! let result = context.run_script("1 + 1", "example.js").unwrap();
//! assert_eq!(result.as_number(), Some(2.0));
//! ```
//!
//! # Garbage collection
//!
//! Collection only happens when [`RawIsolate::collect_garbage`] is called
//! and never while a script is executing. A [`RawValue::Object`] is a plain
//! id; holding one does not keep the object alive. Ids of reclaimed objects
//! never alias new objects, so a stale id simply stops resolving.
//!
//! ```
//! use tern_engine::{Persistent, RawContext, RawIsolate};
//!
//! let isolate = RawIsolate::default();
//! let context = RawContext::new(&isolate).unwrap();
//! let object = context.new_object().unwrap();
//! let root = Persistent::new(&isolate, object.clone());
//! isolate.collect_garbage();
//! assert!(context.contains(&object));
//! drop(root);
//! isolate.collect_garbage();
//! assert!(!context.contains(&object));
//! ```
//!
//! # Threading
//!
//! Every type here is `Send + Sync`, but the engine does no execution
//! locking of its own: callers must serialize use of an isolate.
//! [`RawIsolate::terminate_execution`] is the one call meant to arrive from
//! another thread while a script runs.

mod builtins;
mod callback;
mod context;
mod convert;
mod error;
mod heap;
mod isolate;
mod json;
mod promise;
mod script;
mod value;
mod vm;

pub use callback::{CallbackInfo, NativeFunction};
pub use context::{RawContext, RawPromiseState};
pub use error::{EngineResult, ErrorKind, ExceptionDetails, Throw};
pub use heap::{HeapLimits, HeapStatistics};
pub use isolate::{CompiledScript, EMBEDDER_DATA_SLOTS, RawIsolate};
pub use value::{ObjectId, Persistent, RawValue, ValueKind};
