//! Handle bridge between host code and the tern engine.
//!
//! Host code never holds engine pointers. Every value handed out is a
//! [`Value`]: the owning [`Context`] plus a [`HandleRef`] into that
//! context's [`HandleTable`], which keeps the engine value rooted against the
//! engine's collector. Tables grow until a scope is popped, so bound table
//! growth by bracketing bursts of work with [`Context::push_scope`] /
//! [`Context::pop_scope`] or [`Context::with_scope`].
//!
//! # Example
//!
//! ```
//! use tern_core::{Context, Isolate};
//!
//! let isolate = Isolate::new();
//! let context = Context::new(&isolate).unwrap();
//!
//! let double = isolate
//!     .new_function_template(|info| {
//!         let n = info.arg(0)?.to_number().ok()?;
//!         info.context().number(n * 2.0).ok()
//!     })
//!     .with_name("double")
//!     .get_function(&context)
//!     .unwrap();
//! context.global().unwrap().set("double", &double).unwrap();
//!
//! let result = context.eval("double(21)").unwrap();
//! assert_eq!(result.to_number().unwrap(), 42.0);
//! ```
//!
//! # Scopes
//!
//! ```
//! use tern_core::{BridgeError, Context, Isolate};
//!
//! let isolate = Isolate::new();
//! let context = Context::new(&isolate).unwrap();
//! let scope = context.push_scope().unwrap();
//! let temp = context.string("temporary").unwrap();
//! assert!(context.pop_scope(scope).unwrap());
//! assert!(matches!(temp.to_string(), Err(BridgeError::ObsoleteHandle { .. })));
//! ```
//!
//! # Threading
//!
//! [`Isolate`], [`Context`] and [`Value`] are `Send + Sync`; every
//! operation takes the isolate's [`ExecutionLock`], so threads are
//! serialized onto the engine. The lock is owned by a thread, and the
//! guard proving it cannot leave that thread:
//!
//! ```compile_fail
//! use tern_core::Isolate;
//!
//! let isolate = Isolate::new();
//! let guard = isolate.execution_lock().acquire();
//! std::thread::spawn(move || drop(guard));
//! ```
//!
//! [`Isolate::terminate_execution`] is the one call that does not wait for
//! the lock; the interrupted operation fails with [`BridgeError::Terminated`].

mod context;
mod error;
mod function;
mod handle;
mod isolate;
mod json;
mod lock;
mod object;
mod promise;
mod registry;
mod script;
mod table;
mod template;
mod value;

pub use context::{CONTEXT_ID_SLOT, Context};
pub use error::{BridgeError, BridgeResult, JsError};
pub use function::{Function, FunctionCallbackInfo, FunctionTemplate, HostCallback};
pub use handle::HandleRef;
pub use isolate::{Isolate, init};
pub use lock::{ExecutionGuard, ExecutionLock, LockStats};
pub use object::Object;
pub use promise::{Promise, PromiseResolver, PromiseState};
pub use registry::CallbackRegistry;
pub use script::UnboundScript;
pub use table::{HandleTable, TableStats};
pub use template::{ObjectTemplate, TemplateValue};
pub use value::Value;

pub use tern_engine::{ErrorKind, HeapLimits, HeapStatistics, ValueKind};
