//! tern-runtime - worker-pool runtime on top of the tern bridge.
//!
//! Scripts go in as source text and results come back as JSON. Each worker
//! thread owns one isolate and one context, so jobs never share engine
//! state across threads.
//!
//! # Example
//!
//! ```no_run
//! use tern_runtime::{Engine, Extension, op_sync};
//!
//! #[tokio::main]
//! async fn main() -> tern_runtime::RuntimeResult<()> {
//!     let engine = Engine::builder()
//!         .pool_size(2)
//!         .timeout_ms(1000)
//!         .extension(Extension::new("math").with_ops(vec![op_sync("double", |_, args| {
//!             let n = args.first().and_then(|v| v.as_i64()).unwrap_or(0);
//!             Ok(serde_json::json!(n * 2))
//!         })]))
//!         .build()?;
//!
//!     let result = engine.handle().eval("double(21)").await?;
//!     assert_eq!(result, serde_json::json!(42));
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! EngineHandle --(bounded queue)--> tern-worker-0 .. tern-worker-N
//!                                    each: Isolate + Context + scope per job
//! tern-watchdog --terminate_execution--> worker isolate past its deadline
//! ```

pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod extension;
mod watchdog;
mod worker;

pub use config::{ENV_POOL_SIZE, ENV_TIMEOUT_MS, RuntimeConfig};
pub use console::{ConsoleLevel, reset_console_handler, set_console_handler};
pub use engine::{Engine, EngineBuilder, EngineHandle, EngineStats, EngineStatsSnapshot};
pub use error::{RuntimeError, RuntimeResult};
pub use extension::{Extension, ExtensionState, OpContext, OpDecl, OpHandler, OpResult, op_sync};

pub use tern_core::{BridgeError, BridgeResult, HeapLimits, JsError};
