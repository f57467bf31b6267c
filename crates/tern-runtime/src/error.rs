//! Error types for tern-runtime
//!
//! Wraps bridge errors and adds the failures of the worker pool.

use thiserror::Error;

pub use tern_core::{BridgeError, BridgeResult};

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Error raised by the bridge or the script
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Script execution timed out
    #[error("Script execution timed out after {0}ms")]
    Timeout(u64),

    /// The engine has shut down
    #[error("Engine shut down")]
    Shutdown,

    /// The job queue is at capacity
    #[error("Job queue full")]
    QueueFull,

    /// An extension op failed
    #[error("Op error: {0}")]
    Op(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RuntimeError {
    /// Create an op error
    pub fn op(message: impl Into<String>) -> Self {
        Self::Op(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Bridge(BridgeError::internal(message))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Script-level failure (exception thrown by the script)
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Bridge(err) if err.is_script_error())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Bridge(BridgeError::Json(e))
    }
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
