//! Bridge error types
//!
//! Script failures keep the engine's message, location and stack so callers
//! can report them without reaching back into the engine.

use std::fmt;
use tern_engine::{ExceptionDetails, Throw};
use thiserror::Error;

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Structured record of an exception raised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsError {
    /// Detail string of the thrown value, e.g. `TypeError: x is not a function`
    pub message: String,
    /// `origin:line:column` of the throw site
    pub location: Option<String>,
    /// Stack trace when the thrown value was an error object
    pub stack: Option<String>,
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {}", self.message, location),
            None => f.write_str(&self.message),
        }
    }
}

impl From<ExceptionDetails> for JsError {
    fn from(details: ExceptionDetails) -> Self {
        Self {
            message: details.message,
            location: details.location,
            stack: details.stack,
        }
    }
}

/// Errors that can occur during bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The script raised an exception
    #[error("{0}")]
    Engine(JsError),

    /// Execution was cancelled through `terminate_execution`
    #[error("Script execution was terminated")]
    Terminated,

    /// A handle was used after its scope was popped or its context closed
    #[error("Obsolete handle {scope}:{index}")]
    ObsoleteHandle { scope: u32, index: u32 },

    /// The context has been closed
    #[error("Context is closed")]
    ContextClosed,

    /// The isolate has been disposed
    #[error("Isolate is disposed")]
    IsolateDisposed,

    /// Values or scripts from one isolate were used with another
    #[error("Value belongs to a different isolate")]
    IsolateMismatch,

    /// `throw_exception` was called while no host callback was running
    #[error("No host callback is running to throw from")]
    NoActiveCallback,

    /// An internal field index beyond the object's field count
    #[error("Internal field {index} out of range for {count} fields")]
    InternalFieldOutOfRange { index: usize, count: usize },

    /// The value is not of the expected kind
    #[error("Type error: expected {expected}, got {actual}")]
    TypeError { expected: String, actual: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal/unexpected error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a type error
    pub fn type_error(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeError {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this is a user-facing script error
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Engine(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Get the stack trace if available
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Self::Engine(error) => error.stack.as_deref(),
            _ => None,
        }
    }

    /// Get source location if available
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::Engine(error) => error.location.as_deref(),
            _ => None,
        }
    }
}

impl From<Throw> for BridgeError {
    fn from(throw: Throw) -> Self {
        match throw {
            Throw::Exception(details) => Self::Engine(details.into()),
            Throw::Terminated => Self::Terminated,
            Throw::Disposed("isolate") => Self::IsolateDisposed,
            Throw::Disposed(_) => Self::ContextClosed,
        }
    }
}
