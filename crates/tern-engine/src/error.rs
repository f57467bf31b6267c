//! The engine's failure channel

use crate::value::RawValue;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Throw>;

/// Why an engine operation did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum Throw {
    /// Script raised an exception
    #[error("{}", .0.message)]
    Exception(ExceptionDetails),

    /// Execution was terminated, either on request or because the heap
    /// limit was exceeded
    #[error("script execution has been terminated")]
    Terminated,

    /// The isolate or context has been disposed
    #[error("{0} has been disposed")]
    Disposed(&'static str),
}

impl Throw {
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// The thrown value, if this is an exception
    pub fn exception(&self) -> Option<&RawValue> {
        match self {
            Self::Exception(details) => Some(&details.exception),
            _ => None,
        }
    }
}

/// Everything the engine reports about an uncaught exception.
#[derive(Debug, Clone)]
pub struct ExceptionDetails {
    /// The thrown value itself
    pub exception: RawValue,
    /// Detail string of the thrown value (`"TypeError: x is not a function"`)
    pub message: String,
    /// `origin:line:column` of the throw site
    pub location: Option<String>,
    /// Stack trace of error objects
    pub stack: Option<String>,
}

/// Built-in error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Error,
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
        }
    }

    pub(crate) fn from_index(index: i32) -> Option<Self> {
        Self::ALL.get(usize::try_from(index).ok()?).copied()
    }

    pub(crate) fn index(self) -> i32 {
        match self {
            Self::Error => 0,
            Self::TypeError => 1,
            Self::RangeError => 2,
            Self::ReferenceError => 3,
            Self::SyntaxError => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_index_round_trip() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(ErrorKind::from_index(-1), None);
        assert_eq!(ErrorKind::from_index(5), None);
    }

    #[test]
    fn test_terminated_display() {
        assert_eq!(
            Throw::Terminated.to_string(),
            "script execution has been terminated"
        );
        assert!(Throw::Terminated.is_terminated());
        assert!(Throw::Terminated.exception().is_none());
    }
}
