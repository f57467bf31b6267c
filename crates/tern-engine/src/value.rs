//! Raw engine values and persistent roots

use crate::isolate::{IsolateCore, RawIsolate};
use std::fmt;
use std::sync::{Arc, Weak};

/// Identity of an object slot in an isolate heap.
///
/// The generation changes every time the slot is reclaimed, so an id that
/// outlived its object never aliases the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// A value as the engine sees it.
///
/// Object values are plain ids into the isolate heap and are **not** roots.
/// Anything that must survive a collection has to be held in a [`Persistent`].
#[derive(Debug, Clone, Default)]
pub enum RawValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Arc<str>),
    Object(ObjectId),
}

impl RawValue {
    /// Create a string value
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::String(s.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RawValue {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        Self::String(s.into())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        Self::String(s.into())
    }
}

/// Engine-level classification of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Object,
    Array,
    Function,
    Error,
    Promise,
}

impl ValueKind {
    pub fn is_object(self) -> bool {
        matches!(
            self,
            Self::Object | Self::Array | Self::Function | Self::Error | Self::Promise
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Function => "function",
            Self::Error => "error",
            Self::Promise => "promise",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A strong root keeping an engine value alive across collections.
///
/// Creating a `Persistent` increments the object's root count and dropping
/// it decrements the count again. Primitive values are carried along
/// without touching the heap. A `Persistent` that outlives its isolate
/// becomes inert.
pub struct Persistent {
    value: RawValue,
    isolate: Weak<IsolateCore>,
}

impl Persistent {
    /// Root `value` in `isolate`'s heap
    pub fn new(isolate: &RawIsolate, value: RawValue) -> Self {
        if let Some(id) = value.as_object() {
            isolate.core().heap.lock().root(id);
        }
        Self {
            value,
            isolate: Arc::downgrade(isolate.core()),
        }
    }

    /// The rooted value
    pub fn value(&self) -> &RawValue {
        &self.value
    }

    /// Check whether this root belongs to `isolate`
    pub fn belongs_to(&self, isolate: &RawIsolate) -> bool {
        std::ptr::eq(self.isolate.as_ptr(), Arc::as_ptr(isolate.core()))
    }
}

impl Clone for Persistent {
    fn clone(&self) -> Self {
        if let (Some(id), Some(core)) = (self.value.as_object(), self.isolate.upgrade()) {
            core.heap.lock().root(id);
        }
        Self {
            value: self.value.clone(),
            isolate: self.isolate.clone(),
        }
    }
}

impl Drop for Persistent {
    fn drop(&mut self) {
        if let (Some(id), Some(core)) = (self.value.as_object(), self.isolate.upgrade()) {
            core.heap.lock().unroot(id);
        }
    }
}

impl fmt::Debug for Persistent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Persistent").field(&self.value).finish()
    }
}
