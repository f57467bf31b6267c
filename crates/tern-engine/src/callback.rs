//! Native function entry points

use crate::context::RawContext;
use crate::error::EngineResult;
use crate::isolate::RawIsolate;
use crate::value::RawValue;

/// Signature of a native function installed into a context.
///
/// Natives are plain function pointers: everything they need beyond the
/// call's receiver and arguments must be recovered from the integer
/// [`data`](CallbackInfo::data) or from the context's embedder data.
pub type NativeFunction = fn(&CallbackInfo<'_>) -> EngineResult<RawValue>;

/// What a native function sees of the call that invoked it
pub struct CallbackInfo<'a> {
    pub(crate) context: RawContext,
    pub(crate) this: RawValue,
    pub(crate) args: &'a [RawValue],
    pub(crate) data: i32,
    pub(crate) construct: bool,
}

impl CallbackInfo<'_> {
    /// The context the function was created in
    pub fn context(&self) -> &RawContext {
        &self.context
    }

    pub fn isolate(&self) -> &RawIsolate {
        self.context.isolate()
    }

    pub fn this(&self) -> &RawValue {
        &self.this
    }

    pub fn args(&self) -> &[RawValue] {
        self.args
    }

    /// Argument `index`, or undefined when absent
    pub fn arg(&self, index: usize) -> RawValue {
        self.args.get(index).cloned().unwrap_or_default()
    }

    /// Integer attached when the function was created
    pub fn data(&self) -> i32 {
        self.data
    }

    /// Called with `new`
    pub fn is_construct_call(&self) -> bool {
        self.construct
    }
}
