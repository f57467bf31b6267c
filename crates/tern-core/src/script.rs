//! Scripts compiled once per isolate

use crate::context::Context;
use crate::error::{BridgeError, BridgeResult};
use crate::isolate::Isolate;
use crate::value::Value;
use tern_engine::CompiledScript;

/// A parsed script that can run in any context of the isolate that
/// compiled it
#[derive(Debug, Clone)]
pub struct UnboundScript {
    isolate: Isolate,
    compiled: CompiledScript,
}

impl Isolate {
    /// Parse `source` once. Syntax errors surface here rather than at run time.
    pub fn compile_unbound_script(&self, source: &str, origin: &str) -> BridgeResult<UnboundScript> {
        let _guard = self.guard()?;
        let compiled = self.raw().compile(source, origin)?;
        Ok(UnboundScript {
            isolate: self.clone(),
            compiled,
        })
    }
}

impl UnboundScript {
    pub fn origin(&self) -> &str {
        self.compiled.origin()
    }

    pub fn run(&self, context: &Context) -> BridgeResult<Value> {
        if !context.isolate().ptr_eq(&self.isolate) {
            return Err(BridgeError::IsolateMismatch);
        }
        let _guard = context.guard()?;
        context.finish(context.raw().run_compiled(&self.compiled))
    }
}
