//! Table-relative value references

use std::fmt;

/// A copyable reference to a value rooted in one context's handle table.
///
/// Holds no pointer: it names the scope that was current when the value was
/// rooted and the slot it landed in. Only the table that minted it can
/// resolve it, and only until that scope is popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleRef {
    pub scope: u32,
    pub index: u32,
}

impl HandleRef {
    pub const fn new(scope: u32, index: u32) -> Self {
        Self { scope, index }
    }
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.index)
    }
}
