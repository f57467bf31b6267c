//! Front end and syntax tree for the script subset the engine runs
pub(crate) mod ast;
pub(crate) mod parser;
