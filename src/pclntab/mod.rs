//! Support for Go program counter line tables (`.gopclntab`).
//!
//! Go binaries carry a table mapping program counters to functions
//! (and source locations) that survives stripping of the conventional
//! symbol tables. Its layout changed with Go 1.2, 1.16, 1.18, and 1.20.

mod data;
mod parser;

pub(crate) use data::FileData;
#[cfg(test)]
pub(crate) use data::MemData;
pub(crate) use parser::LineTable;
