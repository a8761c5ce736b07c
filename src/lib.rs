//! **procsym** resolves instruction addresses sampled from arbitrary
//! processes, and from the kernel, to symbols.
//!
//! Per-process memory maps and per-binary symbol tables are cached
//! across calls and released in rounds, making the crate suitable for
//! long running profilers that repeatedly symbolize stack traces of the
//! same set of processes.
#![doc = include_str!("../README.md")]
#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::let_and_return,
    clippy::let_unit_value
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::result;

mod elf;
mod error;
mod gcache;
mod ksym;
mod log;
mod maps;
mod mmap;
mod pclntab;
mod proc;
mod symbol;
mod symbol_cache;
#[cfg(any(test, feature = "test"))]
mod test_helper;
mod util;


pub use crate::elf::BuildId;
pub use crate::elf::ElfTableDebugInfo;
pub use crate::elf::ElfTableState;
pub use crate::elf::FileStat;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub use crate::error::IntoCowStr;
pub use crate::error::IntoError;
pub use crate::gcache::CacheDebugInfo;
pub use crate::gcache::CacheEntryInfo;
pub use crate::gcache::GCacheOptions;
pub use crate::gcache::GenerationalCache;
pub use crate::ksym::KALLSYMS;
pub use crate::proc::ModuleDebugInfo;
pub use crate::proc::ModuleState;
pub use crate::proc::ProcTableDebugInfo;
pub use crate::symbol::Symbol;
pub use crate::symbol_cache::Builder;
pub use crate::symbol_cache::CacheOptions;
pub use crate::symbol_cache::SymbolCache;
pub use crate::symbol_cache::SymbolCacheDebugInfo;

/// A type representing addresses.
pub type Addr = u64;

/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = result::Result<T, E>;


#[cfg(feature = "test")]
#[doc(hidden)]
pub mod __private {
    pub use crate::elf::debug_link_crc32;
    pub use crate::test_helper::ElfBuilder;
    pub use crate::test_helper::FakeProcfs;
    pub use crate::test_helper::PclntabBuilder;
}
