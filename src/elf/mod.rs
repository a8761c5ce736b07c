mod cache;
mod debug;
mod parser;
mod table;
#[allow(non_camel_case_types)]
mod types;

pub use cache::BuildId;
pub use cache::FileStat;
pub use table::ElfTableDebugInfo;
pub use table::ElfTableState;

pub(crate) use cache::ElfCache;
pub(crate) use debug::rooted;
pub(crate) use parser::ElfParser;
pub(crate) use parser::LoadInfo;
pub(crate) use table::ElfTable;

#[cfg(feature = "test")]
pub use debug::debug_link_crc32;
