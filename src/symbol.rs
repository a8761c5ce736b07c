use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

#[cfg(feature = "demangle")]
use cpp_demangle::DemangleOptions;

use crate::Addr;


/// The result of resolving an address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Symbol {
    /// For user space addresses, the offset of the address relative to
    /// the start of the memory mapping containing it. For kernel
    /// addresses, the start address of the symbol.
    pub start: Addr,
    /// The name of the function, if it could be recovered.
    pub name: Option<String>,
    /// The module containing the address: the path of the mapped file,
    /// `kernel`, or the name of a kernel module. Empty if the address
    /// is not mapped at all.
    pub module: String,
}

impl Symbol {
    /// Check whether the address was found in any module.
    #[inline]
    pub fn is_unknown(&self) -> bool {
        self.module.is_empty()
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = self.name.as_deref().unwrap_or("??");
        write!(f, "{}+{:#x} {name}", self.module, self.start)
    }
}


/// Demangle a Rust or C++ symbol name, returning it unchanged if it is
/// neither.
#[cfg(feature = "demangle")]
pub(crate) fn demangle(name: String) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(&name) {
        return format!("{demangled:#}")
    }

    cpp_demangle::Symbol::new(name.as_bytes())
        .ok()
        .and_then(|sym| sym.demangle(&DemangleOptions::default()).ok())
        .unwrap_or(name)
}

#[cfg(not(feature = "demangle"))]
pub(crate) fn demangle(name: String) -> String {
    name
}
