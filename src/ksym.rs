use std::fs::File;
use std::io::BufRead as _;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;

use crate::log::debug;
use crate::log::warn;
use crate::symbol::Symbol;
use crate::util::find_floor_by_key;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Result;


/// The default location of the kernel's symbol listing.
pub const KALLSYMS: &str = "/proc/kallsyms";
const DFL_KSYM_CAP: usize = 200000;
/// The module name reported for symbols of the kernel image proper.
const KERNEL_MODULE: &str = "kernel";


#[derive(Debug)]
struct Ksym {
    addr: Addr,
    name: Box<str>,
    /// The name of the module the symbol belongs to, if not the kernel
    /// image itself.
    module: Option<Box<str>>,
}


/// Parse a line of the form `<addr> <type> <name> [<module>]`.
fn parse_ksym_line(line: &str) -> Option<Ksym> {
    let mut tokens = line.split_ascii_whitespace();
    let addr = Addr::from_str_radix(tokens.next()?, 16).ok()?;
    let _type = tokens.next()?;
    let name = tokens.next()?;
    let module = tokens
        .next()
        .and_then(|module| module.strip_prefix('['))
        .and_then(|module| module.strip_suffix(']'));

    let ksym = Ksym {
        addr,
        name: Box::from(name),
        module: module.map(Box::from),
    };
    Some(ksym)
}


/// The symbol resolver for `/proc/kallsyms`.
///
/// The kernel's symbols are read once and never change afterwards.
#[derive(Debug)]
pub(crate) struct KsymResolver {
    syms: Vec<Ksym>,
}

impl KsymResolver {
    pub(crate) fn load_file_name(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let slf = Self::load_from_reader(file)
            .with_context(|| format!("failed to read {}", path.display()))?;
        debug!("loaded {} kernel symbols from {}", slf.syms.len(), path.display());
        Ok(slf)
    }

    fn load_from_reader<R>(reader: R) -> Result<Self>
    where
        R: Read,
    {
        let mut reader = BufReader::new(reader);
        let mut syms = Vec::with_capacity(DFL_KSYM_CAP);
        let mut line = String::new();
        let mut zeroed = 0usize;

        loop {
            let () = line.clear();
            if reader.read_line(&mut line)? == 0 {
                break
            }

            match parse_ksym_line(&line) {
                // Addresses are all zero when `kptr_restrict` hides them
                // from us.
                Some(ksym) if ksym.addr == 0 => zeroed += 1,
                Some(ksym) => syms.push(ksym),
                None => warn!("ignoring malformed kallsyms line: {}", line.trim_end()),
            }
        }

        if zeroed > 0 {
            warn!("ignored {zeroed} kernel symbols with zero address; is kptr_restrict set?");
        }

        let () = syms.sort_by_key(|ksym| ksym.addr);
        let () = syms.shrink_to_fit();
        Ok(Self { syms })
    }

    fn find_ksym(&self, addr: Addr) -> Option<&Ksym> {
        let idx = find_floor_by_key(&self.syms, addr, |ksym| ksym.addr)?;
        self.syms.get(idx)
    }

    /// Resolve a kernel address to the symbol at or below it.
    pub(crate) fn resolve(&self, addr: Addr) -> Symbol {
        match self.find_ksym(addr) {
            Some(ksym) => Symbol {
                start: ksym.addr,
                name: Some(ksym.name.to_string()),
                module: ksym.module.as_deref().unwrap_or(KERNEL_MODULE).to_string(),
            },
            None => Symbol {
                start: 0,
                name: None,
                module: KERNEL_MODULE.to_string(),
            },
        }
    }

    /// Retrieve the number of symbols known.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.syms.len()
    }
}
