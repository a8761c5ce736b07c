use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use crate::log::debug;
use crate::log::warn;
use crate::mmap::Mmap;
use crate::pclntab::FileData;
use crate::pclntab::LineTable;
use crate::util::unpoison;
use crate::util::Hexify;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::ErrorKind;
use crate::Result;

use super::cache::BuildId;
use super::debug::build_id_candidates;
use super::debug::debug_link_candidates;
use super::debug::debug_link_crc32;
use super::parser::ElfParser;
use super::parser::SymbolTable;
use super::types::SHT_NOBITS;


/// The section containing the Go line table.
const PCLNTAB_SECTION: &str = ".gopclntab";


/// The state an [`ElfTable`] is in, as reported for introspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElfTableState {
    /// Nothing has been resolved through the table yet.
    Uninitialized,
    /// Names are looked up in an ELF symbol table.
    SymbolTable,
    /// Names are looked up in a Go line table.
    LineTable,
    /// Names are looked up in a Go line table first and in an ELF
    /// symbol table second.
    LineTableWithFallback,
    /// Loading failed. The table will never resolve anything.
    Errored,
}


/// Introspection data about an [`ElfTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct ElfTableDebugInfo {
    /// The path of the file, as seen by the process that mapped it
    /// first.
    pub path: PathBuf,
    /// The file's build ID, if any.
    pub build_id: Option<BuildId>,
    /// The table's state.
    pub state: ElfTableState,
    /// The number of functions known, if loaded.
    pub symbols: usize,
    /// The number of times the underlying file was parsed.
    pub parses: usize,
}


#[derive(Debug)]
enum Resolver {
    Symtab(SymbolTable),
    LineTable(LineTable<FileData>),
    LineTableWithFallback(LineTable<FileData>, SymbolTable),
}

impl Resolver {
    /// Create the resolver most suitable for the given file.
    fn for_file(file: File, parser: &ElfParser) -> Result<Self> {
        let syms = parser.function_symbols()?;
        let linetab = if let Some(idx) = parser.find_section(PCLNTAB_SECTION)? {
            let shdr = parser.section_header(idx)?;
            if shdr.sh_type == SHT_NOBITS || shdr.sh_size == 0 {
                None
            } else {
                let text_start = match parser.find_section(".text")? {
                    Some(text) => parser.section_header(text)?.sh_addr,
                    None => 0,
                };
                let data = FileData::new(file, shdr.sh_offset, shdr.sh_size);
                Some(LineTable::new(data, text_start))
            }
        } else {
            None
        };

        match (linetab, syms.is_empty()) {
            (Some(linetab), true) => Ok(Self::LineTable(linetab)),
            (Some(linetab), false) => Ok(Self::LineTableWithFallback(linetab, syms)),
            (None, false) => Ok(Self::Symtab(syms)),
            (None, true) => Err(Error::with_not_found(
                "file contains neither function symbols nor a line table",
            )),
        }
    }

    fn find(&self, addr: Addr) -> Option<String> {
        let name = match self {
            Self::Symtab(syms) => syms.find(addr).map(<[u8]>::to_vec),
            Self::LineTable(linetab) => linetab.find_name(addr),
            Self::LineTableWithFallback(linetab, syms) => linetab
                .find_name(addr)
                .or_else(|| syms.find(addr).map(<[u8]>::to_vec)),
        }?;
        let name = String::from_utf8(name)
            .unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned());
        Some(name)
    }

    fn state(&self) -> ElfTableState {
        match self {
            Self::Symtab(..) => ElfTableState::SymbolTable,
            Self::LineTable(..) => ElfTableState::LineTable,
            Self::LineTableWithFallback(..) => ElfTableState::LineTableWithFallback,
        }
    }

    fn symbols(&self) -> usize {
        let linetab_len = |linetab: &LineTable<FileData>| {
            linetab.loaded_funcs().map(|funcs| funcs.len()).unwrap_or(0)
        };

        match self {
            Self::Symtab(syms) => syms.len(),
            Self::LineTable(linetab) => linetab_len(linetab),
            Self::LineTableWithFallback(linetab, syms) => linetab_len(linetab) + syms.len(),
        }
    }
}


#[derive(Debug)]
enum State {
    Ready(Resolver),
    Errored,
}


/// The symbol table of a single ELF file, shared by all processes
/// mapping it.
///
/// Nothing is parsed until the first address is resolved. Loading
/// happens at most once: a table that failed to load stays
/// [`ElfTableState::Errored`] for the rest of its life.
#[derive(Debug)]
pub(crate) struct ElfTable {
    /// The path to the file, as seen by the process.
    path: PathBuf,
    /// The root directory of the process's mount namespace.
    root: PathBuf,
    /// Directories searched for separate debug files.
    debug_dirs: Arc<[PathBuf]>,
    build_id: Option<BuildId>,
    /// The mapped file. Consumed when loading.
    file: Mutex<Option<(File, Mmap)>>,
    state: OnceLock<State>,
    parses: AtomicUsize,
}

impl ElfTable {
    pub(crate) fn new(
        path: PathBuf,
        root: PathBuf,
        debug_dirs: Arc<[PathBuf]>,
        build_id: Option<BuildId>,
        file: File,
        mmap: Mmap,
    ) -> Self {
        Self {
            path,
            root,
            debug_dirs,
            build_id,
            file: Mutex::new(Some((file, mmap))),
            state: OnceLock::new(),
            parses: AtomicUsize::new(0),
        }
    }

    /// Open and verify the debug file at `path`.
    ///
    /// A file matching the mapped one by build ID is accepted. Without
    /// a build ID to compare, the debug link checksum `crc` (if any) is
    /// checked instead.
    fn open_debug_file(&self, path: &Path, crc: Option<u32>) -> Result<Option<Resolver>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let parser = ElfParser::open_file(&file)?;

        let verified = match (&self.build_id, parser.build_id()?) {
            (Some(expected), Some(actual)) => {
                if expected.as_bytes() != actual {
                    return Err(Error::with_build_id_mismatch(format!(
                        "build ID {} does not match expected {expected}",
                        Hexify(actual)
                    )))
                }
                true
            }
            (Some(expected), None) if crc.is_none() => {
                return Err(Error::with_build_id_mismatch(format!(
                    "file has no build ID; expected {expected}"
                )))
            }
            _ => false,
        };

        if !verified {
            if let Some(crc) = crc {
                let actual = debug_link_crc32(parser.mmap());
                if actual != crc {
                    return Err(Error::with_invalid_data(format!(
                        "debug link checksum {actual:#010x} does not match expected {crc:#010x}"
                    )))
                }
            }
        }

        Resolver::for_file(file, &parser).map(Some)
    }

    fn find_debug_file<I>(&self, candidates: I, crc: Option<u32>) -> Option<Resolver>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        for path in candidates {
            match self.open_debug_file(&path, crc) {
                Ok(Some(resolver)) => {
                    debug!("using debug file {} for {}", path.display(), self.path.display());
                    return Some(resolver)
                }
                Ok(None) => (),
                Err(err) if err.kind() == ErrorKind::BuildIdMismatch => {
                    warn!("ignoring debug file {}: {err}", path.display())
                }
                Err(err) => debug!("ignoring debug file {}: {err:#}", path.display()),
            }
        }
        None
    }

    fn load(&self, file: File, mmap: Mmap) -> Result<Resolver> {
        let parser = ElfParser::from_mmap(mmap)?;

        if let Some(build_id) = &self.build_id {
            let candidates =
                build_id_candidates(&self.root, &self.debug_dirs, build_id.as_bytes());
            if let Some(resolver) = self.find_debug_file(candidates, None) {
                return Ok(resolver)
            }
        }

        if let Some((name, crc)) = parser.debug_link()? {
            let candidates = debug_link_candidates(&self.root, &self.debug_dirs, &self.path, name);
            if let Some(resolver) = self.find_debug_file(candidates, Some(crc)) {
                return Ok(resolver)
            }
        }

        Resolver::for_file(file, &parser)
    }

    fn init(&self) -> State {
        let _count = self.parses.fetch_add(1, Ordering::Relaxed);

        let result = unpoison(self.file.lock())
            .take()
            .ok_or_else(|| Error::with_unexpected_eof("file already consumed"))
            .and_then(|(file, mmap)| self.load(file, mmap))
            .with_context(|| format!("failed to load symbols of {}", self.path.display()));

        match result {
            Ok(resolver) => {
                debug!(
                    "loaded symbols of {}: {:?}",
                    self.path.display(),
                    resolver.state()
                );
                State::Ready(resolver)
            }
            Err(err) => {
                warn!("{err:#}");
                State::Errored
            }
        }
    }

    /// Resolve a file relative address to the name of the function
    /// containing it.
    pub(crate) fn resolve(&self, addr: Addr) -> Option<String> {
        match self.state.get_or_init(|| self.init()) {
            State::Ready(resolver) => resolver.find(addr),
            State::Errored => None,
        }
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Retrieve the number of times the file has been parsed.
    #[inline]
    pub(crate) fn parses(&self) -> usize {
        self.parses.load(Ordering::Relaxed)
    }

    pub(crate) fn debug_info(&self) -> ElfTableDebugInfo {
        let (state, symbols) = match self.state.get() {
            None => (ElfTableState::Uninitialized, 0),
            Some(State::Ready(resolver)) => (resolver.state(), resolver.symbols()),
            Some(State::Errored) => (ElfTableState::Errored, 0),
        };

        ElfTableDebugInfo {
            path: self.path.clone(),
            build_id: self.build_id.clone(),
            state,
            symbols,
            parses: self.parses(),
        }
    }
}
