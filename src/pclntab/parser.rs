use std::sync::OnceLock;

use crate::log::debug;
use crate::log::warn;
use crate::Addr;

use super::data::ReadAt;


const GO12_MAGIC: u32 = 0xfffffffb;
const GO116_MAGIC: u32 = 0xfffffffa;
const GO118_MAGIC: u32 = 0xfffffff0;
const GO120_MAGIC: u32 = 0xfffffff1;


/// The on-disk layout of a line table.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub(crate) enum Version {
    /// Legacy or unrecognized layout. No functions can be recovered.
    Ver11,
    Ver12,
    Ver116,
    Ver118,
    Ver120,
}


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    fn u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            Self::Little => u64::from_le_bytes(bytes),
            Self::Big => u64::from_be_bytes(bytes),
        }
    }
}


/// The parsed line table header.
#[derive(Clone, Debug)]
struct Header {
    version: Version,
    endian: Endian,
    quantum: u8,
    ptr_size: u8,
    nfunc: u64,
    /// Offset of the function name table.
    funcnametab: u64,
    /// Offset of the function table.
    functab: u64,
    /// Offset relative to which `_func` structs are located.
    funcdata: u64,
}

impl Header {
    /// The size of a single field in the function table.
    fn field_size(&self) -> u8 {
        if self.version >= Version::Ver118 {
            4
        } else {
            self.ptr_size
        }
    }

    /// The size of the leading entry field of a `_func` struct.
    fn entry_size(&self) -> u64 {
        if self.version >= Version::Ver118 {
            4
        } else {
            u64::from(self.ptr_size)
        }
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
enum Entries {
    U32(Box<[u32]>),
    U64(Box<[u64]>),
}

impl Entries {
    fn new(entries: Vec<u64>) -> Self {
        if entries.iter().all(|entry| u32::try_from(*entry).is_ok()) {
            Self::U32(entries.into_iter().map(|entry| entry as u32).collect())
        } else {
            Self::U64(entries.into_boxed_slice())
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::U32(entries) => entries.len(),
            Self::U64(entries) => entries.len(),
        }
    }

    /// Find the index of the last entry less than or equal to `addr`.
    fn find(&self, addr: Addr) -> Option<usize> {
        let idx = match self {
            Self::U32(entries) => {
                entries.partition_point(|entry| u64::from(*entry) <= addr)
            }
            Self::U64(entries) => entries.partition_point(|entry| *entry <= addr),
        };
        idx.checked_sub(1)
    }
}


/// A flat, searchable index of all functions in a line table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FuncIndex {
    /// Function entry addresses, sorted.
    entries: Entries,
    /// Offsets of function names in the name table, parallel to
    /// `entries`.
    names: Box<[u32]>,
    /// The end address of the last function.
    end: Addr,
}

impl FuncIndex {
    fn empty() -> Self {
        Self {
            entries: Entries::U32(Box::default()),
            names: Box::default(),
            end: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn end(&self) -> Addr {
        self.end
    }

    /// Find the name offset of the function containing `addr`.
    pub(crate) fn find(&self, addr: Addr) -> Option<u32> {
        if addr >= self.end {
            return None
        }
        let idx = self.entries.find(addr)?;
        self.names.get(idx).copied()
    }
}


/// A Go program counter line table (`.gopclntab`).
///
/// The header and the function index are parsed lazily, exactly once,
/// on first use. Malformed tables result in an empty index.
#[derive(Debug)]
pub(crate) struct LineTable<D> {
    data: D,
    /// The address of the text segment, relative to which function
    /// entries are stored in newer table versions.
    text_start: Addr,
    header: OnceLock<Option<Header>>,
    index: OnceLock<FuncIndex>,
}

impl<D> LineTable<D>
where
    D: ReadAt,
{
    pub(crate) fn new(data: D, text_start: Addr) -> Self {
        Self {
            data,
            text_start,
            header: OnceLock::new(),
            index: OnceLock::new(),
        }
    }

    fn read<const N: usize>(&self, offset: u64) -> Option<[u8; N]> {
        let mut buf = [0; N];
        let () = self.data.read_at(offset, &mut buf)?;
        Some(buf)
    }

    fn read_uint(&self, endian: Endian, size: u8, offset: u64) -> Option<u64> {
        match size {
            4 => self.read::<4>(offset).map(|b| u64::from(endian.u32(b))),
            8 => self.read::<8>(offset).map(|b| endian.u64(b)),
            _ => None,
        }
    }

    fn parse_header(&self) -> Option<Header> {
        // 4-byte magic, two zeros, pc quantum, pointer size.
        let ident = self.read::<16>(0)?;
        let quantum = ident[6];
        let ptr_size = ident[7];
        if ident[4] != 0
            || ident[5] != 0
            || !matches!(quantum, 1 | 2 | 4)
            || !matches!(ptr_size, 4 | 8)
        {
            return None
        }

        let magic = [ident[0], ident[1], ident[2], ident[3]];
        let (endian, version) = [Endian::Little, Endian::Big]
            .into_iter()
            .find_map(|endian| {
                let version = match endian.u32(magic) {
                    GO12_MAGIC => Version::Ver12,
                    GO116_MAGIC => Version::Ver116,
                    GO118_MAGIC => Version::Ver118,
                    GO120_MAGIC => Version::Ver120,
                    _ => return None,
                };
                Some((endian, version))
            })?;

        let word = |idx: u64| {
            let offset = 8 + idx * u64::from(ptr_size);
            self.read_uint(endian, ptr_size, offset)
        };

        let mut header = Header {
            version,
            endian,
            quantum,
            ptr_size,
            nfunc: 0,
            funcnametab: 0,
            functab: 0,
            funcdata: 0,
        };

        match version {
            Version::Ver118 | Version::Ver120 => {
                header.nfunc = word(0)?;
                header.funcnametab = word(3)?;
                header.funcdata = word(7)?;
                header.functab = header.funcdata;
            }
            Version::Ver116 => {
                header.nfunc = word(0)?;
                header.funcnametab = word(2)?;
                header.funcdata = word(6)?;
                header.functab = header.funcdata;
            }
            Version::Ver12 => {
                header.nfunc = word(0)?;
                header.funcnametab = 0;
                header.funcdata = 0;
                header.functab = 8 + u64::from(ptr_size);
            }
            Version::Ver11 => return None,
        }

        // The function table holds `nfunc` entry/offset pairs followed
        // by the end address of the last function.
        let functab_size = header
            .nfunc
            .checked_mul(2)?
            .checked_add(1)?
            .checked_mul(u64::from(header.field_size()))?;
        let functab_end = header.functab.checked_add(functab_size)?;
        if functab_end > self.data.len() || header.funcnametab > self.data.len() {
            return None
        }
        Some(header)
    }

    fn header(&self) -> Option<&Header> {
        self.header
            .get_or_init(|| {
                let header = self.parse_header();
                match &header {
                    Some(header) => debug!(
                        "parsed line table header: {:?}, {} functions, quantum {}, pointer size {}",
                        header.version, header.nfunc, header.quantum, header.ptr_size
                    ),
                    None => debug!("line table has unsupported or malformed header"),
                }
                header
            })
            .as_ref()
    }

    /// Retrieve the table's on-disk version.
    #[cfg(test)]
    pub(crate) fn version(&self) -> Version {
        self.header()
            .map(|header| header.version)
            .unwrap_or(Version::Ver11)
    }

    /// Retrieve the program counter quantum, if the header is valid.
    #[cfg(test)]
    fn quantum(&self) -> Option<u8> {
        self.header().map(|header| header.quantum)
    }

    fn build_index(&self, header: &Header) -> Option<FuncIndex> {
        let size = header.field_size();
        let field = |idx: u64| {
            let offset = header.functab + idx * u64::from(size);
            self.read_uint(header.endian, size, offset)
        };
        let pc = |idx: u64| {
            let pc = field(2 * idx)?;
            if header.version >= Version::Ver118 {
                pc.checked_add(self.text_start)
            } else {
                Some(pc)
            }
        };

        let count = usize::try_from(header.nfunc).ok()?;
        let mut entries = Vec::with_capacity(count);
        let mut names = Vec::with_capacity(count);

        for idx in 0..header.nfunc {
            let entry = pc(idx)?;
            if entries.last().is_some_and(|last| *last > entry) {
                return None
            }

            let func_off = field(2 * idx + 1)?;
            let name_off = header
                .funcdata
                .checked_add(func_off)?
                .checked_add(header.entry_size())?;
            let name = self.read::<4>(name_off)?;
            let () = entries.push(entry);
            let () = names.push(header.endian.u32(name));
        }

        let end = pc(header.nfunc)?;
        if entries.last().is_some_and(|last| *last > end) {
            return None
        }

        let index = FuncIndex {
            entries: Entries::new(entries),
            names: names.into_boxed_slice(),
            end,
        };
        Some(index)
    }

    /// Retrieve the index of all functions in this table.
    ///
    /// A table that turns out to be truncated or otherwise corrupted
    /// yields an empty index.
    pub(crate) fn funcs(&self) -> &FuncIndex {
        self.index.get_or_init(|| {
            let Some(header) = self.header() else {
                return FuncIndex::empty()
            };

            self.build_index(header).unwrap_or_else(|| {
                warn!(
                    "line table with {} functions is malformed; ignoring it",
                    header.nfunc
                );
                FuncIndex::empty()
            })
        })
    }

    /// Retrieve the function index, if it has been built already.
    pub(crate) fn loaded_funcs(&self) -> Option<&FuncIndex> {
        self.index.get()
    }

    /// Read the name at `name_off` in the function name table.
    pub(crate) fn func_name(&self, name_off: u32) -> Option<Vec<u8>> {
        let header = self.header()?;
        let offset = header.funcnametab.checked_add(u64::from(name_off))?;
        self.data.read_cstr(offset)
    }

    /// Find the name of the function containing `addr`.
    pub(crate) fn find_name(&self, addr: Addr) -> Option<Vec<u8>> {
        let name_off = self.funcs().find(addr)?;
        self.func_name(name_off)
    }
}
