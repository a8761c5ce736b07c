use std::cmp::Reverse;
use std::ffi::OsStr;
use std::fs::File;
use std::mem::size_of;

use crate::mmap::Mmap;
use crate::util::bytes_to_os_str;
use crate::util::find_floor_by_key;
use crate::util::ReadRaw as _;
use crate::Addr;
use crate::Error;
use crate::IntoError as _;
use crate::Result;

use super::types::Elf64_Ehdr;
use super::types::Elf64_Nhdr;
use super::types::Elf64_Phdr;
use super::types::Elf64_Shdr;
use super::types::Elf64_Sym;
use super::types::ELFCLASS64;
use super::types::ELFDATA2LSB;
use super::types::ELFMAG;
use super::types::ET_EXEC;
use super::types::NT_GNU_BUILD_ID;
use super::types::PN_XNUM;
use super::types::SHN_XINDEX;
use super::types::SHT_DYNSYM;
use super::types::SHT_NOBITS;
use super::types::SHT_NOTE;
use super::types::SHT_SYMTAB;


/// The name of the section containing the GNU build ID note.
const BUILD_ID_SECTION: &str = ".note.gnu.build-id";
/// The name of the section referencing a separate debug file.
const DEBUG_LINK_SECTION: &str = ".gnu_debuglink";


fn align_up_u32(value: usize) -> Option<usize> {
    value.checked_add(3).map(|value| value & !3)
}

/// Parse the entries of a note section, looking for a GNU build ID.
fn parse_build_id(mut data: &[u8]) -> Option<&[u8]> {
    while !data.is_empty() {
        let nhdr = data.read_pod::<Elf64_Nhdr>()?;
        let namesz = nhdr.n_namesz as usize;
        let descsz = nhdr.n_descsz as usize;
        let name = data.read_slice(align_up_u32(namesz)?)?.get(..namesz)?;
        let desc = data.read_slice(align_up_u32(descsz)?)?.get(..descsz)?;

        if nhdr.n_type == NT_GNU_BUILD_ID && name == b"GNU\0" {
            return Some(desc)
        }
    }
    None
}

/// Parse the content of a `.gnu_debuglink` section: a NUL terminated
/// file name, padded to a four byte boundary, followed by a CRC32 of
/// the debug file.
fn parse_debug_link(data: &[u8]) -> Option<(&OsStr, u32)> {
    let mut cursor = data;
    let name = cursor.read_cstr()?.to_bytes();
    let offset = align_up_u32(name.len() + 1)?;
    let mut cursor = data.get(offset..)?;
    let crc = cursor.read_u32()?;
    Some((bytes_to_os_str(name), crc))
}


/// An executable `PT_LOAD` segment.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Segment {
    offset: u64,
    vaddr: Addr,
    filesz: u64,
}


/// The information required for converting virtual addresses in a
/// process into addresses as used inside of the ELF file.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LoadInfo {
    /// Whether the file is a non-relocatable executable.
    exec: bool,
    /// All executable `PT_LOAD` segments.
    segments: Box<[Segment]>,
}

impl LoadInfo {
    /// Calculate the load bias of a mapping of the file starting at
    /// virtual address `start` and covering file offset `offset`.
    ///
    /// Subtracting the bias from a virtual address yields the address
    /// as used in the file's symbol tables.
    pub(crate) fn bias(&self, start: Addr, offset: u64) -> Result<u64> {
        if self.exec {
            return Ok(0)
        }

        let segment = self
            .segments
            .iter()
            .find(|segment| {
                let seg_start = segment.offset & !0xfff;
                let seg_end = segment.offset.saturating_add(segment.filesz);
                seg_start <= offset && offset < seg_end
            })
            .ok_or_invalid_data(|| {
                format!("no executable PT_LOAD segment covers file offset {offset:#x}")
            })?;

        let bias = start
            .wrapping_sub(segment.vaddr)
            .wrapping_add(segment.offset)
            .wrapping_sub(offset);
        Ok(bias)
    }
}


/// A function symbol.
#[derive(Clone, Copy, Debug)]
struct FuncSym {
    addr: Addr,
    size: u64,
    /// The offset of the name inside its string table.
    name: u32,
    /// The index of the string table in [`SymbolTable::strtabs`].
    strtab: u8,
}


/// An address sorted index of the function symbols of an ELF file.
///
/// Names are not copied. They are read from the mapping of the file's
/// string tables on demand.
#[derive(Debug)]
pub(crate) struct SymbolTable {
    syms: Box<[FuncSym]>,
    strtabs: Vec<Mmap>,
}

impl SymbolTable {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.syms.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    fn name(&self, sym: &FuncSym) -> Option<&[u8]> {
        let strtab = self.strtabs.get(usize::from(sym.strtab))?;
        let name = strtab.get(sym.name as usize..)?.read_cstr()?.to_bytes();
        Some(name)
    }

    /// Find the name of the function containing `addr`.
    ///
    /// A symbol size of zero means that the size is unknown. In that
    /// case the symbol is assumed to extend to the next one.
    pub(crate) fn find(&self, addr: Addr) -> Option<&[u8]> {
        let idx = find_floor_by_key(&self.syms, addr, |sym| sym.addr)?;

        for sym in self.syms.get(idx..)? {
            if sym.addr > addr {
                break
            }

            if sym.size == 0 || addr < sym.addr.saturating_add(sym.size) {
                return self.name(sym)
            }
        }
        None
    }
}


/// A parser for 64 bit little endian ELF files.
///
/// Only the ELF header is parsed eagerly. Everything else is read from
/// the mapping on demand.
#[derive(Debug)]
pub(crate) struct ElfParser {
    mmap: Mmap,
    e_type: u16,
    phoff: u64,
    /// Override of `e_phnum`, handling of which is special-cased by the
    /// ELF standard.
    phnum: usize,
    shoff: u64,
    /// Override of `e_shnum`.
    shnum: usize,
    /// Override of `e_shstrndx`.
    shstrndx: usize,
}

impl ElfParser {
    /// Create an `ElfParser` from an open file.
    pub(crate) fn open_file(file: &File) -> Result<Self> {
        Mmap::map(file).and_then(Self::from_mmap)
    }

    /// Create an `ElfParser` from mmap'ed ELF data.
    pub(crate) fn from_mmap(mmap: Mmap) -> Result<Self> {
        let mut data = &*mmap;
        let ehdr = data
            .read_pod::<Elf64_Ehdr>()
            .ok_or_invalid_data(|| "failed to read Elf64_Ehdr")?;
        if ehdr.e_ident[..4] != ELFMAG {
            return Err(Error::with_invalid_data(format!(
                "encountered unexpected e_ident: {:x?}",
                &ehdr.e_ident[0..4]
            )))
        }
        if ehdr.e_ident[4] != ELFCLASS64 || ehdr.e_ident[5] != ELFDATA2LSB {
            return Err(Error::with_unsupported(
                "only 64 bit little endian ELF files are supported",
            ))
        }

        let first_shdr = || {
            mmap.get(ehdr.e_shoff as usize..)
                .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
                .read_pod::<Elf64_Shdr>()
                .ok_or_invalid_data(|| "failed to read Elf64_Shdr")
        };

        // "If the number of entries in the section header table is larger than
        // or equal to SHN_LORESERVE, e_shnum holds the value zero and the real
        // number of entries in the section header table is held in the sh_size
        // member of the initial entry in section header table."
        let shnum = if ehdr.e_shnum == 0 && ehdr.e_shoff != 0 {
            let size = first_shdr()?.sh_size;
            usize::try_from(size).ok().ok_or_invalid_data(|| {
                format!("ELF file contains unsupported number of sections ({size})")
            })?
        } else {
            ehdr.e_shnum.into()
        };

        // Likewise, `e_phnum` values of `PN_XNUM` refer to `sh_info` of
        // the initial section header.
        let phnum = if ehdr.e_phnum == PN_XNUM {
            first_shdr()?.sh_info as usize
        } else {
            ehdr.e_phnum.into()
        };

        let shstrndx = if ehdr.e_shstrndx == SHN_XINDEX {
            first_shdr()?.sh_link as usize
        } else {
            ehdr.e_shstrndx.into()
        };

        let parser = Self {
            e_type: ehdr.e_type,
            phoff: ehdr.e_phoff,
            phnum,
            shoff: ehdr.e_shoff,
            shnum,
            shstrndx,
            mmap,
        };
        Ok(parser)
    }

    /// Retrieve the memory mapping of the file.
    #[inline]
    pub(crate) fn mmap(&self) -> &Mmap {
        &self.mmap
    }

    pub(crate) fn program_headers(&self) -> Result<&[Elf64_Phdr]> {
        let phdrs = self
            .mmap
            .get(self.phoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_phoff is invalid")?
            .read_pod_slice_ref::<Elf64_Phdr>(self.phnum)
            .ok_or_invalid_data(|| "failed to read Elf64_Phdr")?;
        Ok(phdrs)
    }

    pub(crate) fn section_headers(&self) -> Result<&[Elf64_Shdr]> {
        if self.shnum == 0 {
            return Ok(&[])
        }

        let shdrs = self
            .mmap
            .get(self.shoff as usize..)
            .ok_or_invalid_data(|| "Elf64_Ehdr::e_shoff is invalid")?
            .read_pod_slice_ref::<Elf64_Shdr>(self.shnum)
            .ok_or_invalid_data(|| "failed to read Elf64_Shdr")?;
        Ok(shdrs)
    }

    pub(crate) fn section_header(&self, idx: usize) -> Result<&Elf64_Shdr> {
        self.section_headers()?
            .get(idx)
            .ok_or_invalid_input(|| format!("ELF section index ({idx}) out of bounds"))
    }

    /// Retrieve the raw section data for the ELF section at index
    /// `idx`.
    ///
    /// Sections without data in the file (`SHT_NOBITS`) are empty.
    pub(crate) fn section_data(&self, idx: usize) -> Result<&[u8]> {
        let shdr = self.section_header(idx)?;
        if shdr.sh_type == SHT_NOBITS {
            return Ok(&[])
        }

        let data = self
            .mmap
            .get(shdr.sh_offset as usize..)
            .ok_or_invalid_data(|| "failed to read section data: invalid offset")?
            .read_slice(shdr.sh_size as usize)
            .ok_or_invalid_data(|| "failed to read section data: invalid size")?;
        Ok(data)
    }

    /// Retrieve a mapping of the data of the section at index `idx`.
    pub(crate) fn section_mmap(&self, idx: usize) -> Result<Mmap> {
        let shdr = self.section_header(idx)?;
        let end = shdr.sh_offset.saturating_add(shdr.sh_size);
        self.mmap
            .constrain(shdr.sh_offset..end)
            .ok_or_invalid_data(|| format!("section {idx} exceeds file bounds"))
    }

    fn section_name(&self, idx: usize) -> Result<&[u8]> {
        let shdr = self.section_header(idx)?;
        let shstrtab = self.section_data(self.shstrndx)?;
        let name = shstrtab
            .get(shdr.sh_name as usize..)
            .ok_or_invalid_data(|| "string table index out of bounds")?
            .read_cstr()
            .ok_or_invalid_data(|| "no valid string found in string table")?;
        Ok(name.to_bytes())
    }

    /// Find the index of the section with the given name.
    pub(crate) fn find_section(&self, name: &str) -> Result<Option<usize>> {
        for idx in 1..self.shnum {
            if self.section_name(idx)? == name.as_bytes() {
                return Ok(Some(idx))
            }
        }
        Ok(None)
    }

    /// Find the index of the first section of the given type.
    fn find_section_by_type(&self, type_: u32) -> Result<Option<usize>> {
        let idx = self
            .section_headers()?
            .iter()
            .position(|shdr| shdr.sh_type == type_);
        Ok(idx)
    }

    /// Check whether the file is a non-relocatable executable.
    #[inline]
    pub(crate) fn is_exec(&self) -> bool {
        self.e_type == ET_EXEC
    }

    /// Gather the information necessary for calculating load biases.
    pub(crate) fn load_info(&self) -> Result<LoadInfo> {
        let segments = self
            .program_headers()?
            .iter()
            .filter(|phdr| phdr.is_exec_load())
            .map(|phdr| Segment {
                offset: phdr.p_offset,
                vaddr: phdr.p_vaddr,
                filesz: phdr.p_filesz,
            })
            .collect();

        let info = LoadInfo {
            exec: self.is_exec(),
            segments,
        };
        Ok(info)
    }

    /// Read the GNU build ID of the file, if any.
    pub(crate) fn build_id(&self) -> Result<Option<&[u8]>> {
        if let Some(idx) = self.find_section(BUILD_ID_SECTION)? {
            let data = self.section_data(idx)?;
            if let Some(build_id) = parse_build_id(data) {
                return Ok(Some(build_id))
            }
        }

        for (idx, shdr) in self.section_headers()?.iter().enumerate() {
            if shdr.sh_type == SHT_NOTE {
                if let Some(build_id) = parse_build_id(self.section_data(idx)?) {
                    return Ok(Some(build_id))
                }
            }
        }
        Ok(None)
    }

    /// Read the debug link (file name and CRC) of the file, if any.
    pub(crate) fn debug_link(&self) -> Result<Option<(&OsStr, u32)>> {
        let Some(idx) = self.find_section(DEBUG_LINK_SECTION)? else {
            return Ok(None)
        };
        let data = self.section_data(idx)?;
        let link = parse_debug_link(data)
            .ok_or_invalid_data(|| format!("{DEBUG_LINK_SECTION} section is malformed"))?;
        Ok(Some(link))
    }

    fn read_func_syms(
        &self,
        type_: u32,
        strtab_idx: u8,
        syms: &mut Vec<FuncSym>,
    ) -> Result<Option<Mmap>> {
        let Some(idx) = self.find_section_by_type(type_)? else {
            return Ok(None)
        };
        let shdr = self.section_header(idx)?;
        let strtab = self.section_mmap(shdr.sh_link as usize)?;

        let mut data = self.section_data(idx)?;
        let count = data.len() / size_of::<Elf64_Sym>();
        let () = syms.reserve(count);

        for _ in 0..count {
            let sym = data
                .read_pod::<Elf64_Sym>()
                .ok_or_invalid_data(|| "failed to read Elf64_Sym")?;
            if sym.is_defined_func() {
                let () = syms.push(FuncSym {
                    addr: sym.st_value,
                    size: sym.st_size,
                    name: sym.st_name,
                    strtab: strtab_idx,
                });
            }
        }
        Ok(Some(strtab))
    }

    /// Build an index of all defined function symbols in `.symtab` and
    /// `.dynsym`.
    pub(crate) fn function_symbols(&self) -> Result<SymbolTable> {
        let mut syms = Vec::new();
        let mut strtabs = Vec::with_capacity(2);

        for type_ in [SHT_SYMTAB, SHT_DYNSYM] {
            let strtab_idx = strtabs.len() as u8;
            if let Some(strtab) = self.read_func_syms(type_, strtab_idx, &mut syms)? {
                let () = strtabs.push(strtab);
            }
        }

        // Among symbols starting at the same address the widest one is
        // reported by `SymbolTable::find`.
        let () = syms.sort_by_key(|sym| (sym.addr, Reverse(sym.size)));
        let () = syms.dedup_by(|a, b| a.addr == b.addr && a.size == b.size);

        let table = SymbolTable {
            syms: syms.into_boxed_slice(),
            strtabs,
        };
        Ok(table)
    }
}
