//! Fixtures for tests: synthetic ELF files, Go line tables, and a fake
//! proc file system.

use std::fs::create_dir_all;
use std::fs::write;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use crate::Addr;


const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PF_R_X: u32 = 0x4 | 0x1;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_STRTAB: u32 = 3;
const SHT_NOTE: u32 = 7;
const SHT_DYNSYM: u32 = 11;
const SHF_ALLOC_EXEC: u64 = 0x2 | 0x4;
/// `STB_GLOBAL` binding, `STT_FUNC` type.
const GLOBAL_FUNC: u8 = 0x12;
const NT_GNU_BUILD_ID: u32 = 3;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

/// The address and file offset of `.text`.
const TEXT_ADDR: u64 = 0x1000;
const TEXT_SIZE: u64 = 0x1000;


fn align(data: &mut Vec<u8>, align: usize) {
    let len = data.len().next_multiple_of(align);
    let () = data.resize(len, 0);
}

fn set(data: &mut [u8], offset: usize, bytes: &[u8]) {
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
}


#[derive(Debug)]
struct Section {
    name: &'static str,
    type_: u32,
    flags: u64,
    addr: u64,
    data: Vec<u8>,
    link: u32,
    entsize: u64,
}

impl Section {
    fn new(name: &'static str, type_: u32, data: Vec<u8>) -> Self {
        Self {
            name,
            type_,
            flags: 0,
            addr: 0,
            data,
            link: 0,
            entsize: 0,
        }
    }
}


/// A builder of minimal 64 bit little endian x86-64 ELF files.
///
/// The file contains a single executable `PT_LOAD` segment, covering
/// `.text` at address and file offset `0x1000` with a size of
/// `0x1000`. Symbols reference `.text`.
#[derive(Clone, Debug, Default)]
pub struct ElfBuilder {
    exec: bool,
    symbols: Vec<(String, Addr, u64)>,
    dynamic_symbols: Vec<(String, Addr, u64)>,
    build_id: Option<Vec<u8>>,
    debug_link: Option<(String, u32)>,
    pclntab: Option<Vec<u8>>,
}

impl ElfBuilder {
    /// Create a builder for a stripped shared object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder with the symbols `iter` (`0x1149`, size
    /// `0x15`) and `main` (`0x115e`, size `0x20`).
    pub fn with_test_symbols() -> Self {
        Self::new()
            .symbol("iter", 0x1149, 0x15)
            .symbol("main", 0x115e, 0x20)
    }

    /// Add a function symbol to `.symtab`.
    pub fn symbol(mut self, name: &str, addr: Addr, size: u64) -> Self {
        let () = self.symbols.push((name.to_string(), addr, size));
        self
    }

    /// Add a function symbol to `.dynsym`.
    pub fn dynamic_symbol(mut self, name: &str, addr: Addr, size: u64) -> Self {
        let () = self.dynamic_symbols.push((name.to_string(), addr, size));
        self
    }

    /// Add a `.note.gnu.build-id` section.
    pub fn build_id(mut self, build_id: &[u8]) -> Self {
        self.build_id = Some(build_id.to_vec());
        self
    }

    /// Add a `.gnu_debuglink` section.
    pub fn debug_link(mut self, name: &str, crc: u32) -> Self {
        self.debug_link = Some((name.to_string(), crc));
        self
    }

    /// Add a `.gopclntab` section with the given content.
    pub fn pclntab(mut self, data: Vec<u8>) -> Self {
        self.pclntab = Some(data);
        self
    }

    /// Make the file a non-relocatable executable.
    pub fn exec(mut self) -> Self {
        self.exec = true;
        self
    }

    fn symbol_sections(
        symtab: &'static str,
        strtab: &'static str,
        type_: u32,
        syms: &[(String, Addr, u64)],
        strtab_idx: u32,
    ) -> [Section; 2] {
        let mut strs = vec![0];
        // The mandatory null symbol.
        let mut data = vec![0; SYM_SIZE];
        for (name, addr, size) in syms {
            let name_off = strs.len() as u32;
            let () = strs.extend_from_slice(name.as_bytes());
            let () = strs.push(0);

            let () = data.extend_from_slice(&name_off.to_le_bytes());
            let () = data.push(GLOBAL_FUNC);
            let () = data.push(0);
            // `.text` is always section 1.
            let () = data.extend_from_slice(&1u16.to_le_bytes());
            let () = data.extend_from_slice(&addr.to_le_bytes());
            let () = data.extend_from_slice(&size.to_le_bytes());
        }

        let mut symtab = Section::new(symtab, type_, data);
        symtab.link = strtab_idx;
        symtab.entsize = SYM_SIZE as u64;
        [symtab, Section::new(strtab, SHT_STRTAB, strs)]
    }

    fn sections(&self) -> Vec<Section> {
        let mut text = Section::new(".text", SHT_PROGBITS, vec![0xcc; TEXT_SIZE as usize]);
        text.flags = SHF_ALLOC_EXEC;
        text.addr = TEXT_ADDR;

        // Index 0 is the null section.
        let mut sections = vec![text];
        if !self.symbols.is_empty() {
            let strtab_idx = sections.len() as u32 + 2;
            let () = sections.extend(Self::symbol_sections(
                ".symtab",
                ".strtab",
                SHT_SYMTAB,
                &self.symbols,
                strtab_idx,
            ));
        }
        if !self.dynamic_symbols.is_empty() {
            let strtab_idx = sections.len() as u32 + 2;
            let () = sections.extend(Self::symbol_sections(
                ".dynsym",
                ".dynstr",
                SHT_DYNSYM,
                &self.dynamic_symbols,
                strtab_idx,
            ));
        }

        if let Some(build_id) = &self.build_id {
            let mut data = Vec::new();
            let () = data.extend_from_slice(&4u32.to_le_bytes());
            let () = data.extend_from_slice(&(build_id.len() as u32).to_le_bytes());
            let () = data.extend_from_slice(&NT_GNU_BUILD_ID.to_le_bytes());
            let () = data.extend_from_slice(b"GNU\0");
            let () = data.extend_from_slice(build_id);
            let () = align(&mut data, 4);
            let () = sections.push(Section::new(".note.gnu.build-id", SHT_NOTE, data));
        }

        if let Some(pclntab) = &self.pclntab {
            let () = sections.push(Section::new(".gopclntab", SHT_PROGBITS, pclntab.clone()));
        }

        if let Some((name, crc)) = &self.debug_link {
            let mut data = name.as_bytes().to_vec();
            let () = data.push(0);
            let () = align(&mut data, 4);
            let () = data.extend_from_slice(&crc.to_le_bytes());
            let () = sections.push(Section::new(".gnu_debuglink", SHT_PROGBITS, data));
        }
        sections
    }

    /// Create the ELF file's content.
    pub fn build(&self) -> Vec<u8> {
        let mut sections = self.sections();

        let mut shstrtab = vec![0];
        let mut names = Vec::with_capacity(sections.len() + 1);
        for name in sections
            .iter()
            .map(|section| section.name)
            .chain([".shstrtab"])
        {
            let () = names.push(shstrtab.len() as u32);
            let () = shstrtab.extend_from_slice(name.as_bytes());
            let () = shstrtab.push(0);
        }
        let () = sections.push(Section::new(".shstrtab", SHT_STRTAB, shstrtab));
        let shstrndx = sections.len() as u16;

        // Headers, then `.text` at its fixed offset, then everything
        // else.
        let mut data = vec![0; TEXT_ADDR as usize];
        let mut offsets = Vec::with_capacity(sections.len());
        for section in &sections {
            if section.addr != TEXT_ADDR {
                let () = align(&mut data, 8);
            }
            let () = offsets.push(data.len() as u64);
            let () = data.extend_from_slice(&section.data);
        }

        let () = align(&mut data, 8);
        let shoff = data.len() as u64;
        // The null section header.
        let () = data.resize(data.len() + SHDR_SIZE, 0);
        for ((section, offset), name) in sections.iter().zip(&offsets).zip(&names) {
            let () = data.extend_from_slice(&name.to_le_bytes());
            let () = data.extend_from_slice(&section.type_.to_le_bytes());
            let () = data.extend_from_slice(&section.flags.to_le_bytes());
            let () = data.extend_from_slice(&section.addr.to_le_bytes());
            let () = data.extend_from_slice(&offset.to_le_bytes());
            let () = data.extend_from_slice(&(section.data.len() as u64).to_le_bytes());
            let () = data.extend_from_slice(&section.link.to_le_bytes());
            let () = data.extend_from_slice(&0u32.to_le_bytes());
            let () = data.extend_from_slice(&8u64.to_le_bytes());
            let () = data.extend_from_slice(&section.entsize.to_le_bytes());
        }

        let mut ehdr = Vec::with_capacity(EHDR_SIZE);
        let () = ehdr.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1]);
        let () = ehdr.resize(16, 0);
        let e_type = if self.exec { ET_EXEC } else { ET_DYN };
        let () = ehdr.extend_from_slice(&e_type.to_le_bytes());
        let () = ehdr.extend_from_slice(&EM_X86_64.to_le_bytes());
        let () = ehdr.extend_from_slice(&1u32.to_le_bytes());
        let () = ehdr.extend_from_slice(&TEXT_ADDR.to_le_bytes());
        let () = ehdr.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
        let () = ehdr.extend_from_slice(&shoff.to_le_bytes());
        let () = ehdr.extend_from_slice(&0u32.to_le_bytes());
        let () = ehdr.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        let () = ehdr.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        let () = ehdr.extend_from_slice(&1u16.to_le_bytes());
        let () = ehdr.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
        let () = ehdr.extend_from_slice(&(sections.len() as u16 + 1).to_le_bytes());
        let () = ehdr.extend_from_slice(&shstrndx.to_le_bytes());
        let () = set(&mut data, 0, &ehdr);

        let mut phdr = Vec::with_capacity(PHDR_SIZE);
        let () = phdr.extend_from_slice(&PT_LOAD.to_le_bytes());
        let () = phdr.extend_from_slice(&PF_R_X.to_le_bytes());
        // p_offset, p_vaddr, p_paddr
        for _ in 0..3 {
            let () = phdr.extend_from_slice(&TEXT_ADDR.to_le_bytes());
        }
        // p_filesz, p_memsz, p_align
        for _ in 0..3 {
            let () = phdr.extend_from_slice(&TEXT_SIZE.to_le_bytes());
        }
        let () = set(&mut data, EHDR_SIZE, &phdr);
        data
    }
}


#[derive(Clone, Copy, Debug)]
enum PclntabLayout {
    Go12,
    Go116,
    Go118,
    Go120,
}


/// A builder of Go line tables containing just enough data for
/// function name lookup.
#[derive(Clone, Debug)]
pub struct PclntabBuilder {
    text_start: Addr,
    big_endian: bool,
    ptr_size: u8,
    funcs: Vec<(Addr, &'static str)>,
    end: Addr,
    layout: PclntabLayout,
}

impl PclntabBuilder {
    /// Create a builder for a table describing a text section starting
    /// at `text_start`.
    pub fn new(text_start: Addr) -> Self {
        Self {
            text_start,
            big_endian: false,
            ptr_size: 8,
            funcs: Vec::new(),
            end: text_start,
            layout: PclntabLayout::Go120,
        }
    }

    /// Set the table's byte order.
    pub fn big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    /// Set the pointer size, four or eight.
    pub fn ptr_size(mut self, ptr_size: u8) -> Self {
        self.ptr_size = ptr_size;
        self
    }

    /// Set the functions, as entry address and name, in table order.
    pub fn funcs(mut self, funcs: Vec<(Addr, &'static str)>) -> Self {
        self.funcs = funcs;
        self
    }

    /// Set the end address of the last function.
    pub fn end(mut self, end: Addr) -> Self {
        self.end = end;
        self
    }

    /// Use the Go 1.2 layout.
    pub fn go12(mut self) -> Self {
        self.layout = PclntabLayout::Go12;
        self
    }

    /// Use the Go 1.16 layout.
    pub fn go116(mut self) -> Self {
        self.layout = PclntabLayout::Go116;
        self
    }

    /// Use the Go 1.18 layout.
    pub fn go118(mut self) -> Self {
        self.layout = PclntabLayout::Go118;
        self
    }

    /// Use the Go 1.20 layout.
    pub fn go120(mut self) -> Self {
        self.layout = PclntabLayout::Go120;
        self
    }

    fn uint(&self, value: u64, size: usize) -> Vec<u8> {
        match (size, self.big_endian) {
            (4, false) => (value as u32).to_le_bytes().to_vec(),
            (4, true) => (value as u32).to_be_bytes().to_vec(),
            (_, false) => value.to_le_bytes().to_vec(),
            (_, true) => value.to_be_bytes().to_vec(),
        }
    }

    /// Create the table's content.
    pub fn build(&self) -> Vec<u8> {
        let ptr = usize::from(self.ptr_size);
        let (magic, words) = match self.layout {
            PclntabLayout::Go12 => (0xfffffffb, 1),
            PclntabLayout::Go116 => (0xfffffffa, 7),
            PclntabLayout::Go118 => (0xfffffff0, 8),
            PclntabLayout::Go120 => (0xfffffff1, 8),
        };
        let relative = matches!(self.layout, PclntabLayout::Go118 | PclntabLayout::Go120);
        let field = if relative { 4 } else { ptr };
        let pc = |addr: Addr| if relative { addr - self.text_start } else { addr };

        let mut data = self.uint(magic, 4);
        let () = data.extend_from_slice(&[0, 0, 1, self.ptr_size]);
        let () = data.resize(8 + words * ptr, 0);

        let count = self.funcs.len();
        let functab_size = (2 * count + 1) * field;

        // Go 1.2 tables place the function table right after the header
        // and have all offsets relative to the start of the table.
        let (nametab, functab) = if let PclntabLayout::Go12 = self.layout {
            let functab = data.len();
            let () = data.resize(functab + functab_size, 0);
            (0, functab)
        } else {
            (data.len(), 0)
        };

        let mut name_offs = Vec::with_capacity(count);
        for (_addr, name) in &self.funcs {
            let () = name_offs.push(data.len() - nametab);
            let () = data.extend_from_slice(name.as_bytes());
            let () = data.push(0);
        }

        let (functab, funcdata) = if let PclntabLayout::Go12 = self.layout {
            (functab, 0)
        } else {
            let () = align(&mut data, 8);
            let functab = data.len();
            let () = data.resize(functab + functab_size, 0);
            (functab, functab)
        };

        for (idx, ((addr, _name), name_off)) in self.funcs.iter().zip(name_offs).enumerate() {
            let func_off = data.len() - funcdata;
            let () = data.extend_from_slice(&self.uint(pc(*addr), field));
            let () = data.extend_from_slice(&self.uint(name_off as u64, 4));

            let entry = functab + 2 * idx * field;
            let () = set(&mut data, entry, &self.uint(pc(*addr), field));
            let () = set(&mut data, entry + field, &self.uint(func_off as u64, field));
        }
        let end = functab + 2 * count * field;
        let () = set(&mut data, end, &self.uint(pc(self.end), field));

        let mut header = vec![(0, count as u64)];
        match self.layout {
            PclntabLayout::Go12 => (),
            PclntabLayout::Go116 => {
                let () = header.push((2, nametab as u64));
                let () = header.push((6, funcdata as u64));
            }
            PclntabLayout::Go118 | PclntabLayout::Go120 => {
                let () = header.push((2, self.text_start));
                let () = header.push((3, nametab as u64));
                let () = header.push((7, funcdata as u64));
            }
        }
        for (word, value) in header {
            let () = set(&mut data, 8 + word * ptr, &self.uint(value, ptr));
        }
        data
    }
}


/// A directory mimicking the layout of `/proc` for a set of fake
/// processes.
#[derive(Debug)]
pub struct FakeProcfs {
    dir: PathBuf,
}

impl FakeProcfs {
    /// Create a fake proc file system rooted at `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Retrieve the directory acting as mount point.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.dir.join(pid.to_string())
    }

    /// Format a line of a `maps` file, with a device of `fd:01`.
    pub fn map_line(
        start: Addr,
        end: Addr,
        perms: &str,
        offset: u64,
        inode: u64,
        path: &str,
    ) -> String {
        format!("{start:x}-{end:x} {perms} {offset:08x} fd:01 {inode} {path}")
    }

    /// Place a file at the absolute `path` inside the root directory
    /// of process `pid`.
    pub fn add_file(&self, pid: u32, path: &str, data: &[u8]) {
        let path = self
            .pid_dir(pid)
            .join("root")
            .join(path.trim_start_matches('/'));
        let () = create_dir_all(path.parent().unwrap()).unwrap();
        let () = write(path, data).unwrap();
    }

    /// Place the file reachable through the `map_files` entry of the
    /// given range of process `pid`.
    pub fn add_map_file(&self, pid: u32, start: Addr, end: Addr, data: &[u8]) {
        let dir = self.pid_dir(pid).join("map_files");
        let () = create_dir_all(&dir).unwrap();
        let () = write(dir.join(format!("{start:x}-{end:x}")), data).unwrap();
    }

    /// Make the root directory of process `pid` the same as that of
    /// process `other`.
    pub fn share_root(&self, pid: u32, other: u32) {
        let dir = self.pid_dir(pid);
        let () = create_dir_all(&dir).unwrap();
        let () = create_dir_all(self.pid_dir(other).join("root")).unwrap();
        let () = symlink(self.pid_dir(other).join("root"), dir.join("root")).unwrap();
    }

    /// Set the memory map of process `pid`.
    pub fn set_maps(&self, pid: u32, lines: &[String]) {
        let mut maps = lines.join("\n");
        let () = maps.push('\n');
        let () = self.set_maps_raw(pid, &maps);
    }

    /// Set the content of the `maps` file of process `pid`.
    pub fn set_maps_raw(&self, pid: u32, maps: &str) {
        let dir = self.pid_dir(pid);
        let () = create_dir_all(&dir).unwrap();
        let () = write(dir.join("maps"), maps).unwrap();
    }
}
