use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;


const DELETED_SUFFIX: &str = " (deleted)";


/// Encode a device's major and minor number in the same way
/// `st_dev` reports them.
pub(crate) fn makedev(major: u32, minor: u32) -> u64 {
    let major = u64::from(major);
    let minor = u64::from(minor);
    ((major & 0xfffff000) << 32)
        | ((major & 0x00000fff) << 8)
        | ((minor & 0xffffff00) << 12)
        | (minor & 0x000000ff)
}


/// The key identifying a file mapped into a process.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct FileKey {
    pub dev: u64,
    pub inode: u64,
    pub path: PathBuf,
}


/// A single entry of a process' memory map listing.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ProcMap {
    /// The virtual address range covered by this entry.
    pub range: Range<Addr>,
    /// The permissions as bit field, `r` being the most significant
    /// bit and `p`/`s` the least significant one.
    pub mode: u8,
    pub offset: u64,
    pub dev: u64,
    pub inode: u64,
    /// The path of the backing file, with any " (deleted)" suffix
    /// removed. Empty for anonymous mappings.
    pub path: PathBuf,
    /// Whether the backing file was deleted after being mapped.
    pub deleted: bool,
}

impl ProcMap {
    #[inline]
    pub(crate) fn is_executable(&self) -> bool {
        self.mode & 0b0010 != 0
    }

    /// Check whether this entry is backed by a file with an absolute
    /// path, as opposed to an anonymous or pseudo mapping (e.g.,
    /// `[vdso]`).
    pub(crate) fn is_file_backed(&self) -> bool {
        self.path.components().next() == Some(Component::RootDir)
    }

    pub(crate) fn file_key(&self) -> FileKey {
        FileKey {
            dev: self.dev,
            inode: self.inode,
            path: self.path.clone(),
        }
    }
}


/// Parse a line of a proc maps file.
fn parse_maps_line<'line>(line: &'line str) -> Result<ProcMap> {
    let full_line = line;

    let split_once = |line: &'line str, component| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_invalid_data(|| {
                format!("failed to find {component} in proc maps line: {full_line}")
            })
    };

    // Lines have the following format:
    // address           perms offset  dev   inode      pathname
    // 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
    // 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
    // a7cb1000-a7cb2000 ---p 00000000 00:00 0
    // a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
    let (address_str, line) = split_once(line, "address range")?;
    let (start_str, end_str) = address_str.split_once('-').ok_or_invalid_data(|| {
        format!("encountered malformed address range in proc maps line: {full_line}")
    })?;
    let start = Addr::from_str_radix(start_str, 16)
        .map_err(|err| Error::with_invalid_data(err.to_string()))
        .with_context(|| format!("encountered malformed start address in proc maps line: {full_line}"))?;
    let end = Addr::from_str_radix(end_str, 16)
        .map_err(|err| Error::with_invalid_data(err.to_string()))
        .with_context(|| format!("encountered malformed end address in proc maps line: {full_line}"))?;
    if end < start {
        return Err(Error::with_invalid_data(format!(
            "encountered inverted address range in proc maps line: {full_line}"
        )))
    }

    let (mode_str, line) = split_once(line.trim_start(), "permissions component")?;
    let mode = mode_str
        .chars()
        .fold(0, |mode, c| (mode << 1) | u8::from(c != '-'));

    let (offset_str, line) = split_once(line.trim_start(), "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16)
        .map_err(|err| Error::with_invalid_data(err.to_string()))
        .with_context(|| format!("encountered malformed offset component in proc maps line: {full_line}"))?;

    let (dev_str, line) = split_once(line.trim_start(), "device component")?;
    let dev = dev_str
        .split_once(':')
        .and_then(|(major, minor)| {
            let major = u32::from_str_radix(major, 16).ok()?;
            let minor = u32::from_str_radix(minor, 16).ok()?;
            Some(makedev(major, minor))
        })
        .ok_or_invalid_data(|| {
            format!("encountered malformed device component in proc maps line: {full_line}")
        })?;

    // Note that by design, a path may not be present and so we may not be able
    // to successfully split.
    let (inode_str, path_str) = line
        .trim_start()
        .split_once(|c: char| c.is_ascii_whitespace())
        .map(|(inode, path)| (inode, path.trim()))
        .unwrap_or((line.trim(), ""));
    let inode = inode_str
        .parse::<u64>()
        .map_err(|err| Error::with_invalid_data(err.to_string()))
        .with_context(|| format!("encountered malformed inode component in proc maps line: {full_line}"))?;

    let (path_str, deleted) = match path_str.strip_suffix(DELETED_SUFFIX) {
        Some(path) => (path, true),
        None => (path_str, false),
    };

    let entry = ProcMap {
        range: start..end,
        mode,
        offset,
        dev,
        inode,
        path: PathBuf::from(path_str),
        deleted,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<ProcMap>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(Error::from(err))),
                Ok(0) => break None,
                Ok(_) => {
                    let line_str = self.line.trim();
                    // There shouldn't be any empty lines, but we'd just ignore them. We
                    // need to trim anyway.
                    if !line_str.is_empty() {
                        let result = parse_maps_line(line_str);
                        break Some(result)
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
pub(crate) fn parse_file<R>(reader: R) -> impl Iterator<Item = Result<ProcMap>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
    }
}

/// Parse the maps file of the process with the given PID, below the
/// proc file system mounted at `procfs`, retaining only executable
/// entries.
///
/// A single malformed line invalidates the entire listing.
pub(crate) fn parse_executable(procfs: &Path, pid: u32) -> Result<Vec<ProcMap>> {
    let path = procfs.join(pid.to_string()).join("maps");
    let file =
        File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;

    let mut maps = parse_file(file)
        .filter(|entry| entry.as_ref().map(ProcMap::is_executable).unwrap_or(true))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let () = maps.sort_by_key(|entry| entry.range.start);
    Ok(maps)
}
