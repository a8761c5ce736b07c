//! Location of separate debug files.
//!
//! Debug files are found either through the build ID of the mapped file
//! (`<debug-dir>/.build-id/<xx>/<rest>.debug`) or through the file name
//! and checksum stored in its `.gnu_debuglink` section. From
//! <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Separate-Debug-Files.html>,
//! the latter is searched for in the directory of the mapped file, in
//! its `.debug` sub-directory, and in the global debug directories.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;


/// Make `path` relative to `root`, as if `root` was the file system
/// root.
pub(crate) fn rooted(root: &Path, path: &Path) -> PathBuf {
    let relative = path
        .components()
        .filter(|component| !matches!(component, Component::RootDir | Component::Prefix(..)))
        .collect::<PathBuf>();
    root.join(relative)
}

/// Produce the candidate paths for a debug file referenced by build ID.
pub(crate) fn build_id_candidates(
    root: &Path,
    debug_dirs: &[PathBuf],
    build_id: &[u8],
) -> Vec<PathBuf> {
    let [first, rest @ ..] = build_id else {
        return Vec::new()
    };
    // A single byte build ID would produce a file named `.debug`.
    if rest.is_empty() {
        return Vec::new()
    }

    let mut file = String::with_capacity(rest.len() * 2 + 6);
    for byte in rest {
        let _result = write!(file, "{byte:02x}");
    }
    let () = file.push_str(".debug");

    debug_dirs
        .iter()
        .map(|dir| {
            rooted(root, dir)
                .join(".build-id")
                .join(format!("{first:02x}"))
                .join(&file)
        })
        .collect()
}

/// Produce the candidate paths for a debug file referenced by the debug
/// link `linkee` in the file at `linker` (as seen by the process).
pub(crate) fn debug_link_candidates(
    root: &Path,
    debug_dirs: &[PathBuf],
    linker: &Path,
    linkee: &OsStr,
) -> Vec<PathBuf> {
    let dir = linker.parent().unwrap_or_else(|| Path::new("/"));
    let mut candidates = Vec::with_capacity(debug_dirs.len() + 2);

    let local = rooted(root, dir);
    let () = candidates.push(local.join(linkee));
    let () = candidates.push(local.join(".debug").join(linkee));

    for debug_dir in debug_dirs {
        let global = rooted(root, debug_dir);
        let () = candidates.push(rooted(&global, dir).join(linkee));
    }
    candidates
}


const fn crc32_table() -> [u32; 256] {
    let mut table = [0; 256];
    let mut i = 0;
    while i < table.len() {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                0xedb88320 ^ (crc >> 1)
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = crc32_table();

/// Calculate the CRC32 checksum used by `.gnu_debuglink` sections.
pub fn debug_link_crc32(data: &[u8]) -> u32 {
    let crc = data.iter().fold(!0u32, |crc, byte| {
        CRC32_TABLE[usize::from((crc as u8) ^ byte)] ^ (crc >> 8)
    });
    !crc
}
