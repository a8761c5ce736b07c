use std::fs::create_dir;
use std::fs::write;
use std::path::PathBuf;

use procsym::Builder;
use procsym::SymbolCache;
use procsym::__private::FakeProcfs;

use tempfile::tempdir;
use tempfile::TempDir;


pub(crate) const KALLSYMS: &str = "\
ffffffff81000000 T _stext
ffffffff81001000 T do_one_initcall
ffffffff81001800 T schedule
ffffffffc0a00000 t nf_conntrack_in\t[nf_conntrack]
";

/// The path of the binary used by most tests.
pub(crate) const APP: &str = "/usr/bin/app";


/// A temporary directory holding a fake proc file system and a kernel
/// symbol listing.
pub(crate) struct Env {
    dir: TempDir,
    pub procfs: FakeProcfs,
}

impl Env {
    pub fn new() -> Self {
        let dir = tempdir().unwrap();
        let () = write(dir.path().join("kallsyms"), KALLSYMS).unwrap();
        let procfs_dir = dir.path().join("proc");
        let () = create_dir(&procfs_dir).unwrap();
        let procfs = FakeProcfs::new(&procfs_dir);
        Self { dir, procfs }
    }

    pub fn kallsyms(&self) -> PathBuf {
        self.dir.path().join("kallsyms")
    }

    pub fn builder(&self) -> Builder {
        SymbolCache::builder()
            .set_kallsyms_path(self.kallsyms())
            .set_procfs_path(self.procfs.path().to_path_buf())
    }

    pub fn cache(&self) -> SymbolCache {
        self.builder().build().unwrap()
    }

    /// Map the file at `path` into process `pid` at `start`, with the
    /// mapping covering file offset `0x1000` onwards.
    pub fn map(&self, pid: u32, start: u64, inode: u64, path: &str) {
        let () = self.procfs.set_maps(
            pid,
            &[FakeProcfs::map_line(start, start + 0x1000, "r-xp", 0x1000, inode, path)],
        );
    }
}
