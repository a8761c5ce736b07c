use std::path::PathBuf;
use std::sync::Arc;

use crate::elf::BuildId;
use crate::elf::ElfCache;
use crate::elf::ElfTableDebugInfo;
use crate::elf::FileStat;
use crate::gcache::CacheDebugInfo;
use crate::gcache::GCacheOptions;
use crate::gcache::GenerationalCache;
use crate::ksym::KsymResolver;
use crate::ksym::KALLSYMS;
use crate::log::debug;
use crate::log::trace;
use crate::proc::ProcConfig;
use crate::proc::ProcTable;
use crate::proc::ProcTableDebugInfo;
use crate::symbol::demangle;
use crate::symbol::Symbol;
use crate::Addr;
use crate::Result;


/// The PID routed to the kernel's symbol table.
const KERNEL_PID: u32 = 0;


/// Bounds for the caches of a [`SymbolCache`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheOptions {
    /// Options for the cache of per-process tables.
    pub pid_cache: GCacheOptions,
    /// Options for the cache of ELF symbol tables keyed by build ID.
    pub build_id_cache: GCacheOptions,
    /// Options for the cache of ELF symbol tables keyed by file
    /// identity.
    pub same_file_cache: GCacheOptions,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            pid_cache: GCacheOptions::new(256, 3),
            build_id_cache: GCacheOptions::new(128, 3),
            same_file_cache: GCacheOptions::new(128, 3),
        }
    }
}


/// A snapshot of the state of all caches of a [`SymbolCache`].
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolCacheDebugInfo {
    /// The per-process tables.
    pub pid_cache: CacheDebugInfo<u32, ProcTableDebugInfo>,
    /// The ELF symbol tables reachable by build ID.
    pub build_id_cache: CacheDebugInfo<BuildId, ElfTableDebugInfo>,
    /// The ELF symbol tables reachable by file identity.
    pub same_file_cache: CacheDebugInfo<FileStat, ElfTableDebugInfo>,
}


/// A builder for configurable construction of [`SymbolCache`] objects.
///
/// By default the kernel's symbols are read from `/proc/kallsyms`,
/// process information from `/proc`, and separate debug files are
/// searched for below `/usr/lib/debug`. Demangling is disabled.
#[derive(Clone, Debug)]
pub struct Builder {
    /// See [`Builder::set_cache_options`].
    cache_options: CacheOptions,
    /// See [`Builder::set_kallsyms_path`].
    kallsyms: PathBuf,
    /// See [`Builder::set_procfs_path`].
    procfs: PathBuf,
    /// See [`Builder::set_debug_dirs`].
    debug_dirs: Vec<PathBuf>,
    /// See [`Builder::enable_demangling`].
    demangle: bool,
}

impl Builder {
    /// Set the bounds of the caches.
    pub fn set_cache_options(mut self, options: CacheOptions) -> Builder {
        self.cache_options = options;
        self
    }

    /// Set the path of the file listing the kernel's symbols.
    pub fn set_kallsyms_path(mut self, path: PathBuf) -> Builder {
        self.kallsyms = path;
        self
    }

    /// Set the mount point of the proc file system.
    pub fn set_procfs_path(mut self, path: PathBuf) -> Builder {
        self.procfs = path;
        self
    }

    /// Set the directories searched for separate debug files.
    ///
    /// Directories are interpreted relative to the root directory of
    /// the process whose addresses are being resolved.
    pub fn set_debug_dirs(mut self, dirs: Vec<PathBuf>) -> Builder {
        self.debug_dirs = dirs;
        self
    }

    /// Enable/disable the demangling of Rust and C++ symbol names.
    ///
    /// Demangling is only performed if the `demangle` feature is
    /// enabled.
    pub fn enable_demangling(mut self, enable: bool) -> Builder {
        self.demangle = enable;
        self
    }

    /// Create the [`SymbolCache`] object.
    ///
    /// Reading the kernel's symbols is part of construction. Failure to
    /// do so is reported as an error.
    pub fn build(self) -> Result<SymbolCache> {
        let Builder {
            cache_options,
            kallsyms,
            procfs,
            debug_dirs,
            demangle,
        } = self;

        let ksym = KsymResolver::load_file_name(&kallsyms)?;
        let on_pid_evict =
            |pid: &u32, _table: &Arc<ProcTable>| trace!("evicting process table for {pid}");
        let cache = SymbolCache {
            ksym,
            pid_cache: GenerationalCache::with_evict_hook(cache_options.pid_cache, on_pid_evict),
            elf_cache: ElfCache::new(cache_options.build_id_cache, cache_options.same_file_cache),
            config: ProcConfig {
                procfs,
                debug_dirs: Arc::from(debug_dirs),
            },
            demangle,
        };
        Ok(cache)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            cache_options: CacheOptions::default(),
            kallsyms: PathBuf::from(KALLSYMS),
            procfs: PathBuf::from("/proc"),
            debug_dirs: vec![PathBuf::from("/usr/lib/debug")],
            demangle: false,
        }
    }
}


/// Resolution of addresses in arbitrary processes and the kernel to
/// symbols, caching per-process and per-binary state across calls.
///
/// Time is divided into rounds, typically one per profile collection
/// cycle. Each round should look as follows:
/// 1. [`advance_round`][SymbolCache::advance_round]
/// 2. [`resolve`][SymbolCache::resolve] for all addresses collected
/// 3. [`evict_expired`][SymbolCache::evict_expired]
///
/// Cached state not used for more than the configured number of rounds
/// is released during eviction, as is state exceeding the configured
/// cache sizes.
#[derive(Debug)]
pub struct SymbolCache {
    /// The kernel's symbols.
    ksym: KsymResolver,
    pid_cache: GenerationalCache<u32, Arc<ProcTable>>,
    elf_cache: ElfCache,
    config: ProcConfig,
    /// See [`Builder::enable_demangling`].
    demangle: bool,
}

impl SymbolCache {
    /// Create a new [`SymbolCache`] with the given cache bounds and
    /// otherwise default settings.
    ///
    /// This method is just a short hand for instantiating a
    /// `SymbolCache` from the default [`Builder`].
    pub fn new(options: CacheOptions) -> Result<Self> {
        Self::builder().set_cache_options(options).build()
    }

    /// Retrieve a [`Builder`] object for configurable construction of a
    /// [`SymbolCache`].
    #[inline]
    pub fn builder() -> Builder {
        Builder::default()
    }

    fn proc_table(&self, pid: u32) -> Arc<ProcTable> {
        if let Some(table) = self.pid_cache.get(&pid) {
            return table
        }

        let table = Arc::new(ProcTable::new(pid, &self.config, self.pid_cache.round()));
        let () = self.pid_cache.put(pid, Arc::clone(&table));
        table
    }

    /// Resolve the address `addr` in the process with ID `pid`.
    ///
    /// A `pid` of `0` refers to the kernel. Failure to resolve an
    /// address, for whatever reason, is not an error. Rather, the
    /// returned [`Symbol`] lacks a name or, if the address is not
    /// mapped at all, is empty.
    pub fn resolve(&self, pid: u32, addr: Addr) -> Symbol {
        let mut sym = if pid == KERNEL_PID {
            self.ksym.resolve(addr)
        } else {
            self.proc_table(pid)
                .resolve(&self.config, &self.elf_cache, addr, self.pid_cache.round())
        };

        if self.demangle {
            sym.name = sym.name.map(demangle);
        }
        sym
    }

    /// Re-read the memory map of the process with ID `pid`.
    pub fn refresh(&self, pid: u32) {
        if pid == KERNEL_PID {
            return
        }

        match self.pid_cache.get(&pid) {
            Some(table) => table.refresh(&self.config, self.pid_cache.round()),
            None => {
                let _table = self.proc_table(pid);
            }
        }
    }

    /// Start a new round.
    pub fn advance_round(&self) {
        let () = self.pid_cache.advance_round();
        let () = self.elf_cache.advance_round();
    }

    /// Release all cached state that expired, returning the number of
    /// cache entries evicted.
    ///
    /// Calling this method repeatedly without intermediate activity
    /// evicts nothing.
    pub fn evict_expired(&self) -> usize {
        let elf = self.elf_cache.evict_expired();
        let pid = self.pid_cache.evict_expired();
        if elf + pid > 0 {
            debug!("evicted {pid} process tables and {elf} ELF tables");
        }
        elf + pid
    }

    /// Change the bounds of the caches.
    ///
    /// New bounds are enforced starting with the next call to
    /// [`evict_expired`][SymbolCache::evict_expired].
    pub fn reconfigure(&self, options: CacheOptions) {
        let () = self.pid_cache.configure(options.pid_cache);
        let () = self
            .elf_cache
            .configure(options.build_id_cache, options.same_file_cache);
    }

    /// Retrieve a snapshot of the state of all caches.
    ///
    /// Taking the snapshot does not count as use of any entry.
    pub fn debug_snapshot(&self) -> SymbolCacheDebugInfo {
        SymbolCacheDebugInfo {
            pid_cache: self.pid_cache.debug_info(|_pid, table| table.debug_info()),
            build_id_cache: self.elf_cache.build_id_debug_info(),
            same_file_cache: self.elf_cache.same_file_debug_info(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;
    use tempfile::TempDir;
    use test_log::test;

    use crate::test_helper::ElfBuilder;
    use crate::test_helper::FakeProcfs;
    use crate::ErrorKind;


    const KALLSYMS_DATA: &str = "\
ffffffff81000000 T _stext
ffffffff81001000 T do_one_initcall
ffffffffc0a00000 t nf_conntrack_in [nf_conntrack]
";

    struct Fixture {
        dir: TempDir,
        procfs: FakeProcfs,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let () = fs::write(dir.path().join("kallsyms"), KALLSYMS_DATA).unwrap();
            let procfs_dir = dir.path().join("proc");
            let () = fs::create_dir(&procfs_dir).unwrap();
            let procfs = FakeProcfs::new(&procfs_dir);
            Self { dir, procfs }
        }

        fn builder(&self) -> Builder {
            SymbolCache::builder()
                .set_kallsyms_path(self.dir.path().join("kallsyms"))
                .set_procfs_path(self.procfs.path().to_path_buf())
        }

        fn add_app(&self, pid: u32, builder: &ElfBuilder) {
            let () = self.procfs.add_file(pid, "/usr/bin/app", &builder.build());
            let () = self.procfs.set_maps(
                pid,
                &[FakeProcfs::map_line(0x1000, 0x2000, "r-xp", 0x1000, 10, "/usr/bin/app")],
            );
        }
    }

    /// Check that construction fails without kernel symbols.
    #[test]
    fn missing_kallsyms() {
        let err = SymbolCache::builder()
            .set_kallsyms_path(Path::new("/does/not/exist").to_path_buf())
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    /// Check that PID 0 is resolved against the kernel's symbols.
    #[test]
    fn kernel_resolution() {
        let fixture = Fixture::new();
        let cache = fixture.builder().build().unwrap();

        let sym = cache.resolve(0, 0xffffffff81001010);
        assert_eq!(sym.start, 0xffffffff81001000);
        assert_eq!(sym.name.as_deref(), Some("do_one_initcall"));
        assert_eq!(sym.module, "kernel");

        let sym = cache.resolve(0, 0xffffffffc0a00010);
        assert_eq!(sym.module, "nf_conntrack");
        assert_eq!(cache.debug_snapshot().pid_cache.entries.len(), 0);
    }

    /// Check the resolution of user space addresses.
    #[test]
    fn user_resolution() {
        let fixture = Fixture::new();
        let () = fixture.add_app(42, &ElfBuilder::with_test_symbols());
        let cache = fixture.builder().build().unwrap();

        let sym = cache.resolve(42, 0x1149);
        assert_eq!(sym.name.as_deref(), Some("iter"));
        assert_eq!(sym.start, 0x149);
        assert_eq!(sym.module, "/usr/bin/app");
        let sym = cache.resolve(42, 0x115e);
        assert_eq!(sym.name.as_deref(), Some("main"));

        // A process that does not exist.
        let sym = cache.resolve(43, 0x1149);
        assert_eq!(sym, Symbol::default());

        let snapshot = cache.debug_snapshot();
        assert_eq!(snapshot.pid_cache.entries.len(), 2);
        assert_eq!(snapshot.same_file_cache.entries.len(), 1);
        assert_eq!(snapshot.same_file_cache.entries[0].value.parses, 1);
    }

    /// Check that names are demangled if requested.
    #[cfg(feature = "demangle")]
    #[test]
    fn demangled_resolution() {
        let fixture = Fixture::new();
        let builder = ElfBuilder::new().symbol("_ZN3app4main17h0123456789abcdefE", 0x1100, 0x80);
        let () = fixture.add_app(42, &builder);

        let cache = fixture.builder().build().unwrap();
        let sym = cache.resolve(42, 0x1104);
        assert_eq!(sym.name.as_deref(), Some("_ZN3app4main17h0123456789abcdefE"));

        let cache = fixture.builder().enable_demangling(true).build().unwrap();
        let sym = cache.resolve(42, 0x1104);
        assert_eq!(sym.name.as_deref(), Some("app::main"));
    }

    /// Check that process tables expire and get recreated.
    #[test]
    fn process_expiry() {
        let fixture = Fixture::new();
        let () = fixture.add_app(42, &ElfBuilder::with_test_symbols());
        let options = CacheOptions {
            pid_cache: GCacheOptions::new(16, 1),
            ..Default::default()
        };
        let cache = fixture.builder().set_cache_options(options).build().unwrap();

        let _sym = cache.resolve(42, 0x1149);
        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 0);
        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.evict_expired(), 0);
        assert_eq!(cache.debug_snapshot().pid_cache.entries.len(), 0);

        let sym = cache.resolve(42, 0x1149);
        assert_eq!(sym.name.as_deref(), Some("iter"));
    }

    /// Check that reconfiguration takes effect on the next eviction.
    #[test]
    fn reconfiguration() {
        let fixture = Fixture::new();
        let () = fixture.add_app(1, &ElfBuilder::with_test_symbols());
        let () = fixture.add_app(2, &ElfBuilder::with_test_symbols());
        let cache = fixture.builder().build().unwrap();

        let _sym = cache.resolve(1, 0x1149);
        let _sym = cache.resolve(2, 0x1149);
        assert_eq!(cache.debug_snapshot().pid_cache.entries.len(), 2);

        let options = CacheOptions {
            pid_cache: GCacheOptions::new(1, 3),
            ..Default::default()
        };
        let () = cache.reconfigure(options);
        assert_eq!(cache.debug_snapshot().pid_cache.entries.len(), 2);
        assert_eq!(cache.evict_expired(), 1);

        let snapshot = cache.debug_snapshot();
        assert_eq!(snapshot.pid_cache.options, GCacheOptions::new(1, 3));
        assert_eq!(snapshot.pid_cache.entries[0].key, 2);
    }

    /// Check that a forced refresh picks up new mappings.
    #[test]
    fn forced_refresh() {
        let fixture = Fixture::new();
        let () = fixture.add_app(42, &ElfBuilder::with_test_symbols());
        let cache = fixture.builder().build().unwrap();
        assert_eq!(cache.resolve(42, 0x1149).name.as_deref(), Some("iter"));

        let () = fixture.procfs.set_maps(
            42,
            &[FakeProcfs::map_line(0x5000, 0x6000, "r-xp", 0x1000, 10, "/usr/bin/app")],
        );
        // Still the old mappings.
        assert_eq!(cache.resolve(42, 0x1149).name.as_deref(), Some("iter"));

        let () = cache.refresh(42);
        assert_eq!(cache.resolve(42, 0x1149), Symbol::default());
        assert_eq!(cache.resolve(42, 0x5149).name.as_deref(), Some("iter"));
    }
}
