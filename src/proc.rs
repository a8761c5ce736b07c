use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::mem::take;
use std::os::unix::io::AsRawFd as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::elf::rooted;
use crate::elf::BuildId;
use crate::elf::ElfCache;
use crate::elf::ElfParser;
use crate::elf::ElfTable;
use crate::elf::FileStat;
use crate::elf::LoadInfo;
use crate::log::debug;
use crate::log::warn;
use crate::maps;
use crate::maps::FileKey;
use crate::maps::ProcMap;
use crate::mmap::Mmap;
use crate::symbol::Symbol;
use crate::util::fstat;
use crate::util::unpoison;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Result;


/// Configuration shared by all process tables.
#[derive(Debug)]
pub(crate) struct ProcConfig {
    /// The mount point of the proc file system.
    pub procfs: PathBuf,
    /// Directories searched for separate debug files.
    pub debug_dirs: Arc<[PathBuf]>,
}


/// The state of a module, as reported for introspection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModuleState {
    /// No address inside the module has been resolved yet.
    Unbound,
    /// The module is bound to a shared symbol table.
    Bound,
    /// The shared symbol table the module was bound to got evicted.
    /// It will be re-bound on next use.
    Evicted,
    /// Binding failed. Nothing inside the module will be resolved.
    Failed,
}


/// Introspection data about a file mapped into a process.
#[derive(Clone, Debug, PartialEq)]
pub struct ModuleDebugInfo {
    /// The path of the file, as seen by the process.
    pub path: PathBuf,
    /// The device the file resides on, as reported by the memory map.
    pub dev: u64,
    /// The file's inode, as reported by the memory map.
    pub inode: u64,
    /// The state of the module's binding.
    pub state: ModuleState,
}


/// Introspection data about a [`ProcTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct ProcTableDebugInfo {
    /// The process's ID.
    pub pid: u32,
    /// The number of executable memory ranges known.
    pub ranges: usize,
    /// The files mapped executable, sorted by path.
    pub modules: Vec<ModuleDebugInfo>,
}


#[derive(Debug, Default)]
enum Binding {
    #[default]
    Unbound,
    Bound {
        load: LoadInfo,
        table: Weak<ElfTable>,
        build_id: Option<BuildId>,
        stat: FileStat,
        /// The round in which the shared table was last marked as used.
        touched: u32,
    },
    Failed,
}


/// A file mapped into a process and its binding to the shared symbol
/// table for that file.
#[derive(Debug, Default)]
struct Module {
    binding: Binding,
}

impl Module {
    /// Bind the module to the shared table for the file backing `map`,
    /// creating that table if necessary.
    fn bind(
        &mut self,
        pid: u32,
        config: &ProcConfig,
        elf_cache: &ElfCache,
        map: &ProcMap,
        round: u32,
    ) -> Result<Arc<ElfTable>> {
        let proc_dir = config.procfs.join(pid.to_string());
        let root = proc_dir.join("root");
        // A deleted file is only reachable through the mapping itself.
        let path = if map.deleted {
            proc_dir
                .join("map_files")
                .join(format!("{:x}-{:x}", map.range.start, map.range.end))
        } else {
            rooted(&root, &map.path)
        };

        let file =
            File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let stat = fstat(file.as_raw_fd())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let stat = FileStat {
            dev: u64::from(stat.st_dev),
            inode: u64::from(stat.st_ino),
        };
        let mmap = Mmap::map(&file)?;
        let parser = ElfParser::from_mmap(mmap.clone())
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let build_id = parser.build_id()?.map(BuildId::from);
        let load = parser.load_info()?;
        let () = drop(parser);

        let table = elf_cache.get_or_create(build_id.as_ref(), stat, || {
            debug!("creating symbol table for {}", map.path.display());
            ElfTable::new(
                map.path.clone(),
                root,
                Arc::clone(&config.debug_dirs),
                build_id.clone(),
                file,
                mmap,
            )
        });

        self.binding = Binding::Bound {
            load,
            table: Arc::downgrade(&table),
            build_id,
            stat,
            touched: round,
        };
        Ok(table)
    }

    fn try_resolve(
        &mut self,
        pid: u32,
        config: &ProcConfig,
        elf_cache: &ElfCache,
        map: &ProcMap,
        pc: Addr,
        round: u32,
    ) -> Result<Option<String>> {
        let table = match &mut self.binding {
            Binding::Bound {
                table,
                build_id,
                stat,
                touched,
                ..
            } => {
                let table = table.upgrade();
                // The shared table must not expire while still in use.
                if table.is_some() && *touched != round {
                    let () = elf_cache.touch(build_id.as_ref(), *stat);
                    *touched = round;
                }
                table
            }
            Binding::Unbound => None,
            Binding::Failed => return Ok(None),
        };
        let table = match table {
            Some(table) => table,
            None => self.bind(pid, config, elf_cache, map, round)?,
        };

        let Binding::Bound { load, .. } = &self.binding else {
            return Ok(None)
        };
        let bias = load.bias(map.range.start, map.offset)?;
        Ok(table.resolve(pc.wrapping_sub(bias)))
    }

    fn resolve(
        &mut self,
        pid: u32,
        config: &ProcConfig,
        elf_cache: &ElfCache,
        map: &ProcMap,
        pc: Addr,
        round: u32,
    ) -> Option<String> {
        match self.try_resolve(pid, config, elf_cache, map, pc, round) {
            Ok(name) => name,
            Err(err) => {
                warn!(
                    "failed to resolve addresses in {} of process {pid}: {err:#}",
                    map.path.display()
                );
                self.binding = Binding::Failed;
                None
            }
        }
    }

    fn state(&self) -> ModuleState {
        match &self.binding {
            Binding::Unbound => ModuleState::Unbound,
            Binding::Bound { table, .. } if table.strong_count() > 0 => ModuleState::Bound,
            Binding::Bound { .. } => ModuleState::Evicted,
            Binding::Failed => ModuleState::Failed,
        }
    }
}


#[derive(Debug, Default)]
struct ProcState {
    /// All executable mappings, sorted by start address.
    ranges: Vec<ProcMap>,
    /// The files backing the mappings.
    modules: HashMap<FileKey, Module>,
    /// The round in which the memory map was last read.
    refreshed: Option<u32>,
}

impl ProcState {
    fn refresh(&mut self, pid: u32, config: &ProcConfig, round: u32) {
        self.refreshed = Some(round);

        let ranges = match maps::parse_executable(&config.procfs, pid) {
            Ok(ranges) => ranges,
            Err(err) => {
                debug!("failed to refresh memory map of process {pid}: {err:#}");
                return
            }
        };

        let mut old = take(&mut self.modules);
        for map in ranges.iter().filter(|map| map.is_file_backed()) {
            if let Entry::Vacant(entry) = self.modules.entry(map.file_key()) {
                let module = old.remove(entry.key()).unwrap_or_default();
                let _module = entry.insert(module);
            }
        }
        self.ranges = ranges;
    }

    fn find_range(&self, pc: Addr) -> Option<usize> {
        let idx = self
            .ranges
            .partition_point(|map| map.range.start <= pc)
            .checked_sub(1)?;
        self.ranges[idx].range.contains(&pc).then_some(idx)
    }
}


/// The symbolization state of a single process.
#[derive(Debug)]
pub(crate) struct ProcTable {
    pid: u32,
    state: Mutex<ProcState>,
}

impl ProcTable {
    /// Create a table for process `pid`, reading its memory map.
    pub(crate) fn new(pid: u32, config: &ProcConfig, round: u32) -> Self {
        debug!("creating process table for {pid}");

        let mut state = ProcState::default();
        let () = state.refresh(pid, config, round);
        Self {
            pid,
            state: Mutex::new(state),
        }
    }

    /// Re-read the process's memory map.
    pub(crate) fn refresh(&self, config: &ProcConfig, round: u32) {
        let () = unpoison(self.state.lock()).refresh(self.pid, config, round);
    }

    /// Resolve the address `pc` in the process's address space.
    ///
    /// The memory map is re-read on the first resolution of every
    /// round, so that libraries unloaded and replaced in the meantime
    /// are not reported.
    pub(crate) fn resolve(
        &self,
        config: &ProcConfig,
        elf_cache: &ElfCache,
        pc: Addr,
        round: u32,
    ) -> Symbol {
        let mut state = unpoison(self.state.lock());
        if state.refreshed != Some(round) {
            let () = state.refresh(self.pid, config, round);
        }

        let Some(idx) = state.find_range(pc) else {
            return Symbol::default()
        };

        let ProcState {
            ranges, modules, ..
        } = &mut *state;
        let map = &ranges[idx];
        let name = if map.is_file_backed() {
            modules
                .get_mut(&map.file_key())
                .and_then(|module| module.resolve(self.pid, config, elf_cache, map, pc, round))
        } else {
            None
        };

        Symbol {
            start: pc - map.range.start,
            name,
            module: map.path.to_string_lossy().into_owned(),
        }
    }

    pub(crate) fn debug_info(&self) -> ProcTableDebugInfo {
        let state = unpoison(self.state.lock());
        let mut modules = state
            .modules
            .iter()
            .map(|(key, module)| ModuleDebugInfo {
                path: key.path.clone(),
                dev: key.dev,
                inode: key.inode,
                state: module.state(),
            })
            .collect::<Vec<_>>();
        let () = modules.sort_by(|a, b| a.path.cmp(&b.path));

        ProcTableDebugInfo {
            pid: self.pid,
            ranges: state.ranges.len(),
            modules,
        }
    }
}
