use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use crate::gcache::CacheDebugInfo;
use crate::gcache::GCacheOptions;
use crate::gcache::GenerationalCache;
use crate::log::trace;
use crate::util::Hexify;

use super::table::ElfTable;
use super::table::ElfTableDebugInfo;


/// A GNU build ID, identifying a binary by its content.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BuildId(Box<[u8]>);

impl BuildId {
    /// Retrieve the raw bytes of the build ID.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for BuildId {
    fn from(other: &[u8]) -> Self {
        Self(Box::from(other))
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&Hexify(&self.0), f)
    }
}


/// The identity of a file on a file system.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileStat {
    /// The device the file resides on.
    pub dev: u64,
    /// The file's inode number.
    pub inode: u64,
}

impl Display for FileStat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:x}:{}", self.dev, self.inode)
    }
}


/// Shared ownership of [`ElfTable`] objects, keyed by build ID and by
/// file identity.
///
/// A table may be reachable through both keys. It is dropped, releasing
/// its file and mapping, once evicted from both caches.
#[derive(Debug)]
pub(crate) struct ElfCache {
    build_id_cache: GenerationalCache<BuildId, Arc<ElfTable>>,
    same_file_cache: GenerationalCache<FileStat, Arc<ElfTable>>,
}

impl ElfCache {
    pub(crate) fn new(build_id_opts: GCacheOptions, same_file_opts: GCacheOptions) -> Self {
        let on_build_id_evict = |id: &BuildId, table: &Arc<ElfTable>| {
            trace!("evicting {} (build ID {id})", table.path().display())
        };
        let on_same_file_evict = |stat: &FileStat, table: &Arc<ElfTable>| {
            trace!("evicting {} ({stat})", table.path().display())
        };

        Self {
            build_id_cache: GenerationalCache::with_evict_hook(build_id_opts, on_build_id_evict),
            same_file_cache: GenerationalCache::with_evict_hook(same_file_opts, on_same_file_evict),
        }
    }

    /// Look up the table for a file, creating it if necessary.
    ///
    /// Lookup happens by build ID first and by file identity second.
    /// Newly created tables are made available under both keys.
    pub(crate) fn get_or_create<F>(
        &self,
        build_id: Option<&BuildId>,
        stat: FileStat,
        create: F,
    ) -> Arc<ElfTable>
    where
        F: FnOnce() -> ElfTable,
    {
        if let Some(build_id) = build_id {
            if let Some(table) = self.build_id_cache.get(build_id) {
                return table
            }
        }

        if let Some(table) = self.same_file_cache.get(&stat) {
            if let Some(build_id) = build_id {
                let () = self.build_id_cache.put(build_id.clone(), Arc::clone(&table));
            }
            return table
        }

        let table = Arc::new(create());
        if let Some(build_id) = build_id {
            let () = self.build_id_cache.put(build_id.clone(), Arc::clone(&table));
        }
        let () = self.same_file_cache.put(stat, Arc::clone(&table));
        table
    }

    /// Mark the table stored under the provided keys as used in the
    /// current round.
    pub(crate) fn touch(&self, build_id: Option<&BuildId>, stat: FileStat) {
        if let Some(build_id) = build_id {
            let _table = self.build_id_cache.get(build_id);
        }
        let _table = self.same_file_cache.get(&stat);
    }

    pub(crate) fn advance_round(&self) {
        let () = self.build_id_cache.advance_round();
        let () = self.same_file_cache.advance_round();
    }

    pub(crate) fn evict_expired(&self) -> usize {
        self.build_id_cache.evict_expired() + self.same_file_cache.evict_expired()
    }

    pub(crate) fn configure(&self, build_id_opts: GCacheOptions, same_file_opts: GCacheOptions) {
        let () = self.build_id_cache.configure(build_id_opts);
        let () = self.same_file_cache.configure(same_file_opts);
    }

    pub(crate) fn build_id_debug_info(&self) -> CacheDebugInfo<BuildId, ElfTableDebugInfo> {
        self.build_id_cache
            .debug_info(|_id, table| table.debug_info())
    }

    pub(crate) fn same_file_debug_info(&self) -> CacheDebugInfo<FileStat, ElfTableDebugInfo> {
        self.same_file_cache
            .debug_info(|_stat, table| table.debug_info())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::fs::File;
    use std::path::PathBuf;

    use tempfile::NamedTempFile;
    use test_log::test;

    use crate::mmap::Mmap;
    use crate::test_helper::ElfBuilder;


    fn create_table(file: &NamedTempFile) -> ElfTable {
        let handle = File::open(file.path()).unwrap();
        let mmap = Mmap::map(&handle).unwrap();
        ElfTable::new(
            file.path().to_path_buf(),
            PathBuf::from("/"),
            Arc::from([]),
            None,
            handle,
            mmap,
        )
    }

    fn elf_file() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        let () = fs::write(file.path(), ElfBuilder::with_test_symbols().build()).unwrap();
        file
    }

    /// Check the textual representation of cache keys.
    #[test]
    fn key_display() {
        let id = BuildId::from([0xde, 0xad, 0x01].as_slice());
        assert_eq!(id.to_string(), "dead01");
        assert_eq!(id.as_bytes(), &[0xde, 0xad, 0x01]);

        let stat = FileStat {
            dev: 0x10305,
            inode: 42,
        };
        assert_eq!(stat.to_string(), "10305:42");
    }

    /// Check that tables are shared through both kinds of keys.
    #[test]
    fn table_sharing() {
        let cache = ElfCache::new(GCacheOptions::default(), GCacheOptions::default());
        let file = elf_file();
        let id = BuildId::from([1, 2, 3, 4].as_slice());
        let stat1 = FileStat { dev: 1, inode: 1 };
        let stat2 = FileStat { dev: 1, inode: 2 };

        let table1 = cache.get_or_create(Some(&id), stat1, || create_table(&file));
        let table2 = cache.get_or_create(Some(&id), stat2, || unreachable!());
        assert!(Arc::ptr_eq(&table1, &table2));

        let table3 = cache.get_or_create(None, stat1, || unreachable!());
        assert!(Arc::ptr_eq(&table1, &table3));

        let table4 = cache.get_or_create(None, stat2, || create_table(&file));
        assert!(!Arc::ptr_eq(&table1, &table4));

        assert_eq!(cache.build_id_debug_info().entries.len(), 1);
        assert_eq!(cache.same_file_debug_info().entries.len(), 2);
    }

    /// Check that a table found by file identity becomes reachable by
    /// build ID as well.
    #[test]
    fn build_id_backfill() {
        let cache = ElfCache::new(GCacheOptions::default(), GCacheOptions::default());
        let file = elf_file();
        let id = BuildId::from([5, 6, 7, 8].as_slice());
        let stat = FileStat { dev: 3, inode: 7 };

        let table1 = cache.get_or_create(None, stat, || create_table(&file));
        assert_eq!(cache.build_id_debug_info().entries.len(), 0);
        let table2 = cache.get_or_create(Some(&id), stat, || unreachable!());
        assert!(Arc::ptr_eq(&table1, &table2));
        assert_eq!(cache.build_id_debug_info().entries.len(), 1);
    }

    /// Check that tables get released once evicted from both caches.
    #[test]
    fn table_release() {
        let opts = GCacheOptions::new(16, 1);
        let cache = ElfCache::new(opts, opts);
        let file = elf_file();
        let id = BuildId::from([1, 2, 3, 4].as_slice());
        let stat = FileStat { dev: 1, inode: 1 };

        let table = cache.get_or_create(Some(&id), stat, || create_table(&file));
        let weak = Arc::downgrade(&table);
        drop(table);

        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 0);
        assert!(weak.upgrade().is_some());

        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 2);
        assert!(weak.upgrade().is_none());
        assert_eq!(cache.evict_expired(), 0);
    }

    /// Check that a zero sized cache does not keep tables alive.
    #[test]
    fn disabled_caching() {
        let opts = GCacheOptions::new(0, 3);
        let cache = ElfCache::new(opts, opts);
        let file = elf_file();
        let stat = FileStat { dev: 1, inode: 1 };

        let table1 = cache.get_or_create(None, stat, || create_table(&file));
        let table2 = cache.get_or_create(None, stat, || create_table(&file));
        assert!(!Arc::ptr_eq(&table1, &table2));
        assert_eq!(cache.same_file_debug_info().entries.len(), 0);

        let () = cache.configure(GCacheOptions::default(), GCacheOptions::default());
        let table3 = cache.get_or_create(None, stat, || create_table(&file));
        let table4 = cache.get_or_create(None, stat, || unreachable!());
        assert!(Arc::ptr_eq(&table3, &table4));
    }
}
