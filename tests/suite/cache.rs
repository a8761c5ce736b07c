use procsym::CacheOptions;
use procsym::GCacheOptions;
use procsym::SymbolCache;
use procsym::__private::ElfBuilder;

use test_log::test;

use crate::suite::common::Env;
use crate::suite::common::APP;


const BUILD_ID: [u8; 8] = [0x4e, 0x1f, 0x07, 0x3a, 0x9c, 0x22, 0x5b, 0xd0];


/// Check that processes mapping different files with the same build ID
/// share a single symbol table.
#[test]
fn build_id_sharing() {
    let env = Env::new();
    let elf = ElfBuilder::with_test_symbols().build_id(&BUILD_ID).build();
    let () = env.procfs.add_file(1, APP, &elf);
    let () = env.procfs.add_file(2, "/opt/app/bin/app", &elf);
    let () = env.map(1, 0x1000, 10, APP);
    let () = env.map(2, 0x55d4c2a01000, 20, "/opt/app/bin/app");

    let cache = env.cache();
    assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));
    assert_eq!(cache.resolve(2, 0x55d4c2a01149).name.as_deref(), Some("iter"));

    let info = cache.debug_snapshot();
    assert_eq!(info.pid_cache.entries.len(), 2);
    assert_eq!(info.build_id_cache.entries.len(), 1);
    assert_eq!(info.same_file_cache.entries.len(), 1);

    let entry = &info.build_id_cache.entries[0];
    assert_eq!(entry.key.as_bytes(), BUILD_ID);
    assert_eq!(entry.value.parses, 1);
    assert_eq!(entry.value.symbols, 2);
}

/// Check that processes sharing a root share tables of binaries without
/// build ID through the file's identity.
#[test]
fn same_file_sharing() {
    let env = Env::new();
    let elf = ElfBuilder::with_test_symbols().build();
    let () = env.procfs.add_file(1, APP, &elf);
    let () = env.procfs.share_root(2, 1);
    let () = env.map(1, 0x1000, 10, APP);
    let () = env.map(2, 0x1000, 10, APP);

    let cache = env.cache();
    assert_eq!(cache.resolve(1, 0x115e).name.as_deref(), Some("main"));
    assert_eq!(cache.resolve(2, 0x115e).name.as_deref(), Some("main"));

    let info = cache.debug_snapshot();
    assert_eq!(info.build_id_cache.entries.len(), 0);
    assert_eq!(info.same_file_cache.entries.len(), 1);
    assert_eq!(info.same_file_cache.entries[0].value.parses, 1);

    // A copy of the same binary is a different file.
    let () = env.procfs.add_file(3, APP, &elf);
    let () = env.map(3, 0x1000, 10, APP);
    assert_eq!(cache.resolve(3, 0x115e).name.as_deref(), Some("main"));

    let info = cache.debug_snapshot();
    assert_eq!(info.same_file_cache.entries.len(), 2);
}

/// Check that a binary's symbols are parsed only once, no matter how
/// often addresses in it are resolved.
#[test]
fn parse_once() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    for _ in 0..3 {
        assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));
        assert_eq!(cache.resolve(1, 0x115e).name.as_deref(), Some("main"));
        let () = cache.advance_round();
    }

    let info = cache.debug_snapshot();
    let entry = &info.same_file_cache.entries[0];
    assert_eq!(entry.value.parses, 1);
    assert_eq!(entry.round, 2);
}

/// Check that entries are retained for exactly `keep_rounds` rounds
/// after their last use.
#[test]
fn keep_rounds() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    let () = cache.advance_round();
    assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));

    for _ in 0..3 {
        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 0);
    }

    let info = cache.debug_snapshot();
    assert_eq!(info.pid_cache.entries.len(), 1);
    assert_eq!(info.same_file_cache.entries.len(), 1);

    let () = cache.advance_round();
    // The process table and the file's symbol table.
    assert_eq!(cache.evict_expired(), 2);
    assert_eq!(cache.evict_expired(), 0);

    let info = cache.debug_snapshot();
    assert!(info.pid_cache.entries.is_empty());
    assert!(info.same_file_cache.entries.is_empty());
}

/// Check that resolving addresses keeps the involved tables alive.
#[test]
fn use_extends_lifetime() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    for _ in 0..10 {
        assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));
        let () = cache.advance_round();
        assert_eq!(cache.evict_expired(), 0);
    }

    let info = cache.debug_snapshot();
    assert_eq!(info.pid_cache.entries[0].round, 9);
    assert_eq!(info.same_file_cache.entries[0].round, 9);
    assert_eq!(info.same_file_cache.entries[0].value.parses, 1);
}

/// Check that zero sized caches disable caching without affecting
/// resolution.
#[test]
fn disabled_caching() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let options = CacheOptions {
        pid_cache: GCacheOptions::new(0, 3),
        build_id_cache: GCacheOptions::new(0, 3),
        same_file_cache: GCacheOptions::new(0, 3),
    };
    let cache = env.builder().set_cache_options(options).build().unwrap();
    for _ in 0..2 {
        assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));
    }
    assert_eq!(cache.evict_expired(), 0);

    let info = cache.debug_snapshot();
    assert!(info.pid_cache.entries.is_empty());
    assert!(info.build_id_cache.entries.is_empty());
    assert!(info.same_file_cache.entries.is_empty());
}

/// Check that taking a snapshot does not count as use.
#[test]
fn snapshot_is_passive() {
    let env = Env::new();
    let elf = ElfBuilder::with_test_symbols().build();
    let () = env.procfs.add_file(1, APP, &elf);
    let () = env.procfs.add_file(2, APP, &elf);
    let () = env.map(1, 0x1000, 10, APP);
    let () = env.map(2, 0x1000, 11, APP);

    let cache = env.cache();
    let _sym = cache.resolve(1, 0x1149);
    let () = cache.advance_round();
    let _sym = cache.resolve(2, 0x1149);

    let keys = |cache: &SymbolCache| {
        cache
            .debug_snapshot()
            .pid_cache
            .entries
            .iter()
            .map(|entry| (entry.key, entry.round))
            .collect::<Vec<_>>()
    };

    let before = keys(&cache);
    assert_eq!(before, vec![(2, 1), (1, 0)]);
    let () = cache.advance_round();
    assert_eq!(keys(&cache), before);
    assert_eq!(keys(&cache), before);
}

/// Check that new options are honored by the next eviction.
#[test]
fn reconfiguration() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    let _sym = cache.resolve(1, 0x1149);
    let () = cache.advance_round();
    assert_eq!(cache.evict_expired(), 0);

    let mut options = CacheOptions::default();
    options.pid_cache.keep_rounds = 0;
    let () = cache.reconfigure(options);

    let info = cache.debug_snapshot();
    assert_eq!(info.pid_cache.options.keep_rounds, 0);
    assert_eq!(info.pid_cache.entries.len(), 1);

    // Only the process table is affected.
    assert_eq!(cache.evict_expired(), 1);
    let info = cache.debug_snapshot();
    assert!(info.pid_cache.entries.is_empty());
    assert_eq!(info.same_file_cache.entries.len(), 1);
}
