use std::fs::remove_file;
use std::thread;

use procsym::CacheOptions;
use procsym::ErrorKind;
use procsym::Symbol;
use procsym::SymbolCache;
use procsym::__private::debug_link_crc32;
use procsym::__private::ElfBuilder;
use procsym::__private::FakeProcfs;
use procsym::__private::PclntabBuilder;

use test_log::test;

use crate::suite::common::Env;
use crate::suite::common::APP;


/// Check the canonical example: `iter` and `main` in a binary mapped
/// at `0x1000`.
#[test]
fn resolve_symtab() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    let sym = cache.resolve(1, 0x1149);
    assert_eq!(
        sym,
        Symbol {
            start: 0x149,
            name: Some("iter".to_string()),
            module: APP.to_string(),
        }
    );
    let sym = cache.resolve(1, 0x115e);
    assert_eq!(sym.name.as_deref(), Some("main"));
    assert_eq!(sym.start, 0x15e);
}

/// Check that a stripped binary without debug file yields names-less
/// symbols that still carry the module.
#[test]
fn resolve_stripped() {
    let env = Env::new();
    let () = env.procfs.add_file(1, APP, &ElfBuilder::new().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    for addr in [0x1149, 0x115e] {
        let sym = cache.resolve(1, addr);
        assert_eq!(sym.name, None);
        assert_eq!(sym.module, APP);
        assert!(!sym.is_unknown());
    }
}

/// Check that a 32 bit binary, which cannot be parsed, still yields
/// symbols carrying the module.
#[test]
fn resolve_elf32() {
    let env = Env::new();
    let mut elf = ElfBuilder::with_test_symbols().build();
    // 32 bit class.
    elf[4] = 1;
    let () = env.procfs.add_file(1, APP, &elf);
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    let sym = cache.resolve(1, 0x1149);
    assert_eq!(sym.name, None);
    assert_eq!(sym.module, APP);
    assert_eq!(sym.start, 0x149);
}

/// Check the boundaries of ranges and function tables.
#[test]
fn resolve_boundaries() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    // Ranges are half open.
    let sym = cache.resolve(1, 0x2000);
    assert_eq!(sym, Symbol::default());
    assert!(sym.is_unknown());
    let sym = cache.resolve(1, 0xfff);
    assert_eq!(sym, Symbol::default());

    // Below the first function.
    let sym = cache.resolve(1, 0x1010);
    assert_eq!(sym.name, None);
    assert_eq!(sym.module, APP);
    assert_eq!(sym.start, 0x10);

    let sym = cache.resolve(1, 0x1fff);
    assert_eq!(sym.name, None);
    assert_eq!(sym.start, 0xfff);
}

/// Check that a position independent binary is resolved correctly
/// when loaded at a randomized address.
#[test]
fn resolve_relocated() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x55d4c2a01000, 10, APP);

    let cache = env.cache();
    let sym = cache.resolve(1, 0x55d4c2a01149);
    assert_eq!(sym.name.as_deref(), Some("iter"));
    assert_eq!(sym.start, 0x149);
}

/// Check that Go binaries without conventional symbols are resolved
/// through their line table.
#[test]
fn resolve_go_line_table() {
    let pclntab = PclntabBuilder::new(0x1000)
        .funcs(vec![
            (0x1000, "runtime.text"),
            (0x1040, "main.iter"),
            (0x1100, "main.main"),
        ])
        .end(0x1180)
        .go118()
        .build();
    let elf = ElfBuilder::new().pclntab(pclntab).build();

    let env = Env::new();
    let () = env.procfs.add_file(1, "/usr/local/bin/server", &elf);
    let () = env.map(1, 0x7f0000001000, 10, "/usr/local/bin/server");

    let cache = env.cache();
    let sym = cache.resolve(1, 0x7f0000001104);
    assert_eq!(sym.name.as_deref(), Some("main.main"));
    assert_eq!(sym.start, 0x104);
    let sym = cache.resolve(1, 0x7f0000001050);
    assert_eq!(sym.name.as_deref(), Some("main.iter"));
    let sym = cache.resolve(1, 0x7f0000001200);
    assert_eq!(sym.name, None);
}

/// Check that debug files inside of the process's root are found by
/// build ID and by debug link.
#[test]
fn resolve_debug_files() {
    let build_id = [0xab, 0xcd, 0xef, 0x01, 0x23];
    let env = Env::new();
    let debug = ElfBuilder::with_test_symbols().build_id(&build_id).build();
    let () = env
        .procfs
        .add_file(1, "/usr/lib/debug/.build-id/ab/cdef0123.debug", &debug);
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::new().build_id(&build_id).build());
    let () = env.map(1, 0x1000, 10, APP);

    let debug = ElfBuilder::new().symbol("linked", 0x1100, 0x100).build();
    let crc = debug_link_crc32(&debug);
    let () = env.procfs.add_file(2, "/usr/bin/.debug/other.debug", &debug);
    let () = env.procfs.add_file(
        2,
        "/usr/bin/other",
        &ElfBuilder::new().debug_link("other.debug", crc).build(),
    );
    let () = env.map(2, 0x1000, 11, "/usr/bin/other");

    let cache = env.cache();
    assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));
    assert_eq!(cache.resolve(2, 0x1149).name.as_deref(), Some("linked"));
}

/// Check that kernel addresses are resolved for PID 0.
#[test]
fn resolve_kernel() {
    let env = Env::new();
    let cache = env.cache();

    let sym = cache.resolve(0, 0xffffffff81001804);
    assert_eq!(sym.start, 0xffffffff81001800);
    assert_eq!(sym.name.as_deref(), Some("schedule"));
    assert_eq!(sym.module, "kernel");

    let sym = cache.resolve(0, 0xffffffffc0a00042);
    assert_eq!(sym.name.as_deref(), Some("nf_conntrack_in"));
    assert_eq!(sym.module, "nf_conntrack");

    let sym = cache.resolve(0, 0x1000);
    assert_eq!(sym.name, None);
    assert_eq!(sym.module, "kernel");
}

/// Check that an unreadable kernel symbol listing is fatal.
#[test]
fn missing_kallsyms() {
    let env = Env::new();
    let () = remove_file(env.kallsyms()).unwrap();
    let err = env.builder().build().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Check that processes that do not exist resolve to nothing.
#[test]
fn resolve_unknown_process() {
    let env = Env::new();
    let cache = env.cache();
    assert_eq!(cache.resolve(4242, 0x1149), Symbol::default());
}

/// Check that newly loaded libraries are picked up without explicit
/// refresh, once per round.
#[test]
fn resolve_dlopen() {
    let env = Env::new();
    let elf = ElfBuilder::with_test_symbols().build();
    let () = env.procfs.add_file(1, APP, &elf);
    let () = env.procfs.add_file(1, "/usr/lib/libplugin.so", &elf);
    let () = env.map(1, 0x1000, 10, APP);

    let cache = env.cache();
    assert_eq!(cache.resolve(1, 0x1149).name.as_deref(), Some("iter"));

    let () = env.procfs.set_maps(
        1,
        &[
            FakeProcfs::map_line(0x1000, 0x2000, "r-xp", 0x1000, 10, APP),
            FakeProcfs::map_line(
                0x7f0000001000,
                0x7f0000002000,
                "r-xp",
                0x1000,
                11,
                "/usr/lib/libplugin.so",
            ),
        ],
    );
    // The memory map was read in this round already.
    assert_eq!(cache.resolve(1, 0x7f000000115e), Symbol::default());

    let () = cache.advance_round();
    let sym = cache.resolve(1, 0x7f000000115e);
    assert_eq!(sym.name.as_deref(), Some("main"));
    assert_eq!(sym.module, "/usr/lib/libplugin.so");
}

/// Check that a library replaced by another one at the same address
/// range is picked up in the next round.
#[test]
fn resolve_swapped_library() {
    let env = Env::new();
    let liba = ElfBuilder::new().symbol("liba_func", 0x1100, 0x20).build();
    let libb = ElfBuilder::new().symbol("libb_func", 0x1100, 0x20).build();
    let () = env.procfs.add_file(1, "/usr/lib/liba.so", &liba);
    let () = env.procfs.add_file(1, "/usr/lib/libb.so", &libb);
    let () = env.map(1, 0x5000, 11, "/usr/lib/liba.so");

    let cache = env.cache();
    let () = cache.advance_round();
    let sym = cache.resolve(1, 0x5104);
    assert_eq!(sym.name.as_deref(), Some("liba_func"));

    let () = env.map(1, 0x5000, 12, "/usr/lib/libb.so");
    for _ in 0..3 {
        let () = cache.advance_round();
        let sym = cache.resolve(1, 0x5104);
        assert_eq!(
            sym,
            Symbol {
                start: 0x104,
                name: Some("libb_func".to_string()),
                module: "/usr/lib/libb.so".to_string(),
            }
        );
    }
}

/// Check that a process executing another binary, which happens to be
/// loaded at the same address range, resolves against the new binary.
#[test]
fn resolve_after_exec() {
    let env = Env::new();
    let old = ElfBuilder::new().symbol("old_main", 0x1100, 0x40).exec().build();
    let new = ElfBuilder::new().symbol("new_main", 0x1100, 0x40).exec().build();
    let () = env.procfs.add_file(1, "/usr/bin/old", &old);
    let () = env.procfs.add_file(1, "/usr/bin/new", &new);
    let () = env.map(1, 0x1000, 20, "/usr/bin/old");

    let cache = env.cache();
    assert_eq!(cache.resolve(1, 0x1120).name.as_deref(), Some("old_main"));

    let () = env.map(1, 0x1000, 21, "/usr/bin/new");
    let () = cache.advance_round();
    let sym = cache.resolve(1, 0x1120);
    assert_eq!(sym.name.as_deref(), Some("new_main"));
    assert_eq!(sym.module, "/usr/bin/new");

    let info = cache.debug_snapshot();
    let modules = &info.pid_cache.entries[0].value.modules;
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].path.to_str(), Some("/usr/bin/new"));
}

/// Check that the cache can be reconfigured while addresses are being
/// resolved.
#[test]
fn concurrent_reconfigure() {
    let env = Env::new();
    let () = env
        .procfs
        .add_file(1, APP, &ElfBuilder::with_test_symbols().build());
    let () = env.map(1, 0x1000, 10, APP);
    let cache = env.cache();

    let () = thread::scope(|scope| {
        let _handle = scope.spawn(|| {
            for size in 0..50 {
                let mut options = CacheOptions::default();
                options.pid_cache.size = size % 3;
                let () = cache.reconfigure(options);
            }
        });

        for _ in 0..50 {
            let sym = cache.resolve(1, 0x1149);
            assert_eq!(sym.name.as_deref(), Some("iter"));
            let _evicted = cache.evict_expired();
        }
    });
}

/// Make sure that a `SymbolCache` can be shared between threads.
#[test]
fn send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    let () = assert_send_sync::<SymbolCache>();
}
