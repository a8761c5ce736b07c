#![allow(clippy::let_and_return, clippy::let_unit_value)]

mod args;

use std::fmt::Debug;
use std::fmt::Display;
use std::io::stderr;

use anyhow::Context;
use anyhow::Result;

use procsym::CacheDebugInfo;
use procsym::CacheOptions;
use procsym::GCacheOptions;
use procsym::SymbolCache;

use clap::Parser as _;

use tracing::subscriber::set_global_default as set_global_subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::FmtSubscriber;


fn create_cache(args: args::CacheArgs) -> Result<SymbolCache> {
    let args::CacheArgs {
        kallsyms,
        procfs,
        pid_cache_size,
        elf_cache_size,
        keep_rounds,
        demangle,
    } = args;

    let options = CacheOptions {
        pid_cache: GCacheOptions::new(pid_cache_size, keep_rounds),
        build_id_cache: GCacheOptions::new(elf_cache_size, keep_rounds),
        same_file_cache: GCacheOptions::new(elf_cache_size, keep_rounds),
    };

    SymbolCache::builder()
        .set_cache_options(options)
        .set_kallsyms_path(kallsyms)
        .set_procfs_path(procfs)
        .enable_demangling(demangle)
        .build()
        .context("failed to create symbol cache")
}

/// The handler for the 'resolve' command.
fn resolve(cache: &SymbolCache, resolve: args::Resolve) {
    let args::Resolve { pid, addrs } = resolve;

    let () = cache.advance_round();
    for addr in addrs {
        let sym = cache.resolve(pid, addr);
        if sym.is_unknown() {
            println!("{addr:#016x}: <unknown>")
        } else {
            println!("{addr:#016x}: {sym}")
        }
    }
}

fn print_cache<K, T>(name: &str, info: &CacheDebugInfo<K, T>)
where
    K: Display,
    T: Debug,
{
    let CacheDebugInfo {
        options,
        round,
        entries,
    } = info;
    println!(
        "{name}: {} entries (size {}, keep rounds {}), round {round}",
        entries.len(),
        options.size,
        options.keep_rounds
    );
    for entry in entries {
        println!("  {} (round {}): {:?}", entry.key, entry.round, entry.value);
    }
}

/// The handler for the 'snapshot' command.
fn snapshot(cache: &SymbolCache, resolve: args::Resolve) {
    let () = self::resolve(cache, resolve);
    let snapshot = cache.debug_snapshot();

    println!();
    let () = print_cache("processes", &snapshot.pid_cache);
    let () = print_cache("binaries by build ID", &snapshot.build_id_cache);
    let () = print_cache("binaries by file", &snapshot.same_file_cache);
}


fn main() -> Result<()> {
    let args = args::Args::parse();
    let level = match args.verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_span_events(FmtSpan::FULL)
        .with_timer(SystemTime)
        .with_writer(stderr)
        .finish();

    let () =
        set_global_subscriber(subscriber).with_context(|| "failed to set tracing subscriber")?;

    let cache = create_cache(args.cache)?;
    match args.command {
        args::Command::Resolve(resolve) => self::resolve(&cache, resolve),
        args::Command::Snapshot(resolve) => self::snapshot(&cache, resolve),
    }
    Ok(())
}
