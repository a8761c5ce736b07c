use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;

use procsym::Addr;

use clap::ArgAction;
use clap::Args as Arguments;
use clap::Parser;
use clap::Subcommand;


/// Parse a PID from a string.
fn parse_pid(s: &str) -> Result<u32> {
    let pid = if let Some(s) = s.strip_prefix("0x") {
        u32::from_str_radix(s, 16)
    } else {
        s.parse::<u32>()
    }
    .with_context(|| format!("failed to parse PID: {s}"))?;

    Ok(pid)
}

/// Parse an address from a string.
fn parse_addr(s: &str) -> Result<Addr> {
    // In our world addresses are always represented in hex, with or without 0x
    // prefix.
    Addr::from_str_radix(s.trim_start_matches("0x"), 16)
        .with_context(|| format!("failed to parse address: {s}"))
}


/// A command line interface for procsym.
#[derive(Debug, Parser)]
#[clap(version = env!("VERSION"))]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
    #[command(flatten)]
    pub cache: CacheArgs,
    /// Increase verbosity (can be supplied multiple times).
    #[arg(short = 'v', long = "verbose", global = true, action = ArgAction::Count)]
    pub verbosity: u8,
}


/// Options configuring the symbol cache.
#[derive(Debug, Arguments)]
pub struct CacheArgs {
    /// The path to the kernel's symbol listing.
    #[clap(long, global = true, default_value = "/proc/kallsyms")]
    pub kallsyms: PathBuf,
    /// The mount point of the proc file system.
    #[clap(long, global = true, default_value = "/proc")]
    pub procfs: PathBuf,
    /// The maximum number of processes to cache state for.
    #[clap(long, global = true, default_value_t = 256)]
    pub pid_cache_size: usize,
    /// The maximum number of binaries to cache symbol tables for, per
    /// lookup key (build ID and file identity).
    #[clap(long, global = true, default_value_t = 128)]
    pub elf_cache_size: usize,
    /// The number of rounds unused cache entries are kept around.
    #[clap(long, global = true, default_value_t = 3)]
    pub keep_rounds: u32,
    /// Demangle Rust and C++ symbol names.
    #[clap(long, global = true)]
    pub demangle: bool,
}


#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve one or more addresses.
    Resolve(Resolve),
    /// Resolve one or more addresses and print the state of all caches
    /// afterwards.
    Snapshot(Resolve),
}


#[derive(Debug, Arguments)]
pub struct Resolve {
    /// The PID of the process the provided addresses belong to; 0 for
    /// the kernel.
    #[arg(value_parser = parse_pid)]
    pub pid: u32,
    /// The addresses to resolve.
    #[arg(value_parser = parse_addr)]
    pub addrs: Vec<Addr>,
}
