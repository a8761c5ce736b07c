#![allow(clippy::let_unit_value)]

use std::fs::File;
use std::io::stdout;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;

use clap::CommandFactory as _;
use clap::Parser;

use clap_complete::generate;
use clap_complete::Shell;


#[allow(unused)]
mod prog {
    include!("../src/args.rs");
}


/// Generate a shell completion script for `procsym`.
#[derive(Debug, Parser)]
struct Args {
    /// The shell to generate the completion script for.
    shell: Shell,
    /// The file to write the script to, instead of stdout.
    #[clap(short, long)]
    output: Option<PathBuf>,
}


fn main() -> Result<()> {
    let args = Args::parse();
    let mut command = prog::Args::command();
    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(stdout()),
    };
    let () = generate(args.shell, &mut command, "procsym", &mut writer);
    Ok(())
}
