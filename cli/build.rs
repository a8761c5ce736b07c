use std::env;

use anyhow::Context as _;
use anyhow::Result;

use grev::git_revision_auto;


/// Embed the package version, along with the git revision it was built
/// from, if available, as `VERSION`.
fn main() -> Result<()> {
    let dir = env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR is not set")?;
    let version = env!("CARGO_PKG_VERSION");
    let version = match git_revision_auto(dir)? {
        Some(rev) => format!("{version} ({rev})"),
        None => version.to_string(),
    };
    println!("cargo:rustc-env=VERSION={version}");
    Ok(())
}
