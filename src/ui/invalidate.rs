use std::path::Path;

use anyhow::Result;
use camino::Utf8Path;
use clap::Parser;

/// Drop a file's cached blocks
#[derive(Debug, Parser)]
pub struct Args {
    /// Backing path (as seen through the mount), e.g. /music/a.flac
    path: String,
}

pub fn run(cache_dir: &Utf8Path, args: Args) -> Result<()> {
    let cache = super::open_cache(cache_dir)?;
    cache.invalidate_file(Path::new(&args.path))?;
    println!("invalidated {}", args.path);
    Ok(())
}
