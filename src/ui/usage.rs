use std::path::Path;

use anyhow::Result;
use byte_unit::{Byte, UnitType};
use camino::Utf8Path;
use clap::Parser;

/// Show cache occupancy, optionally per path
#[derive(Debug, Parser)]
pub struct Args {
    /// Backing paths (as seen through the mount) to total up
    paths: Vec<String>,
}

pub fn run(cache_dir: &Utf8Path, args: Args) -> Result<()> {
    let cache = super::open_cache(cache_dir)?;
    // Wait out the startup estimate so the numbers are exact.
    cache.settle_used_bytes();

    let pretty = |n: u64| {
        Byte::from_u64(n)
            .get_appropriate_unit(UnitType::Binary)
            .to_string()
    };
    match cache.max_bytes() {
        Some(max) => println!("{} used of {}", pretty(cache.used_bytes()), pretty(max)),
        None => println!("{} used (whole device)", pretty(cache.used_bytes())),
    }

    for path in &args.paths {
        let bytes = cache.cached_bytes(Path::new(path))?;
        println!("{:>12} {path}", pretty(bytes));
    }
    Ok(())
}
