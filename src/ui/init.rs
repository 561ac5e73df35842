use anyhow::Result;
use byte_unit::{Byte, UnitType};
use camino::Utf8Path;
use clap::Parser;

use crate::cache::Cache;
use crate::config;

/// Create a cache directory (or re-open one to sanity-check it)
#[derive(Debug, Parser)]
pub struct Args {
    /// Maximum cache size (e.g. 4GiB); 0 means the whole device
    #[clap(short, long)]
    size: Option<Byte>,

    /// Block size (e.g. 128KiB); must match an existing cache
    #[clap(short, long)]
    block_size: Option<Byte>,
}

pub fn run(cache_dir: &Utf8Path, args: Args) -> Result<()> {
    let conf = config::load()?;
    let size = args.size.unwrap_or(conf.cache_size).as_u64();
    let block_size = args.block_size.unwrap_or(conf.block_size).as_u64();

    let cache = Cache::open(
        cache_dir.as_std_path(),
        (size != 0).then_some(size),
        (block_size != 0).then_some(block_size),
    )?;

    let pretty = |n: u64| Byte::from_u64(n).get_appropriate_unit(UnitType::Binary);
    match cache.max_bytes() {
        Some(max) => println!(
            "cache at {cache_dir}: {} blocks, capped at {:.2}",
            pretty(cache.block_size()),
            pretty(max)
        ),
        None => println!(
            "cache at {cache_dir}: {} blocks, bounded by the device",
            pretty(cache.block_size())
        ),
    }
    Ok(())
}
