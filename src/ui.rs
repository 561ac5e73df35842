//! CLI subcommands.

pub mod check;
pub mod init;
pub mod invalidate;
pub mod orphans;
pub mod usage;

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::cache::Cache;
use crate::config;

/// Opens an existing cache with config-file defaults for the cap.
fn open_cache(dir: &Utf8Path) -> Result<Arc<Cache>> {
    let conf = config::load()?;
    let max = match conf.cache_size.as_u64() {
        0 => None,
        n => Some(n),
    };
    Cache::open(dir.as_std_path(), max, None)
        .with_context(|| format!("Couldn't open cache at {dir}"))
}
