use anyhow::Result;
use camino::Utf8Path;

pub fn run(cache_dir: &Utf8Path) -> Result<()> {
    let cache = super::open_cache(cache_dir)?;
    cache.free_orphan_buckets()?;
    Ok(())
}
