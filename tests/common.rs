#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use backfs::cache::Cache;
use backfs::error::CacheError;

/// A small cache: 8-byte blocks, room for four of them.
pub const BLOCK_SIZE: u64 = 8;
pub const CACHE_SIZE: u64 = 32;

pub fn small_cache() -> Result<(tempfile::TempDir, Arc<Cache>)> {
    let dir = tempfile::tempdir()?;
    let cache = Cache::open(dir.path(), Some(CACHE_SIZE), Some(BLOCK_SIZE))?;
    Ok((dir, cache))
}

/// Fetches a whole block, panicking unless it hits.
pub fn fetch_block(cache: &Cache, path: &str, block: u64, mtime: i64) -> Vec<u8> {
    let mut buf = vec![0; BLOCK_SIZE as usize];
    let n = cache
        .fetch(Path::new(path), block, 0, &mut buf, mtime)
        .expect("fetch should hit");
    buf.truncate(n);
    buf
}

/// Fetches a block, expecting a miss.
pub fn expect_miss(cache: &Cache, path: &str, block: u64, mtime: i64) {
    let mut buf = vec![0; BLOCK_SIZE as usize];
    match cache.fetch(Path::new(path), block, 0, &mut buf, mtime) {
        Err(CacheError::NotCached) => {}
        other => panic!("expected a miss for block {block} of {path}, got {other:?}"),
    }
}

/// The queue and back-reference invariants should hold after every
/// operation; complain loudly if they don't.
pub fn assert_consistent(cache: &Cache) {
    let problems = cache.self_check().expect("self check should run");
    assert!(problems.is_empty(), "cache inconsistent: {problems:#?}");
}

/// Every block symlink anywhere under the cache's map tree.
pub fn map_links(cache_dir: &Path) -> Vec<std::path::PathBuf> {
    walkdir::WalkDir::new(cache_dir.join("map"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path_is_symlink())
        .map(|e| e.into_path())
        .collect()
}
