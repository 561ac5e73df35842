//! Keeping the cache coherent on a writable mount.
//!
//! Writes go straight through to the backing store; the driver then calls in
//! here to reconcile whatever blocks the write touched. Blocks the write
//! covered whole are re-cached immediately (stamped with the current wall
//! clock, which is what the backing file's mtime becomes). Blocks it only
//! grazed are dropped, so the next read repopulates them from backing.

use std::path::Path;

use jiff::Timestamp;
use tracing::*;

use crate::cache::Cache;
use crate::error::{CacheError, Result};

/// How many transient out-of-space answers an add gets before we give up.
const ADD_RETRIES: u32 = 5;

/// Reconciles the cache after `data` was written to the backing file at
/// byte `offset`.
pub fn write(cache: &Cache, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let block_size = cache.block_size();
    let end = offset + data.len() as u64;
    let first = offset / block_size;
    let last = (end - 1) / block_size;
    let stamp = Timestamp::now().as_second();

    for block in first..=last {
        let block_start = block * block_size;
        let block_end = block_start + block_size;
        if offset <= block_start && end >= block_end {
            let slice = &data[(block_start - offset) as usize..(block_end - offset) as usize];
            add_with_retries(cache, path, block, slice, stamp)?;
        } else {
            debug!(
                "write only grazed block {block} of {}; dropping it",
                path.display()
            );
            cache.try_invalidate_block(path, block)?;
        }
    }
    Ok(())
}

fn add_with_retries(
    cache: &Cache,
    path: &Path,
    block: u64,
    data: &[u8],
    mtime: i64,
) -> Result<()> {
    let mut tries = 0;
    loop {
        match cache.add(path, block, data, mtime) {
            Err(CacheError::Retry) if tries < ADD_RETRIES => {
                tries += 1;
                debug!("caching block {block} wants a retry ({tries}/{ADD_RETRIES})");
            }
            other => return other,
        }
    }
}

/// Drops cached blocks made stale by truncating the backing file to
/// `new_size` bytes.
///
/// Blocks are cached whole or not at all, so the first stale index is the
/// block containing the cut (or starting at it, when the cut lands on a
/// boundary).
pub fn truncate(cache: &Cache, path: &Path, new_size: u64) -> Result<()> {
    cache.invalidate_blocks_above(path, new_size / cache.block_size())
}

/// Forgets a file unlinked from the backing store.
pub fn unlink(cache: &Cache, path: &Path) -> Result<()> {
    cache.try_invalidate_file(path)
}

/// Follows a backing-store rename. If this fails, the caller should undo
/// the backing rename, or the cache will keep serving the old name.
pub fn rename(cache: &Cache, old: &Path, new: &Path) -> Result<()> {
    cache.rename(old, new)
}
