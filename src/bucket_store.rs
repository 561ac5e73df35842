//! Buckets: numbered directories under `buckets/`, each able to hold one
//! block's payload, threaded onto two on-disk queues.
//!
//! A bucket holding data sits on the used queue (an LRU: hot at the head)
//! and carries a `data` file plus a `parent` symlink back to the map entry
//! that owns it. A drained bucket sits on the free queue with neither, ready
//! to be handed out again. Bucket numbers are never re-used; the directories
//! themselves are.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use tracing::*;

use crate::counters;
use crate::error::{CacheError, Result};
use crate::file_util;
use crate::fsll::{self, Fsll};

pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024;

const SIZE_MARKER: &str = "bucket_size";
const NEXT_BUCKET: &str = "next_bucket_number";

/// A bucket's number. Identity for accounting; the directory path is derived
/// from it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BucketId(pub u64);

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The payload file inside a bucket directory.
pub fn data_path(bucket: &Path) -> PathBuf {
    bucket.join("data")
}

#[derive(Debug)]
pub struct BucketStore {
    dir: PathBuf,
    used: Fsll,
    free: Fsll,
    block_size: u64,
    max_bytes: Option<u64>,
    used_bytes: u64,
    next_bucket_number: u64,
    /// Buckets still counted at a whole block by the startup estimate.
    unchecked: FxHashSet<BucketId>,
}

impl BucketStore {
    /// Opens the `buckets/` half of a cache directory, creating it if this
    /// is a brand-new cache.
    ///
    /// The block size is pinned by the `bucket_size` marker the first time a
    /// cache is opened; a later `requested` size that disagrees with the
    /// marker is refused. `None` defers to the marker (or the 128 KiB
    /// default for a new cache).
    ///
    /// Counting every existing bucket at a full block gives an instant,
    /// pessimistic used-bytes figure; callers are expected to walk
    /// [`correct_one_estimate`](Self::correct_one_estimate) down to zero in
    /// the background to refine it.
    pub fn open(cache_dir: &Path, requested: Option<u64>, max_bytes: Option<u64>) -> Result<BucketStore> {
        let dir = cache_dir.join("buckets");
        fs::create_dir_all(&dir)?;

        let block_size = match (file_util::read_number_file(&dir.join(SIZE_MARKER))?, requested) {
            (Some(persisted), Some(requested)) if persisted != requested => {
                return Err(CacheError::BlockSizeMismatch { persisted, requested });
            }
            (Some(persisted), _) => persisted,
            (None, requested) => {
                let block_size = requested.unwrap_or(DEFAULT_BLOCK_SIZE);
                file_util::write_number_file(&dir.join(SIZE_MARKER), block_size)?;
                block_size
            }
        };

        let next_bucket_number =
            file_util::read_number_file(&dir.join(NEXT_BUCKET))?.unwrap_or(0);

        info!("taking inventory of cache directory");
        let mut unchecked = FxHashSet::default();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(number) = name.parse::<u64>() else {
                continue;
            };
            unchecked.insert(BucketId(number));
        }
        let used_bytes = unchecked.len() as u64 * block_size;
        info!(
            "{} buckets in cache, estimated {used_bytes} bytes used",
            unchecked.len()
        );

        Ok(BucketStore {
            used: Fsll::new(&dir, "head", "tail"),
            free: Fsll::new(&dir, "free_head", "free_tail"),
            dir,
            block_size,
            max_bytes,
            used_bytes,
            next_bucket_number,
            unchecked,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn used_queue(&self) -> &Fsll {
        &self.used
    }

    pub fn free_queue(&self) -> &Fsll {
        &self.free
    }

    pub fn used_tail(&self) -> Result<Option<PathBuf>> {
        self.used.tail()
    }

    pub fn bucket_path(&self, id: BucketId) -> PathBuf {
        self.dir.join(id.0.to_string())
    }

    /// Every numbered bucket directory, in no particular order.
    pub fn bucket_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.parse::<u64>().is_ok() {
                buckets.push(entry.path());
            }
        }
        Ok(buckets)
    }

    /// Hands out a bucket for a new block and makes it the used-queue head:
    /// the head of the free queue if one is waiting, otherwise a freshly
    /// numbered directory.
    pub fn acquire(&mut self) -> Result<PathBuf> {
        if let Some(bucket) = self.free.head()? {
            debug!("re-using free bucket {}", bucket.display());
            self.free.disconnect(&bucket)?;
            self.used.insert_as_head(&bucket)?;
            counters::bump(counters::Op::BucketReused);
            return Ok(bucket);
        }

        let number = self.next_bucket_number;
        self.next_bucket_number += 1;
        file_util::write_number_file(&self.dir.join(NEXT_BUCKET), self.next_bucket_number)?;
        let bucket = fsll::make_entry(&self.dir, number)?;
        self.used.insert_as_head(&bucket)?;
        debug!("made new bucket {number}");
        counters::bump(counters::Op::BucketCreated);
        Ok(bucket)
    }

    /// Moves a used bucket up to the hot end of the LRU.
    pub fn promote(&self, bucket: &Path) -> Result<()> {
        self.used.to_head(bucket)
    }

    /// The queue half of freeing a bucket: detach it from the used queue,
    /// park it at the free tail, and drop its payload. Returns the payload
    /// size.
    ///
    /// `expect_tail` is set on the eviction path, where freeing anything but
    /// the LRU tail means the queues are scrambled.
    pub fn retire(&mut self, bucket: &Path, expect_tail: bool) -> Result<u64> {
        if expect_tail {
            if let Some(next) = fsll::getlink(bucket, "next")? {
                return Err(CacheError::corrupt(format!(
                    "bucket {} freed under pressure was not the queue tail ({} follows it)",
                    bucket.display(),
                    next.display()
                )));
            }
        }

        self.used.disconnect(bucket)?;
        self.free.insert_as_tail(bucket)?;

        let data = data_path(bucket);
        let freed = match fs::symlink_metadata(&data) {
            Ok(meta) => {
                fs::remove_file(&data)?;
                meta.len()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let id = BucketId(fsll::node_number(bucket)?);
        if freed > 0 && !self.unchecked.contains(&id) {
            self.used_bytes = self.used_bytes.saturating_sub(freed);
        }
        debug!("freed {freed} bytes from bucket {id}");
        Ok(freed)
    }

    /// Accounts for a block that was just written into `bucket`.
    ///
    /// Skipped while the bucket is still carried at a whole block by the
    /// startup estimate; the correction pass will land on the real size.
    pub fn commit_size(&mut self, bucket: &Path, len: u64) -> Result<()> {
        let id = BucketId(fsll::node_number(bucket)?);
        if !self.unchecked.contains(&id) {
            self.used_bytes += len;
        }
        debug!("used space now {} bytes", self.used_bytes);
        Ok(())
    }

    /// One step of the startup size correction: stat one estimated bucket's
    /// payload and replace its whole-block guess with the real size.
    /// `Ok(false)` once nothing is left to correct.
    pub fn correct_one_estimate(&mut self) -> Result<bool> {
        let Some(id) = self.unchecked.iter().next().copied() else {
            return Ok(false);
        };
        self.unchecked.remove(&id);

        let data = data_path(&self.bucket_path(id));
        let actual = match fs::symlink_metadata(&data) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        trace!("bucket {id}: {actual} bytes");
        self.used_bytes = self
            .used_bytes
            .saturating_sub(self.block_size.saturating_sub(actual));
        Ok(true)
    }

    /// How many bytes eviction must reclaim before `len` more can be
    /// written, honoring both the configured cap and the device's live free
    /// space, whichever is tighter.
    pub fn shortfall(&self, len: u64) -> Result<u64> {
        let device_free = file_util::device_free_bytes(&self.dir)?;
        if device_free < len {
            return Ok(len - device_free);
        }
        match self.max_bytes {
            None => Ok(0),
            Some(cap) if self.used_bytes + len <= cap => Ok(0),
            Some(cap) => Ok(self.used_bytes + len - cap),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    #[test]
    fn new_cache_pins_block_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BucketStore::open(dir.path(), Some(8), Some(32))?;
        assert_eq!(store.block_size(), 8);
        drop(store);

        // Reopening without a size reads the marker back.
        let store = BucketStore::open(dir.path(), None, Some(32))?;
        assert_eq!(store.block_size(), 8);

        // A contradictory size is refused.
        match BucketStore::open(dir.path(), Some(16), Some(32)) {
            Err(CacheError::BlockSizeMismatch {
                persisted: 8,
                requested: 16,
            }) => {}
            other => panic!("expected a block size mismatch, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn acquire_numbers_then_recycles() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = BucketStore::open(dir.path(), Some(8), None)?;

        let first = store.acquire()?;
        let second = store.acquire()?;
        assert_eq!(fsll::node_number(&first)?, 0);
        assert_eq!(fsll::node_number(&second)?, 1);
        assert_eq!(store.used_queue().nodes()?, vec![second.clone(), first.clone()]);

        // Retiring the tail parks it on the free queue; the next acquire
        // hands the same directory back instead of minting bucket 2.
        fs::write(data_path(&first), b"payload!")?;
        assert_eq!(store.retire(&first, true)?, 8);
        assert_eq!(store.free_queue().nodes()?, vec![first.clone()]);

        let recycled = store.acquire()?;
        assert_eq!(recycled, first);
        assert!(store.free_queue().is_empty()?);
        assert_eq!(store.used_queue().nodes()?, vec![recycled, second]);
        Ok(())
    }

    #[test]
    fn retire_checks_the_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = BucketStore::open(dir.path(), Some(8), None)?;
        let a = store.acquire()?;
        let b = store.acquire()?;
        // `a` is the tail here; `b` the head.
        assert!(store.retire(&b, true).is_err());
        assert_eq!(store.retire(&a, true)?, 0);
        Ok(())
    }

    #[test]
    fn size_accounting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = BucketStore::open(dir.path(), Some(8), Some(32))?;

        let a = store.acquire()?;
        fs::write(data_path(&a), b"ABCDEFGH")?;
        store.commit_size(&a, 8)?;
        assert_eq!(store.used_bytes(), 8);

        // Under the cap: no shortfall. One byte over: evict exactly that.
        assert_eq!(store.shortfall(24)?, 0);
        assert_eq!(store.shortfall(25)?, 1);

        assert_eq!(store.retire(&a, true)?, 8);
        assert_eq!(store.used_bytes(), 0);
        Ok(())
    }

    #[test]
    fn startup_estimate_corrects_down() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut store = BucketStore::open(dir.path(), Some(8), None)?;
            let a = store.acquire()?;
            fs::write(data_path(&a), b"ABCD")?;
            store.commit_size(&a, 4)?;
            let b = store.acquire()?;
            fs::write(data_path(&b), b"ABCDEFGH")?;
            store.commit_size(&b, 8)?;
        }

        // A fresh open guesses two whole blocks, then walks down to the
        // real 12 bytes.
        let mut store = BucketStore::open(dir.path(), None, None)?;
        assert_eq!(store.used_bytes(), 16);
        while store.correct_one_estimate()? {}
        assert_eq!(store.used_bytes(), 12);
        Ok(())
    }

    #[test]
    fn additions_during_estimate_count_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut store = BucketStore::open(dir.path(), Some(8), None)?;
            let a = store.acquire()?;
            fs::write(data_path(&a), b"ABCDEFGH")?;
            store.commit_size(&a, 8)?;
        }

        let mut store = BucketStore::open(dir.path(), None, None)?;
        assert_eq!(store.used_bytes(), 8);

        // A brand-new bucket isn't part of the estimate and counts exactly;
        // the old one still corrects to its real (full) size.
        let b = store.acquire()?;
        fs::write(data_path(&b), b"ABCD")?;
        store.commit_size(&b, 4)?;
        assert_eq!(store.used_bytes(), 12);
        while store.correct_one_estimate()? {}
        assert_eq!(store.used_bytes(), 12);
        Ok(())
    }
}
