//! The cache engine: the public operations, the global lock, and the
//! freshness rules that tie the block map, the bucket store, and the LRU
//! queues together.
//!
//! Everything lives under one cache directory:
//!
//! ```text
//! <cache>/buckets/bucket_size         one line: the block size, pinned at creation
//! <cache>/buckets/next_bucket_number  one line: next id to allocate
//! <cache>/buckets/head      -> <cache>/buckets/<N>   (absent iff used queue empty)
//! <cache>/buckets/tail      -> <cache>/buckets/<N>
//! <cache>/buckets/free_head -> <cache>/buckets/<N>
//! <cache>/buckets/free_tail -> <cache>/buckets/<N>
//! <cache>/buckets/<N>/data            the payload (used buckets only)
//! <cache>/buckets/<N>/parent -> <cache>/map<P>/<B>   (used buckets only)
//! <cache>/buckets/<N>/prev   -> <cache>/buckets/<M>  (absent at the head)
//! <cache>/buckets/<N>/next   -> <cache>/buckets/<M>  (absent at the tail)
//! <cache>/map<P>/<B>         -> <cache>/buckets/<N>
//! <cache>/map<P>/mtime                one line: backing mtime in seconds
//! ```
//!
//! Every public operation takes one process-wide mutex for its whole
//! duration, blocking I/O included. That is deliberate: with no operation
//! interruptible mid-queue-splice, the symlink structures only ever need to
//! be consistent *between* operations, and a single lock is easy to reason
//! about. The cache assumes it owns its directory exclusively.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use rustc_hash::FxHashSet;
use rustix::io::Errno;
use tracing::*;

use crate::block_map::BlockMap;
use crate::bucket_store::{self, BucketStore};
use crate::counters;
use crate::error::{CacheError, Result};
use crate::file_util;
use crate::fsll;

#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
    block_size: u64,
    max_bytes: Option<u64>,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    map: BlockMap,
    store: BucketStore,
}

impl Cache {
    /// Opens the cache at `root`, creating the skeleton if it isn't one yet.
    ///
    /// `max_bytes` of `None` means the device's free space is the only
    /// limit. `block_size` of `None` takes whatever the cache was created
    /// with (or 128 KiB for a new one); a `Some` that contradicts the
    /// persisted marker is refused.
    ///
    /// The map tree and symlink queues are the index; nothing is rebuilt
    /// here. Used space starts as a pessimistic whole-block-per-bucket
    /// estimate that a background thread walks down to the true figure,
    /// taking the cache lock around each bucket it stats.
    pub fn open(
        root: &Path,
        max_bytes: Option<u64>,
        block_size: Option<u64>,
    ) -> Result<Arc<Cache>> {
        fs::create_dir_all(root)?;
        // Queue links are absolute paths, so resolve the root once up front.
        let root = fs::canonicalize(root)?;

        let store = BucketStore::open(&root, block_size, max_bytes)?;
        let map = BlockMap::open(&root)?;
        let block_size = store.block_size();

        let cache = Arc::new(Cache {
            root,
            block_size,
            max_bytes,
            inner: Mutex::new(Inner { map, store }),
        });

        let corrector = Arc::clone(&cache);
        thread::spawn(move || corrector.settle_used_bytes());

        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().store.used_bytes()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drains the startup size estimate, one bucket per lock acquisition so
    /// readers and writers interleave.
    ///
    /// `open` runs this on a background thread; tools that want exact
    /// numbers right now can call it again themselves. It is idempotent.
    pub fn settle_used_bytes(&self) {
        loop {
            match self.lock().store.correct_one_estimate() {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    error!("walking the used-size estimate failed: {e}");
                    return;
                }
            }
        }
    }

    /// Reads up to `buf.len()` bytes of `(path, block)` starting at
    /// `offset` within the block, returning how many bytes were read. Reads
    /// cannot cross a block boundary.
    ///
    /// `mtime` is the backing file's current modification time in seconds.
    /// A cached file stamped with anything else is dropped whole and the
    /// fetch reports [`CacheError::NotCached`], so no reader ever sees a
    /// mix of old and new blocks from one file.
    pub fn fetch(
        &self,
        path: &Path,
        block: u64,
        offset: u64,
        buf: &mut [u8],
        mtime: i64,
    ) -> Result<usize> {
        let len = buf.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.block_size) {
            return Err(CacheError::BadRange);
        }
        if len == 0 {
            return Ok(0);
        }

        debug!("getting block {block} of {}", path.display());
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(bucket) = inner.map.get(path, block)? else {
            debug!("block not in cache");
            counters::bump(counters::Op::CacheMiss);
            return Err(CacheError::NotCached);
        };

        // Hot again. A scrambled queue shouldn't cost the reader the block,
        // so a failed promotion is logged and the fetch goes on.
        if let Err(e) = inner.store.promote(&bucket) {
            warn!("couldn't promote bucket {}: {e}", bucket.display());
        }

        let stamped = inner.map.read_mtime(path)?;
        if stamped != Some(mtime) {
            match stamped {
                Some(stamped) => info!(
                    "cached copy of {} is stamped {stamped} but the backing file says {mtime}; invalidating",
                    path.display()
                ),
                None => info!("{} has no mtime record; invalidating", path.display()),
            }
            counters::bump(counters::Op::StaleFileDropped);
            inner.invalidate_file(path, true)?;
            return Err(CacheError::NotCached);
        }

        let data = bucket_store::data_path(&bucket);
        let file = match File::open(&data) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Crash leftovers: a mapped bucket with no payload. Drop the
                // mapping; the driver will repopulate from backing.
                warn!(
                    "bucket {} has no data; invalidating block {block} of {}",
                    bucket.display(),
                    path.display()
                );
                inner.invalidate_block(path, block, false)?;
                counters::bump(counters::Op::CacheMiss);
                return Err(CacheError::NotCached);
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len();
        if offset >= size {
            debug!("read offset {offset} is at or past the stored {size} bytes");
            return Ok(0);
        }

        let nread = file.read_at(buf, offset)?;
        if (nread as u64) < len {
            debug!("short read from cache: {nread} of {len} bytes");
        }
        counters::bump(counters::Op::CacheHit);
        Ok(nread)
    }

    /// Inserts one whole block of `path`. All later reads assume the block
    /// is complete, so only the final block of a file may be short.
    ///
    /// `len == 0` is a no-op; data longer than the block size is refused.
    /// Re-adding a block that's already cached is a quiet success, which is
    /// what coalesces two threads racing to fill the same miss.
    pub fn add(&self, path: &Path, block: u64, buf: &[u8], mtime: i64) -> Result<()> {
        if buf.len() as u64 > self.block_size {
            return Err(CacheError::Oversized);
        }
        if buf.is_empty() {
            return Ok(());
        }

        debug!(
            "writing {} bytes to block {block} of {}",
            buf.len(),
            path.display()
        );
        let mut guard = self.lock();
        let inner = &mut *guard;

        if let Some(bucket) = inner.map.get(path, block)? {
            if fsll::exists(&bucket_store::data_path(&bucket)) {
                debug!("block {block} of {} is already cached", path.display());
                return Ok(());
            }
            // A mapping with no payload is a crash leftover. Clear it out
            // and start over with a fresh bucket.
            warn!(
                "replacing dataless bucket {} mapped for block {block} of {}",
                bucket.display(),
                path.display()
            );
            inner.free_bucket(&bucket, false)?;
            inner.map.unlink_entry(&inner.map.block_link(path, block))?;
        }

        if let Err(e) = inner.map.ensure_file_dir(path) {
            if let CacheError::Io(io_err) = &e {
                if file_util::is_enospc(io_err) {
                    debug!("mkdir says the disk is full; evicting one bucket");
                    if let Err(evict_err) = inner.evict_tail() {
                        error!("eviction while out of space failed: {evict_err}");
                    }
                    return Err(CacheError::Retry);
                }
            }
            return Err(e);
        }

        inner.make_space_available(buf.len() as u64)?;

        let bucket = inner.store.acquire()?;
        debug!("bucket path: {}", bucket.display());
        let link = inner.map.block_link(path, block);
        inner.map.set(path, block, &bucket)?;
        fsll::makelink(&bucket, "parent", Some(&link))?;
        inner.map.write_mtime(path, mtime)?;

        inner.write_data(&bucket, buf)?;
        inner.store.commit_size(&bucket, buf.len() as u64)?;
        counters::bump(counters::Op::BlockWrite);
        Ok(())
    }

    /// Drops one cached block. [`CacheError::NotCached`] (with a warning)
    /// if it wasn't there.
    pub fn invalidate_block(&self, path: &Path, block: u64) -> Result<()> {
        self.lock().invalidate_block(path, block, true)
    }

    /// Drops one cached block; absence is fine.
    pub fn try_invalidate_block(&self, path: &Path, block: u64) -> Result<()> {
        match self.lock().invalidate_block(path, block, false) {
            Err(CacheError::NotCached) => Ok(()),
            other => other,
        }
    }

    /// Drops every cached block of `path` and its mtime record.
    pub fn invalidate_file(&self, path: &Path) -> Result<()> {
        self.lock().invalidate_file(path, true)
    }

    /// Drops every cached block of `path`; absence is fine.
    pub fn try_invalidate_file(&self, path: &Path) -> Result<()> {
        match self.lock().invalidate_file(path, false) {
            Err(CacheError::NotCached) => Ok(()),
            other => other,
        }
    }

    /// Drops every cached block of `path` with index `start` or higher.
    /// Used after a truncation, when everything past the cut is stale.
    pub fn invalidate_blocks_above(&self, path: &Path, start: u64) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        debug!(
            "invalidating blocks >= {start} of {}",
            path.display()
        );
        let Some(blocks) = inner.map.blocks(path)? else {
            return Ok(());
        };
        for (block, _link) in blocks {
            if block >= start {
                inner.invalidate_block(path, block, false)?;
            }
        }
        Ok(())
    }

    /// Moves `old`'s cached blocks (a file or a whole directory tree) to
    /// `new`, repointing every affected bucket's back-reference. Renaming
    /// something that isn't cached is a quiet success.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<()> {
        debug!("renaming {} to {}", old.display(), new.display());
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(renamed) = inner.map.rename(old, new)? else {
            return Ok(());
        };
        inner.repoint_parents(&renamed)
    }

    /// Total cached payload bytes under `path`, file or directory.
    pub fn cached_bytes(&self, path: &Path) -> Result<u64> {
        self.lock().map.cached_bytes(path)
    }

    /// Sweeps the bucket directories for orphans: buckets holding data whose
    /// `parent` link is missing or dangling. Crash debris; freeing them is
    /// always safe because nothing maps to them.
    pub fn free_orphan_buckets(&self) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        for bucket in inner.store.bucket_dirs()? {
            let parent = fsll::getlink(&bucket, "parent")?;
            if !fsll::exists(&bucket_store::data_path(&bucket)) {
                continue;
            }
            let orphaned = match &parent {
                None => true,
                Some(parent) => !fsll::exists(parent),
            };
            if orphaned {
                debug!("bucket {} is an orphan", bucket.display());
                if let Some(parent) = &parent {
                    debug!("  parent was {}", parent.display());
                }
                inner.free_bucket(&bucket, false)?;
                counters::bump(counters::Op::OrphanFreed);
            }
        }
        Ok(())
    }

    /// Audits the on-disk structures without changing anything, returning a
    /// description of each problem found: scrambled or looped queues,
    /// buckets on no queue (or both), used buckets missing their payload or
    /// back-reference, free buckets still carrying either, files with
    /// unreadable mtime records.
    pub fn self_check(&self) -> Result<Vec<String>> {
        let guard = self.lock();
        let mut problems = Vec::new();

        let used = walk_queue(guard.store.used_queue(), "used", &mut problems);
        let free = walk_queue(guard.store.free_queue(), "free", &mut problems);

        let used_set: FxHashSet<&PathBuf> = used.iter().collect();
        let free_set: FxHashSet<&PathBuf> = free.iter().collect();
        for bucket in used_set.intersection(&free_set) {
            problems.push(format!("bucket {} is on both queues", bucket.display()));
        }
        for bucket in guard.store.bucket_dirs()? {
            if !used_set.contains(&bucket) && !free_set.contains(&bucket) {
                problems.push(format!("bucket {} is on neither queue", bucket.display()));
            }
        }

        for bucket in &used {
            check_used_bucket(bucket, &mut problems);
        }
        for bucket in &free {
            if fsll::exists(&bucket_store::data_path(bucket)) {
                problems.push(format!(
                    "free bucket {} still has data",
                    bucket.display()
                ));
            }
            if fsll::getlink(bucket, "parent").ok().flatten().is_some() {
                problems.push(format!(
                    "free bucket {} still has a parent link",
                    bucket.display()
                ));
            }
        }

        for problem in &problems {
            error!("{problem}");
        }
        Ok(problems)
    }
}

/// Walks one queue front to back, reporting structural problems instead of
/// bailing on the first.
fn walk_queue(queue: &fsll::Fsll, name: &str, problems: &mut Vec<String>) -> Vec<PathBuf> {
    let mut nodes = Vec::new();
    let mut seen = FxHashSet::default();
    let head = queue.head().ok().flatten();
    let tail = queue.tail().ok().flatten();

    if head.is_some() != tail.is_some() {
        problems.push(format!("the {name} queue has one anchor but not the other"));
        return nodes;
    }

    let mut prev: Option<PathBuf> = None;
    let mut cursor = head;
    while let Some(node) = cursor {
        if !seen.insert(node.clone()) {
            problems.push(format!(
                "the {name} queue loops back to {}",
                node.display()
            ));
            return nodes;
        }
        let back = fsll::getlink(&node, "prev").ok().flatten();
        if back != prev {
            problems.push(format!(
                "{} disagrees with its predecessor on the {name} queue",
                node.display()
            ));
        }
        cursor = fsll::getlink(&node, "next").ok().flatten();
        prev = Some(node.clone());
        nodes.push(node);
    }
    if prev != tail {
        problems.push(format!(
            "the {name} queue's chain does not end at its tail anchor"
        ));
    }
    nodes
}

fn check_used_bucket(bucket: &Path, problems: &mut Vec<String>) {
    if !fsll::exists(&bucket_store::data_path(bucket)) {
        problems.push(format!("used bucket {} has no data", bucket.display()));
    }
    match fsll::getlink(bucket, "parent").ok().flatten() {
        None => problems.push(format!("used bucket {} has no parent link", bucket.display())),
        Some(parent) => match fs::read_link(&parent) {
            Ok(target) if target == bucket => {
                // The map entry round-trips; its sibling mtime must parse.
                let mtime = parent.parent().map(|dir| dir.join("mtime"));
                let stamp = mtime
                    .as_deref()
                    .and_then(|m| file_util::read_number_file::<i64>(m).ok().flatten());
                if stamp.is_none() {
                    problems.push(format!(
                        "no readable mtime record beside map entry {}",
                        parent.display()
                    ));
                }
            }
            Ok(target) => problems.push(format!(
                "map entry {} points at {}, not back at {}",
                parent.display(),
                target.display(),
                bucket.display()
            )),
            Err(_) => problems.push(format!(
                "used bucket {} has a dangling parent link to {}",
                bucket.display(),
                parent.display()
            )),
        },
    }
}

impl Inner {
    /// Frees one bucket: unmaps it, parks it on the free queue, drops its
    /// payload. `expect_tail` is set on the eviction path.
    fn free_bucket(&mut self, bucket: &Path, expect_tail: bool) -> Result<u64> {
        if let Some(parent) = fsll::getlink(bucket, "parent")? {
            self.map.unlink_entry(&parent)?;
        }
        fsll::makelink(bucket, "parent", None)?;
        self.store.retire(bucket, expect_tail)
    }

    /// Evicts the least recently used bucket, returning the bytes
    /// reclaimed.
    fn evict_tail(&mut self) -> Result<u64> {
        let Some(tail) = self.store.used_tail()? else {
            error!("can't free anything; the used queue is empty");
            return Err(CacheError::corrupt(
                "space is needed but the used queue is empty",
            ));
        };
        let freed = self.free_bucket(&tail, true)?;
        debug!("evicted bucket {}, freeing {freed} bytes", tail.display());
        counters::bump(counters::Op::Eviction);
        Ok(freed)
    }

    /// Evicts tail buckets until `len` more bytes fit under both the
    /// configured cap and the device's free space.
    fn make_space_available(&mut self, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let needed = self.store.shortfall(len)?;
        if needed == 0 {
            return Ok(());
        }
        debug!("need to free {needed} bytes");
        let mut freed = 0;
        while freed < needed {
            freed += self.evict_tail()?;
        }
        debug!("freed {freed} bytes");
        Ok(())
    }

    fn invalidate_block(&mut self, path: &Path, block: u64, warn_if_absent: bool) -> Result<()> {
        match self.map.get(path, block)? {
            Some(bucket) => {
                debug!("invalidating block {block} of {}", path.display());
                self.free_bucket(&bucket, false)?;
                // Normally gone already via the parent link; covers crash
                // leftovers where that link never got written.
                self.map.unlink_entry(&self.map.block_link(path, block))?;
                counters::bump(counters::Op::BlockInvalidated);
                Ok(())
            }
            None => {
                if warn_if_absent {
                    warn!(
                        "block {block} of {} isn't in the cache",
                        path.display()
                    );
                }
                Err(CacheError::NotCached)
            }
        }
    }

    fn invalidate_file(&mut self, path: &Path, warn_if_absent: bool) -> Result<()> {
        let Some(blocks) = self.map.blocks(path)? else {
            if warn_if_absent {
                warn!("{} isn't in the cache", path.display());
            }
            return Err(CacheError::NotCached);
        };
        self.map.remove_mtime(path)?;
        for (block, _link) in blocks {
            self.invalidate_block(path, block, false)?;
        }
        counters::bump(counters::Op::FileInvalidated);
        Ok(())
    }

    /// Writes the payload, forcibly evicting the coldest bucket and
    /// retrying whenever the disk reports full mid-write. Anything other
    /// than out-of-space is fatal.
    fn write_data(&mut self, bucket: &Path, buf: &[u8]) -> Result<()> {
        let data = bucket_store::data_path(bucket);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&data)?;

        let mut written = 0;
        loop {
            match file.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if file_util::is_enospc(&e) => {
                    debug!("nothing written (no space on device)");
                }
                Err(e) => return Err(e.into()),
            }
            if written == buf.len() {
                return Ok(());
            }

            debug!(
                "short write to {}: {written} of {} bytes so far",
                data.display(),
                buf.len()
            );
            // Never mind what statvfs said; the filesystem wants more room.
            // Evict and push on, unless the only bucket left is this one.
            if self.store.used_tail()?.as_deref() == Some(bucket) {
                error!(
                    "out of space writing {} and nothing is left to evict",
                    data.display()
                );
                return Err(CacheError::Io(io::Error::from_raw_os_error(
                    Errno::NOSPC.raw_os_error(),
                )));
            }
            self.evict_tail()?;
        }
    }

    /// After a map subtree moved, every bucket under it must have its
    /// `parent` link rewritten to the entry's new home.
    fn repoint_parents(&mut self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name() == "mtime" {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                let bucket = fs::read_link(entry.path())?;
                fsll::makelink(&bucket, "parent", Some(&entry.path()))?;
            } else if file_type.is_dir() {
                self.repoint_parents(&entry.path())?;
            }
        }
        Ok(())
    }
}
