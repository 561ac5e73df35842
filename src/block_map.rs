//! The block map: a directory tree under `map/` mirroring the backing
//! store's paths.
//!
//! For backing path `P` and block index `B`, `map<P>/<B>` is a symlink to
//! the bucket directory holding that block, and `map<P>/mtime` records the
//! backing file's modification time when its blocks were stamped. The map
//! tree and the bucket queues *are* the index; there is nothing to rebuild
//! at startup.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::*;

use crate::bucket_store;
use crate::error::Result;
use crate::file_util;
use crate::fsll;

#[derive(Debug)]
pub struct BlockMap {
    dir: PathBuf,
}

impl BlockMap {
    pub fn open(cache_dir: &Path) -> Result<BlockMap> {
        let dir = cache_dir.join("map");
        fs::create_dir_all(&dir)?;
        Ok(BlockMap { dir })
    }

    /// `map<path>`: the directory holding a backing file's block links.
    pub fn file_dir(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.dir.join(relative)
    }

    /// `map<path>/<block>`: where the symlink for one block lives.
    pub fn block_link(&self, path: &Path, block: u64) -> PathBuf {
        self.file_dir(path).join(block.to_string())
    }

    /// The bucket currently holding `(path, block)`, if any.
    pub fn get(&self, path: &Path, block: u64) -> Result<Option<PathBuf>> {
        match fs::read_link(self.block_link(path, block)) {
            Ok(bucket) => Ok(Some(bucket)),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Points `(path, block)` at `bucket`. The directory chain must already
    /// exist.
    pub fn set(&self, path: &Path, block: u64, bucket: &Path) -> Result<()> {
        fsll::makelink(&self.file_dir(path), &block.to_string(), Some(bucket))
    }

    /// Creates the directory chain for `path`'s block links, mode 0700.
    ///
    /// Failures (`ENOSPC` included) surface as-is so callers can decide
    /// whether to evict and retry.
    pub fn ensure_file_dir(&self, path: &Path) -> Result<PathBuf> {
        let dir = self.file_dir(path);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)?;
        Ok(dir)
    }

    /// The stamped modification time for `path`, if present and readable.
    /// A malformed record is discarded on sight.
    pub fn read_mtime(&self, path: &Path) -> Result<Option<i64>> {
        let mtime_path = self.file_dir(path).join("mtime");
        match file_util::read_number_file(&mtime_path) {
            Ok(stamp) => Ok(stamp),
            Err(crate::error::CacheError::Corrupt(msg)) => {
                warn!("{msg}; removing it");
                fs::remove_file(&mtime_path)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn write_mtime(&self, path: &Path, mtime: i64) -> Result<()> {
        file_util::write_number_file(&self.file_dir(path).join("mtime"), mtime)
    }

    pub fn remove_mtime(&self, path: &Path) -> Result<()> {
        match fs::remove_file(self.file_dir(path).join("mtime")) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The blocks of `path` currently mapped, as `(index, link path)` pairs.
    /// `None` if the file has no map directory at all.
    pub fn blocks(&self, path: &Path) -> Result<Option<Vec<(u64, PathBuf)>>> {
        let dir = self.file_dir(path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut blocks = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(index) = name.parse::<u64>() {
                blocks.push((index, entry.path()));
            }
        }
        blocks.sort_unstable();
        Ok(Some(blocks))
    }

    /// Removes one block's symlink (if it's still there) and trims any map
    /// directories that leaves empty.
    pub fn unlink_entry(&self, entry: &Path) -> Result<()> {
        match fs::remove_file(entry) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.trim(entry)
    }

    /// Walks upward from `entry`'s directory, removing directories left
    /// empty (and any `mtime` record sitting in them), stopping at the map
    /// root.
    fn trim(&self, entry: &Path) -> Result<()> {
        let Some(start) = entry.parent() else {
            return Ok(());
        };
        let mut dir = start.to_path_buf();

        while dir != self.dir && dir.starts_with(&self.dir) {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let mut found_mtime = false;
            let mut busy = false;
            for entry in entries {
                let entry = entry?;
                if entry.file_name() == "mtime" && entry.file_type()?.is_file() {
                    found_mtime = true;
                    continue;
                }
                debug!(
                    "directory {} still has {:?} in it",
                    dir.display(),
                    entry.file_name()
                );
                busy = true;
                break;
            }
            if busy {
                return Ok(());
            }

            if found_mtime {
                fs::remove_file(dir.join("mtime"))?;
                debug!("removed mtime record in {}", dir.display());
            }

            match fs::remove_dir(&dir) {
                Ok(()) => debug!("removed empty map directory {}", dir.display()),
                Err(e) => {
                    warn!(
                        "map directory {} not empty after trim, but how? {e}",
                        dir.display()
                    );
                    return Ok(());
                }
            }

            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => return Ok(()),
            }
        }
        Ok(())
    }

    /// Sum of cached payload bytes under `path`, which may name a file or a
    /// whole directory tree. Whether a map directory is a file is decided by
    /// the presence of an `mtime` record.
    pub fn cached_bytes(&self, path: &Path) -> Result<u64> {
        let mut total = 0;
        self.sum_dir(&self.file_dir(path), &mut total)?;
        Ok(total)
    }

    fn sum_dir(&self, dir: &Path, total: &mut u64) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
            {
                debug!("not in cache: {}", dir.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let is_file = dir
            .join("mtime")
            .symlink_metadata()
            .map(|m| m.is_file())
            .unwrap_or(false);

        for entry in entries {
            let entry = entry?;
            if entry.file_name() == "mtime" {
                continue;
            }
            if is_file {
                let Ok(bucket) = fs::read_link(entry.path()) else {
                    continue;
                };
                match fs::symlink_metadata(bucket_store::data_path(&bucket)) {
                    Ok(meta) => *total += meta.len(),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            } else {
                self.sum_dir(&entry.path(), total)?;
            }
        }
        Ok(())
    }

    /// Renames `old`'s map subtree to `new`, creating `new`'s parent chain
    /// first. `Ok(None)` when `old` wasn't cached; otherwise the renamed
    /// directory, whose buckets' `parent` links the caller must repoint.
    pub fn rename(&self, old: &Path, new: &Path) -> Result<Option<PathBuf>> {
        let from = self.file_dir(old);
        let to = self.file_dir(new);
        if let Some(parent) = to.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)?;
        }
        match fs::rename(&from, &to) {
            Ok(()) => Ok(Some(to)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("not in cache: {}", old.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
