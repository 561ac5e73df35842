//! A doubly linked list whose nodes are directories and whose pointers are
//! symlinks.
//!
//! Each node carries `prev` and `next` symlinks naming its neighbors; the
//! list itself is a pair of head/tail anchor symlinks in a parent directory.
//! Keeping the links on disk means the LRU order survives restarts and can
//! be inspected with `ls -l`; nothing has to be rebuilt at startup.
//!
//! None of these operations are atomic on their own. The cache engine holds
//! its global lock across every call.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashSet;
use tracing::*;

use crate::error::{CacheError, Result};

/// Reads the symlink at `base/name`, or `None` if there is no such link.
pub fn getlink(base: &Path, name: &str) -> Result<Option<PathBuf>> {
    let path = base.join(name);
    match fs::read_link(&path) {
        Ok(target) => Ok(Some(target)),
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

/// Replaces the symlink at `base/name` with one pointing at `target`, or
/// just removes it when `target` is `None`.
pub fn makelink(base: &Path, name: &str, target: Option<&Path>) -> Result<()> {
    let path = base.join(name);
    match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if matches!(
            e.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
        ) => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(target) = target {
        std::os::unix::fs::symlink(target, &path)?;
    }
    Ok(())
}

/// Does `path` name anything, following symlinks?
pub fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

/// Creates a fresh numbered node directory at `parent/<number>`, no links
/// set.
pub fn make_entry(parent: &Path, number: u64) -> Result<PathBuf> {
    let path = parent.join(number.to_string());
    fs::create_dir(&path)?;
    Ok(path)
}

/// Decodes the numeric id a node path ends with, scanning back from the end
/// of the string until the first non-digit.
pub fn node_number(path: &Path) -> Result<u64> {
    let bytes = path.as_os_str().as_encoded_bytes();
    let digits = bytes
        .iter()
        .rev()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 {
        return Err(CacheError::corrupt(format!(
            "no trailing number in node path {}",
            path.display()
        )));
    }
    // All ASCII digits, so from_utf8 can't fail.
    let digits = std::str::from_utf8(&bytes[bytes.len() - digits..]).unwrap();
    digits.parse().map_err(|_| {
        CacheError::corrupt(format!("node number out of range in {}", path.display()))
    })
}

/// One on-disk list: a pair of named anchor symlinks in `base`.
#[derive(Debug, Clone)]
pub struct Fsll {
    base: PathBuf,
    head: String,
    tail: String,
}

impl Fsll {
    pub fn new(base: &Path, head: &str, tail: &str) -> Fsll {
        Fsll {
            base: base.to_owned(),
            head: head.to_owned(),
            tail: tail.to_owned(),
        }
    }

    pub fn head(&self) -> Result<Option<PathBuf>> {
        getlink(&self.base, &self.head)
    }

    pub fn tail(&self) -> Result<Option<PathBuf>> {
        getlink(&self.base, &self.tail)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.head()?.is_none())
    }

    fn set_head(&self, node: Option<&Path>) -> Result<()> {
        makelink(&self.base, &self.head, node)
    }

    fn set_tail(&self, node: Option<&Path>) -> Result<()> {
        makelink(&self.base, &self.tail, node)
    }

    fn anchor_mismatch(&self, head: &Option<PathBuf>) -> CacheError {
        let msg = if head.is_some() {
            format!("list {} has a head but no tail", self.head)
        } else {
            format!("list {} has a tail but no head", self.head)
        };
        error!("{msg}");
        CacheError::Corrupt(msg)
    }

    fn corrupt_node(&self, node: &Path, what: &str) -> CacheError {
        let msg = format!("node {} {}", node.display(), what);
        error!("{msg}");
        CacheError::Corrupt(msg)
    }

    /// Splices a detached node in at the head.
    pub fn insert_as_head(&self, node: &Path) -> Result<()> {
        let head = self.head()?;
        let tail = self.tail()?;
        match (&head, &tail) {
            (None, None) => {
                self.set_head(Some(node))?;
                self.set_tail(Some(node))?;
                makelink(node, "next", None)?;
                makelink(node, "prev", None)?;
            }
            (Some(head), Some(_)) => {
                makelink(node, "next", Some(head))?;
                makelink(head, "prev", Some(node))?;
                self.set_head(Some(node))?;
            }
            _ => return Err(self.anchor_mismatch(&head)),
        }
        Ok(())
    }

    /// Splices a detached node in at the tail.
    pub fn insert_as_tail(&self, node: &Path) -> Result<()> {
        let head = self.head()?;
        let tail = self.tail()?;
        match (&head, &tail) {
            (None, None) => {
                self.set_head(Some(node))?;
                self.set_tail(Some(node))?;
                makelink(node, "next", None)?;
                makelink(node, "prev", None)?;
            }
            (Some(_), Some(tail)) => {
                makelink(node, "prev", Some(tail))?;
                makelink(tail, "next", Some(node))?;
                self.set_tail(Some(node))?;
            }
            _ => return Err(self.anchor_mismatch(&head)),
        }
        Ok(())
    }

    /// Unlinks a node from the chain, patching its neighbors and the anchors
    /// if it was an endpoint. The node's own `prev`/`next` are cleared.
    pub fn disconnect(&self, node: &Path) -> Result<()> {
        let head = self.head()?;
        let tail = self.tail()?;
        let next = getlink(node, "next")?;
        let prev = getlink(node, "prev")?;

        if head.as_deref() == Some(node) {
            match &next {
                Some(next) => {
                    self.set_head(Some(next))?;
                    makelink(next, "prev", None)?;
                }
                None => {
                    if tail.as_deref() == Some(node) {
                        self.set_tail(None)?;
                    } else {
                        return Err(self.corrupt_node(node, "has no next but is not the tail"));
                    }
                }
            }
        }

        if tail.as_deref() == Some(node) {
            match &prev {
                Some(prev) => {
                    self.set_tail(Some(prev))?;
                    makelink(prev, "next", None)?;
                }
                None => {
                    if head.as_deref() == Some(node) {
                        self.set_head(None)?;
                    } else {
                        return Err(self.corrupt_node(node, "has no prev but is not the head"));
                    }
                }
            }
        }

        if let (Some(prev), Some(next)) = (&prev, &next) {
            makelink(next, "prev", Some(prev))?;
            makelink(prev, "next", Some(next))?;
        }

        makelink(node, "next", None)?;
        makelink(node, "prev", None)?;
        Ok(())
    }

    /// Moves a node already on this list up to the head.
    ///
    /// A node with no `prev` must be the head, and one with no `next` must
    /// be the tail; if the links say otherwise the list is scrambled and we
    /// refuse to touch it.
    pub fn to_head(&self, node: &Path) -> Result<()> {
        let Some(head) = self.head()? else {
            return Err(self.corrupt_node(node, "is on a list with no head"));
        };
        let Some(tail) = self.tail()? else {
            return Err(self.corrupt_node(node, "is on a list with no tail"));
        };
        let next = getlink(node, "next")?;
        let prev = getlink(node, "prev")?;

        if prev.is_none() != (head == node) {
            return Err(if prev.is_some() {
                self.corrupt_node(node, "is the head but has a prev")
            } else {
                self.corrupt_node(node, "has no prev but is not the head")
            });
        }
        if next.is_none() != (tail == node) {
            return Err(if next.is_some() {
                self.corrupt_node(node, "is the tail but has a next")
            } else {
                self.corrupt_node(node, "has no next but is not the tail")
            });
        }
        if prev.as_deref() == Some(node) || next.as_deref() == Some(node) {
            return Err(self.corrupt_node(node, "points at itself"));
        }

        let Some(prev) = prev else {
            // Already the head.
            return Ok(());
        };

        makelink(&prev, "next", next.as_deref())?;
        match &next {
            Some(next) => makelink(next, "prev", Some(&prev))?,
            None => self.set_tail(Some(&prev))?,
        }
        makelink(&head, "prev", Some(node))?;
        makelink(node, "next", Some(&head))?;
        makelink(node, "prev", None)?;
        self.set_head(Some(node))?;
        Ok(())
    }

    /// Walks the chain from head to tail, checking `prev` back-links and the
    /// tail anchor along the way.
    pub fn nodes(&self) -> Result<Vec<PathBuf>> {
        let mut nodes = Vec::new();
        let mut seen = FxHashSet::default();
        let mut prev: Option<PathBuf> = None;
        let mut cursor = self.head()?;

        while let Some(node) = cursor {
            if !seen.insert(node.clone()) {
                return Err(self.corrupt_node(&node, "appears twice; the list has a loop"));
            }
            let back = getlink(&node, "prev")?;
            if back != prev {
                return Err(self.corrupt_node(&node, "disagrees with its predecessor"));
            }
            cursor = getlink(&node, "next")?;
            prev = Some(node.clone());
            nodes.push(node);
        }

        if prev != self.tail()? {
            return Err(CacheError::corrupt(format!(
                "chain from {} does not end at {}",
                self.head, self.tail
            )));
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    fn scratch_list() -> Result<(tempfile::TempDir, Fsll)> {
        let dir = tempfile::tempdir()?;
        let list = Fsll::new(dir.path(), "head", "tail");
        Ok((dir, list))
    }

    #[test]
    fn inserts_and_walks() -> Result<()> {
        let (dir, list) = scratch_list()?;
        assert!(list.is_empty()?);

        let a = make_entry(dir.path(), 0)?;
        let b = make_entry(dir.path(), 1)?;
        let c = make_entry(dir.path(), 2)?;

        list.insert_as_head(&a)?;
        list.insert_as_head(&b)?;
        list.insert_as_tail(&c)?;

        assert_eq!(list.nodes()?, vec![b.clone(), a.clone(), c.clone()]);
        assert_eq!(list.head()?.as_deref(), Some(b.as_path()));
        assert_eq!(list.tail()?.as_deref(), Some(c.as_path()));
        Ok(())
    }

    #[test]
    fn disconnect_patches_neighbors_and_anchors() -> Result<()> {
        let (dir, list) = scratch_list()?;
        let a = make_entry(dir.path(), 0)?;
        let b = make_entry(dir.path(), 1)?;
        let c = make_entry(dir.path(), 2)?;
        for node in [&a, &b, &c] {
            list.insert_as_tail(node)?;
        }

        // Middle.
        list.disconnect(&b)?;
        assert_eq!(list.nodes()?, vec![a.clone(), c.clone()]);
        assert_eq!(getlink(&b, "prev")?, None);
        assert_eq!(getlink(&b, "next")?, None);

        // Endpoints.
        list.disconnect(&a)?;
        assert_eq!(list.nodes()?, vec![c.clone()]);
        list.disconnect(&c)?;
        assert!(list.is_empty()?);
        assert_eq!(list.tail()?, None);
        Ok(())
    }

    #[test]
    fn to_head_promotes() -> Result<()> {
        let (dir, list) = scratch_list()?;
        let a = make_entry(dir.path(), 0)?;
        let b = make_entry(dir.path(), 1)?;
        let c = make_entry(dir.path(), 2)?;
        for node in [&a, &b, &c] {
            list.insert_as_tail(node)?;
        }

        // Promoting the tail moves the tail anchor back.
        list.to_head(&c)?;
        assert_eq!(list.nodes()?, vec![c.clone(), a.clone(), b.clone()]);

        // Promoting the middle.
        list.to_head(&a)?;
        assert_eq!(list.nodes()?, vec![a.clone(), c.clone(), b.clone()]);

        // Promoting the head is a no-op.
        list.to_head(&a)?;
        assert_eq!(list.nodes()?, vec![a, c, b]);
        Ok(())
    }

    #[test]
    fn to_head_refuses_scrambled_links() -> Result<()> {
        let (dir, list) = scratch_list()?;
        let a = make_entry(dir.path(), 0)?;
        let b = make_entry(dir.path(), 1)?;
        list.insert_as_tail(&a)?;
        list.insert_as_tail(&b)?;

        // Give the tail a bogus next pointer.
        makelink(&b, "next", Some(&a))?;
        assert!(list.to_head(&b).is_err());
        Ok(())
    }

    #[test]
    fn anchors_must_agree() -> Result<()> {
        let (dir, list) = scratch_list()?;
        let a = make_entry(dir.path(), 0)?;
        let b = make_entry(dir.path(), 1)?;
        list.insert_as_head(&a)?;

        // Break the tail anchor and try to insert.
        makelink(dir.path(), "tail", None)?;
        assert!(list.insert_as_head(&b).is_err());
        assert!(list.insert_as_tail(&b).is_err());
        Ok(())
    }

    #[test]
    fn node_numbers() {
        assert_eq!(node_number(Path::new("/cache/buckets/17")).unwrap(), 17);
        assert_eq!(node_number(Path::new("0")).unwrap(), 0);
        assert!(node_number(Path::new("/cache/buckets/head")).is_err());
        assert!(node_number(Path::new("")).is_err());
    }
}
