//! A read-through block cache that lives entirely on the filesystem:
//! numbered directories are buckets, symlinks are the LRU pointers, and a
//! directory tree mirroring the backing store is the index. Nothing has to
//! be rebuilt when the process restarts.
//!
//! [`cache::Cache`] is the engine; its module documents the on-disk layout.

pub mod block_map;
pub mod bucket_store;
pub mod cache;
pub mod config;
pub mod control;
pub mod counters;
pub mod error;
pub mod file_util;
pub mod fsll;
pub mod writethrough;

// CLI stuff:
pub mod ui;
