//! Performance counters: count how many times we do various important
//! operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    CacheHit,
    CacheMiss,
    BlockWrite,
    Eviction,
    BucketCreated,
    BucketReused,
    BlockInvalidated,
    FileInvalidated,
    StaleFileDropped,
    OrphanFreed,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::CacheHit => "cache hits",
        Op::CacheMiss => "cache misses",
        Op::BlockWrite => "blocks written",
        Op::Eviction => "buckets evicted",
        Op::BucketCreated => "buckets created",
        Op::BucketReused => "buckets re-used",
        Op::BlockInvalidated => "blocks invalidated",
        Op::FileInvalidated => "files invalidated",
        Op::StaleFileDropped => "stale files dropped",
        Op::OrphanFreed => "orphan buckets freed",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}
