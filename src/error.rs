//! The error kinds cache operations can produce, and their mapping onto
//! POSIX errno values for a FUSE driver.

use std::io;

use rustix::io::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The requested block is not in the cache. A miss, not a failure.
    #[error("block not in cache")]
    NotCached,

    /// A read that would cross the end of a block.
    #[error("read range extends past the end of a block")]
    BadRange,

    /// An added block bigger than the cache's block size.
    #[error("block data is larger than the cache block size")]
    Oversized,

    /// The disk filled up mid-operation; a bucket was evicted and the caller
    /// should try again.
    #[error("cache transiently out of space, retry")]
    Retry,

    /// A cache directory that was created with a different block size.
    #[error("cache holds {persisted}-byte blocks, not {requested}")]
    BlockSizeMismatch { persisted: u64, requested: u64 },

    /// On-disk state that contradicts itself (scrambled queue links, a
    /// malformed number file). Logged at error level by whoever detects it.
    #[error("cache structure corrupt: {0}")]
    Corrupt(String),

    /// A control-channel write we don't understand.
    #[error("unknown control command: {0:?}")]
    BadCommand(String),

    /// Sentinel answer to the control channel's `test` command.
    #[error("cross-device link")]
    ControlProbe,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CacheError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        CacheError::Corrupt(msg.into())
    }

    /// The errno a FUSE driver should report for this error.
    pub fn errno(&self) -> i32 {
        match self {
            CacheError::NotCached => Errno::NOENT.raw_os_error(),
            CacheError::BadRange => Errno::INVAL.raw_os_error(),
            CacheError::Oversized => Errno::OVERFLOW.raw_os_error(),
            CacheError::Retry => Errno::AGAIN.raw_os_error(),
            CacheError::BlockSizeMismatch { .. } => Errno::INVAL.raw_os_error(),
            CacheError::Corrupt(_) => Errno::IO.raw_os_error(),
            CacheError::BadCommand(_) => Errno::BADMSG.raw_os_error(),
            CacheError::ControlProbe => Errno::XDEV.raw_os_error(),
            CacheError::Io(e) => e.raw_os_error().unwrap_or(Errno::IO.raw_os_error()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errnos_match_libc() {
        assert_eq!(CacheError::NotCached.errno(), libc::ENOENT);
        assert_eq!(CacheError::BadRange.errno(), libc::EINVAL);
        assert_eq!(CacheError::Oversized.errno(), libc::EOVERFLOW);
        assert_eq!(CacheError::Retry.errno(), libc::EAGAIN);
        assert_eq!(
            CacheError::BlockSizeMismatch {
                persisted: 8,
                requested: 16,
            }
            .errno(),
            libc::EINVAL
        );
        assert_eq!(CacheError::BadCommand("eh".into()).errno(), libc::EBADMSG);
        assert_eq!(CacheError::ControlProbe.errno(), libc::EXDEV);
        assert_eq!(CacheError::corrupt("scrambled").errno(), libc::EIO);
        let gone = CacheError::Io(io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(gone.errno(), libc::ENOENT);
    }

    #[test]
    fn messages_name_the_problem() {
        let mismatch = CacheError::BlockSizeMismatch {
            persisted: 8,
            requested: 16,
        };
        assert_eq!(mismatch.to_string(), "cache holds 8-byte blocks, not 16");
        assert_eq!(
            CacheError::BadCommand("defragment".into()).to_string(),
            "unknown control command: \"defragment\""
        );
        assert_eq!(CacheError::ControlProbe.to_string(), "cross-device link");
    }
}
