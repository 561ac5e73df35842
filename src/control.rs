//! The mount's control channel: one-line text commands, routed to cache
//! maintenance operations.
//!
//! A driver exposes a couple of pseudo-files at the mount root; writing
//! `<command> [argument]` to the control file lands here. Unknown commands
//! answer `EBADMSG`, and `test` always answers the `EXDEV` sentinel so
//! scripts can tell a live control file from a plain one.

use std::path::{Path, PathBuf};

use tracing::*;

use crate::cache::Cache;
use crate::error::{CacheError, Result};

/// Where a driver should expose the command pseudo-file.
pub const CONTROL_FILE: &str = "/.backfs_control";
/// Where a driver should expose the read-only version pseudo-file.
pub const VERSION_FILE: &str = "/.backfs_version";

/// Is this mount-relative path one of ours rather than the backing store's?
pub fn is_control_path(path: &Path) -> bool {
    path == Path::new(CONTROL_FILE) || path == Path::new(VERSION_FILE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Liveness probe; always answered with the cross-device-link sentinel.
    Test,
    Noop,
    /// Drop every cached block of the given backing path.
    Invalidate(PathBuf),
    /// Sweep for buckets left orphaned by a crash.
    FreeOrphans,
}

impl Command {
    /// Parses one write to the control file, trailing newline optional.
    pub fn parse(input: &str) -> Result<Command> {
        let input = input.strip_suffix('\n').unwrap_or(input);
        let (command, argument) = match input.split_once(' ') {
            Some((command, argument)) => (command, Some(argument)),
            None => (input, None),
        };
        match (command, argument) {
            ("test", None) => Ok(Command::Test),
            ("noop", None) => Ok(Command::Noop),
            ("invalidate", Some(path)) if !path.is_empty() => {
                Ok(Command::Invalidate(PathBuf::from(path)))
            }
            ("free_orphans", None) => Ok(Command::FreeOrphans),
            _ => Err(CacheError::BadCommand(input.to_string())),
        }
    }
}

/// Runs one control-channel write against the cache.
pub fn dispatch(cache: &Cache, input: &str) -> Result<()> {
    let command = Command::parse(input)?;
    debug!("control: {command:?}");
    match command {
        Command::Test => Err(CacheError::ControlProbe),
        Command::Noop => Ok(()),
        Command::Invalidate(path) => cache.invalidate_file(&path),
        Command::FreeOrphans => cache.free_orphan_buckets(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_the_command_table() {
        assert_eq!(Command::parse("noop\n").unwrap(), Command::Noop);
        assert_eq!(Command::parse("test").unwrap(), Command::Test);
        assert_eq!(
            Command::parse("invalidate /a/b c\n").unwrap(),
            Command::Invalidate(PathBuf::from("/a/b c"))
        );
        assert_eq!(
            Command::parse("free_orphans\n").unwrap(),
            Command::FreeOrphans
        );
    }

    #[test]
    fn rejects_what_it_does_not_know() {
        for bad in ["", "defragment", "invalidate", "invalidate ", "noop now"] {
            match Command::parse(bad) {
                Err(CacheError::BadCommand(_)) => {}
                other => panic!("{bad:?} should be a bad command, got {other:?}"),
            }
        }
    }

    #[test]
    fn control_paths() {
        assert!(is_control_path(Path::new("/.backfs_control")));
        assert!(is_control_path(Path::new("/.backfs_version")));
        assert!(!is_control_path(Path::new("/music/.backfs_control")));
        assert!(!is_control_path(Path::new("/a")));
    }
}
