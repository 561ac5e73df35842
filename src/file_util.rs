//! Small file helpers: one-line decimal "number files" and free-space
//! queries.

use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{CacheError, Result};

/// Reads a file holding one decimal number, with or without a trailing
/// newline. `Ok(None)` if the file doesn't exist.
pub fn read_number_file<N>(path: &Path) -> Result<Option<N>>
where
    N: std::str::FromStr,
{
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match contents.trim().parse() {
        Ok(n) => Ok(Some(n)),
        Err(_) => Err(CacheError::corrupt(format!(
            "malformed number file {}: {:?}",
            path.display(),
            contents
        ))),
    }
}

/// Writes a one-line decimal number file, replacing any previous contents.
///
/// Written to a temporary name in the same directory and renamed into place,
/// so a crash can't leave the file torn.
pub fn write_number_file<N: std::fmt::Display>(path: &Path, number: N) -> Result<()> {
    let dir = path
        .parent()
        .expect("number files always sit inside a directory");
    let mut temp = NamedTempFile::new_in(dir)?;
    writeln!(temp, "{number}")?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Bytes available to us on the filesystem holding `path`.
pub fn device_free_bytes(path: &Path) -> Result<u64> {
    let vfs = rustix::fs::statvfs(path).map_err(io::Error::from)?;
    Ok(vfs.f_bavail * vfs.f_frsize)
}

pub fn is_enospc(e: &io::Error) -> bool {
    e.raw_os_error() == Some(rustix::io::Errno::NOSPC.raw_os_error())
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Result;

    #[test]
    fn number_files_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("next_bucket_number");

        assert_eq!(read_number_file::<u64>(&path)?, None);
        write_number_file(&path, 42u64)?;
        assert_eq!(read_number_file::<u64>(&path)?, Some(42));
        write_number_file(&path, 43u64)?;
        assert_eq!(read_number_file::<u64>(&path)?, Some(43));

        // Negative stamps parse too; mtimes are signed.
        write_number_file(&path, -7i64)?;
        assert_eq!(read_number_file::<i64>(&path)?, Some(-7));
        Ok(())
    }

    #[test]
    fn garbage_number_file_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bucket_size");
        fs::write(&path, "one hundred\n")?;
        assert!(read_number_file::<u64>(&path).is_err());
        Ok(())
    }

    #[test]
    fn free_space_is_nonzero_somewhere_writable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(device_free_bytes(dir.path())? > 0);
        Ok(())
    }
}
