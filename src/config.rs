use std::{fs, io};

use anyhow::{Context, Result, anyhow};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

use crate::bucket_store;

#[inline]
fn defcachesize() -> Byte {
    Byte::from_u64(0)
}

#[inline]
fn defblocksize() -> Byte {
    Byte::from_u64(bucket_store::DEFAULT_BLOCK_SIZE)
}

/// Defaults for command-line flags, from `~/.config/backfs.toml` if the
/// user has one.
#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// Cache size cap; 0 means the device is the only bound.
    #[serde(default = "defcachesize")]
    pub cache_size: Byte,
    #[serde(default = "defblocksize")]
    pub block_size: Byte,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            cache_size: defcachesize(),
            block_size: defblocksize(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "backfs.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let conf = Configuration::default();
        assert_eq!(conf.cache_size.as_u64(), 0);
        assert_eq!(conf.block_size.as_u64(), 128 * 1024);
    }

    #[test]
    fn parses_human_sizes() -> Result<()> {
        let conf: Configuration = toml::from_str(
            r#"
            cache_size = "4GiB"
            block_size = "64KiB"
            "#,
        )?;
        assert_eq!(conf.cache_size.as_u64(), 4 * 1024 * 1024 * 1024);
        assert_eq!(conf.block_size.as_u64(), 64 * 1024);
        Ok(())
    }
}
