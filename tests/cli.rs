//! Smoke tests for the maintenance CLI.

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;

mod common;

fn cli(cache_dir: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME"))?;
    cmd.arg("--cache").arg(cache_dir);
    // Keep config-file defaults out of the picture.
    cmd.env("HOME", cache_dir);
    Ok(cmd)
}

#[test]
fn init_then_check() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_dir = dir.path().join("cache");

    cli(&cache_dir)?
        .args(["init", "--size", "32", "--block-size", "8"])
        .assert()
        .success()
        .stdout(predicate::str::contains("capped at"));

    assert!(cache_dir.join("buckets/bucket_size").is_file());
    assert!(cache_dir.join("map").is_dir());

    cli(&cache_dir)?
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("cache checks out"));
    Ok(())
}

#[test]
fn init_refuses_a_different_block_size() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_dir = dir.path().join("cache");

    cli(&cache_dir)?
        .args(["init", "--size", "32", "--block-size", "8"])
        .assert()
        .success();
    cli(&cache_dir)?
        .args(["init", "--size", "32", "--block-size", "16"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("8-byte blocks"));
    Ok(())
}

#[test]
fn usage_and_invalidate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_dir = dir.path().join("cache");

    // Populate through the library, like a driver would.
    {
        let cache = backfs::cache::Cache::open(&cache_dir, Some(32), Some(8))?;
        cache.add(Path::new("/a"), 0, b"ABCDEFGH", 1000)?;
        cache.add(Path::new("/a"), 1, b"IJKL", 1000)?;
    }

    // The cap is a mount option, not persisted; without one the CLI sees a
    // device-bounded cache.
    cli(&cache_dir)?
        .args(["usage", "/a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("12 B used").and(predicate::str::contains("/a")));

    cli(&cache_dir)?
        .args(["invalidate", "/a"])
        .assert()
        .success();
    assert!(!cache_dir.join("map/a").exists());

    // A second invalidation has nothing to drop.
    cli(&cache_dir)?
        .args(["invalidate", "/a"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn orphans_runs_clean_on_a_healthy_cache() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_dir = dir.path().join("cache");
    {
        let cache = backfs::cache::Cache::open(&cache_dir, Some(32), Some(8))?;
        cache.add(Path::new("/a"), 0, b"ABCDEFGH", 1000)?;
    }

    cli(&cache_dir)?.arg("orphans").assert().success();

    // Nothing healthy was swept.
    let cache = backfs::cache::Cache::open(&cache_dir, Some(32), None)?;
    cache.settle_used_bytes();
    assert_eq!(cache.used_bytes(), 8);
    Ok(())
}

#[test]
fn check_reports_scrambled_queues() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache_dir = dir.path().join("cache");
    {
        let cache = backfs::cache::Cache::open(&cache_dir, Some(32), Some(8))?;
        cache.add(Path::new("/a"), 0, b"ABCDEFGH", 1000)?;
    }

    // Rip out the bucket's payload behind the cache's back.
    std::fs::remove_file(cache_dir.join("buckets/0/data"))?;

    cli(&cache_dir)?
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("has no data"));
    Ok(())
}
