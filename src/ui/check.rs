use anyhow::{Result, bail};
use camino::Utf8Path;

pub fn run(cache_dir: &Utf8Path) -> Result<()> {
    let cache = super::open_cache(cache_dir)?;
    let problems = cache.self_check()?;
    if problems.is_empty() {
        println!("cache checks out");
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    bail!("{} problem(s) found", problems.len());
}
