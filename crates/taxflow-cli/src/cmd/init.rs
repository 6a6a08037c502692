use anyhow::Context;
use std::path::Path;
use taxflow_core::config::Config;

pub fn run(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(());
    }
    Config::default()
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    println!("Edit upstream.gateway_url and the token settings, then run `taxflow run`.");
    Ok(())
}
