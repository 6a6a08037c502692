pub mod config;
pub mod history;
pub mod init;
pub mod payouts;
pub mod run;
pub mod status;
pub mod tick;

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use taxflow_core::config::Config;
use taxflow_core::scheduler::Scheduler;
use taxflow_core::store::StateStore;

/// Load the config and refuse to continue on any error-level finding.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load_valid(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Open the state store next to the config without wiring upstreams.
pub(crate) fn open_store(path: &Path) -> anyhow::Result<Arc<StateStore>> {
    let config = load_config(path)?;
    let db = config.store_path(path);
    let store =
        StateStore::open(&db).with_context(|| format!("failed to open {}", db.display()))?;
    Ok(Arc::new(store))
}

pub(crate) fn scheduler(path: &Path) -> anyhow::Result<Scheduler> {
    let config = load_config(path)?;
    Scheduler::from_config(&config, path).context("failed to start scheduler")
}
