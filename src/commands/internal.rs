//! Entry points the supervisor launches; not meant to be run by hand.

use anyhow::{Context, Result};
use labctl::config::ConfigLoader;
use labctl::supervisor::{server, SupervisorOptions};
use labctl::{daemon, nameserver, LabConfig, SupervisorSettings};
use std::path::Path;

pub async fn cmd_supervisor(force: bool) -> Result<()> {
    let settings = SupervisorSettings::load()?;
    server::run(SupervisorOptions::from_env(settings, force)).await
}

pub async fn cmd_run_nameserver(name: &str, config: &Path) -> Result<()> {
    let config = load_committed(config)?;
    nameserver::run(name, &config).await
}

pub async fn cmd_run_daemon(name: &str, config: &Path) -> Result<()> {
    let settings = SupervisorSettings::load()?;
    let config = load_committed(config)?;
    daemon::run(name, &config, &settings).await
}

/// The snapshot the supervisor committed before spawning us.
fn load_committed(path: &Path) -> Result<LabConfig> {
    ConfigLoader::new()
        .load_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}
