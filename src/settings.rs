use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Supervisor tunables, read from `settings.toml`.
///
/// Every field is optional in the file; unset fields keep the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Health/recovery loop period
    pub health_interval_ms: u64,
    /// Grace period between SIGTERM and SIGKILL on stop
    pub stop_grace_secs: u64,
    /// Bound on a single control-plane request
    pub request_timeout_secs: u64,
    /// Rolling window for crash-loop detection
    pub crash_window_secs: u64,
    /// Crashes tolerated inside the window before a profile is left stopped
    pub crash_ceiling: u32,
    /// Reject unknown fields in the instrument configuration
    pub strict_config: bool,
    /// Lines retained per profile in the in-memory log buffer
    pub log_lines: usize,
    /// Nameserver registration attempts made by a starting daemon
    pub registration_attempts: u32,
    pub registration_backoff_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            health_interval_ms: 2_000,
            stop_grace_secs: 10,
            request_timeout_secs: 30,
            crash_window_secs: 60,
            crash_ceiling: 5,
            strict_config: false,
            log_lines: 10_000,
            registration_attempts: 10,
            registration_backoff_ms: 500,
        }
    }
}

impl SupervisorSettings {
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::clienv::settings_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading supervisor settings");

        if !path.exists() {
            tracing::trace!("Settings file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;

        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;

        tracing::trace!(?settings, "Supervisor settings loaded");
        Ok(settings)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn registration_backoff(&self) -> Duration {
        Duration::from_millis(self.registration_backoff_ms)
    }
}
