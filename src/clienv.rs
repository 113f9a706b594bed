use std::path::PathBuf;

const ENV_CONFIG_DIR: &str = "LAB_CONFIG_DIR";
const ENV_DATA_DIR: &str = "LAB_DATA_DIR";
const ENV_SUPERVISOR_SOCKET: &str = "LAB_SUPERVISOR_SOCKET";
const ENV_LOCKFILE: &str = "LAB_LOCKFILE";
const ENV_SUPERVISOR_LOG: &str = "LAB_SUPERVISOR_LOG";
const ENV_SUPERVISOR_TCP_PORT: &str = "LAB_SUPERVISOR_TCP_PORT";
pub const ENV_LOG: &str = "LAB_LOG";

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const LAB_SUBDIR: &str = "labctl";
const DEFAULT_SUPERVISOR_TCP_PORT: u16 = 14790;

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config directory ($LAB_CONFIG_DIR or ~/.config/labctl)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(LAB_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory ($LAB_DATA_DIR or ~/.local/share/labctl)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(ENV_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(LAB_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Operator-edited instrument configuration (config_dir/config.yaml)
pub fn user_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}

/// Supervisor tunables (config_dir/settings.toml)
pub fn settings_path() -> PathBuf {
    config_dir().join("settings.toml")
}

/// Last-committed configuration snapshot read by subprocesses (data_dir/runtime.yaml)
pub fn runtime_config_path() -> PathBuf {
    data_dir().join("runtime.yaml")
}

/// Supervisor socket path ($LAB_SUPERVISOR_SOCKET or data_dir/supervisor.sock)
pub fn supervisor_socket_path() -> PathBuf {
    let path = env_opt(ENV_SUPERVISOR_SOCKET)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("supervisor.sock"));
    tracing::trace!(path = %path.display(), "Supervisor socket path");
    path
}

/// Supervisor lockfile ($LAB_LOCKFILE or data_dir/supervisor.lock)
pub fn lockfile_path() -> PathBuf {
    let path = env_opt(ENV_LOCKFILE)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("supervisor.lock"));
    tracing::trace!(path = %path.display(), "Lockfile path");
    path
}

/// Supervisor log file ($LAB_SUPERVISOR_LOG or data_dir/logs/supervisor.log)
pub fn supervisor_log_path() -> PathBuf {
    let path = env_opt(ENV_SUPERVISOR_LOG)
        .map(PathBuf::from)
        .unwrap_or_else(|| logs_dir().join("supervisor.log"));
    tracing::trace!(path = %path.display(), "Supervisor log path");
    path
}

/// Per-profile log files live here (data_dir/logs)
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Subprocess PID records used to adopt survivors after a supervisor restart
pub fn run_dir() -> PathBuf {
    data_dir().join("run")
}

/// Default location for persistent nameserver storage
pub fn nameserver_storage_dir() -> PathBuf {
    data_dir().join("nameserver")
}

/// Supervisor TCP port for non-Unix platforms ($LAB_SUPERVISOR_TCP_PORT or 14790)
pub fn supervisor_tcp_port() -> u16 {
    env_opt(ENV_SUPERVISOR_TCP_PORT)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SUPERVISOR_TCP_PORT)
}
