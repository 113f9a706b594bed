use super::health::{CrashPolicy, CrashVerdict};
use super::log_buffer::LogBuffer;
use super::log_files;
use super::os::{self, Signal};
use super::protocol::{ProcessSnapshot, ProcessState, ProfileRef, ReloadReport, StatusTarget};
use crate::clienv;
use crate::config::{LabConfig, ProfileKind, RenderView};
use crate::error::{LabError, Result};
use crate::settings::SupervisorSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// How long a fresh spawn must survive before it counts as running.
const STARTUP_OBSERVATION: Duration = Duration::from_millis(300);
const ADOPTED_POLL: Duration = Duration::from_millis(100);

pub type ProfileKey = (ProfileKind, String);

/// Hidden CLI subcommand that runs a profile's subprocess.
pub fn run_subcommand(kind: ProfileKind) -> &'static str {
    match kind {
        ProfileKind::Nameserver => "run-nameserver",
        ProfileKind::Daemon => "run-daemon",
    }
}

/// Builds the command line for a profile's subprocess.
pub trait Launcher: Send + Sync {
    fn command(&self, kind: ProfileKind, name: &str, config: &Path) -> Command;

    /// Whether a live `pid` left by a previous supervisor is this profile's subprocess.
    fn recognizes(&self, pid: u32, kind: ProfileKind, name: &str) -> bool {
        os::cmdline_contains(pid, run_subcommand(kind)) && os::cmdline_contains(pid, name)
    }
}

/// Re-executes the running binary with the hidden `run-*` subcommands.
pub struct SelfLauncher {
    exe: PathBuf,
}

impl SelfLauncher {
    pub fn current() -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }
}

impl Launcher for SelfLauncher {
    fn command(&self, kind: ProfileKind, name: &str, config: &Path) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg(run_subcommand(kind))
            .arg(name)
            .arg("--config")
            .arg(config);
        cmd
    }
}

/// Filesystem locations owned by the process registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessPaths {
    /// Committed configuration snapshot handed to every subprocess
    pub runtime_config: PathBuf,
    pub run_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for ProcessPaths {
    fn default() -> Self {
        Self {
            runtime_config: clienv::runtime_config_path(),
            run_dir: clienv::run_dir(),
            logs_dir: clienv::logs_dir(),
        }
    }
}

impl ProcessPaths {
    /// Every path below one root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            runtime_config: root.join("runtime.yaml"),
            run_dir: root.join("run"),
            logs_dir: root.join("logs"),
        }
    }

    fn pid_file(&self, kind: ProfileKind, name: &str) -> PathBuf {
        self.run_dir.join(format!("{kind}-{name}.pid"))
    }

    fn log_file(&self, kind: ProfileKind, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{kind}-{name}.log"))
    }
}

/// Written next to every spawned subprocess so a restarted supervisor can adopt it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidRecord {
    pub kind: ProfileKind,
    pub name: String,
    pub pid: u32,
    pub incarnation: u32,
    pub started_at: DateTime<Utc>,
}

enum Handle {
    Spawned(Child),
    /// Survivor of a previous supervisor, known only by PID
    Adopted(u32),
}

pub struct ManagedProcess {
    kind: ProfileKind,
    name: String,
    handle: Option<Handle>,
    pid: Option<u32>,
    state: ProcessState,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    restarts: u32,
    incarnation: u32,
    last_error: Option<String>,
    crash_looped: bool,
    crashes: VecDeque<Instant>,
}

impl ManagedProcess {
    fn new(kind: ProfileKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            handle: None,
            pid: None,
            state: ProcessState::Stopped,
            started_at: None,
            started: None,
            restarts: 0,
            incarnation: 0,
            last_error: None,
            crash_looped: false,
            crashes: VecDeque::new(),
        }
    }

    fn adopted(record: &PidRecord) -> Self {
        Self {
            handle: Some(Handle::Adopted(record.pid)),
            pid: Some(record.pid),
            state: ProcessState::Running,
            started_at: Some(record.started_at),
            incarnation: record.incarnation,
            ..Self::new(record.kind, &record.name)
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let live = self.state.is_running();
        ProcessSnapshot {
            kind: self.kind,
            name: self.name.clone(),
            state: self.state,
            pid: self.pid.filter(|_| live),
            started_at_ms: self.started_at.map(|t| t.timestamp_millis()),
            uptime_secs: self
                .started_at
                .filter(|_| live)
                .map(|t| (Utc::now() - t).num_seconds().max(0) as u64),
            restarts: self.restarts,
            incarnation: self.incarnation,
            last_error: self.last_error.clone(),
            crash_looped: self.crash_looped,
            adopted: matches!(self.handle, Some(Handle::Adopted(_))),
        }
    }

    /// Exit description if the process has gone away since the last check.
    fn poll_exit(&mut self) -> Option<String> {
        match self.handle.as_mut()? {
            Handle::Spawned(child) => match child.try_wait() {
                Ok(Some(status)) => Some(format!("exited with {status}")),
                Ok(None) => None,
                Err(e) => Some(format!("could not be waited on: {e}")),
            },
            Handle::Adopted(pid) => {
                (!os::is_process_running(*pid)).then(|| "adopted process exited".to_string())
            }
        }
    }

    fn mark_crashed(&mut self, reason: String) {
        warn!(
            kind = %self.kind,
            name = %self.name,
            pid = ?self.pid,
            incarnation = self.incarnation,
            "Subprocess {}",
            reason
        );
        self.handle = None;
        self.state = ProcessState::Crashed;
        self.last_error = Some(reason);
    }
}

/// Outcome of a start or stop request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    pub pid: Option<u32>,
    /// False when the profile was already in the requested state
    pub changed: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReloadOutcome {
    pub report: ReloadReport,
    pub warnings: Vec<String>,
}

/// Update states from the OS: detect exits and promote settled spawns.
fn reap(records: &mut BTreeMap<ProfileKey, ManagedProcess>) {
    for record in records.values_mut() {
        if let Some(reason) = record.poll_exit() {
            record.mark_crashed(reason);
        } else if record.state == ProcessState::Starting
            && record
                .started
                .is_some_and(|t| t.elapsed() >= STARTUP_OBSERVATION)
        {
            record.state = ProcessState::Running;
        }
    }
}

fn is_live(records: &BTreeMap<ProfileKey, ManagedProcess>, kind: ProfileKind, name: &str) -> bool {
    records
        .get(&(kind, name.to_string()))
        .is_some_and(|r| r.state.is_running())
}

/// The process registry: one record per subprocess the supervisor is responsible for.
pub struct ProcessManager {
    records: RwLock<BTreeMap<ProfileKey, ManagedProcess>>,
    /// Serializes start/stop/reload/recovery so transitions never interleave
    lifecycle: Mutex<()>,
    config: std::sync::RwLock<Arc<LabConfig>>,
    settings: SupervisorSettings,
    policy: CrashPolicy,
    launcher: Arc<dyn Launcher>,
    logs: Arc<LogBuffer>,
    paths: ProcessPaths,
    incarnations: std::sync::Mutex<HashMap<ProfileKey, u32>>,
    pending_renames: std::sync::Mutex<Vec<(ProfileKind, String, String)>>,
}

impl ProcessManager {
    /// Create a registry and commit `config` as the running configuration.
    pub fn new(
        config: LabConfig,
        settings: SupervisorSettings,
        launcher: Arc<dyn Launcher>,
        paths: ProcessPaths,
    ) -> Result<Self> {
        let manager = Self {
            records: RwLock::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
            config: std::sync::RwLock::new(Arc::new(LabConfig::default())),
            policy: CrashPolicy::from_settings(&settings),
            logs: Arc::new(LogBuffer::new(settings.log_lines)),
            settings,
            launcher,
            paths,
            incarnations: std::sync::Mutex::new(HashMap::new()),
            pending_renames: std::sync::Mutex::new(Vec::new()),
        };
        manager.commit(config)?;
        Ok(manager)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn log_buffer(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// The committed configuration.
    pub fn config(&self) -> Arc<LabConfig> {
        Arc::clone(&self.config.read().expect("config lock poisoned"))
    }

    /// Persist `config` as the snapshot subprocesses read and make it current.
    pub fn commit(&self, config: LabConfig) -> Result<()> {
        config.save(&self.paths.runtime_config, RenderView::Merged)?;
        *self.config.write().expect("config lock poisoned") = Arc::new(config);
        debug!(path = %self.paths.runtime_config.display(), "Committed configuration");
        Ok(())
    }

    pub async fn start(&self, kind: ProfileKind, name: &str) -> Result<Transition> {
        let _lifecycle = self.lifecycle.lock().await;
        let config = self.config();
        if !config.contains(kind, name) {
            return Err(LabError::UnknownProfile {
                kind,
                name: name.to_string(),
            });
        }

        let key = (kind, name.to_string());
        let mut records = self.records.write().await;
        let warnings = missing_nameservers(&config, &records, kind, name);

        let record = records
            .entry(key.clone())
            .or_insert_with(|| ManagedProcess::new(kind, name));
        if let Some(reason) = record.poll_exit() {
            record.mark_crashed(reason);
        }
        if record.state.is_running() {
            debug!(%kind, name, "Already running");
            return Ok(Transition {
                pid: record.pid,
                changed: false,
                warnings,
            });
        }
        if record.crash_looped {
            info!(%kind, name, "Clearing crash-loop flag on operator start");
        }
        record.crash_looped = false;
        record.crashes.clear();
        self.spawn_into(record)?;
        drop(records);

        for warning in &warnings {
            warn!("{}", warning);
        }
        let pid = self.observe_startup(&key).await?;
        Ok(Transition {
            pid,
            changed: true,
            warnings,
        })
    }

    /// Wait out the startup window and report an immediate exit as a failure.
    async fn observe_startup(&self, key: &ProfileKey) -> Result<Option<u32>> {
        tokio::time::sleep(STARTUP_OBSERVATION).await;
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(None);
        };
        if let Some(reason) = record.poll_exit() {
            record.mark_crashed(reason.clone());
            let (kind, name) = key;
            return Err(LabError::Internal(format!(
                "{kind} '{name}' {reason} during startup; see `lab logs {kind} {name}`"
            )));
        }
        if record.state == ProcessState::Starting {
            record.state = ProcessState::Running;
        }
        Ok(record.pid)
    }

    pub async fn stop(&self, kind: ProfileKind, name: &str) -> Result<Transition> {
        let _lifecycle = self.lifecycle.lock().await;
        let config = self.config();
        let removed = self.records.write().await.remove(&(kind, name.to_string()));

        let Some(mut record) = removed else {
            if config.contains(kind, name) {
                return Ok(Transition::default());
            }
            return Err(LabError::UnknownProfile {
                kind,
                name: name.to_string(),
            });
        };

        let pid = record.pid;
        let changed = record.handle.is_some();
        self.terminate(&mut record).await;
        self.remove_pid_file(kind, name);

        let mut warnings = Vec::new();
        if kind == ProfileKind::Nameserver {
            let records = self.records.read().await;
            for daemon in config.nameserver_dependents(name) {
                if is_live(&records, ProfileKind::Daemon, &daemon) {
                    warnings.push(format!(
                        "daemon '{daemon}' is still running and depends on nameserver '{name}'"
                    ));
                }
            }
        }
        for warning in &warnings {
            warn!("{}", warning);
        }

        Ok(Transition {
            pid,
            changed,
            warnings,
        })
    }

    pub async fn status(&self, target: &StatusTarget) -> Result<Vec<ProcessSnapshot>> {
        let config = self.config();
        let mut records = self.records.write().await;
        reap(&mut records);

        let snapshot = |kind: ProfileKind, name: &str| {
            records
                .get(&(kind, name.to_string()))
                .map(ManagedProcess::snapshot)
                .unwrap_or_else(|| ProcessSnapshot::stopped(kind, name))
        };

        match target {
            StatusTarget::All => {
                let mut out = Vec::new();
                for kind in [ProfileKind::Nameserver, ProfileKind::Daemon] {
                    for name in config.names(kind) {
                        out.push(snapshot(kind, &name));
                    }
                }
                // Renamed or removed profiles still running until the next reload
                out.extend(
                    records
                        .iter()
                        .filter(|((kind, name), _)| !config.contains(*kind, name))
                        .map(|(_, record)| record.snapshot()),
                );
                out.sort_by_key(|s| s.kind);
                Ok(out)
            }
            StatusTarget::One { kind, name } => {
                if !config.contains(*kind, name) && !records.contains_key(&(*kind, name.clone())) {
                    return Err(LabError::UnknownProfile {
                        kind: *kind,
                        name: name.clone(),
                    });
                }
                Ok(vec![snapshot(*kind, name)])
            }
        }
    }

    /// Reconcile running subprocesses with a newly loaded configuration.
    pub async fn reload(&self, next: LabConfig) -> Result<ReloadOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        let previous = self.config();
        let renames = std::mem::take(
            &mut *self
                .pending_renames
                .lock()
                .expect("pending renames lock poisoned"),
        );
        self.commit(next)?;
        let current = self.config();

        let mut outcome = ReloadOutcome::default();
        let mut to_stop: Vec<ProfileKey> = Vec::new();
        let mut to_spawn: Vec<(ProfileKey, ProfileKey)> = Vec::new();
        {
            let mut records = self.records.write().await;
            reap(&mut records);
            for (key, record) in records.iter() {
                let (kind, name) = (key.0, key.1.as_str());
                let live = record.state.is_running();
                let renamed_to = renames
                    .iter()
                    .find(|(k, old, _)| *k == kind && old == name)
                    .map(|(_, _, new)| new.clone())
                    .filter(|new| current.contains(kind, new));

                if let Some(new) = renamed_to {
                    to_stop.push(key.clone());
                    if live {
                        to_spawn.push((key.clone(), (kind, new)));
                    }
                } else if !current.contains(kind, name) {
                    to_stop.push(key.clone());
                    if live {
                        outcome.report.stopped.push(profile_ref(key));
                    }
                } else if previous.fingerprint(kind, name) != current.fingerprint(kind, name) {
                    if live {
                        to_stop.push(key.clone());
                        to_spawn.push((key.clone(), key.clone()));
                    }
                } else if live {
                    outcome.report.unchanged.push(profile_ref(key));
                }
            }
        }

        // Daemons go down before the nameservers they register with
        to_stop.sort_by(|a, b| b.0.cmp(&a.0));
        for key in &to_stop {
            let removed = self.records.write().await.remove(key);
            if let Some(mut record) = removed {
                info!(kind = %key.0, name = %key.1, "Stopping for reload");
                self.terminate(&mut record).await;
                self.remove_pid_file(key.0, &key.1);
            }
        }

        to_spawn.sort_by(|a, b| a.1 .0.cmp(&b.1 .0));
        for (old, new) in &to_spawn {
            if old != new {
                self.logs.rename(old.0, &old.1, &new.1);
            }
            let mut records = self.records.write().await;
            let record = records
                .entry(new.clone())
                .or_insert_with(|| ManagedProcess::new(new.0, &new.1));
            match self.spawn_into(record) {
                Ok(()) => outcome.report.restarted.push(profile_ref(new)),
                Err(e) => outcome.warnings.push(e.to_string()),
            }
        }

        if !to_spawn.is_empty() {
            tokio::time::sleep(STARTUP_OBSERVATION).await;
            let mut records = self.records.write().await;
            reap(&mut records);
            for (_, new) in &to_spawn {
                if let Some(record) = records.get(new) {
                    if record.state == ProcessState::Crashed {
                        outcome.warnings.push(format!(
                            "{} '{}' exited right after restart; see `lab logs {} {}`",
                            new.0, new.1, new.0, new.1
                        ));
                    }
                }
            }
        }

        info!(
            stopped = outcome.report.stopped.len(),
            restarted = outcome.report.restarted.len(),
            unchanged = outcome.report.unchanged.len(),
            "Reload complete"
        );
        Ok(outcome)
    }

    /// Remember a rename applied to the user configuration; the running
    /// process moves to its new name at the next reload.
    pub fn note_rename(&self, kind: ProfileKind, old: &str, new: &str) {
        let mut pending = self
            .pending_renames
            .lock()
            .expect("pending renames lock poisoned");
        if let Some(chained) = pending
            .iter_mut()
            .find(|(k, _, target)| *k == kind && target == old)
        {
            chained.2 = new.to_string();
            return;
        }
        pending.push((kind, old.to_string(), new.to_string()));
    }

    /// Start every profile in the autolaunch set, nameservers first.
    /// Returns one message per profile that failed to start.
    pub async fn autolaunch(&self) -> Vec<String> {
        let config = self.config();
        let mut failures = Vec::new();
        let ordered = [
            (ProfileKind::Nameserver, &config.autolaunch.nameservers),
            (ProfileKind::Daemon, &config.autolaunch.daemons),
        ];
        for (kind, names) in ordered {
            for name in names {
                info!(%kind, name = %name, "Auto-starting");
                if let Err(e) = self.start(kind, name).await {
                    warn!(%kind, name = %name, "Failed to auto-start: {}", e);
                    failures.push(format!("{kind} '{name}': {e}"));
                }
            }
        }
        failures
    }

    /// Take over subprocesses left running by a previous supervisor.
    pub async fn adopt(&self) -> usize {
        let config = self.config();
        let Ok(entries) = std::fs::read_dir(&self.paths.run_dir) else {
            return 0;
        };

        let mut records = self.records.write().await;
        let mut adopted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let parsed = std::fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<PidRecord>(&raw).ok());
            let Some(pid_record) = parsed else {
                let _ = std::fs::remove_file(&path);
                continue;
            };

            let alive = os::is_process_running(pid_record.pid)
                && self
                    .launcher
                    .recognizes(pid_record.pid, pid_record.kind, &pid_record.name);
            let key = (pid_record.kind, pid_record.name.clone());
            if !alive || !config.contains(key.0, &key.1) || records.contains_key(&key) {
                if alive {
                    warn!(
                        kind = %key.0,
                        name = %key.1,
                        pid = pid_record.pid,
                        "Leaving unconfigured survivor alone"
                    );
                }
                let _ = std::fs::remove_file(&path);
                continue;
            }

            {
                let mut incarnations = self.incarnations.lock().expect("incarnation lock poisoned");
                let counter = incarnations.entry(key.clone()).or_insert(0);
                *counter = (*counter).max(pid_record.incarnation);
            }
            info!(
                kind = %key.0,
                name = %key.1,
                pid = pid_record.pid,
                "Adopted running subprocess"
            );
            records.insert(key, ManagedProcess::adopted(&pid_record));
            adopted += 1;
        }
        adopted
    }

    /// One recovery pass: reap exits and respawn crashed profiles under the
    /// crash policy. Returns the number of respawns.
    pub async fn recover(&self) -> usize {
        let _lifecycle = self.lifecycle.lock().await;
        let config = self.config();
        let mut records = self.records.write().await;
        reap(&mut records);

        let crashed: Vec<ProfileKey> = records
            .iter()
            .filter(|(_, r)| r.state == ProcessState::Crashed)
            .map(|(key, _)| key.clone())
            .collect();

        let now = Instant::now();
        let mut restarted = 0;
        for key in crashed {
            if !config.contains(key.0, &key.1) {
                records.remove(&key);
                continue;
            }
            let Some(record) = records.get_mut(&key) else {
                continue;
            };
            match self.policy.record_crash(&mut record.crashes, now) {
                CrashVerdict::Restart => {
                    record.restarts += 1;
                    info!(
                        kind = %key.0,
                        name = %key.1,
                        restarts = record.restarts,
                        "Restarting crashed subprocess"
                    );
                    match self.spawn_into(record) {
                        Ok(()) => restarted += 1,
                        Err(e) => error!(kind = %key.0, name = %key.1, "Restart failed: {}", e),
                    }
                }
                CrashVerdict::GiveUp { crashes } => {
                    let err = LabError::SubprocessCrashLoop {
                        kind: key.0,
                        name: key.1.clone(),
                        crashes,
                        window_secs: self.policy.window.as_secs(),
                    };
                    error!("{}", err);
                    record.state = ProcessState::Stopped;
                    record.crash_looped = true;
                    record.last_error = Some(err.to_string());
                    self.remove_pid_file(key.0, &key.1);
                }
            }
        }
        restarted
    }

    /// Stop everything, daemons before nameservers.
    pub async fn stop_all(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let records = std::mem::take(&mut *self.records.write().await);
        let mut ordered: Vec<(ProfileKey, ManagedProcess)> = records.into_iter().collect();
        ordered.sort_by(|a, b| b.0 .0.cmp(&a.0 .0));

        for ((kind, name), mut record) in ordered {
            if record.handle.is_some() {
                info!(%kind, name = %name, "Stopping");
            }
            self.terminate(&mut record).await;
            self.remove_pid_file(kind, &name);
        }
    }

    pub async fn logs(&self, kind: ProfileKind, name: &str, lines: usize) -> Result<Vec<String>> {
        let known = self.config().contains(kind, name)
            || self.records.read().await.contains_key(&(kind, name.to_string()));
        if !known {
            return Err(LabError::UnknownProfile {
                kind,
                name: name.to_string(),
            });
        }
        Ok(self.logs.tail(kind, name, lines))
    }

    fn next_incarnation(&self, kind: ProfileKind, name: &str) -> u32 {
        let mut incarnations = self.incarnations.lock().expect("incarnation lock poisoned");
        let counter = incarnations.entry((kind, name.to_string())).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Spawn the subprocess for `record`, leaving it `starting`.
    fn spawn_into(&self, record: &mut ManagedProcess) -> Result<()> {
        let (kind, name) = (record.kind, record.name.clone());
        let incarnation = self.next_incarnation(kind, &name);

        let mut cmd = self
            .launcher
            .command(kind, &name, &self.paths.runtime_config);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Own process group: a Ctrl+C aimed at a foreground supervisor must
        // not reach the children before the ordered shutdown does.
        #[cfg(unix)]
        cmd.process_group(0);

        match cmd.spawn() {
            Ok(mut child) => {
                let pid = child.id();
                info!(%kind, name = %name, ?pid, incarnation, "Spawned subprocess");
                spawn_log_readers(
                    kind,
                    &name,
                    format!("[{incarnation}:{}]", pid.unwrap_or_default()),
                    &mut child,
                    &self.logs,
                    &self.paths.log_file(kind, &name),
                );

                let started_at = Utc::now();
                record.handle = Some(Handle::Spawned(child));
                record.pid = pid;
                record.state = ProcessState::Starting;
                record.started_at = Some(started_at);
                record.started = Some(Instant::now());
                record.incarnation = incarnation;
                record.last_error = None;

                if let Some(pid) = pid {
                    self.write_pid_file(&PidRecord {
                        kind,
                        name,
                        pid,
                        incarnation,
                        started_at,
                    });
                }
                Ok(())
            }
            Err(e) => {
                let reason = format!("failed to spawn: {e}");
                record.mark_crashed(reason.clone());
                record.pid = None;
                Err(LabError::Internal(format!("{kind} '{name}' {reason}")))
            }
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, record: &mut ManagedProcess) {
        let (kind, name) = (record.kind, record.name.as_str());
        let grace = self.settings.stop_grace();

        match record.handle.take() {
            None => {}
            Some(Handle::Spawned(mut child)) => {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    os::send_signal(pid, Signal::Terminate);
                }
                #[cfg(not(unix))]
                if let Err(e) = child.start_kill() {
                    warn!(%kind, name, "Failed to signal subprocess: {}", e);
                }

                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!(%kind, name, %status, "Subprocess stopped"),
                    Ok(Err(e)) => warn!(%kind, name, "Failed to wait for subprocess: {}", e),
                    Err(_) => {
                        warn!(%kind, name, "Did not stop within {:?}, killing", grace);
                        if let Err(e) = child.kill().await {
                            warn!(%kind, name, "Failed to kill subprocess: {}", e);
                        }
                    }
                }
            }
            Some(Handle::Adopted(pid)) => {
                os::send_signal(pid, Signal::Terminate);
                let deadline = Instant::now() + grace;
                while os::is_process_running(pid) && Instant::now() < deadline {
                    tokio::time::sleep(ADOPTED_POLL).await;
                }
                if os::is_process_running(pid) {
                    warn!(%kind, name, pid, "Did not stop within {:?}, killing", grace);
                    os::send_signal(pid, Signal::Kill);
                }
            }
        }

        record.state = ProcessState::Stopped;
    }

    fn write_pid_file(&self, record: &PidRecord) {
        let path = self.paths.pid_file(record.kind, &record.name);
        let written = std::fs::create_dir_all(&self.paths.run_dir).and_then(|_| {
            let body = serde_json::to_vec(record).map_err(std::io::Error::other)?;
            std::fs::write(&path, body)
        });
        if let Err(e) = written {
            warn!(path = %path.display(), "Failed to write PID file: {}", e);
        }
    }

    fn remove_pid_file(&self, kind: ProfileKind, name: &str) {
        let path = self.paths.pid_file(kind, name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "Failed to remove PID file: {}", e),
        }
    }
}

fn profile_ref(key: &ProfileKey) -> ProfileRef {
    ProfileRef {
        kind: key.0,
        name: key.1.clone(),
    }
}

/// Nameservers a daemon depends on that have no live process.
fn missing_nameservers(
    config: &LabConfig,
    records: &BTreeMap<ProfileKey, ManagedProcess>,
    kind: ProfileKind,
    name: &str,
) -> Vec<String> {
    if kind != ProfileKind::Daemon {
        return Vec::new();
    }
    config
        .daemon_dependencies(name)
        .into_iter()
        .filter(|ns| !is_live(records, ProfileKind::Nameserver, ns))
        .map(|ns| format!("daemon '{name}' depends on nameserver '{ns}', which is not running"))
        .collect()
}

/// Capture stdout/stderr into the log buffer and the profile's log file.
fn spawn_log_readers(
    kind: ProfileKind,
    name: &str,
    prefix: String,
    child: &mut Child,
    logs: &Arc<LogBuffer>,
    log_path: &Path,
) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(
            stdout,
            kind,
            name.to_string(),
            prefix.clone(),
            Arc::clone(logs),
            log_path.to_path_buf(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(
            stderr,
            kind,
            name.to_string(),
            prefix,
            Arc::clone(logs),
            log_path.to_path_buf(),
        ));
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    kind: ProfileKind,
    name: String,
    prefix: String,
    logs: Arc<LogBuffer>,
    log_path: PathBuf,
) {
    let mut file = match open_log(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %log_path.display(), "Failed to open log file: {}", e);
            None
        }
    };

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = format!("{prefix} {line}");
        let failed = match file.as_mut() {
            Some(f) => f
                .write_all(format!("{}\n", log_files::stamp(&line)).as_bytes())
                .await
                .err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!(path = %log_path.display(), "Log file write failed, keeping memory only: {}", e);
            file = None;
        }
        logs.push(kind, &name, line);
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{DaemonProfile, DaemonVariant, DEFAULT_PROFILE};

    /// Every profile runs as a long `sleep`.
    struct SleepLauncher;

    impl Launcher for SleepLauncher {
        fn command(&self, _kind: ProfileKind, _name: &str, _config: &Path) -> Command {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            cmd
        }

        fn recognizes(&self, _pid: u32, _kind: ProfileKind, _name: &str) -> bool {
            true
        }
    }

    /// Prints one line, then sleeps.
    struct ChattyLauncher;

    impl Launcher for ChattyLauncher {
        fn command(&self, kind: ProfileKind, name: &str, _config: &Path) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(format!("echo hello from {kind} {name}; exec sleep 30"));
            cmd
        }
    }

    fn lab_config() -> LabConfig {
        let mut config = LabConfig::default();
        config.daemons.insert(
            "lockable".into(),
            DaemonProfile {
                variant: DaemonVariant::Lockable,
                nameservers: vec![DEFAULT_PROFILE.into()],
                ..Default::default()
            },
        );
        config.autolaunch.nameservers.push(DEFAULT_PROFILE.into());
        config.autolaunch.daemons.push("lockable".into());
        config
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            stop_grace_secs: 2,
            ..Default::default()
        }
    }

    fn manager_with(
        dir: &Path,
        config: LabConfig,
        settings: SupervisorSettings,
        launcher: Arc<dyn Launcher>,
    ) -> ProcessManager {
        ProcessManager::new(config, settings, launcher, ProcessPaths::under(dir)).unwrap()
    }

    fn manager(dir: &Path) -> ProcessManager {
        manager_with(dir, lab_config(), settings(), Arc::new(SleepLauncher))
    }

    async fn one(manager: &ProcessManager, kind: ProfileKind, name: &str) -> ProcessSnapshot {
        manager
            .status(&StatusTarget::One {
                kind,
                name: name.into(),
            })
            .await
            .unwrap()
            .remove(0)
    }

    async fn kill_externally(manager: &ProcessManager, kind: ProfileKind, name: &str) {
        let pid = one(manager, kind, name).await.pid.unwrap();
        assert!(os::send_signal(pid, Signal::Kill));
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn autolaunch_starts_nameservers_first() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.autolaunch().await.is_empty());

        let all = manager.status(&StatusTarget::All).await.unwrap();
        let ns = all.iter().find(|s| s.kind == ProfileKind::Nameserver).unwrap();
        let daemon = all.iter().find(|s| s.name == "lockable").unwrap();
        assert_eq!(ns.state, ProcessState::Running);
        assert_eq!(daemon.state, ProcessState::Running);
        assert!(ns.started_at_ms.unwrap() <= daemon.started_at_ms.unwrap());

        // built-in daemon is configured but not autolaunched
        let builtin = all
            .iter()
            .find(|s| s.kind == ProfileKind::Daemon && s.name == DEFAULT_PROFILE)
            .unwrap();
        assert_eq!(builtin.state, ProcessState::Stopped);
        assert!(dir.path().join("runtime.yaml").exists());
        assert!(dir.path().join("run").join("daemon-lockable.pid").exists());

        manager.stop_all().await;
        assert!(!dir.path().join("run").join("daemon-lockable.pid").exists());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let first = manager.start(ProfileKind::Nameserver, "default").await.unwrap();
        let second = manager.start(ProfileKind::Nameserver, "default").await.unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(first.pid, second.pid);

        let all = manager.status(&StatusTarget::All).await.unwrap();
        let running: Vec<_> = all.iter().filter(|s| s.state.is_running()).collect();
        assert_eq!(running.len(), 1);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn unknown_profiles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.start(ProfileKind::Daemon, "ghost").await.unwrap_err();
        assert!(matches!(err, LabError::UnknownProfile { .. }));
        let err = manager.stop(ProfileKind::Daemon, "ghost").await.unwrap_err();
        assert!(matches!(err, LabError::UnknownProfile { .. }));
        let err = manager
            .status(&StatusTarget::One {
                kind: ProfileKind::Nameserver,
                name: "ghost".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::UnknownProfile { .. }));

        // configured but stopped is not an error
        let stopped = manager.stop(ProfileKind::Daemon, "lockable").await.unwrap();
        assert!(!stopped.changed);
    }

    #[tokio::test]
    async fn starting_a_daemon_without_its_nameserver_warns() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let started = manager.start(ProfileKind::Daemon, "lockable").await.unwrap();
        assert!(started.changed);
        assert_eq!(started.warnings.len(), 1);
        assert!(started.warnings[0].contains("'default'"));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn stopping_a_nameserver_warns_about_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.autolaunch().await;

        let stopped = manager.stop(ProfileKind::Nameserver, "default").await.unwrap();
        assert!(stopped.changed);
        assert_eq!(stopped.warnings.len(), 1);
        assert!(stopped.warnings[0].contains("lockable"));

        let ns = one(&manager, ProfileKind::Nameserver, "default").await;
        assert_eq!(ns.state, ProcessState::Stopped);
        let daemon = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(daemon.state, ProcessState::Running);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn crashed_subprocess_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let first = manager.start(ProfileKind::Daemon, "lockable").await.unwrap();

        kill_externally(&manager, ProfileKind::Daemon, "lockable").await;
        let crashed = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(crashed.state, ProcessState::Crashed);
        assert!(crashed.last_error.is_some());

        assert_eq!(manager.recover().await, 1);
        tokio::time::sleep(STARTUP_OBSERVATION + Duration::from_millis(50)).await;

        let recovered = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(recovered.state, ProcessState::Running);
        assert_eq!(recovered.restarts, 1);
        assert_eq!(recovered.incarnation, 2);
        assert_ne!(recovered.pid, first.pid);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn crash_loop_leaves_profile_stopped_until_started() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SupervisorSettings {
            crash_ceiling: 1,
            ..settings()
        };
        let manager = manager_with(dir.path(), lab_config(), settings, Arc::new(SleepLauncher));
        manager.start(ProfileKind::Daemon, "lockable").await.unwrap();

        kill_externally(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(manager.recover().await, 1);

        kill_externally(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(manager.recover().await, 0);

        let flagged = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(flagged.state, ProcessState::Stopped);
        assert!(flagged.crash_looped);
        assert!(flagged.last_error.unwrap().contains("crashed 2 times"));

        // further passes leave it alone
        assert_eq!(manager.recover().await, 0);

        manager.start(ProfileKind::Daemon, "lockable").await.unwrap();
        let cleared = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert_eq!(cleared.state, ProcessState::Running);
        assert!(!cleared.crash_looped);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn reload_without_changes_restarts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.autolaunch().await;
        let before = manager.status(&StatusTarget::All).await.unwrap();

        let outcome = manager.reload(lab_config()).await.unwrap();
        assert!(outcome.report.restarted.is_empty());
        assert!(outcome.report.stopped.is_empty());
        assert_eq!(outcome.report.unchanged.len(), 2);

        let after = manager.status(&StatusTarget::All).await.unwrap();
        let pids = |s: &[ProcessSnapshot]| s.iter().map(|p| p.pid).collect::<Vec<_>>();
        assert_eq!(pids(&before), pids(&after));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn reload_stops_only_removed_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = lab_config();
        config.daemons.insert("bench".into(), DaemonProfile::default());
        config.autolaunch.daemons.push("bench".into());
        let manager = manager_with(dir.path(), config, settings(), Arc::new(SleepLauncher));
        manager.autolaunch().await;

        let outcome = manager.reload(lab_config()).await.unwrap();
        assert_eq!(
            outcome.report.stopped,
            vec![ProfileRef {
                kind: ProfileKind::Daemon,
                name: "bench".into()
            }]
        );
        assert!(outcome.report.restarted.is_empty());
        assert_eq!(outcome.report.unchanged.len(), 2);
        assert_eq!(
            one(&manager, ProfileKind::Daemon, "lockable").await.state,
            ProcessState::Running
        );

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn reload_restarts_changed_and_renamed_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        manager.autolaunch().await;
        let before = one(&manager, ProfileKind::Daemon, "lockable").await;

        let mut next = lab_config();
        next.rename(ProfileKind::Daemon, "lockable", "bench").unwrap();
        manager.note_rename(ProfileKind::Daemon, "lockable", "bench");

        // still running under the old name until reload
        assert_eq!(
            one(&manager, ProfileKind::Daemon, "lockable").await.state,
            ProcessState::Running
        );

        let outcome = manager.reload(next.clone()).await.unwrap();
        assert_eq!(
            outcome.report.restarted,
            vec![ProfileRef {
                kind: ProfileKind::Daemon,
                name: "bench".into()
            }]
        );
        assert!(outcome.warnings.is_empty());
        let renamed = one(&manager, ProfileKind::Daemon, "bench").await;
        assert!(renamed.state.is_running());
        assert_ne!(renamed.pid, before.pid);
        assert!(manager
            .status(&StatusTarget::One {
                kind: ProfileKind::Daemon,
                name: "lockable".into()
            })
            .await
            .is_err());

        let mut changed = next;
        changed.nameservers.get_mut(DEFAULT_PROFILE).unwrap().port = 9190;
        let outcome = manager.reload(changed).await.unwrap();
        // the nameserver changed, and so did the daemon registering with it
        assert_eq!(outcome.report.restarted.len(), 2);
        assert_eq!(outcome.report.restarted[0].kind, ProfileKind::Nameserver);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn survivors_are_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let mut survivor = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let paths = ProcessPaths::under(dir.path());
        std::fs::create_dir_all(&paths.run_dir).unwrap();
        let record = PidRecord {
            kind: ProfileKind::Daemon,
            name: "lockable".into(),
            pid: survivor.id(),
            incarnation: 4,
            started_at: Utc::now(),
        };
        std::fs::write(
            paths.pid_file(ProfileKind::Daemon, "lockable"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
        std::fs::write(paths.run_dir.join("daemon-junk.pid"), "garbage").unwrap();

        let settings = SupervisorSettings {
            stop_grace_secs: 1,
            ..Default::default()
        };
        let manager = manager_with(dir.path(), lab_config(), settings, Arc::new(SleepLauncher));
        assert_eq!(manager.adopt().await, 1);
        assert!(!paths.run_dir.join("daemon-junk.pid").exists());

        let adopted = one(&manager, ProfileKind::Daemon, "lockable").await;
        assert!(adopted.adopted);
        assert_eq!(adopted.state, ProcessState::Running);
        assert_eq!(adopted.pid, Some(survivor.id()));
        assert_eq!(adopted.restarts, 0);

        let again = manager.start(ProfileKind::Daemon, "lockable").await.unwrap();
        assert!(!again.changed);

        manager.stop(ProfileKind::Daemon, "lockable").await.unwrap();
        survivor.wait().unwrap();
    }

    #[tokio::test]
    async fn output_is_captured_with_incarnation_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_with(dir.path(), lab_config(), settings(), Arc::new(ChattyLauncher));
        let started = manager.start(ProfileKind::Nameserver, "default").await.unwrap();

        let lines = manager.logs(ProfileKind::Nameserver, "default", 10).await.unwrap();
        let expected = format!("[1:{}] hello from nameserver default", started.pid.unwrap());
        assert_eq!(lines, vec![expected.clone()]);

        manager.stop_all().await;
        let file = std::fs::read_to_string(dir.path().join("logs").join("nameserver-default.log"))
            .unwrap();
        assert!(file.contains(&expected));
        assert!(manager.logs(ProfileKind::Daemon, "ghost", 10).await.is_err());
    }
}
