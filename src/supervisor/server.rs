use super::health::HealthManager;
use super::lockfile::Lockfile;
use super::processes::{Launcher, ProcessManager, ProcessPaths, SelfLauncher};
use super::protocol::{
    profile_kind, ArchivedRequest, ArchivedStatusTarget, MessageFrame, Payload, Response,
    StatusTarget,
};
use crate::clienv;
use crate::config::{ConfigLoader, LabConfig, ProfileKind, RenderView};
use crate::error::LabError;
use crate::settings::SupervisorSettings;
use anyhow::Result;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub struct SupervisorOptions {
    pub socket_path: PathBuf,
    pub lockfile_path: PathBuf,
    /// Operator-edited configuration, re-read on reload and edited by rename
    pub user_config_path: PathBuf,
    pub paths: ProcessPaths,
    pub settings: SupervisorSettings,
    /// Take over a lockfile held by a live process
    pub force: bool,
}

impl SupervisorOptions {
    pub fn from_env(settings: SupervisorSettings, force: bool) -> Self {
        Self {
            socket_path: clienv::supervisor_socket_path(),
            lockfile_path: clienv::lockfile_path(),
            user_config_path: clienv::user_config_path(),
            paths: ProcessPaths::default(),
            settings,
            force,
        }
    }
}

pub struct Supervisor {
    socket_path: PathBuf,
    user_config_path: PathBuf,
    manager: Arc<ProcessManager>,
    loader: ConfigLoader,
    lockfile: Lockfile,
    started_at: Instant,
    version: String,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Claim the lockfile, load the configuration, adopt survivors and
    /// autolaunch. The control-plane listener starts in [`Supervisor::serve`].
    pub async fn start(
        options: SupervisorOptions,
        launcher: Arc<dyn Launcher>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        info!("Supervisor starting...");

        let lockfile = Lockfile::acquire(&options.lockfile_path, &options.socket_path, options.force)?;

        let loader = ConfigLoader::new().strict(options.settings.strict_config);
        let config = loader.load_file_or_default(&options.user_config_path)?;
        info!(
            nameservers = config.nameservers.len(),
            daemons = config.daemons.len(),
            services = config.services.len(),
            "Configuration loaded from {}",
            options.user_config_path.display()
        );

        let manager = Arc::new(ProcessManager::new(
            config,
            options.settings,
            launcher,
            options.paths,
        )?);

        let adopted = manager.adopt().await;
        if adopted > 0 {
            info!("Adopted {} running subprocess(es)", adopted);
        }

        if !shutdown.is_cancelled() {
            for failure in manager.autolaunch().await {
                warn!("Autolaunch: {}", failure);
            }
        }

        Ok(Self {
            socket_path: options.socket_path,
            user_config_path: options.user_config_path,
            manager,
            loader,
            lockfile,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown,
        })
    }

    /// Run the control-plane listener until shutdown, then stop every
    /// subprocess and release the lockfile.
    pub async fn serve(self) -> Result<()> {
        let listener = match self.bind_control().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Control plane unavailable: {}", e);
                self.manager.stop_all().await;
                self.lockfile.release();
                return Err(e);
            }
        };

        let health = HealthManager::new(Arc::clone(&self.manager));
        let health_task = tokio::spawn(health.run(self.shutdown.child_token()));

        let server = Arc::new(self);
        info!("Supervisor ready (PID {})", std::process::id());

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = server.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        drop(listener);
        let _ = health_task.await;

        info!("Stopping all subprocesses...");
        server.manager.stop_all().await;

        #[cfg(unix)]
        if server.socket_path.exists() {
            std::fs::remove_file(&server.socket_path)?;
        }
        server.lockfile.release();

        info!("Supervisor stopped");
        Ok(())
    }

    #[cfg(unix)]
    async fn bind_control(&self) -> Result<tokio::net::UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = tokio::net::UnixListener::bind(&self.socket_path)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!("Control plane listening on: {}", self.socket_path.display());
        Ok(listener)
    }

    #[cfg(not(unix))]
    async fn bind_control(&self) -> Result<tokio::net::TcpListener> {
        let port = clienv::supervisor_tcp_port();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
        info!("Control plane listening on: 127.0.0.1:{}", port);
        Ok(listener)
    }

    async fn handle_connection<S>(self: Arc<Self>, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("New connection accepted");

        let body = MessageFrame::read(&mut stream).await?;
        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&body)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let response = self.handle_request(archived).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(self: &Arc<Self>, request: &ArchivedRequest) -> Response {
        match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                Response::success("pong").with_payload(Payload::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                    pid: std::process::id(),
                })
            }

            ArchivedRequest::Shutdown => {
                info!("Handling: Shutdown");
                self.shutdown.cancel();
                Response::success("Supervisor shutting down")
            }

            ArchivedRequest::Start { kind, name } => {
                let (kind, name) = (profile_kind(kind), name.to_string());
                debug!("Handling: Start({} {})", kind, name);
                let server = Arc::clone(self);
                self.bounded(format!("start {kind} {name}"), async move {
                    match server.manager.start(kind, &name).await {
                        Ok(t) if t.changed => {
                            Response::success(format!("Started {kind} '{name}'{}", pid_suffix(t.pid)))
                                .with_warnings(t.warnings)
                        }
                        Ok(t) => Response::success(format!(
                            "{kind} '{name}' is already running{}",
                            pid_suffix(t.pid)
                        ))
                        .with_warnings(t.warnings),
                        Err(e) => Response::failure(&e),
                    }
                })
                .await
            }

            ArchivedRequest::Stop { kind, name } => {
                let (kind, name) = (profile_kind(kind), name.to_string());
                debug!("Handling: Stop({} {})", kind, name);
                let server = Arc::clone(self);
                self.bounded(format!("stop {kind} {name}"), async move {
                    match server.manager.stop(kind, &name).await {
                        Ok(t) if t.changed => Response::success(format!(
                            "Stopped {kind} '{name}'{}",
                            pid_suffix(t.pid)
                        ))
                        .with_warnings(t.warnings),
                        Ok(t) => Response::success(format!("{kind} '{name}' is not running"))
                            .with_warnings(t.warnings),
                        Err(e) => Response::failure(&e),
                    }
                })
                .await
            }

            ArchivedRequest::Status { target } => {
                let target = match target {
                    ArchivedStatusTarget::All => StatusTarget::All,
                    ArchivedStatusTarget::One { kind, name } => StatusTarget::One {
                        kind: profile_kind(kind),
                        name: name.to_string(),
                    },
                };
                debug!("Handling: Status({:?})", target);
                let server = Arc::clone(self);
                self.bounded("status".to_string(), async move {
                    match server.manager.status(&target).await {
                        Ok(records) => {
                            Response::success(format!("{} profile(s)", records.len()))
                                .with_payload(Payload::Records(records))
                        }
                        Err(e) => Response::failure(&e),
                    }
                })
                .await
            }

            ArchivedRequest::Reload => {
                debug!("Handling: Reload");
                let server = Arc::clone(self);
                self.bounded("reload".to_string(), async move { server.reload().await })
                    .await
            }

            ArchivedRequest::Rename { kind, old, new } => {
                let (kind, old, new) = (profile_kind(kind), old.to_string(), new.to_string());
                debug!("Handling: Rename({} {} -> {})", kind, old, new);
                match self.rename(kind, &old, &new) {
                    Ok(()) => Response::success(format!(
                        "Renamed {kind} '{old}' to '{new}'; a running process moves to the new name at the next reload"
                    )),
                    Err(e) => {
                        warn!("Rename failed: {}", e);
                        Response::failure(&e)
                    }
                }
            }

            ArchivedRequest::RenameService { old, new } => {
                let (old, new) = (old.to_string(), new.to_string());
                debug!("Handling: RenameService({} -> {})", old, new);
                match self.rename_service(&old, &new) {
                    Ok(()) => Response::success(format!(
                        "Renamed service '{old}' to '{new}'; its daemon picks up the new name at the next reload"
                    )),
                    Err(e) => {
                        warn!("Rename failed: {}", e);
                        Response::failure(&e)
                    }
                }
            }

            ArchivedRequest::Logs { kind, name, lines } => {
                let (kind, name) = (profile_kind(kind), name.to_string());
                let n = lines.to_native() as usize;
                debug!("Handling: Logs({} {}, lines: {})", kind, name, n);
                match self.manager.logs(kind, &name, n).await {
                    Ok(lines) => Response::success(format!("{} line(s)", lines.len()))
                        .with_payload(Payload::Logs(lines)),
                    Err(e) => Response::failure(&e),
                }
            }
        }
    }

    /// Run `op` under the request timeout. A timed-out operation keeps
    /// running; the caller learns its outcome from `status`.
    async fn bounded<F>(&self, operation: String, op: F) -> Response
    where
        F: Future<Output = Response> + Send + 'static,
    {
        let timeout = self.manager.settings().request_timeout();
        let task = tokio::spawn(op);
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => Response::failure(&LabError::Internal(format!("{operation} failed: {e}"))),
            Err(_) => {
                warn!("'{}' exceeded {:?}, still in flight", operation, timeout);
                Response::failure(&LabError::TimedOut {
                    operation,
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn reload(&self) -> Response {
        let config = match self.load_user_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("Reload rejected: {}", e);
                return Response::failure(&e);
            }
        };

        match self.manager.reload(config).await {
            Ok(outcome) => {
                let report = outcome.report;
                Response::success(format!(
                    "Reloaded: {} restarted, {} stopped, {} unchanged",
                    report.restarted.len(),
                    report.stopped.len(),
                    report.unchanged.len()
                ))
                .with_warnings(outcome.warnings)
                .with_payload(Payload::Reload(report))
            }
            Err(e) => Response::failure(&e),
        }
    }

    /// Rename in the operator's file; the committed configuration is untouched.
    fn rename(&self, kind: ProfileKind, old: &str, new: &str) -> crate::error::Result<()> {
        let mut config = self.load_user_config()?;
        config.rename(kind, old, new)?;
        self.loader.validate(&config)?;
        config.save(&self.user_config_path, RenderView::Diff)?;
        self.manager.note_rename(kind, old, new);
        info!(%kind, old, new, "Renamed profile in {}", self.user_config_path.display());
        Ok(())
    }

    fn rename_service(&self, old: &str, new: &str) -> crate::error::Result<()> {
        let mut config = self.load_user_config()?;
        config.rename_service(old, new)?;
        self.loader.validate(&config)?;
        config.save(&self.user_config_path, RenderView::Diff)?;
        info!(old, new, "Renamed service in {}", self.user_config_path.display());
        Ok(())
    }

    fn load_user_config(&self) -> crate::error::Result<LabConfig> {
        self.loader.load_file_or_default(&self.user_config_path)
    }
}

fn pid_suffix(pid: Option<u32>) -> String {
    pid.map(|pid| format!(" (PID {pid})")).unwrap_or_default()
}

/// Foreground supervisor entry point: signals, startup, serve.
pub async fn run(options: SupervisorOptions) -> Result<()> {
    let shutdown = CancellationToken::new();
    crate::shutdown::cancel_on_signal(shutdown.clone())?;

    let launcher = Arc::new(SelfLauncher::current()?);
    let supervisor = Supervisor::start(options, launcher, shutdown).await?;
    supervisor.serve().await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::client::SupervisorClient;
    use crate::supervisor::protocol::{ProcessState, Request};
    use std::path::Path;
    use std::time::Duration;
    use tokio::process::Command;

    struct SleepLauncher;

    impl Launcher for SleepLauncher {
        fn command(&self, _kind: ProfileKind, _name: &str, _config: &Path) -> Command {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            cmd
        }
    }

    const CONFIG: &str = r#"
version: 1
daemons:
  lockable:
    variant: lockable
    nameservers: [default]
services:
  asgard.hulk:
    implementation: sample.SampleService
    daemon: lockable
autolaunch:
  nameservers: [default]
  daemons: [lockable]
"#;

    fn options(root: &Path) -> SupervisorOptions {
        SupervisorOptions {
            socket_path: root.join("supervisor.sock"),
            lockfile_path: root.join("supervisor.lock"),
            user_config_path: root.join("config.yaml"),
            paths: ProcessPaths::under(root),
            settings: SupervisorSettings {
                stop_grace_secs: 2,
                health_interval_ms: 200,
                ..Default::default()
            },
            force: false,
        }
    }

    async fn records(client: &SupervisorClient) -> Vec<crate::supervisor::ProcessSnapshot> {
        let response = client
            .call(&Request::Status {
                target: StatusTarget::All,
            })
            .await
            .unwrap();
        match response.payload {
            Payload::Records(records) => records,
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_plane_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        std::fs::write(&opts.user_config_path, CONFIG).unwrap();
        let client = SupervisorClient::new(&opts.socket_path, Duration::from_secs(10));
        let lockfile_path = opts.lockfile_path.clone();
        let user_config_path = opts.user_config_path.clone();

        let supervisor = Supervisor::start(opts, Arc::new(SleepLauncher), CancellationToken::new())
            .await
            .unwrap();
        let served = tokio::spawn(supervisor.serve());
        for _ in 0..50 {
            if client.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let pong = client.call(&Request::Ping).await.unwrap();
        assert!(matches!(pong.payload, Payload::Pong { pid, .. } if pid == std::process::id()));

        let all = records(&client).await;
        let running: Vec<_> = all.iter().filter(|r| r.state == ProcessState::Running).collect();
        assert_eq!(running.len(), 2);

        let again = client
            .call(&Request::Start {
                kind: ProfileKind::Daemon,
                name: "lockable".into(),
            })
            .await
            .unwrap();
        assert!(again.message.contains("already running"));

        let stopped = client
            .call(&Request::Stop {
                kind: ProfileKind::Nameserver,
                name: "default".into(),
            })
            .await
            .unwrap();
        assert_eq!(stopped.warnings.len(), 1);

        let unknown = client
            .call(&Request::Start {
                kind: ProfileKind::Daemon,
                name: "ghost".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(unknown.kind(), crate::error::ErrorKind::UnknownProfile);

        let renamed = client
            .call(&Request::Rename {
                kind: ProfileKind::Daemon,
                old: "lockable".into(),
                new: "bench".into(),
            })
            .await
            .unwrap();
        assert!(renamed.is_success());
        let on_disk = std::fs::read_to_string(&user_config_path).unwrap();
        assert!(on_disk.contains("bench"));
        assert!(!on_disk.contains("lockable:"));

        let service = client
            .call(&Request::RenameService {
                old: "asgard.hulk".into(),
                new: "asgard.thor".into(),
            })
            .await
            .unwrap();
        assert!(service.is_success());
        let on_disk = std::fs::read_to_string(&user_config_path).unwrap();
        assert!(on_disk.contains("asgard.thor"));
        assert!(!on_disk.contains("asgard.hulk"));
        let missing = client
            .call(&Request::RenameService {
                old: "asgard.hulk".into(),
                new: "asgard.loki".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::UnknownProfile);

        let reserved = client
            .call(&Request::Rename {
                kind: ProfileKind::Daemon,
                old: "bench".into(),
                new: "all".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(reserved.kind(), crate::error::ErrorKind::Configuration);

        let reloaded = client.call(&Request::Reload).await.unwrap();
        match reloaded.payload {
            Payload::Reload(report) => {
                assert_eq!(report.restarted.len(), 1);
                assert_eq!(report.restarted[0].name, "bench");
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        client.call(&Request::Shutdown).await.unwrap();
        served.await.unwrap().unwrap();
        assert!(!lockfile_path.exists());
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_whole() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        std::fs::write(
            &opts.user_config_path,
            "services:\n  bench:\n    implementation: sample.SampleService\n    daemon: missing\n",
        )
        .unwrap();
        let lockfile_path = opts.lockfile_path.clone();

        let err = Supervisor::start(opts, Arc::new(SleepLauncher), CancellationToken::new())
            .await
            .err()
            .unwrap();
        let lab = err.downcast_ref::<LabError>().unwrap();
        assert_eq!(lab.kind(), crate::error::ErrorKind::Configuration);
        assert!(!lockfile_path.exists());
    }

    #[tokio::test]
    async fn failed_control_bind_stops_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        std::fs::write(&opts.user_config_path, CONFIG).unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        opts.socket_path = blocker.join("supervisor.sock");
        let lockfile_path = opts.lockfile_path.clone();

        let supervisor = Supervisor::start(opts, Arc::new(SleepLauncher), CancellationToken::new())
            .await
            .unwrap();
        let pids: Vec<u32> = supervisor
            .manager
            .status(&StatusTarget::All)
            .await
            .unwrap()
            .iter()
            .filter_map(|record| record.pid)
            .collect();
        assert_eq!(pids.len(), 2);

        assert!(supervisor.serve().await.is_err());
        for pid in pids {
            assert!(!crate::supervisor::os::is_process_running(pid));
        }
        assert!(!lockfile_path.exists());
    }
}
