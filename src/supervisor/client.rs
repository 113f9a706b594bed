use super::protocol::{MessageFrame, Request, Response};
use crate::clienv;
use crate::error::{LabError, Result};
use crate::settings::SupervisorSettings;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// Extra time the client waits beyond the supervisor's own request bound,
/// so a server-side timeout arrives as a response rather than a hang-up.
const CLIENT_MARGIN: Duration = Duration::from_secs(5);

/// One-shot control-plane client: connect, one request, disconnect.
#[derive(Debug, Clone)]
pub struct SupervisorClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SupervisorClient {
    pub fn new(socket_path: &Path, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            timeout,
        }
    }

    pub fn from_env(settings: &SupervisorSettings) -> Self {
        Self::new(
            &clienv::supervisor_socket_path(),
            settings.request_timeout() + settings.stop_grace() + CLIENT_MARGIN,
        )
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and return the response whatever its outcome.
    pub async fn request(&self, request: &Request) -> Result<Response> {
        trace!(?request, "Sending control request");
        match tokio::time::timeout(self.timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(LabError::TimedOut {
                operation: request.operation(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    /// Send a request; a failure response becomes an error of its kind.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        self.request(request).await?.into_result()
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.request(&Request::Ping).await, Ok(r) if r.is_success())
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect().await?;

        let bytes = MessageFrame::encode_request(request)
            .map_err(|e| LabError::Internal(format!("failed to encode request: {e}")))?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let body = MessageFrame::read(&mut stream).await?;
        let response = MessageFrame::decode_response(&body)
            .map_err(|e| LabError::Internal(format!("failed to decode response: {e}")))?;
        debug!(success = response.is_success(), "Control response received");
        Ok(response)
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| {
                LabError::SupervisorUnavailable(format!("{}: {e}", self.socket_path.display()))
            })
    }

    #[cfg(not(unix))]
    async fn connect(&self) -> Result<tokio::net::TcpStream> {
        let port = clienv::supervisor_tcp_port();
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| LabError::SupervisorUnavailable(format!("127.0.0.1:{port}: {e}")))
    }
}

/// Start `lab supervisor` detached, output appended to the supervisor log.
/// Returns the new process's PID; readiness is the caller's to poll.
pub fn launch_detached(force: bool) -> Result<u32> {
    let exe = std::env::current_exe()?;
    let log_path = clienv::supervisor_log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("supervisor");
    if force {
        cmd.arg("--force");
    }
    cmd.stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn()?;
    debug!(pid = child.id(), log = %log_path.display(), "Launched supervisor");
    Ok(child.id())
}
