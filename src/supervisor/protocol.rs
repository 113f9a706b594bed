//! Control-plane protocol types using rkyv
//!
//! One request per connection: the CLI connects, writes a framed [`Request`],
//! reads a framed [`Response`] and disconnects.

use crate::config::{ArchivedProfileKind, ProfileKind};
use crate::error::{ErrorKind, LabError};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a control-plane frame.
pub const MAX_MESSAGE_LEN: usize = 8 * 1024 * 1024;

/// Control request from the CLI to the supervisor
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Liveness, uptime and version
    Ping,
    /// Ordered shutdown of every subprocess, then the supervisor itself
    Shutdown,
    Start {
        kind: ProfileKind,
        name: String,
    },
    Stop {
        kind: ProfileKind,
        name: String,
    },
    Status {
        target: StatusTarget,
    },
    /// Re-read the configuration and reconcile running subprocesses
    Reload,
    /// Rename a profile in the persisted configuration
    Rename {
        kind: ProfileKind,
        old: String,
        new: String,
    },
    /// Rename a service binding in the persisted configuration
    RenameService {
        old: String,
        new: String,
    },
    /// Tail of a profile's captured output
    Logs {
        kind: ProfileKind,
        name: String,
        lines: u32,
    },
}

impl Request {
    /// Short operation name used in logs and timeout messages.
    pub fn operation(&self) -> String {
        match self {
            Request::Ping => "ping".into(),
            Request::Shutdown => "shutdown".into(),
            Request::Start { kind, name } => format!("start {kind} {name}"),
            Request::Stop { kind, name } => format!("stop {kind} {name}"),
            Request::Status { .. } => "status".into(),
            Request::Reload => "reload".into(),
            Request::Rename { kind, old, new } => format!("rename {kind} {old} {new}"),
            Request::RenameService { old, new } => format!("rename service {old} {new}"),
            Request::Logs { kind, name, .. } => format!("logs {kind} {name}"),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum StatusTarget {
    All,
    One { kind: ProfileKind, name: String },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Outcome {
    Success,
    Failure(ErrorKind),
}

/// Control response from the supervisor to the CLI
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct Response {
    pub outcome: Outcome,
    /// Human-readable summary
    pub message: String,
    /// Non-fatal conditions the operator should know about
    pub warnings: Vec<String>,
    pub payload: Payload,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Payload {
    None,
    Pong {
        uptime_secs: u64,
        version: String,
        pid: u32,
    },
    Records(Vec<ProcessSnapshot>),
    Logs(Vec<String>),
    Reload(ReloadReport),
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            message: message.into(),
            warnings: Vec::new(),
            payload: Payload::None,
        }
    }

    pub fn failure(err: &LabError) -> Self {
        Self {
            outcome: Outcome::Failure(err.kind()),
            message: err.to_string(),
            warnings: Vec::new(),
            payload: Payload::None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    /// Turn a failure into the error it carries.
    pub fn into_result(self) -> Result<Self, LabError> {
        match self.outcome {
            Outcome::Success => Ok(self),
            Outcome::Failure(kind) => Err(LabError::Remote {
                kind,
                message: self.message,
            }),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[rkyv(derive(Debug))]
pub struct ProfileRef {
    pub kind: ProfileKind,
    pub name: String,
}

impl std::fmt::Display for ProfileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ReloadReport {
    pub stopped: Vec<ProfileRef>,
    pub restarted: Vec<ProfileRef>,
    pub unchanged: Vec<ProfileRef>,
}

/// Point-in-time view of a process record
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ProcessSnapshot {
    pub kind: ProfileKind,
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    /// Wall-clock start, milliseconds since the Unix epoch
    pub started_at_ms: Option<i64>,
    pub uptime_secs: Option<u64>,
    /// Automatic restarts after crashes
    pub restarts: u32,
    /// Spawn counter, prefixed to every captured log line
    pub incarnation: u32,
    pub last_error: Option<String>,
    /// Left stopped after exceeding the crash ceiling
    pub crash_looped: bool,
    /// Found running at supervisor startup rather than spawned by it
    pub adopted: bool,
}

impl ProcessSnapshot {
    /// Snapshot of a configured profile with no process record.
    pub fn stopped(kind: ProfileKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            state: ProcessState::Stopped,
            pid: None,
            started_at_ms: None,
            uptime_secs: None,
            restarts: 0,
            incarnation: 0,
            last_error: None,
            crash_looped: false,
            adopted: false,
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ProcessState {
    Starting,
    Running,
    Crashed,
    Stopped,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Starting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Crashed => "crashed",
            ProcessState::Stopped => "stopped",
        }
    }
}

/// Message frame for the wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::with_prefix(&bytes))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::with_prefix(&bytes))
    }

    fn with_prefix(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Read one frame body into an aligned buffer ready for `rkyv::access`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<AlignedVec> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = Self::read_length(&len_buf);
        if len > MAX_MESSAGE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("control message of {len} bytes exceeds limit"),
            ));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        let mut aligned = AlignedVec::with_capacity(len);
        aligned.extend_from_slice(&body);
        Ok(aligned)
    }

    pub fn decode_response(bytes: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(bytes)
    }
}

/// Owned profile kind from its archived form.
pub fn profile_kind(archived: &ArchivedProfileKind) -> ProfileKind {
    match archived {
        ArchivedProfileKind::Nameserver => ProfileKind::Nameserver,
        ArchivedProfileKind::Daemon => ProfileKind::Daemon,
    }
}
