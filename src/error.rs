use crate::config::ProfileKind;
use thiserror::Error;

/// Closed set of failure categories that may cross a process boundary.
///
/// This is the only error representation carried by the control plane and
/// the remote-object transport; receivers rebuild a [`LabError::Remote`]
/// from it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[rkyv(derive(Debug))]
pub enum ErrorKind {
    Configuration,
    AlreadyRunning,
    UnknownProfile,
    AlreadyLocked,
    ResourceBusy,
    TimedOut,
    SubprocessCrashLoop,
    UnknownObject,
    InvalidArgument,
    SupervisorUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::AlreadyRunning => "already running",
            ErrorKind::UnknownProfile => "unknown profile",
            ErrorKind::AlreadyLocked => "already locked",
            ErrorKind::ResourceBusy => "resource busy",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::SubprocessCrashLoop => "crash loop",
            ErrorKind::UnknownObject => "unknown object",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::SupervisorUnavailable => "supervisor not running",
            ErrorKind::Internal => "internal error",
        }
    }

    /// Process exit code used by the CLI for this category.
    pub fn exit_code(&self) -> u8 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::Configuration => 2,
            ErrorKind::AlreadyRunning => 3,
            ErrorKind::UnknownProfile => 4,
            ErrorKind::TimedOut => 5,
            ErrorKind::SubprocessCrashLoop => 6,
            ErrorKind::AlreadyLocked | ErrorKind::ResourceBusy => 7,
            ErrorKind::SupervisorUnavailable => 8,
            ErrorKind::UnknownObject => 9,
            ErrorKind::InvalidArgument => 10,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LabError {
    #[error("configuration error in '{name}' (field '{field}'): {reason}")]
    Configuration {
        name: String,
        field: String,
        reason: String,
    },

    #[error(
        "supervisor already running{}",
        .pid.map(|pid| format!(" with PID {pid}")).unwrap_or_default()
    )]
    AlreadyRunning { pid: Option<u32> },

    #[error("unknown {kind} profile '{name}'")]
    UnknownProfile { kind: ProfileKind, name: String },

    #[error("unknown service binding '{0}'")]
    UnknownService(String),

    #[error("service '{service}' is already locked by '{holder}'")]
    AlreadyLocked { service: String, holder: String },

    #[error("service '{service}' is locked by '{holder}'")]
    ResourceBusy { service: String, holder: String },

    #[error("'{operation}' timed out after {secs}s; it may still complete on the remote side")]
    TimedOut { operation: String, secs: u64 },

    #[error("{kind} '{name}' crashed {crashes} times within {window_secs}s and was left stopped")]
    SubprocessCrashLoop {
        kind: ProfileKind,
        name: String,
        crashes: usize,
        window_secs: u64,
    },

    #[error("no object or operation '{0}'")]
    UnknownObject(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("supervisor is not running (try `lab up`): {0}")]
    SupervisorUnavailable(String),

    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl LabError {
    pub fn config(
        name: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LabError::Configuration {
            name: name.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Configuration { .. } => ErrorKind::Configuration,
            LabError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            LabError::UnknownProfile { .. } | LabError::UnknownService(_) => {
                ErrorKind::UnknownProfile
            }
            LabError::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
            LabError::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            LabError::TimedOut { .. } => ErrorKind::TimedOut,
            LabError::SubprocessCrashLoop { .. } => ErrorKind::SubprocessCrashLoop,
            LabError::UnknownObject(_) => ErrorKind::UnknownObject,
            LabError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LabError::SupervisorUnavailable(_) => ErrorKind::SupervisorUnavailable,
            LabError::Remote { kind, .. } => *kind,
            LabError::Io(_) | LabError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_survive_remote_rebuild() {
        let err = LabError::ResourceBusy {
            service: "asgard.hulk".into(),
            holder: "conn-3".into(),
        };
        let rebuilt = LabError::Remote {
            kind: err.kind(),
            message: err.to_string(),
        };
        assert_eq!(rebuilt.kind(), ErrorKind::ResourceBusy);
        assert!(rebuilt.to_string().contains("asgard.hulk"));
    }

    #[test]
    fn exit_codes_distinguish_operator_categories() {
        let codes = [
            ErrorKind::Configuration.exit_code(),
            ErrorKind::AlreadyRunning.exit_code(),
            ErrorKind::UnknownProfile.exit_code(),
            ErrorKind::TimedOut.exit_code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn io_errors_are_internal() {
        let err: LabError = std::io::Error::other("disk gone").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
