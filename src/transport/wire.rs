//! Wire types for remote-object calls
//!
//! Format: [4-byte length (little-endian)][JSON document], one call or reply per frame.

use crate::error::{ErrorKind, LabError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const ADDRESS_SCHEME: &str = "obj:";
const UNIX_MARKER: &str = "./u:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub object: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Error {
        error: RemoteError,
    },
}

impl Reply {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Reply::Ok { value },
            Err(err) => Reply::Error {
                error: RemoteError::from(&err),
            },
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Reply::Ok { value } => Ok(value),
            Reply::Error { error } => Err(error.into_error()),
        }
    }
}

/// Serializable error payload: a closed kind, a message, and optional detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl From<&LabError> for RemoteError {
    fn from(err: &LabError) -> Self {
        let detail = match err {
            LabError::AlreadyLocked { service, holder }
            | LabError::ResourceBusy { service, holder } => {
                serde_json::json!({ "service": service, "holder": holder })
            }
            LabError::UnknownObject(name) => serde_json::json!({ "name": name }),
            _ => Value::Null,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            detail,
        }
    }
}

impl RemoteError {
    pub fn into_error(self) -> LabError {
        LabError::Remote {
            kind: self.kind,
            message: self.message,
        }
    }
}

/// Where an object's server listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix { path } => write!(f, "{UNIX_MARKER}{}", path.display()),
        }
    }
}

/// Published location of one object: `obj:<object>@<host>:<port>` or
/// `obj:<object>@./u:<socket path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub object: String,
    pub endpoint: Endpoint,
}

impl Address {
    pub fn new(object: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            object: object.into(),
            endpoint,
        }
    }

    pub fn tcp(object: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(
            object,
            Endpoint::Tcp {
                host: host.into(),
                port,
            },
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_SCHEME}{}@{}", self.object, self.endpoint)
    }
}

impl FromStr for Address {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || LabError::InvalidArgument(format!("malformed object address '{s}'"));

        let rest = s.strip_prefix(ADDRESS_SCHEME).ok_or_else(invalid)?;
        let (object, location) = rest.split_once('@').ok_or_else(invalid)?;
        if object.is_empty() {
            return Err(invalid());
        }

        let endpoint = if let Some(path) = location.strip_prefix(UNIX_MARKER) {
            Endpoint::Unix {
                path: PathBuf::from(path),
            }
        } else {
            let (host, port) = location.rsplit_once(':').ok_or_else(invalid)?;
            let port = port.parse().map_err(|_| invalid())?;
            Endpoint::Tcp {
                host: host.to_string(),
                port,
            }
        };
        Ok(Address::new(object, endpoint))
    }
}

impl TryFrom<String> for Address {
    type Error = LabError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message)
        .map_err(|e| LabError::Internal(format!("failed to encode frame: {e}")))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_FRAME_LEN)
        .ok_or_else(|| LabError::Internal(format!("frame of {} bytes too large", bytes.len())))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `None` when the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(LabError::Internal(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| LabError::Internal(format!("failed to decode frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_text_form() {
        let tcp = Address::tcp("asgard.hulk", "10.0.0.4", 40123);
        assert_eq!(tcp.to_string(), "obj:asgard.hulk@10.0.0.4:40123");
        assert_eq!(tcp.to_string().parse::<Address>().unwrap(), tcp);

        let unix = Address::new(
            "daemon",
            Endpoint::Unix {
                path: PathBuf::from("/run/lab/bench.sock"),
            },
        );
        assert_eq!(unix.to_string(), "obj:daemon@./u:/run/lab/bench.sock");
        assert_eq!(unix.to_string().parse::<Address>().unwrap(), unix);

        for bad in ["asgard@host:1", "obj:@host:1", "obj:x@host", "obj:x@host:port"] {
            assert!(bad.parse::<Address>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn remote_errors_keep_their_kind() {
        let reply = Reply::from_result(Err(LabError::AlreadyLocked {
            service: "asgard.hulk".into(),
            holder: "connection 4".into(),
        }));
        let text = serde_json::to_string(&reply).unwrap();
        let decoded: Reply = serde_json::from_str(&text).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
        assert!(err.to_string().contains("connection 4"));
    }

    #[tokio::test]
    async fn frames_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let call = Call {
            object: "nameserver".into(),
            method: "lookup".into(),
            args: serde_json::json!(["asgard.hulk"]),
        };
        write_frame(&mut client, &call).await.unwrap();
        drop(client);

        let received: Call = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received.method, "lookup");
        assert!(read_frame::<_, Call>(&mut server).await.unwrap().is_none());
    }
}
