use super::server::Stream;
use super::wire::{read_frame, write_frame, Address, Call, Endpoint, Reply};
use crate::error::{LabError, Result};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side handle to one remote object over a persistent connection.
///
/// Dropping the proxy closes the connection, which the serving daemon treats
/// as a disconnect (releasing any locks the connection held). A call that
/// times out or fails mid-exchange leaves the stream out of step with the
/// server, so every later call on the same proxy fails; connect a new one.
pub struct Proxy {
    address: Address,
    stream: Box<dyn Stream>,
    timeout: Duration,
    broken: bool,
}

impl Proxy {
    pub async fn connect(address: &Address) -> Result<Self> {
        let stream = open(&address.endpoint).await?;
        tracing::trace!(%address, "Proxy connected");
        Ok(Self {
            address: address.clone(),
            stream,
            timeout: DEFAULT_CALL_TIMEOUT,
            broken: false,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        if self.broken {
            return Err(LabError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("connection to {} was abandoned by an earlier call", self.address),
            )));
        }

        let call = Call {
            object: self.address.object.clone(),
            method: method.to_string(),
            args,
        };
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let exchange = async {
            write_frame(stream, &call).await?;
            read_frame::<_, Reply>(stream)
                .await?
                .ok_or_else(|| {
                    LabError::Io(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "connection closed before reply",
                    ))
                })
        };
        let reply = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.broken = true;
                return Err(e);
            }
            Err(_) => {
                self.broken = true;
                return Err(LabError::TimedOut {
                    operation: format!("{}.{}", call.object, call.method),
                    secs: timeout.as_secs(),
                });
            }
        };
        reply.into_result()
    }
}

async fn open(endpoint: &Endpoint) -> Result<Box<dyn Stream>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => Ok(Box::new(tokio::net::UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix { path } => Err(LabError::Io(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("cannot reach {}: no Unix sockets", path.display()),
        ))),
    }
}

/// Whether anything accepts connections at the endpoint.
pub async fn probe(endpoint: &Endpoint, timeout: Duration) -> bool {
    matches!(tokio::time::timeout(timeout, open(endpoint)).await, Ok(Ok(_)))
}
