use super::wire::{read_frame, write_frame, Call, Endpoint, Reply};
use crate::config::Concurrency;
use crate::error::{LabError, Result};
use crate::service::CallContext;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Idle time before the kernel starts probing a silent TCP peer.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Receives calls and connection lifecycle events from an [`ObjectServer`].
///
/// All methods are synchronous and may block; the server runs them on worker
/// threads, never on the async reactor.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, ctx: &CallContext, call: &Call) -> Result<Value>;

    fn connected(&self, _ctx: &CallContext) {}

    /// Called exactly once per connection, after its last call, however it ended.
    fn disconnected(&self, _ctx: &CallContext) {}
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { path } => Err(LabError::config(
                path.display().to_string(),
                "unix_socket",
                "Unix-domain sockets are not supported on this platform",
            )),
        }
    }

    /// The bound endpoint, with the real port when 0 was requested.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix { path: path.clone() }),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

enum Job {
    Connected(CallContext),
    Call(CallContext, Call, oneshot::Sender<Reply>),
    Disconnected(CallContext),
}

/// How calls reach the dispatcher.
#[derive(Clone)]
enum Workers {
    /// One blocking worker per connection, bounded by the semaphore.
    Pool(Arc<Semaphore>, usize),
    /// A single dispatch thread serializing every event.
    Serial(mpsc::UnboundedSender<Job>),
}

/// Serves objects of a [`Dispatch`] implementation over framed connections.
pub struct ObjectServer<D: Dispatch> {
    dispatcher: Arc<D>,
    concurrency: Concurrency,
    max_workers: usize,
    idle_timeout: Option<Duration>,
    next_connection: Arc<AtomicU64>,
}

impl<D: Dispatch> ObjectServer<D> {
    pub fn new(dispatcher: Arc<D>, concurrency: Concurrency, max_workers: usize) -> Self {
        Self {
            dispatcher,
            concurrency,
            max_workers: max_workers.max(1),
            idle_timeout: None,
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Close connections that send nothing for `timeout`. The close counts as
    /// a disconnect, so the connection's locks and sessions are released.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn start_workers(&self) -> Workers {
        match self.concurrency {
            Concurrency::Threaded => Workers::Pool(
                Arc::new(Semaphore::new(self.max_workers)),
                self.max_workers,
            ),
            Concurrency::Multiplexed => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let dispatcher = Arc::clone(&self.dispatcher);
                std::thread::spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        match job {
                            Job::Connected(ctx) => dispatcher.connected(&ctx),
                            Job::Call(ctx, call, reply) => {
                                let result = dispatcher.dispatch(&ctx, &call);
                                let _ = reply.send(Reply::from_result(result));
                            }
                            Job::Disconnected(ctx) => dispatcher.disconnected(&ctx),
                        }
                    }
                    trace!("Dispatch thread finished");
                });
                Workers::Serial(tx)
            }
        }
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(self, listener: Listener, shutdown: CancellationToken) -> Result<()> {
        let workers = self.start_workers();
        info!(
            endpoint = %listener.local_endpoint()?,
            concurrency = ?self.concurrency,
            "Object server listening"
        );

        loop {
            tokio::select! {
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer, workers.clone()),
                        Err(e) => warn!("Accept error: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Object server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: Box<dyn Stream>, peer: String, workers: Workers) {
        let ctx = CallContext {
            connection: self.next_connection.fetch_add(1, Ordering::Relaxed),
            peer,
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let idle = self.idle_timeout;
        tokio::spawn(async move {
            let connection = ctx.connection;
            let result = match workers {
                Workers::Pool(semaphore, limit) => match semaphore.try_acquire_owned() {
                    Ok(_permit) => serve_pooled(stream, ctx, dispatcher, idle).await,
                    Err(_) => refuse(stream, &ctx, limit).await,
                },
                Workers::Serial(tx) => serve_serial(stream, ctx, tx, idle).await,
            };
            if let Err(e) = result {
                debug!(connection, "Connection ended with error: {}", e);
            }
        });
    }
}

pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

async fn accept(listener: &Listener) -> std::io::Result<(Box<dyn Stream>, String)> {
    match listener {
        Listener::Tcp(l) => {
            let (stream, addr) = l.accept().await?;
            stream.set_nodelay(true)?;
            // Surfaces peers that vanished without a FIN (power loss, partition).
            let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
            Ok((Box::new(stream), addr.to_string()))
        }
        #[cfg(unix)]
        Listener::Unix(l, path) => {
            let (stream, _) = l.accept().await?;
            Ok((Box::new(stream), format!("unix:{}", path.display())))
        }
    }
}

/// Next call on the connection; `None` once the peer closes or goes quiet.
async fn next_call(
    stream: &mut Box<dyn Stream>,
    ctx: &CallContext,
    idle: Option<Duration>,
) -> Result<Option<Call>> {
    let Some(limit) = idle else {
        return read_frame(stream).await;
    };
    match tokio::time::timeout(limit, read_frame(stream)).await {
        Ok(frame) => frame,
        Err(_) => {
            info!(
                connection = ctx.connection,
                peer = %ctx.peer,
                "Closing connection silent for {:?}",
                limit
            );
            Ok(None)
        }
    }
}

async fn serve_pooled<D: Dispatch>(
    mut stream: Box<dyn Stream>,
    ctx: CallContext,
    dispatcher: Arc<D>,
    idle: Option<Duration>,
) -> Result<()> {
    trace!(connection = ctx.connection, peer = %ctx.peer, "Connection accepted");
    let ctx = Arc::new(ctx);

    {
        let (dispatcher, ctx) = (Arc::clone(&dispatcher), Arc::clone(&ctx));
        run_blocking(move || dispatcher.connected(&ctx)).await;
    }

    let result = async {
        while let Some(call) = next_call(&mut stream, &ctx, idle).await? {
            let (dispatcher, call_ctx) = (Arc::clone(&dispatcher), Arc::clone(&ctx));
            let reply = tokio::task::spawn_blocking(move || {
                Reply::from_result(dispatcher.dispatch(&call_ctx, &call))
            })
            .await
            .unwrap_or_else(|e| {
                Reply::from_result(Err(LabError::Internal(format!("call panicked: {e}"))))
            });
            write_frame(&mut stream, &reply).await?;
        }
        Ok::<_, LabError>(())
    }
    .await;

    run_blocking(move || dispatcher.disconnected(&ctx)).await;
    result
}

async fn serve_serial(
    mut stream: Box<dyn Stream>,
    ctx: CallContext,
    tx: mpsc::UnboundedSender<Job>,
    idle: Option<Duration>,
) -> Result<()> {
    let closed = || LabError::Internal("dispatch thread stopped".into());
    tx.send(Job::Connected(ctx.clone())).map_err(|_| closed())?;

    let result = async {
        while let Some(call) = next_call(&mut stream, &ctx, idle).await? {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(Job::Call(ctx.clone(), call, reply_tx))
                .map_err(|_| closed())?;
            let reply = reply_rx.await.map_err(|_| closed())?;
            write_frame(&mut stream, &reply).await?;
        }
        Ok::<_, LabError>(())
    }
    .await;

    let _ = tx.send(Job::Disconnected(ctx));
    result
}

/// Answer the first call with `ResourceBusy` and close; the pool is full.
async fn refuse(mut stream: Box<dyn Stream>, ctx: &CallContext, limit: usize) -> Result<()> {
    warn!(peer = %ctx.peer, limit, "Worker pool exhausted, refusing connection");
    if read_frame::<_, Call>(&mut stream).await?.is_some() {
        let reply = Reply::from_result(Err(LabError::ResourceBusy {
            service: "daemon".into(),
            holder: format!("all {limit} workers"),
        }));
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

async fn run_blocking<F: FnOnce() + Send + 'static>(f: F) {
    if let Err(e) = tokio::task::spawn_blocking(f).await {
        warn!("Lifecycle callback panicked: {}", e);
    }
}
