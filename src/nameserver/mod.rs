//! Nameserver subprocess
//!
//! Hosts the `nameserver` directory object: a name -> address table that
//! daemons publish their services into and clients resolve names against.
//! Registering an existing name replaces the previous entry without error.

mod store;

pub use store::{Entry, Store};

use crate::config::{Concurrency, LabConfig, NameserverProfile};
use crate::error::{LabError, Result};
use crate::service::{Args, CallContext};
use crate::transport::{probe, Address, Call, Dispatch, Endpoint, Listener, ObjectServer, Proxy};
use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NAMESERVER_OBJECT: &str = "nameserver";
/// Datagram a client broadcasts to discover a nameserver.
pub const BROADCAST_QUERY: &str = "GET_NSURI";

const NAMESERVER_WORKERS: usize = 64;
const AUTOCLEAN_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Host to dial for a bind host; wildcard binds are reached over loopback.
pub fn connect_host(bind_host: &str) -> &str {
    match bind_host {
        "0.0.0.0" | "::" | "" => "localhost",
        other => other,
    }
}

/// Address clients use to reach a nameserver profile.
pub fn address_of(profile: &NameserverProfile) -> Address {
    Address::tcp(NAMESERVER_OBJECT, connect_host(&profile.host), profile.port)
}

pub struct Directory {
    entries: RwLock<BTreeMap<String, Entry>>,
    store: Store,
}

impl Directory {
    pub fn open(store: Store) -> Result<Self> {
        let entries = store.load()?;
        if !entries.is_empty() {
            info!(count = entries.len(), "Restored registrations");
        }
        Ok(Self {
            entries: RwLock::new(entries),
            store,
        })
    }

    /// The table changes only once the store has taken the new contents.
    pub fn register(&self, name: &str, address: Address, metadata: Vec<String>) -> Result<()> {
        let mut entries = self.entries.write().expect("directory lock poisoned");
        let mut next = entries.clone();
        let previous = next.insert(
            name.to_string(),
            Entry {
                address: address.clone(),
                metadata,
                registered_at: Utc::now(),
            },
        );
        self.store.persist(&next)?;
        *entries = next;

        match previous {
            Some(old) if old.address != address => {
                debug!(name, old = %old.address, new = %address, "Registration overwritten")
            }
            _ => debug!(name, %address, "Registered"),
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Entry> {
        self.entries
            .read()
            .expect("directory lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LabError::UnknownObject(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write().expect("directory lock poisoned");
        if !entries.contains_key(name) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(name);
        self.store.persist(&next)?;
        *entries = next;
        debug!(name, "Removed registration");
        Ok(true)
    }

    pub fn list(&self, prefix: Option<&str>) -> BTreeMap<String, Entry> {
        self.entries
            .read()
            .expect("directory lock poisoned")
            .iter()
            .filter(|(name, _)| prefix.is_none_or(|p| name.starts_with(p)))
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    /// Drop entries whose endpoint no longer accepts connections.
    pub async fn autoclean(&self) -> Result<Vec<String>> {
        let snapshot = self.list(None);
        let mut dead = Vec::new();
        for (name, entry) in snapshot {
            if !probe(&entry.address.endpoint, AUTOCLEAN_PROBE_TIMEOUT).await {
                dead.push((name, entry.address));
            }
        }
        if dead.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = self.entries.write().expect("directory lock poisoned");
        let mut next = entries.clone();
        let mut removed = Vec::new();
        for (name, address) in dead {
            // Skip names re-registered while probing.
            if next.get(&name).is_some_and(|e| e.address == address) {
                next.remove(&name);
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            self.store.persist(&next)?;
            *entries = next;
            info!(names = ?removed, "Autoclean removed unreachable registrations");
        }
        Ok(removed)
    }
}

fn entry_json(entry: &Entry) -> Value {
    json!({
        "address": entry.address.to_string(),
        "metadata": entry.metadata,
        "registered_at": entry.registered_at.to_rfc3339(),
    })
}

impl Dispatch for Directory {
    fn dispatch(&self, _ctx: &CallContext, call: &Call) -> Result<Value> {
        if call.object != NAMESERVER_OBJECT {
            return Err(LabError::UnknownObject(call.object.clone()));
        }
        let args = Args::new(&call.args);
        match call.method.as_str() {
            "ping" => Ok(json!("pong")),
            "register" => {
                let name: String = args.required(0, "name")?;
                let address: Address = args.required(1, "address")?;
                let metadata: Vec<String> = args.optional(2, "metadata")?.unwrap_or_default();
                self.register(&name, address, metadata)?;
                Ok(Value::Null)
            }
            "lookup" => {
                let name: String = args.required(0, "name")?;
                Ok(json!(self.lookup(&name)?.address.to_string()))
            }
            "remove" => {
                let name: String = args.required(0, "name")?;
                Ok(json!(self.remove(&name)?))
            }
            "list" => {
                let prefix: Option<String> = args.optional(0, "prefix")?;
                let listing: serde_json::Map<String, Value> = self
                    .list(prefix.as_deref())
                    .iter()
                    .map(|(name, entry)| (name.clone(), entry_json(entry)))
                    .collect();
                Ok(Value::Object(listing))
            }
            other => Err(LabError::UnknownObject(format!("{NAMESERVER_OBJECT}.{other}"))),
        }
    }
}

/// Typed client for the `nameserver` object.
pub struct NameserverClient {
    proxy: Proxy,
}

impl NameserverClient {
    pub async fn connect(address: &Address) -> Result<Self> {
        Ok(Self {
            proxy: Proxy::connect(address).await?,
        })
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.proxy.call("ping", Value::Null).await.map(|_| ())
    }

    pub async fn register(&mut self, name: &str, address: &Address, metadata: &[String]) -> Result<()> {
        self.proxy
            .call("register", json!([name, address.to_string(), metadata]))
            .await
            .map(|_| ())
    }

    pub async fn lookup(&mut self, name: &str) -> Result<Address> {
        let value = self.proxy.call("lookup", json!([name])).await?;
        serde_json::from_value(value)
            .map_err(|e| LabError::Internal(format!("malformed lookup reply: {e}")))
    }

    pub async fn remove(&mut self, name: &str) -> Result<bool> {
        let value = self.proxy.call("remove", json!([name])).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub async fn list(&mut self, prefix: Option<&str>) -> Result<BTreeMap<String, Address>> {
        let value = self.proxy.call("list", json!([prefix])).await?;
        let Value::Object(listing) = value else {
            return Err(LabError::Internal("malformed list reply".into()));
        };
        listing
            .into_iter()
            .map(|(name, entry)| {
                let address = entry
                    .get("address")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LabError::Internal("list entry without address".into()))?
                    .parse()?;
                Ok((name, address))
            })
            .collect()
    }
}

async fn broadcast_responder(
    socket: UdpSocket,
    reply: String,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                let query = String::from_utf8_lossy(&buf[..len]);
                if query.trim() == BROADCAST_QUERY {
                    debug!(%peer, "Answering nameserver discovery");
                    socket.send_to(reply.as_bytes(), peer).await?;
                }
            }
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

/// Entry point of the `run-nameserver` subprocess.
pub async fn run(name: &str, config: &LabConfig) -> anyhow::Result<()> {
    let profile = config.nameserver(name)?.clone();
    let directory = Arc::new(Directory::open(Store::for_profile(name, &profile))?);

    let endpoint = Endpoint::Tcp {
        host: profile.host.clone(),
        port: profile.port,
    };
    let listener = Listener::bind(&endpoint)
        .await
        .with_context(|| format!("Failed to bind nameserver '{}' on {}", name, endpoint))?;

    let shutdown = CancellationToken::new();
    crate::shutdown::cancel_on_signal(shutdown.clone())?;

    if profile.autoclean_secs > 0 {
        let directory = Arc::clone(&directory);
        let token = shutdown.clone();
        let period = Duration::from_secs(profile.autoclean_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = directory.autoclean().await {
                            warn!("Autoclean failed: {}", e);
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    if let Some(bhost) = &profile.broadcast_host {
        let socket = UdpSocket::bind((bhost.as_str(), profile.broadcast_port))
            .await
            .with_context(|| {
                format!("Failed to bind broadcast responder on {}:{}", bhost, profile.broadcast_port)
            })?;
        socket.set_broadcast(true)?;
        let reply = address_of(&profile).to_string();
        let token = shutdown.clone();
        info!(host = %bhost, port = profile.broadcast_port, "Broadcast responder listening");
        tokio::spawn(async move {
            if let Err(e) = broadcast_responder(socket, reply, token).await {
                warn!("Broadcast responder stopped: {}", e);
            }
        });
    }

    info!(name, address = %address_of(&profile), "Nameserver ready");
    ObjectServer::new(directory, Concurrency::Threaded, NAMESERVER_WORKERS)
        .serve(listener, shutdown)
        .await?;
    info!(name, "Nameserver stopped");
    Ok(())
}
