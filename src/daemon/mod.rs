//! Daemon subprocess
//!
//! Hosts the services bound to one daemon profile and dispatches inbound
//! calls to them. A lockable daemon additionally owns a [`LockTable`] that
//! gives one connection at a time exclusive use of a service; locks held by a
//! connection are released when the transport reports it closed.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 daemon <name>                 │
//! ├───────────────────────────────────────────────┤
//! │ ObjectServer │ DaemonHost │ LockTable (opt.)  │
//! │ (transport)  │ (dispatch) │ (lockable only)   │
//! ├───────────────────────────────────────────────┤
//! │  service │ service │ ...  (from the catalog)  │
//! └───────────────────────────────────────────────┘
//! ```

mod locks;

pub use locks::{CallGuard, Lock, LockTable};

use crate::config::{DaemonProfile, DaemonVariant, InstanceMode, LabConfig, ServiceBinding};
use crate::error::{LabError, Result};
use crate::nameserver::{self, NameserverClient};
use crate::service::{Args, CallContext, ConnectionId, Operation, Service, ServiceCatalog};
use crate::settings::SupervisorSettings;
use crate::transport::{Address, Call, Dispatch, Endpoint, Listener, ObjectServer};
use anyhow::Context;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Object id of the daemon's own administrative object.
pub const DAEMON_OBJECT: &str = "daemon";

const LOCK_OPERATIONS: &[&str] = &["lock", "release", "islocked"];

enum Instances {
    Shared(Arc<dyn Service>),
    PerSession,
    PerCall,
}

struct Hosted {
    binding: ServiceBinding,
    operations: &'static [Operation],
    instances: Instances,
}

pub struct DaemonHost {
    name: String,
    profile: DaemonProfile,
    catalog: ServiceCatalog,
    services: BTreeMap<String, Hosted>,
    locks: Option<LockTable>,
    sessions: Mutex<HashMap<ConnectionId, HashMap<String, Arc<dyn Service>>>>,
    started_at: Instant,
}

impl DaemonHost {
    /// Construct every hosted service up front so parameter errors surface at startup.
    pub fn build(name: &str, config: &LabConfig, catalog: ServiceCatalog) -> Result<Self> {
        let profile = config.daemon(name)?.clone();

        let mut services = BTreeMap::new();
        for (service, binding) in config.services_for_daemon(name) {
            let instance: Arc<dyn Service> =
                Arc::from(catalog.construct(&binding.implementation, &binding.parameters)?);
            let operations = instance.operations();
            let instances = match binding.instance_mode {
                InstanceMode::Singleton => Instances::Shared(instance),
                InstanceMode::PerSession => {
                    instance.close();
                    Instances::PerSession
                }
                InstanceMode::PerCall => {
                    instance.close();
                    Instances::PerCall
                }
            };
            debug!(daemon = name, service = %service, mode = ?binding.instance_mode, "Hosting service");
            services.insert(
                service.clone(),
                Hosted {
                    binding: binding.clone(),
                    operations,
                    instances,
                },
            );
        }

        let locks = match profile.variant {
            DaemonVariant::Lockable => Some(LockTable::new(services.keys().cloned())),
            DaemonVariant::Plain => None,
        };

        Ok(Self {
            name: name.to_string(),
            profile,
            catalog,
            services,
            locks,
            sessions: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &DaemonProfile {
        &self.profile
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Instance to run a call on, and whether it must be closed afterwards.
    fn instance(
        &self,
        ctx: &CallContext,
        service: &str,
        hosted: &Hosted,
    ) -> Result<(Arc<dyn Service>, bool)> {
        let construct = || -> Result<Arc<dyn Service>> {
            let binding = &hosted.binding;
            Ok(Arc::from(
                self.catalog
                    .construct(&binding.implementation, &binding.parameters)?,
            ))
        };

        match &hosted.instances {
            Instances::Shared(instance) => Ok((Arc::clone(instance), false)),
            Instances::PerCall => Ok((construct()?, true)),
            Instances::PerSession => {
                let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
                let session = sessions.entry(ctx.connection).or_default();
                if let Some(instance) = session.get(service) {
                    return Ok((Arc::clone(instance), false));
                }
                let instance = construct()?;
                session.insert(service.to_string(), Arc::clone(&instance));
                Ok((instance, false))
            }
        }
    }

    fn describe(&self, service: &str, hosted: &Hosted) -> Value {
        let locking: &[&str] = if self.locks.is_some() {
            LOCK_OPERATIONS
        } else {
            &[]
        };
        json!({
            "name": service,
            "daemon": self.name,
            "implementation": hosted.binding.implementation,
            "description": hosted.binding.description,
            "instance_mode": hosted.binding.instance_mode,
            "operations": hosted.operations,
            "locking": locking,
        })
    }

    fn call_service(&self, ctx: &CallContext, service: &str, call: &Call) -> Result<Value> {
        let hosted = self
            .services
            .get(service)
            .ok_or_else(|| LabError::UnknownObject(service.to_string()))?;
        let args = Args::new(&call.args);

        match (call.method.as_str(), &self.locks) {
            ("describe", _) => Ok(self.describe(service, hosted)),
            ("lock", Some(locks)) => {
                let user: Option<String> = args.optional(0, "user")?;
                locks.acquire(service, ctx.connection, user)?;
                Ok(json!(true))
            }
            ("release", Some(locks)) => Ok(json!(locks.release(service, ctx.connection)?)),
            ("islocked", Some(locks)) => Ok(json!(locks.holder(service)?.is_some())),
            (method, locks) => {
                if !hosted.operations.iter().any(|op| op.name == method) {
                    return Err(LabError::UnknownObject(format!("{service}.{method}")));
                }
                let _guard = locks
                    .as_ref()
                    .map(|locks| locks.enter(service, ctx.connection))
                    .transpose()?;
                let (instance, transient) = self.instance(ctx, service, hosted)?;
                let result = instance.call(ctx, method, args);
                if transient {
                    instance.close();
                }
                result
            }
        }
    }

    fn call_daemon(&self, call: &Call) -> Result<Value> {
        let args = Args::new(&call.args);
        match (call.method.as_str(), &self.locks) {
            ("ping", _) => Ok(json!({
                "daemon": self.name,
                "uptime_secs": self.started_at.elapsed().as_secs(),
                "lockable": self.locks.is_some(),
            })),
            ("services", _) => Ok(Value::Array(
                self.services
                    .iter()
                    .map(|(name, hosted)| {
                        json!({
                            "name": name,
                            "implementation": hosted.binding.implementation,
                            "instance_mode": hosted.binding.instance_mode,
                            "description": hosted.binding.description,
                        })
                    })
                    .collect(),
            )),
            ("locks", Some(locks)) => Ok(json!(locks.snapshot())),
            ("force_release", Some(locks)) => {
                let service: String = args.required(0, "service")?;
                Ok(json!(locks.force_release(&service)?.is_some()))
            }
            (method, _) => Err(LabError::UnknownObject(format!("{DAEMON_OBJECT}.{method}"))),
        }
    }

    /// Close every live instance. Called once when the daemon stops.
    pub fn close(&self) {
        for hosted in self.services.values() {
            if let Instances::Shared(instance) = &hosted.instances {
                instance.close();
            }
        }
        let sessions = std::mem::take(&mut *self.sessions.lock().expect("sessions lock poisoned"));
        for instance in sessions.into_values().flat_map(HashMap::into_values) {
            instance.close();
        }
    }
}

impl Dispatch for DaemonHost {
    fn dispatch(&self, ctx: &CallContext, call: &Call) -> Result<Value> {
        if call.object == DAEMON_OBJECT {
            self.call_daemon(call)
        } else {
            self.call_service(ctx, &call.object, call)
        }
    }

    fn disconnected(&self, ctx: &CallContext) {
        if let Some(locks) = &self.locks {
            locks.release_all(ctx.connection);
        }
        let session = self
            .sessions
            .lock()
            .expect("sessions lock poisoned")
            .remove(&ctx.connection);
        for instance in session.into_iter().flat_map(HashMap::into_values) {
            instance.close();
        }
    }
}

/// One name a daemon publishes into one nameserver.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub nameserver: String,
    pub nameserver_address: Address,
    pub name: String,
    pub address: Address,
    pub metadata: Vec<String>,
}

/// Endpoint written into published addresses, honoring the NAT override.
pub fn published_endpoint(profile: &DaemonProfile, bound: &Endpoint) -> Endpoint {
    match bound {
        Endpoint::Tcp { port, .. } => Endpoint::Tcp {
            host: profile
                .nat_host
                .clone()
                .unwrap_or_else(|| nameserver::connect_host(&profile.host).to_string()),
            port: profile.nat_port.unwrap_or(*port),
        },
        unix => unix.clone(),
    }
}

/// Everything a daemon registers: each hosted service with its binding's
/// nameservers, and the daemon object with the profile's nameservers.
pub fn registrations(name: &str, config: &LabConfig, published: &Endpoint) -> Result<Vec<Registration>> {
    let profile = config.daemon(name)?;
    let mut plan = Vec::new();

    let mut push = |ns: &str, entry: String, object: &str, metadata: Vec<String>| -> Result<()> {
        plan.push(Registration {
            nameserver: ns.to_string(),
            nameserver_address: nameserver::address_of(config.nameserver(ns)?),
            name: entry,
            address: Address::new(object, published.clone()),
            metadata,
        });
        Ok(())
    };

    for (service, binding) in config.services_for_daemon(name) {
        let mut metadata = vec![format!("implementation:{}", binding.implementation)];
        if !binding.description.is_empty() {
            metadata.push(binding.description.clone());
        }
        for ns in &binding.nameservers {
            push(ns, service.clone(), service, metadata.clone())?;
        }
    }
    for ns in &profile.nameservers {
        push(
            ns,
            format!("{DAEMON_OBJECT}.{name}"),
            DAEMON_OBJECT,
            vec![format!("variant:{:?}", profile.variant).to_lowercase()],
        )?;
    }
    Ok(plan)
}

fn by_nameserver(plan: &[Registration]) -> BTreeMap<&str, Vec<&Registration>> {
    let mut grouped: BTreeMap<&str, Vec<&Registration>> = BTreeMap::new();
    for registration in plan {
        grouped
            .entry(registration.nameserver.as_str())
            .or_default()
            .push(registration);
    }
    grouped
}

/// Publish the plan, retrying each nameserver with linear backoff.
pub async fn register_all(plan: &[Registration], settings: &SupervisorSettings) -> Vec<String> {
    let mut failed = Vec::new();
    for (ns, entries) in by_nameserver(plan) {
        let attempts = settings.registration_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match publish(&entries).await {
                Ok(()) => {
                    info!(nameserver = ns, count = entries.len(), "Registered with nameserver");
                    break;
                }
                Err(e) if attempt < attempts => {
                    debug!(nameserver = ns, attempt, "Registration failed, retrying: {}", e);
                    tokio::time::sleep(settings.registration_backoff() * attempt).await;
                }
                Err(e) => {
                    error!(nameserver = ns, attempts, "Giving up on registration: {}", e);
                    failed.push(ns.to_string());
                    break;
                }
            }
        }
    }
    failed
}

async fn publish(entries: &[&Registration]) -> Result<()> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    let mut client = NameserverClient::connect(&first.nameserver_address).await?;
    for entry in entries {
        client
            .register(&entry.name, &entry.address, &entry.metadata)
            .await?;
    }
    Ok(())
}

/// Best-effort removal of the plan's names on shutdown.
pub async fn deregister_all(plan: &[Registration]) {
    for (ns, entries) in by_nameserver(plan) {
        let result = async {
            let mut client = NameserverClient::connect(&entries[0].nameserver_address).await?;
            for entry in &entries {
                client.remove(&entry.name).await?;
            }
            Ok::<_, LabError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(nameserver = ns, "Failed to remove registrations: {}", e);
        }
    }
}

/// Entry point of the `run-daemon` subprocess.
pub async fn run(name: &str, config: &LabConfig, settings: &SupervisorSettings) -> anyhow::Result<()> {
    let host = Arc::new(DaemonHost::build(name, config, ServiceCatalog::builtin())?);
    let profile = host.profile().clone();

    let endpoint = match &profile.unix_socket {
        Some(path) => Endpoint::Unix { path: path.clone() },
        None => Endpoint::Tcp {
            host: profile.host.clone(),
            port: profile.port,
        },
    };
    let listener = Listener::bind(&endpoint)
        .await
        .with_context(|| format!("Failed to bind daemon '{}' on {}", name, endpoint))?;
    let published = published_endpoint(&profile, &listener.local_endpoint()?);
    let plan = registrations(name, config, &published)?;

    let shutdown = CancellationToken::new();
    crate::shutdown::cancel_on_signal(shutdown.clone())?;

    let server = ObjectServer::new(Arc::clone(&host), profile.concurrency, profile.max_workers)
        .idle_timeout(profile.comm_timeout());
    let serving = tokio::spawn(server.serve(listener, shutdown.clone()));

    let failed = register_all(&plan, settings).await;
    if !failed.is_empty() {
        warn!(nameservers = ?failed, "Daemon is serving but unregistered with some nameservers");
    }
    info!(
        name,
        endpoint = %published,
        services = host.service_names().count(),
        variant = ?profile.variant,
        "Daemon ready"
    );

    serving.await.context("Object server task failed")??;

    deregister_all(&plan).await;
    host.close();
    info!(name, "Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, Concurrency};
    use crate::error::ErrorKind;
    use crate::transport::Proxy;
    use std::time::Duration;

    const BENCH: &str = r#"
daemons:
  lockable:
    variant: lockable
    nameservers: [default]
  plain: {}
services:
  asgard.hulk:
    implementation: sample.SampleService
    daemon: lockable
    nameservers: [default]
    description: bench supply
  asgard.thor:
    implementation: sample.SampleService
    daemon: lockable
    instance_mode: per-session
  asgard.loki:
    implementation: sample.SampleService
    daemon: plain
    instance_mode: per-call
"#;

    fn config() -> LabConfig {
        ConfigLoader::new().load_str(BENCH).unwrap()
    }

    fn host(name: &str) -> DaemonHost {
        DaemonHost::build(name, &config(), ServiceCatalog::builtin()).unwrap()
    }

    fn ctx(connection: ConnectionId) -> CallContext {
        CallContext {
            connection,
            peer: "test".into(),
        }
    }

    fn call(host: &DaemonHost, conn: ConnectionId, object: &str, method: &str, args: Value) -> Result<Value> {
        host.dispatch(
            &ctx(conn),
            &Call {
                object: object.into(),
                method: method.into(),
                args,
            },
        )
    }

    #[test]
    fn lock_blocks_other_connections_until_disconnect() {
        let host = host("lockable");
        call(&host, 1, "asgard.hulk", "lock", json!(["ana"])).unwrap();

        let err = call(&host, 2, "asgard.hulk", "echo", json!(["x"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        let err = call(&host, 2, "asgard.hulk", "lock", Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyLocked);
        assert!(call(&host, 1, "asgard.hulk", "echo", json!(["x"])).is_ok());
        assert!(call(&host, 2, "asgard.thor", "echo", json!(["x"])).is_ok());
        assert_eq!(call(&host, 2, "asgard.hulk", "islocked", Value::Null).unwrap(), json!(true));

        host.disconnected(&ctx(1));
        call(&host, 2, "asgard.hulk", "lock", Value::Null).unwrap();
        assert_eq!(call(&host, 2, "asgard.hulk", "release", Value::Null).unwrap(), json!(true));
    }

    #[test]
    fn plain_daemon_has_no_locking() {
        let host = host("plain");
        let err = call(&host, 1, "asgard.loki", "lock", Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);
        let err = call(&host, 1, DAEMON_OBJECT, "locks", Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownObject);
    }

    #[test]
    fn instance_modes_control_identity() {
        let lockable = host("lockable");
        let a1 = call(&lockable, 1, "asgard.thor", "whoami", Value::Null).unwrap();
        let a2 = call(&lockable, 1, "asgard.thor", "whoami", Value::Null).unwrap();
        let b = call(&lockable, 2, "asgard.thor", "whoami", Value::Null).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);

        let s1 = call(&lockable, 1, "asgard.hulk", "whoami", Value::Null).unwrap();
        let s2 = call(&lockable, 2, "asgard.hulk", "whoami", Value::Null).unwrap();
        assert_eq!(s1, s2);

        let plain = host("plain");
        let c1 = call(&plain, 1, "asgard.loki", "whoami", Value::Null).unwrap();
        let c2 = call(&plain, 1, "asgard.loki", "whoami", Value::Null).unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn daemon_object_reports_services_and_locks() {
        let host = host("lockable");
        let services = call(&host, 1, DAEMON_OBJECT, "services", Value::Null).unwrap();
        assert_eq!(services.as_array().unwrap().len(), 2);

        call(&host, 1, "asgard.hulk", "lock", Value::Null).unwrap();
        let locks = call(&host, 9, DAEMON_OBJECT, "locks", Value::Null).unwrap();
        assert_eq!(locks["asgard.hulk"]["holder"], json!(1));
        assert!(locks["asgard.thor"].is_null());

        assert_eq!(
            call(&host, 9, DAEMON_OBJECT, "force_release", json!(["asgard.hulk"])).unwrap(),
            json!(true)
        );
        let describe = call(&host, 2, "asgard.hulk", "describe", Value::Null).unwrap();
        assert_eq!(describe["description"], json!("bench supply"));
        assert_eq!(describe["locking"], json!(LOCK_OPERATIONS));
    }

    #[test]
    fn registrations_use_nat_override() {
        let mut config = config();
        let profile = config.daemons.get_mut("lockable").unwrap();
        profile.nat_host = Some("lab.example.org".into());
        profile.nat_port = Some(9100);
        let published = published_endpoint(
            &config.daemons["lockable"],
            &Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 40404,
            },
        );

        let plan = registrations("lockable", &config, &published).unwrap();
        let names: Vec<_> = plan.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["asgard.hulk", "daemon.lockable"]);
        assert_eq!(plan[0].address.to_string(), "obj:asgard.hulk@lab.example.org:9100");
        assert_eq!(plan[1].address.object, DAEMON_OBJECT);
    }

    #[tokio::test]
    async fn closing_holder_connection_frees_lock_over_transport() {
        let host = Arc::new(host("lockable"));
        let listener = Listener::bind(&Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        })
        .await
        .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let token = CancellationToken::new();
        tokio::spawn(ObjectServer::new(host, Concurrency::Threaded, 4).serve(listener, token.clone()));

        let address = Address::new("asgard.hulk", endpoint);
        let mut holder = Proxy::connect(&address).await.unwrap();
        let mut other = Proxy::connect(&address).await.unwrap();

        holder.call("lock", json!(["ana"])).await.unwrap();
        let err = other.call("echo", json!(["hi"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);

        drop(holder);
        let mut acquired = false;
        for _ in 0..50 {
            if other.call("lock", Value::Null).await.is_ok() {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(acquired);
        token.cancel();
    }

    #[tokio::test]
    async fn silent_holder_loses_lock_after_comm_timeout() {
        let mut config = config();
        config.daemons.get_mut("lockable").unwrap().comm_timeout_secs = 1;
        let profile = config.daemons["lockable"].clone();
        let host = Arc::new(DaemonHost::build("lockable", &config, ServiceCatalog::builtin()).unwrap());
        let listener = Listener::bind(&Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port: 0,
        })
        .await
        .unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let token = CancellationToken::new();
        let server = ObjectServer::new(host, profile.concurrency, profile.max_workers)
            .idle_timeout(profile.comm_timeout());
        tokio::spawn(server.serve(listener, token.clone()));

        let address = Address::new("asgard.hulk", endpoint);
        let mut holder = Proxy::connect(&address).await.unwrap();
        holder.call("lock", json!(["ana"])).await.unwrap();

        // the holder stays connected but says nothing
        let mut acquired = false;
        for _ in 0..60 {
            let mut other = Proxy::connect(&address).await.unwrap();
            if other.call("lock", json!(["ben"])).await.is_ok() {
                acquired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(acquired);
        assert!(holder.call("islocked", Value::Null).await.is_err());
        token.cancel();
    }
}
