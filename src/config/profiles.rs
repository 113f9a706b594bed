use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Name that always resolves to a built-in profile unless the file overrides it.
pub const DEFAULT_PROFILE: &str = "default";
/// Reserved for "every profile" in control requests; never a profile name.
pub const RESERVED_ALL: &str = "all";

/// Which kind of subprocess a profile describes.
///
/// Ordering follows startup dependency order: nameservers come first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[rkyv(derive(Debug))]
pub enum ProfileKind {
    Nameserver,
    Daemon,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Nameserver => "nameserver",
            ProfileKind::Daemon => "daemon",
        }
    }

    /// Top-level section of the configuration document.
    pub fn section(&self) -> &'static str {
        match self {
            ProfileKind::Nameserver => "nameservers",
            ProfileKind::Daemon => "daemons",
        }
    }
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProfileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nameserver" | "ns" => Ok(ProfileKind::Nameserver),
            "daemon" => Ok(ProfileKind::Daemon),
            other => Err(format!("unknown profile kind '{other}'")),
        }
    }
}

/// Any named entry of the document: a profile or a service binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Nameserver,
    Daemon,
    Service,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Nameserver => "nameserver",
            EntryKind::Daemon => "daemon",
            EntryKind::Service => "service",
        }
    }

    pub fn section(&self) -> &'static str {
        match self {
            EntryKind::Nameserver => "nameservers",
            EntryKind::Daemon => "daemons",
            EntryKind::Service => "services",
        }
    }

    /// The process kind, for entries that run as a subprocess.
    pub fn profile(&self) -> Option<ProfileKind> {
        match self {
            EntryKind::Nameserver => Some(ProfileKind::Nameserver),
            EntryKind::Daemon => Some(ProfileKind::Daemon),
            EntryKind::Service => None,
        }
    }
}

impl From<ProfileKind> for EntryKind {
    fn from(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Nameserver => EntryKind::Nameserver,
            ProfileKind::Daemon => EntryKind::Daemon,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(EntryKind::Service),
            other => other
                .parse::<ProfileKind>()
                .map(EntryKind::from)
                .map_err(|_| format!("unknown entry kind '{other}'")),
        }
    }
}

/// Field names accepted for a record, used to reject unknown keys in strict mode.
pub(crate) trait ProfileRecord:
    Serialize + serde::de::DeserializeOwned + Default + PartialEq
{
    const FIELDS: &'static [&'static str];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    #[default]
    Memory,
    #[serde(alias = "dbm")]
    Keyed,
    #[serde(alias = "sql")]
    Relational,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NameserverProfile {
    pub host: String,
    pub port: u16,
    /// Broadcast responder bind host; `None` disables the responder.
    pub broadcast_host: Option<String>,
    pub broadcast_port: u16,
    /// Seconds between autoclean sweeps; 0 disables.
    pub autoclean_secs: u64,
    pub storage: StorageBackend,
    pub storage_path: Option<PathBuf>,
}

impl Default for NameserverProfile {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9090,
            broadcast_host: None,
            broadcast_port: 9091,
            autoclean_secs: 0,
            storage: StorageBackend::Memory,
            storage_path: None,
        }
    }
}

impl ProfileRecord for NameserverProfile {
    const FIELDS: &'static [&'static str] = &[
        "host",
        "port",
        "broadcast_host",
        "broadcast_port",
        "autoclean_secs",
        "storage",
        "storage_path",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonVariant {
    #[default]
    Plain,
    Lockable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    #[default]
    #[serde(alias = "thread")]
    Threaded,
    #[serde(alias = "multiplex")]
    Multiplexed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonProfile {
    pub variant: DaemonVariant,
    pub host: String,
    /// 0 picks a free port.
    pub port: u16,
    pub concurrency: Concurrency,
    /// Worker pool ceiling under threaded concurrency.
    pub max_workers: usize,
    pub unix_socket: Option<PathBuf>,
    pub nat_host: Option<String>,
    pub nat_port: Option<u16>,
    /// Nameserver profiles the daemon registers itself with.
    pub nameservers: Vec<String>,
    /// Close connections silent for this long, releasing their locks. 0 waits forever.
    pub comm_timeout_secs: u64,
}

impl DaemonProfile {
    pub fn comm_timeout(&self) -> Option<Duration> {
        (self.comm_timeout_secs > 0).then(|| Duration::from_secs(self.comm_timeout_secs))
    }
}

impl Default for DaemonProfile {
    fn default() -> Self {
        Self {
            variant: DaemonVariant::Plain,
            host: "localhost".to_string(),
            port: 0,
            concurrency: Concurrency::Threaded,
            max_workers: 16,
            unix_socket: None,
            nat_host: None,
            nat_port: None,
            nameservers: Vec::new(),
            comm_timeout_secs: 0,
        }
    }
}

impl ProfileRecord for DaemonProfile {
    const FIELDS: &'static [&'static str] = &[
        "variant",
        "host",
        "port",
        "concurrency",
        "max_workers",
        "unix_socket",
        "nat_host",
        "nat_port",
        "nameservers",
        "comm_timeout_secs",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceMode {
    #[default]
    #[serde(alias = "single")]
    Singleton,
    #[serde(alias = "session")]
    PerSession,
    #[serde(alias = "percall")]
    PerCall,
}

/// Constructor parameter value. Only shapes the transport can carry are representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Int(i) => serde_json::Value::from(*i),
            ParamValue::Float(f) => serde_json::Value::from(*f),
            ParamValue::Str(s) => serde_json::Value::String(s.clone()),
            ParamValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ParamValue::to_json).collect())
            }
            ParamValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

pub type Parameters = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBinding {
    /// Catalog reference, `<module>.<Class>`.
    pub implementation: String,
    pub parameters: Parameters,
    pub description: String,
    pub instance_mode: InstanceMode,
    pub daemon: String,
    pub nameservers: Vec<String>,
}

impl Default for ServiceBinding {
    fn default() -> Self {
        Self {
            implementation: String::new(),
            parameters: BTreeMap::new(),
            description: String::new(),
            instance_mode: InstanceMode::Singleton,
            daemon: DEFAULT_PROFILE.to_string(),
            nameservers: Vec::new(),
        }
    }
}

impl ProfileRecord for ServiceBinding {
    const FIELDS: &'static [&'static str] = &[
        "implementation",
        "parameters",
        "description",
        "instance_mode",
        "daemon",
        "nameservers",
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Autolaunch {
    pub nameservers: Vec<String>,
    pub daemons: Vec<String>,
}

impl Autolaunch {
    pub fn is_empty(&self) -> bool {
        self.nameservers.is_empty() && self.daemons.is_empty()
    }

    pub fn names_mut(&mut self, kind: ProfileKind) -> &mut Vec<String> {
        match kind {
            ProfileKind::Nameserver => &mut self.nameservers,
            ProfileKind::Daemon => &mut self.daemons,
        }
    }
}

impl ProfileRecord for Autolaunch {
    const FIELDS: &'static [&'static str] = &["nameservers", "daemons"];
}
