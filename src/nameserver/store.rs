use crate::config::{NameserverProfile, StorageBackend};
use crate::error::Result;
use crate::transport::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub address: Address,
    #[serde(default)]
    pub metadata: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// Where registrations survive between nameserver restarts.
#[derive(Debug, Clone, PartialEq)]
pub enum Store {
    Memory,
    /// Whole-table JSON snapshot rewritten after every mutation.
    Snapshot(PathBuf),
}

impl Store {
    pub fn for_profile(name: &str, profile: &NameserverProfile) -> Self {
        match profile.storage {
            StorageBackend::Memory => Store::Memory,
            StorageBackend::Keyed | StorageBackend::Relational => {
                let path = profile.storage_path.clone().unwrap_or_else(|| {
                    crate::clienv::nameserver_storage_dir().join(format!("{name}.json"))
                });
                Store::Snapshot(path)
            }
        }
    }

    pub fn load(&self) -> Result<BTreeMap<String, Entry>> {
        let Store::Snapshot(path) = self else {
            return Ok(BTreeMap::new());
        };
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(path)?;
        match serde_json::from_str(&text) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Discarding unreadable registry snapshot: {}", e);
                Ok(BTreeMap::new())
            }
        }
    }

    pub fn persist(&self, entries: &BTreeMap<String, Entry>) -> Result<()> {
        let Store::Snapshot(path) = self else {
            return Ok(());
        };
        write_atomic(path, entries)
    }
}

fn write_atomic(path: &Path, entries: &BTreeMap<String, Entry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(entries)
        .map_err(|e| crate::error::LabError::Internal(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::Snapshot(dir.path().join("ns").join("default.json"));
        assert!(store.load().unwrap().is_empty());

        let mut entries = BTreeMap::new();
        entries.insert(
            "asgard.hulk".to_string(),
            Entry {
                address: Address::tcp("asgard.hulk", "localhost", 40000),
                metadata: vec!["bench supply".into()],
                registered_at: Utc::now(),
            },
        );
        store.persist(&entries).unwrap();
        assert_eq!(store.load().unwrap(), entries);
    }

    #[test]
    fn memory_store_keeps_nothing() {
        let store = Store::Memory;
        store.persist(&BTreeMap::new()).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn persistent_backends_share_snapshot_format() {
        let profile = NameserverProfile {
            storage: StorageBackend::Relational,
            storage_path: Some(PathBuf::from("/tmp/lab-ns.json")),
            ..Default::default()
        };
        assert_eq!(
            Store::for_profile("default", &profile),
            Store::Snapshot(PathBuf::from("/tmp/lab-ns.json"))
        );
    }
}
