//! Instrument configuration model
//!
//! Named nameserver profiles, daemon profiles, service bindings and the
//! autolaunch set. A [`LabConfig`] is a plain value: it is loaded once
//! (all-or-nothing) by [`ConfigLoader`], handed to the supervisor or to a
//! subprocess at construction time, and written back with [`LabConfig::render`].

mod document;
mod profiles;

pub use document::{ConfigLoader, RenderView};
pub use profiles::{
    ArchivedProfileKind, Autolaunch, Concurrency, DaemonProfile, DaemonVariant, EntryKind, InstanceMode,
    NameserverProfile,
    ParamValue, Parameters, ProfileKind, ServiceBinding, StorageBackend, DEFAULT_PROFILE,
    RESERVED_ALL,
};

use crate::error::{LabError, Result};
use crate::service::ServiceCatalog;
use std::collections::{BTreeMap, BTreeSet};

/// Highest document `version` this build understands.
pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct LabConfig {
    pub version: u32,
    pub nameservers: BTreeMap<String, NameserverProfile>,
    pub daemons: BTreeMap<String, DaemonProfile>,
    pub services: BTreeMap<String, ServiceBinding>,
    pub autolaunch: Autolaunch,
}

impl Default for LabConfig {
    /// Built-in profiles only: the `default` nameserver and `default` daemon.
    fn default() -> Self {
        let mut nameservers = BTreeMap::new();
        nameservers.insert(DEFAULT_PROFILE.to_string(), NameserverProfile::default());
        let mut daemons = BTreeMap::new();
        daemons.insert(DEFAULT_PROFILE.to_string(), DaemonProfile::default());

        Self {
            version: SUPPORTED_VERSION,
            nameservers,
            daemons,
            services: BTreeMap::new(),
            autolaunch: Autolaunch::default(),
        }
    }
}

/// Reject names that can never identify a profile.
pub(crate) fn check_name(section: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LabError::config(
            format!("{section}.<empty>"),
            "name",
            "profile names must not be empty",
        ));
    }
    if name == RESERVED_ALL {
        return Err(LabError::config(
            format!("{section}.{name}"),
            "name",
            format!("'{RESERVED_ALL}' is reserved"),
        ));
    }
    Ok(())
}

impl LabConfig {
    pub fn contains(&self, kind: ProfileKind, name: &str) -> bool {
        match kind {
            ProfileKind::Nameserver => self.nameservers.contains_key(name),
            ProfileKind::Daemon => self.daemons.contains_key(name),
        }
    }

    pub fn names(&self, kind: ProfileKind) -> Vec<String> {
        match kind {
            ProfileKind::Nameserver => self.nameservers.keys().cloned().collect(),
            ProfileKind::Daemon => self.daemons.keys().cloned().collect(),
        }
    }

    pub fn nameserver(&self, name: &str) -> Result<&NameserverProfile> {
        self.nameservers
            .get(name)
            .ok_or_else(|| LabError::UnknownProfile {
                kind: ProfileKind::Nameserver,
                name: name.to_string(),
            })
    }

    pub fn daemon(&self, name: &str) -> Result<&DaemonProfile> {
        self.daemons.get(name).ok_or_else(|| LabError::UnknownProfile {
            kind: ProfileKind::Daemon,
            name: name.to_string(),
        })
    }

    /// Bindings hosted by the given daemon profile, by service name.
    pub fn services_for_daemon<'a>(
        &'a self,
        daemon: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ServiceBinding)> + 'a {
        self.services
            .iter()
            .filter(move |(_, binding)| binding.daemon == daemon)
    }

    /// Nameservers a daemon talks to, either for itself or for a hosted service.
    pub fn daemon_dependencies(&self, daemon: &str) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self
            .daemons
            .get(daemon)
            .map(|d| d.nameservers.iter().cloned().collect())
            .unwrap_or_default();
        for (_, binding) in self.services_for_daemon(daemon) {
            deps.extend(binding.nameservers.iter().cloned());
        }
        deps
    }

    /// Daemons that register with the given nameserver.
    pub fn nameserver_dependents(&self, nameserver: &str) -> Vec<String> {
        self.daemons
            .keys()
            .filter(|daemon| self.daemon_dependencies(daemon).contains(nameserver))
            .cloned()
            .collect()
    }

    /// Stable digest of everything that affects the subprocess for a profile.
    ///
    /// Daemon fingerprints cover the profile, every binding it hosts and the
    /// nameserver profiles it registers with, so a restarted nameserver is
    /// followed by a re-registering daemon.
    pub fn fingerprint(&self, kind: ProfileKind, name: &str) -> Option<String> {
        let digest = match kind {
            ProfileKind::Nameserver => serde_json::to_string(self.nameservers.get(name)?),
            ProfileKind::Daemon => {
                let profile = self.daemons.get(name)?;
                let services: BTreeMap<&String, &ServiceBinding> =
                    self.services_for_daemon(name).collect();
                let nameservers: BTreeMap<String, Option<&NameserverProfile>> = self
                    .daemon_dependencies(name)
                    .into_iter()
                    .map(|ns| {
                        let profile = self.nameservers.get(&ns);
                        (ns, profile)
                    })
                    .collect();
                serde_json::to_string(&(profile, services, nameservers))
            }
        };
        digest.ok()
    }

    /// Check cross-references, names and catalog resolution.
    pub fn validate(&self, catalog: Option<&ServiceCatalog>) -> Result<()> {
        if self.version > SUPPORTED_VERSION {
            return Err(LabError::config(
                "<document>",
                "version",
                format!(
                    "version {} is newer than supported version {SUPPORTED_VERSION}",
                    self.version
                ),
            ));
        }

        for name in self.nameservers.keys() {
            check_name("nameservers", name)?;
        }

        for (name, daemon) in &self.daemons {
            check_name("daemons", name)?;
            if daemon.max_workers == 0 {
                return Err(LabError::config(
                    format!("daemons.{name}"),
                    "max_workers",
                    "must be at least 1",
                ));
            }
            for ns in &daemon.nameservers {
                if !self.nameservers.contains_key(ns) {
                    return Err(LabError::config(
                        format!("daemons.{name}"),
                        "nameservers",
                        format!("references unknown nameserver '{ns}'"),
                    ));
                }
            }
        }

        for (name, binding) in &self.services {
            check_name("services", name)?;
            if binding.implementation.trim().is_empty() {
                return Err(LabError::config(
                    format!("services.{name}"),
                    "implementation",
                    "is required",
                ));
            }
            if let Some(catalog) = catalog {
                if !catalog.contains(&binding.implementation) {
                    return Err(LabError::config(
                        format!("services.{name}"),
                        "implementation",
                        format!("'{}' is not in the service catalog", binding.implementation),
                    ));
                }
            }
            if !self.daemons.contains_key(&binding.daemon) {
                return Err(LabError::config(
                    format!("services.{name}"),
                    "daemon",
                    format!("references unknown daemon '{}'", binding.daemon),
                ));
            }
            for ns in &binding.nameservers {
                if !self.nameservers.contains_key(ns) {
                    return Err(LabError::config(
                        format!("services.{name}"),
                        "nameservers",
                        format!("references unknown nameserver '{ns}'"),
                    ));
                }
            }
        }

        for (kind, names) in [
            (ProfileKind::Nameserver, &self.autolaunch.nameservers),
            (ProfileKind::Daemon, &self.autolaunch.daemons),
        ] {
            for name in names {
                if !self.contains(kind, name) {
                    return Err(LabError::config(
                        "autolaunch",
                        kind.section(),
                        format!("references unknown {kind} '{name}'"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Rename a profile and rewrite every reference to it.
    pub fn rename(&mut self, kind: ProfileKind, old: &str, new: &str) -> Result<()> {
        check_name(kind.section(), new)?;
        if !self.contains(kind, old) {
            return Err(LabError::UnknownProfile {
                kind,
                name: old.to_string(),
            });
        }
        if self.contains(kind, new) {
            return Err(LabError::config(
                format!("{}.{new}", kind.section()),
                "name",
                format!("a {kind} named '{new}' already exists"),
            ));
        }

        let replace = |names: &mut Vec<String>| {
            for n in names.iter_mut().filter(|n| n.as_str() == old) {
                *n = new.to_string();
            }
        };

        match kind {
            ProfileKind::Nameserver => {
                if let Some(profile) = self.nameservers.remove(old) {
                    self.nameservers.insert(new.to_string(), profile);
                }
                for daemon in self.daemons.values_mut() {
                    replace(&mut daemon.nameservers);
                }
                for binding in self.services.values_mut() {
                    replace(&mut binding.nameservers);
                }
            }
            ProfileKind::Daemon => {
                if let Some(profile) = self.daemons.remove(old) {
                    self.daemons.insert(new.to_string(), profile);
                }
                for binding in self.services.values_mut() {
                    if binding.daemon == old {
                        binding.daemon = new.to_string();
                    }
                }
            }
        }
        replace(self.autolaunch.names_mut(kind));

        tracing::debug!(%kind, old, new, "Renamed profile");
        Ok(())
    }

    /// Rename a service binding. The hosting daemon keeps its name; its
    /// fingerprint changes, so the next reload restarts it.
    pub fn rename_service(&mut self, old: &str, new: &str) -> Result<()> {
        check_name("services", new)?;
        if self.services.contains_key(new) {
            return Err(LabError::config(
                format!("services.{new}"),
                "name",
                format!("a service named '{new}' already exists"),
            ));
        }
        let binding = self
            .services
            .remove(old)
            .ok_or_else(|| LabError::UnknownService(old.to_string()))?;
        self.services.insert(new.to_string(), binding);

        tracing::debug!(old, new, "Renamed service");
        Ok(())
    }
}
