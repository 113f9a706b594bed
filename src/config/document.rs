use super::profiles::{
    Autolaunch, DaemonProfile, EntryKind, NameserverProfile, ProfileRecord, ServiceBinding,
};
use super::{check_name, LabConfig};
use crate::error::{LabError, Result};
use crate::service::ServiceCatalog;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const TOP_LEVEL_FIELDS: &[&str] = &["version", "nameservers", "daemons", "services", "autolaunch"];

/// Which form [`LabConfig::render`] writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderView {
    /// Every field of every profile, built-ins included.
    Merged,
    /// Only what differs from documented defaults.
    Diff,
}

/// Parses a declarative document into a validated [`LabConfig`].
///
/// Loading is all-or-nothing: any violation yields a `Configuration` error
/// and no partially-built value escapes.
#[derive(Clone)]
pub struct ConfigLoader {
    strict: bool,
    catalog: Option<ServiceCatalog>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            strict: false,
            catalog: Some(ServiceCatalog::builtin()),
        }
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject unknown fields instead of ignoring them.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn catalog(mut self, catalog: ServiceCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Check an in-memory configuration with this loader's catalog.
    pub fn validate(&self, config: &LabConfig) -> Result<()> {
        config.validate(self.catalog.as_ref())
    }

    pub fn load_file(&self, path: &Path) -> Result<LabConfig> {
        tracing::trace!(path = %path.display(), strict = self.strict, "Loading configuration");
        let text = std::fs::read_to_string(path).map_err(|e| {
            LabError::config(
                path.display().to_string(),
                "-",
                format!("cannot read document: {e}"),
            )
        })?;
        self.load_str(&text)
    }

    /// Like [`Self::load_file`], but a missing file yields the built-in profiles.
    pub fn load_file_or_default(&self, path: &Path) -> Result<LabConfig> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No configuration file, using built-in profiles");
            return Ok(LabConfig::default());
        }
        self.load_file(path)
    }

    pub fn load_str(&self, text: &str) -> Result<LabConfig> {
        let root: Value = serde_yaml::from_str(text)
            .map_err(|e| LabError::config("<document>", "-", e.to_string()))?;

        let root = match root {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m,
            _ => {
                return Err(LabError::config(
                    "<document>",
                    "-",
                    "top level must be a mapping",
                ))
            }
        };

        for key in root.keys() {
            let key = key.as_str().unwrap_or("<non-string>");
            if !TOP_LEVEL_FIELDS.contains(&key) {
                self.unknown_field("<document>", key)?;
            }
        }

        let mut config = LabConfig::default();

        if let Some(version) = root.get("version") {
            config.version = version
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    LabError::config("<document>", "version", "must be a positive integer")
                })?;
        }

        for (name, value) in section_entries("nameservers", root.get("nameservers"))? {
            let profile: NameserverProfile = self.parse_record("nameservers", &name, value)?;
            config.nameservers.insert(name, profile);
        }
        for (name, value) in section_entries("daemons", root.get("daemons"))? {
            let profile: DaemonProfile = self.parse_record("daemons", &name, value)?;
            config.daemons.insert(name, profile);
        }
        for (name, value) in section_entries("services", root.get("services"))? {
            let binding: ServiceBinding = self.parse_record("services", &name, value)?;
            config.services.insert(name, binding);
        }
        if let Some(value) = root.get("autolaunch") {
            config.autolaunch = self.parse_record("autolaunch", "-", value.clone())?;
        }

        config.validate(self.catalog.as_ref())?;
        Ok(config)
    }

    fn unknown_field(&self, label: &str, field: &str) -> Result<()> {
        if self.strict {
            return Err(LabError::config(label, field, "unknown field"));
        }
        tracing::warn!(profile = label, field, "Ignoring unknown field");
        Ok(())
    }

    fn parse_record<T: ProfileRecord>(&self, section: &str, name: &str, value: Value) -> Result<T> {
        let label = if name == "-" {
            section.to_string()
        } else {
            format!("{section}.{name}")
        };

        let mapping = match value {
            Value::Null => return Ok(T::default()),
            Value::Mapping(m) => m,
            _ => return Err(LabError::config(label, "-", "expected a mapping of fields")),
        };

        for key in mapping.keys() {
            let Some(key) = key.as_str() else {
                return Err(LabError::config(label, "-", "field names must be strings"));
            };
            if !T::FIELDS.contains(&key) {
                self.unknown_field(&label, key)?;
            }
        }

        serde_yaml::from_value::<T>(Value::Mapping(mapping.clone())).map_err(|err| {
            // Re-parse field by field to name the offender.
            let field = mapping
                .iter()
                .find(|(k, v)| {
                    let mut single = Mapping::new();
                    single.insert((*k).clone(), (*v).clone());
                    serde_yaml::from_value::<T>(Value::Mapping(single)).is_err()
                })
                .and_then(|(k, _)| k.as_str())
                .unwrap_or("-")
                .to_string();
            LabError::config(label, field, err.to_string())
        })
    }
}

/// Entries of a section written either as a mapping or as a list of
/// single-entry mappings.
fn section_entries(section: &str, value: Option<&Value>) -> Result<Vec<(String, Value)>> {
    let as_name = |key: &Value| -> Result<String> {
        let name = key
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LabError::config(section, "name", "profile names must be strings"))?;
        check_name(section, &name)?;
        Ok(name)
    };

    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Mapping(map)) => map
            .iter()
            .map(|(k, v)| Ok((as_name(k)?, v.clone())))
            .collect(),
        Some(Value::Sequence(items)) => {
            let mut seen = HashSet::new();
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                let entry = match item {
                    Value::Mapping(m) if m.len() == 1 => m.iter().next(),
                    _ => None,
                };
                let Some((key, value)) = entry else {
                    return Err(LabError::config(
                        section,
                        "-",
                        "list entries must be single-key mappings",
                    ));
                };
                let name = as_name(key)?;
                if !seen.insert(name.clone()) {
                    return Err(LabError::config(
                        format!("{section}.{name}"),
                        "name",
                        "duplicate name",
                    ));
                }
                entries.push((name, value.clone()));
            }
            Ok(entries)
        }
        Some(_) => Err(LabError::config(
            section,
            "-",
            "expected a mapping or a list of mappings",
        )),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_yaml::to_value(value)
        .map_err(|e| LabError::Internal(format!("failed to serialize configuration: {e}")))
}

/// Fields of `record` whose values differ from `T::default()`.
fn diff_fields<T: Serialize + Default>(record: &T) -> Result<Mapping> {
    let full = to_value(record)?;
    let base = to_value(&T::default())?;
    let mut diff = Mapping::new();
    if let Value::Mapping(full) = full {
        for (key, value) in full {
            if base.get(&key) != Some(&value) {
                diff.insert(key, value);
            }
        }
    }
    Ok(diff)
}

fn render_section<T: Serialize + Default + PartialEq>(
    records: &BTreeMap<String, T>,
    view: RenderView,
    builtin: Option<&str>,
) -> Result<Mapping> {
    let mut section = Mapping::new();
    for (name, record) in records {
        let value = match view {
            RenderView::Merged => to_value(record)?,
            RenderView::Diff => {
                if builtin == Some(name.as_str()) && *record == T::default() {
                    continue;
                }
                Value::Mapping(diff_fields(record)?)
            }
        };
        section.insert(Value::String(name.clone()), value);
    }
    Ok(section)
}

impl LabConfig {
    pub fn to_document(&self, view: RenderView) -> Result<Value> {
        let mut root = Mapping::new();
        root.insert("version".into(), Value::from(self.version));

        let sections = [
            (
                "nameservers",
                render_section(&self.nameservers, view, Some(super::DEFAULT_PROFILE))?,
            ),
            (
                "daemons",
                render_section(&self.daemons, view, Some(super::DEFAULT_PROFILE))?,
            ),
            ("services", render_section(&self.services, view, None)?),
        ];
        for (key, section) in sections {
            if view == RenderView::Merged || !section.is_empty() {
                root.insert(key.into(), Value::Mapping(section));
            }
        }

        match view {
            RenderView::Merged => {
                root.insert("autolaunch".into(), to_value(&self.autolaunch)?);
            }
            RenderView::Diff if !self.autolaunch.is_empty() => {
                root.insert(
                    "autolaunch".into(),
                    Value::Mapping(diff_fields::<Autolaunch>(&self.autolaunch)?),
                );
            }
            RenderView::Diff => {}
        }

        Ok(Value::Mapping(root))
    }

    pub fn render(&self, view: RenderView) -> Result<String> {
        serde_yaml::to_string(&self.to_document(view)?)
            .map_err(|e| LabError::Internal(format!("failed to render configuration: {e}")))
    }

    /// One profile or binding with every field shown, keyed by its name.
    pub fn render_entry(&self, kind: EntryKind, name: &str) -> Result<String> {
        let value = match kind {
            EntryKind::Nameserver => to_value(self.nameserver(name)?)?,
            EntryKind::Daemon => to_value(self.daemon(name)?)?,
            EntryKind::Service => to_value(
                self.services
                    .get(name)
                    .ok_or_else(|| LabError::UnknownService(name.to_string()))?,
            )?,
        };
        let mut root = Mapping::new();
        root.insert(Value::String(name.to_string()), value);
        serde_yaml::to_string(&Value::Mapping(root))
            .map_err(|e| LabError::Internal(format!("failed to render {kind} '{name}': {e}")))
    }

    /// Write the document, replacing `path` atomically.
    pub fn save(&self, path: &Path, view: RenderView) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, self.render(view)?)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), ?view, "Configuration written");
        Ok(())
    }
}
