//! Service capability interface and the catalog of implementations
//!
//! A service is a value implementing [`Service`]: a fixed dispatch table of
//! named operations. Implementations are looked up by their `<module>.<Class>`
//! reference in a [`ServiceCatalog`] when the configuration is loaded, and
//! constructed once per instance by the hosting daemon.

pub mod sample;

use crate::config::Parameters;
use crate::error::{LabError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Transport-assigned identifier of one client connection.
pub type ConnectionId = u64;

/// Who is calling, as reported by the transport.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub connection: ConnectionId,
    pub peer: String,
}

/// One remotely callable entry point.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Operation {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub returns: &'static str,
    pub summary: &'static str,
}

pub trait Service: Send + Sync {
    /// The dispatch table; only these operations are reachable remotely.
    fn operations(&self) -> &'static [Operation];

    fn call(&self, ctx: &CallContext, operation: &str, args: Args<'_>) -> Result<Value>;

    /// Release hardware or other resources. Called once when the instance is dropped
    /// by its daemon (shutdown, session end, or after a per-call invocation).
    fn close(&self) {}
}

/// Call arguments: a JSON array (positional), an object (named), or a single value.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a>(&'a Value);

impl<'a> Args<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self(value)
    }

    pub fn get(&self, index: usize, name: &str) -> Option<&'a Value> {
        match self.0 {
            Value::Array(items) => items.get(index),
            Value::Object(map) => map.get(name),
            Value::Null => None,
            single if index == 0 => Some(single),
            _ => None,
        }
    }

    /// Every positional argument, for variadic operations.
    pub fn positional(&self) -> Vec<&'a Value> {
        match self.0 {
            Value::Array(items) => items.iter().collect(),
            Value::Null | Value::Object(_) => Vec::new(),
            single => vec![single],
        }
    }

    pub fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T> {
        self.optional(index, name)?
            .ok_or_else(|| LabError::InvalidArgument(format!("missing argument '{name}'")))
    }

    pub fn optional<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>> {
        match self.get(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| LabError::InvalidArgument(format!("argument '{name}': {e}"))),
        }
    }
}

pub type Constructor = fn(&Parameters) -> Result<Box<dyn Service>>;

/// Registry of service implementations keyed by `<module>.<Class>`.
#[derive(Clone, Default)]
pub struct ServiceCatalog {
    constructors: BTreeMap<String, Constructor>,
}

impl ServiceCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        sample::register(&mut catalog);
        catalog
    }

    pub fn register(&mut self, reference: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(reference.into(), constructor);
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.constructors.contains_key(reference)
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn construct(&self, reference: &str, parameters: &Parameters) -> Result<Box<dyn Service>> {
        let constructor = self.constructors.get(reference).ok_or_else(|| {
            LabError::config(reference, "implementation", "not in the service catalog")
        })?;
        tracing::debug!(implementation = reference, "Constructing service instance");
        constructor(parameters)
    }
}

/// Read a constructor parameter into a concrete type.
pub(crate) fn parameter<T: DeserializeOwned>(
    parameters: &Parameters,
    name: &str,
) -> Result<Option<T>> {
    parameters
        .get(name)
        .map(|value| {
            serde_json::from_value(value.to_json())
                .map_err(|e| LabError::InvalidArgument(format!("parameter '{name}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_accept_positional_and_named() {
        let positional = json!(["hello", 2]);
        let named = json!({"message": "hello", "seconds": 2});

        for value in [&positional, &named] {
            let args = Args::new(value);
            assert_eq!(args.required::<String>(0, "message").unwrap(), "hello");
            assert_eq!(args.required::<u64>(1, "seconds").unwrap(), 2);
        }
    }

    #[test]
    fn args_report_missing_and_mistyped() {
        let value = json!(["hello"]);
        let args = Args::new(&value);
        assert!(matches!(
            args.required::<u64>(1, "seconds"),
            Err(LabError::InvalidArgument(_))
        ));
        assert!(matches!(
            args.required::<u64>(0, "seconds"),
            Err(LabError::InvalidArgument(_))
        ));
        assert_eq!(args.optional::<bool>(3, "reverse").unwrap(), None);
    }

    #[test]
    fn builtin_catalog_resolves_samples() {
        let catalog = ServiceCatalog::builtin();
        assert!(catalog.contains("sample.SampleService"));
        assert!(catalog.contains("sample.SelectiveSampleService"));
        assert!(!catalog.contains("sample.Missing"));
        assert!(catalog
            .construct("sample.Missing", &Parameters::new())
            .is_err());
    }
}
