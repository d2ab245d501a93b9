//! Key derivation for queue items and provisioned instances.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::record::Record;

const SEPARATOR: char = '/';

/// Queue and cache key for a record: `namespace/name`, or just `name` when the
/// namespace is empty.
///
/// Keys built through [`RecordKey::new`] always decode back to the pair they
/// were built from, because components containing the separator are rejected
/// up front. Keys obtained from elsewhere via [`RecordKey::from_raw`] are
/// checked when decoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Builds the key for a (namespace, name) pair.
    pub fn new(namespace: &str, name: &str) -> Result<Self, KeyError> {
        if namespace.contains(SEPARATOR) {
            return Err(KeyError::invalid_component("namespace", namespace));
        }
        if name.contains(SEPARATOR) {
            return Err(KeyError::invalid_component("name", name));
        }
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }

        if namespace.is_empty() {
            Ok(Self(name.to_string()))
        } else {
            Ok(Self(format!("{namespace}{SEPARATOR}{name}")))
        }
    }

    /// Builds the key for a record.
    pub fn for_record(record: &Record) -> Result<Self, KeyError> {
        Self::new(&record.namespace, &record.name)
    }

    /// Wraps an arbitrary string without validating it.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Splits the key back into `(namespace, name)`.
    pub fn split(&self) -> Result<(&str, &str), KeyError> {
        let mut parts = self.0.split(SEPARATOR);
        let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), None, None) => ("", name),
            (Some(namespace), Some(name), None) => (namespace, name),
            _ => return Err(KeyError::malformed(&self.0)),
        };

        if name.is_empty() {
            return Err(KeyError::malformed(&self.0));
        }
        Ok((namespace, name))
    }

    /// Returns the identifier of the managed instance for this key.
    pub fn instance_identifier(&self) -> Result<String, KeyError> {
        let (namespace, name) = self.split()?;
        Ok(instance_identifier(namespace, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of the managed instance backing a record: `namespace-name`.
///
/// This is a plain concatenation, so `("a-b", "c")` and `("a", "b-c")` map to
/// the same instance. Existing instances are named this way, so the format is
/// kept.
pub fn instance_identifier(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}
