use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Annotation that opts a record into provisioning.
pub const OPT_IN_ANNOTATION: &str = "dataform.io/provision";

/// The only annotation value that counts as opted in.
pub const OPT_IN_VALUE: &str = "true";

/// Data field holding the handle of the provisioned instance.
pub const HANDLE_FIELD: &str = "ARN";

/// Declared-state record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(default)]
    pub namespace: String,

    pub name: String,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    #[serde(default)]
    pub data: HashMap<String, String>,

    /// Optimistic concurrency token assigned by the store (0 = never stored)
    #[serde(default)]
    pub resource_version: u64,
}

impl Record {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Marks the record as opted in.
    pub fn opted_in(self) -> Self {
        self.with_annotation(OPT_IN_ANNOTATION, OPT_IN_VALUE)
    }

    /// True only when the opt-in annotation is exactly `"true"`.
    pub fn is_opted_in(&self) -> bool {
        self.annotations.get(OPT_IN_ANNOTATION).map(String::as_str) == Some(OPT_IN_VALUE)
    }

    /// Returns the stored handle, treating an empty value as absent.
    pub fn handle(&self) -> Option<&str> {
        self.data
            .get(HANDLE_FIELD)
            .map(String::as_str)
            .filter(|handle| !handle.is_empty())
    }

    pub fn is_provisioned(&self) -> bool {
        self.handle().is_some()
    }

    pub fn set_handle(&mut self, handle: impl Into<String>) {
        self.data.insert(HANDLE_FIELD.to_string(), handle.into());
    }
}
