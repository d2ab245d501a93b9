//! In-memory provisioner with call accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::{ManagedInstance, Provisioner};

const DEFAULT_REGION: &str = "local";

/// Number of calls made against a provisioner, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionerStats {
    pub create_calls: u64,
    pub delete_calls: u64,
    pub find_calls: u64,
}

/// Provisioner keeping instances in a concurrent map.
///
/// Handles are derived from the identifier, so the same identifier always
/// yields the same handle, even after a delete and re-create.
#[derive(Debug)]
pub struct InMemoryProvisioner {
    region: String,
    instances: DashMap<String, ManagedInstance>,
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    find_calls: AtomicU64,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::with_region(DEFAULT_REGION)
    }

    pub fn with_region(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            instances: DashMap::new(),
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            find_calls: AtomicU64::new(0),
        }
    }

    fn handle_for(&self, identifier: &str) -> String {
        format!("arn:dataform:db:{}:{identifier}", self.region)
    }

    /// Registers an instance directly, as if it had been created out of band.
    pub fn insert(&self, instance: ManagedInstance) {
        self.instances.insert(instance.identifier.clone(), instance);
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.instances.contains_key(identifier)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn stats(&self) -> ProvisionerStats {
        ProvisionerStats {
            create_calls: self.create_calls.load(Ordering::SeqCst),
            delete_calls: self.delete_calls.load(Ordering::SeqCst),
            find_calls: self.find_calls.load(Ordering::SeqCst),
        }
    }
}

impl Default for InMemoryProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provisioner for InMemoryProvisioner {
    async fn create(&self, identifier: &str) -> Result<ManagedInstance, ProvisionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let instance = self
            .instances
            .entry(identifier.to_string())
            .or_insert_with(|| {
                info!(identifier, "Created instance");
                ManagedInstance {
                    identifier: identifier.to_string(),
                    handle: self.handle_for(identifier),
                }
            })
            .clone();

        Ok(instance)
    }

    async fn delete(&self, identifier: &str) -> Result<(), ProvisionError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        match self.instances.remove(identifier) {
            Some(_) => info!(identifier, "Deleted instance"),
            None => debug!(identifier, "No instance to delete"),
        }
        Ok(())
    }

    async fn find(&self, identifier: &str) -> Result<Option<ManagedInstance>, ProvisionError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.instances.get(identifier).map(|entry| entry.value().clone()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
