//! Storage traits for the record store contracts.

use std::sync::Arc;

use async_trait::async_trait;
use dataform_core::Record;
use tokio::sync::{broadcast, watch};

use crate::error::StorageError;
use crate::events::RecordEvent;

/// Read-only access to the locally synced record snapshot.
///
/// Implementations must be thread-safe; the controller calls them from every
/// worker concurrently.
#[async_trait]
pub trait RecordLister: Send + Sync {
    /// Looks up a record by namespace and name.
    ///
    /// Returns `None` if the record is not in the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error only when the snapshot cannot be read, never for a
    /// missing record.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Record>>, StorageError>;

    /// Returns every record currently in the snapshot.
    async fn list(&self) -> Result<Vec<Arc<Record>>, StorageError>;
}

/// Change notifications for the record store.
pub trait RecordWatcher: Send + Sync {
    /// Subscribes to change events raised from now on.
    fn subscribe(&self) -> broadcast::Receiver<RecordEvent>;

    /// Receiver that flips to `true` once the local snapshot holds a full
    /// initial listing. It never flips back.
    fn synced(&self) -> watch::Receiver<bool>;
}

/// Write access to the authoritative record store.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Replaces the stored record with `record`.
    ///
    /// The write only succeeds if `record.resource_version` matches the stored
    /// version. Returns the record as stored, with its new version.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::VersionConflict` if the record changed since
    /// the copy was taken.
    /// Returns `StorageError::NotFound` if the record no longer exists.
    async fn update(&self, record: Record) -> Result<Record, StorageError>;

    /// Reads the current record straight from the store, bypassing any
    /// cache. Used to refresh a copy after a conflict.
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Record>, StorageError>;
}
