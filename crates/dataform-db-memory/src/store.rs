use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dataform_core::{Record, RecordKey};
use dataform_storage::{
    EventBroadcaster, RecordEvent, RecordLister, RecordWatcher, RecordWriter, StorageError,
};
use papaya::HashMap as PapayaHashMap;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::debug;

fn storage_key(namespace: &str, name: &str) -> Result<RecordKey, StorageError> {
    RecordKey::new(namespace, name).map_err(|e| StorageError::invalid_record(e.to_string()))
}

/// In-memory record store using papaya lock-free HashMap.
///
/// - Lookups are lock-free and return shared `Arc<Record>` snapshots.
/// - Writes are serialized so version checks and event order stay consistent.
/// - Every successful change is published as a [`RecordEvent`] after the map
///   is updated.
/// - The store reports synced only after [`mark_synced`](Self::mark_synced),
///   which lets tests hold the controller at its startup gate.
#[derive(Debug)]
pub struct InMemoryRecordStore {
    data: PapayaHashMap<RecordKey, Arc<Record>>,
    write_lock: Mutex<()>,
    version_counter: AtomicU64,
    broadcaster: EventBroadcaster,
    synced: watch::Sender<bool>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::with_broadcaster(EventBroadcaster::new())
    }

    pub fn with_broadcaster(broadcaster: EventBroadcaster) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            data: PapayaHashMap::new(),
            write_lock: Mutex::new(()),
            version_counter: AtomicU64::new(1),
            broadcaster,
            synced,
        }
    }

    fn next_version(&self) -> u64 {
        self.version_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn lookup(&self, key: &RecordKey) -> Option<Arc<Record>> {
        self.data.pin().get(key).cloned()
    }

    /// Creates or replaces a record regardless of its version, the way an
    /// external actor edits the store.
    pub async fn apply(&self, mut record: Record) -> Result<Arc<Record>, StorageError> {
        let key = storage_key(&record.namespace, &record.name)?;
        let _guard = self.write_lock.lock().await;

        record.resource_version = self.next_version();
        let record = Arc::new(record);
        let previous = self.data.pin().insert(key.clone(), record.clone()).cloned();

        let subscribers = match previous {
            Some(old) => self.broadcaster.send_updated(old, record.clone()),
            None => self.broadcaster.send_added(record.clone()),
        };
        debug!(key = %key, version = record.resource_version, subscribers, "Applied record");

        Ok(record)
    }

    /// Removes a record, returning its last state if it existed.
    pub async fn remove(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<Record>>, StorageError> {
        let key = storage_key(namespace, name)?;
        let _guard = self.write_lock.lock().await;

        let removed = self.data.pin().remove(&key).cloned();
        if let Some(record) = &removed {
            let subscribers = self.broadcaster.send_deleted(record.clone());
            debug!(key = %key, subscribers, "Removed record");
        }

        Ok(removed)
    }

    /// Flags the snapshot as fully listed.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    pub fn len(&self) -> usize {
        self.data.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordLister for InMemoryRecordStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Record>>, StorageError> {
        let key = storage_key(namespace, name)?;
        Ok(self.lookup(&key))
    }

    async fn list(&self) -> Result<Vec<Arc<Record>>, StorageError> {
        Ok(self
            .data
            .pin()
            .iter()
            .map(|(_, record)| record.clone())
            .collect())
    }
}

impl RecordWatcher for InMemoryRecordStore {
    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.broadcaster.subscribe()
    }

    fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }
}

#[async_trait]
impl RecordWriter for InMemoryRecordStore {
    async fn update(&self, mut record: Record) -> Result<Record, StorageError> {
        let key = storage_key(&record.namespace, &record.name)?;
        let _guard = self.write_lock.lock().await;

        let current = self
            .lookup(&key)
            .ok_or_else(|| StorageError::not_found(key.as_str()))?;
        if current.resource_version != record.resource_version {
            return Err(StorageError::version_conflict(
                key.as_str(),
                record.resource_version,
                current.resource_version,
            ));
        }

        record.resource_version = self.next_version();
        let stored = Arc::new(record.clone());
        self.data.pin().insert(key.clone(), stored.clone());

        let subscribers = self.broadcaster.send_updated(current, stored);
        debug!(key = %key, version = record.resource_version, subscribers, "Updated record");

        Ok(record)
    }

    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Record>, StorageError> {
        let key = storage_key(namespace, name)?;
        Ok(self.lookup(&key).map(|record| (*record).clone()))
    }
}
