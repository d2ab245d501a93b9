//! Drives one record towards its declared state.
//!
//! `reconcile` is level-triggered: it reads the current snapshot and acts on
//! it, ignoring whatever event caused the key to be queued. Running it again
//! on an unchanged record is a no-op.
//!
//! | Snapshot                          | Action                               |
//! |-----------------------------------|--------------------------------------|
//! | absent                            | delete the instance                  |
//! | present, not opted in             | nothing                              |
//! | present, opted in, no handle      | find or create, write handle back    |
//! | present, opted in, has handle     | nothing                              |

use dataform_core::{Record, RecordKey, instance_identifier};
use dataform_provisioner::{DynProvisioner, ManagedInstance};
use dataform_storage::{DynLister, DynWriter, StorageError};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;

/// Reconciles records against the provisioner. Holds no per-key state, so a
/// single instance is shared by all workers.
pub struct Reconciler {
    lister: DynLister,
    writer: DynWriter,
    provisioner: DynProvisioner,
}

impl Reconciler {
    pub fn new(lister: DynLister, writer: DynWriter, provisioner: DynProvisioner) -> Self {
        Self {
            lister,
            writer,
            provisioner,
        }
    }

    pub async fn reconcile(&self, key: &RecordKey) -> Result<(), ReconcileError> {
        let (namespace, name) = key.split()?;

        let record = self
            .lister
            .get(namespace, name)
            .await
            .map_err(|e| ReconcileError::lookup(key.as_str(), e))?;

        let Some(record) = record else {
            return self.deprovision(key, namespace, name).await;
        };

        if !record.is_opted_in() {
            debug!(key = %key, "Record not opted in, skipping");
            return Ok(());
        }
        if record.is_provisioned() {
            debug!(key = %key, "Record already provisioned");
            return Ok(());
        }

        self.provision(key, &record).await
    }

    async fn deprovision(
        &self,
        key: &RecordKey,
        namespace: &str,
        name: &str,
    ) -> Result<(), ReconcileError> {
        let identifier = instance_identifier(namespace, name);
        self.provisioner
            .delete(&identifier)
            .await
            .map_err(|e| ReconcileError::provision(&identifier, e))?;

        info!(
            key = %key,
            identifier = %identifier,
            backend = self.provisioner.backend_name(),
            "Record removed, instance deleted"
        );
        Ok(())
    }

    async fn provision(&self, key: &RecordKey, record: &Record) -> Result<(), ReconcileError> {
        let identifier = instance_identifier(&record.namespace, &record.name);

        let existing = self
            .provisioner
            .find(&identifier)
            .await
            .map_err(|e| ReconcileError::provision(&identifier, e))?;

        let instance = match existing {
            Some(instance) => {
                info!(key = %key, identifier = %identifier, "Reusing existing instance");
                instance
            }
            None => {
                let instance = self
                    .provisioner
                    .create(&identifier)
                    .await
                    .map_err(|e| ReconcileError::provision(&identifier, e))?;
                info!(
                    key = %key,
                    identifier = %identifier,
                    backend = self.provisioner.backend_name(),
                    "Instance created"
                );
                instance
            }
        };

        let mut updated = record.clone();
        updated.set_handle(&instance.handle);

        match self.writer.update(updated).await {
            Ok(stored) => {
                info!(
                    key = %key,
                    handle = %instance.handle,
                    version = stored.resource_version,
                    "Instance handle recorded"
                );
                Ok(())
            }
            Err(e) if e.is_version_conflict() => {
                warn!(key = %key, error = %e, "Record changed during provisioning, refreshing");
                self.rewrite_handle(key, record, &instance, e).await
            }
            Err(e) => Err(ReconcileError::write(key.as_str(), e)),
        }
    }

    /// Applies the handle to a fresh copy after a version conflict.
    async fn rewrite_handle(
        &self,
        key: &RecordKey,
        stale: &Record,
        instance: &ManagedInstance,
        conflict: StorageError,
    ) -> Result<(), ReconcileError> {
        let fresh = self
            .writer
            .fetch(&stale.namespace, &stale.name)
            .await
            .map_err(|e| ReconcileError::lookup(key.as_str(), e))?;

        // Gone: the retry will see the deletion and clean up the instance.
        let Some(mut fresh) = fresh else {
            return Err(ReconcileError::write(key.as_str(), conflict));
        };

        if !fresh.is_opted_in() || fresh.is_provisioned() {
            debug!(key = %key, "Fresh record no longer needs a handle");
            return Ok(());
        }

        fresh.set_handle(&instance.handle);
        let stored = self
            .writer
            .update(fresh)
            .await
            .map_err(|e| ReconcileError::write(key.as_str(), e))?;

        info!(
            key = %key,
            handle = %instance.handle,
            version = stored.resource_version,
            "Instance handle recorded after refresh"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("provisioner", &self.provisioner.backend_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use dataform_core::{HANDLE_FIELD, OPT_IN_ANNOTATION};
    use dataform_db_memory::InMemoryRecordStore;
    use dataform_provisioner::{InMemoryProvisioner, ProvisionError, Provisioner, ProvisionerStats};
    use dataform_storage::{RecordLister, RecordWriter};

    const HANDLE: &str = "arn:dataform:db:local:shop-orders";

    fn key() -> RecordKey {
        RecordKey::new("shop", "orders").unwrap()
    }

    fn setup() -> (Arc<InMemoryRecordStore>, Arc<InMemoryProvisioner>, Reconciler) {
        let store = Arc::new(InMemoryRecordStore::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let reconciler = Reconciler::new(store.clone(), store.clone(), provisioner.clone());
        (store, provisioner, reconciler)
    }

    #[tokio::test]
    async fn test_opted_in_record_gets_provisioned_once() {
        let (store, provisioner, reconciler) = setup();
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        let stored = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(stored.handle(), Some(HANDLE));
        assert_eq!(
            provisioner.stats(),
            ProvisionerStats {
                create_calls: 1,
                delete_calls: 0,
                find_calls: 1
            }
        );

        // Second pass sees the handle and does nothing, including no write.
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(provisioner.stats().create_calls, 1);
        assert_eq!(provisioner.stats().find_calls, 1);
        let again = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(again.resource_version, stored.resource_version);
        assert_eq!(again, stored);
    }

    #[tokio::test]
    async fn test_provisioned_record_is_left_alone() {
        let (store, provisioner, reconciler) = setup();
        store
            .apply(Record::new("shop", "orders").opted_in().with_data(HANDLE_FIELD, "h1"))
            .await
            .unwrap();
        let before = store.get("shop", "orders").await.unwrap().unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(provisioner.stats(), ProvisionerStats::default());
        let after = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(after.resource_version, before.resource_version);
    }

    #[tokio::test]
    async fn test_missing_record_deletes_instance() {
        let (_store, provisioner, reconciler) = setup();
        provisioner.create("shop-orders").await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();
        assert!(!provisioner.contains("shop-orders"));

        // Nothing left to delete, still succeeds.
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(provisioner.stats().delete_calls, 2);
    }

    #[tokio::test]
    async fn test_not_opted_in_makes_no_calls() {
        let (store, provisioner, reconciler) = setup();
        store
            .apply(Record::new("shop", "orders").with_annotation(OPT_IN_ANNOTATION, "false"))
            .await
            .unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(provisioner.stats(), ProvisionerStats::default());
        let stored = store.get("shop", "orders").await.unwrap().unwrap();
        assert!(stored.handle().is_none());
    }

    #[tokio::test]
    async fn test_existing_instance_is_reused() {
        let (store, provisioner, reconciler) = setup();
        provisioner.insert(ManagedInstance {
            identifier: "shop-orders".into(),
            handle: "legacy".into(),
        });
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(provisioner.stats().create_calls, 0);
        let stored = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(stored.handle(), Some("legacy"));
    }

    #[tokio::test]
    async fn test_namespaceless_record() {
        let (store, provisioner, reconciler) = setup();
        store.apply(Record::new("", "orders").opted_in()).await.unwrap();

        reconciler.reconcile(&RecordKey::new("", "orders").unwrap()).await.unwrap();

        assert!(provisioner.contains("-orders"));
    }

    #[tokio::test]
    async fn test_malformed_key() {
        let (_store, provisioner, reconciler) = setup();

        let err = reconciler
            .reconcile(&RecordKey::from_raw("a/b/c"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::KeyDecode(_)));
        assert_eq!(provisioner.stats(), ProvisionerStats::default());
    }

    struct BrokenLister;

    #[async_trait]
    impl RecordLister for BrokenLister {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Arc<Record>>, StorageError> {
            Err(StorageError::connection_error("cache unavailable"))
        }

        async fn list(&self) -> Result<Vec<Arc<Record>>, StorageError> {
            Err(StorageError::connection_error("cache unavailable"))
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported() {
        let store = Arc::new(InMemoryRecordStore::new());
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let reconciler = Reconciler::new(Arc::new(BrokenLister), store, provisioner.clone());

        let err = reconciler.reconcile(&key()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Lookup { .. }));
        assert_eq!(provisioner.stats(), ProvisionerStats::default());
    }

    struct FailingProvisioner;

    #[async_trait]
    impl Provisioner for FailingProvisioner {
        async fn create(&self, identifier: &str) -> Result<ManagedInstance, ProvisionError> {
            Err(ProvisionError::api(identifier, "quota exceeded"))
        }

        async fn delete(&self, identifier: &str) -> Result<(), ProvisionError> {
            Err(ProvisionError::throttled(identifier))
        }

        async fn find(&self, _: &str) -> Result<Option<ManagedInstance>, ProvisionError> {
            Ok(None)
        }

        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_provision_failure_leaves_record_untouched() {
        let store = Arc::new(InMemoryRecordStore::new());
        let reconciler = Reconciler::new(store.clone(), store.clone(), Arc::new(FailingProvisioner));
        let before = store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Provision { .. }));

        let after = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(after.resource_version, before.resource_version);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let store = Arc::new(InMemoryRecordStore::new());
        let reconciler = Reconciler::new(store.clone(), store, Arc::new(FailingProvisioner));

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Provision { .. }));
    }

    #[derive(Clone, Copy)]
    enum Interference {
        /// Another writer edits the record.
        Edit,
        /// Another writer opts the record out.
        OptOut,
        /// The record is deleted.
        Remove,
        /// Every write conflicts.
        AlwaysConflict,
    }

    /// Writer that changes the store right before the first write lands.
    struct RacingWriter {
        store: Arc<InMemoryRecordStore>,
        interference: Interference,
        fired: AtomicBool,
    }

    impl RacingWriter {
        fn new(store: Arc<InMemoryRecordStore>, interference: Interference) -> Self {
            Self {
                store,
                interference,
                fired: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RecordWriter for RacingWriter {
        async fn update(&self, record: Record) -> Result<Record, StorageError> {
            if let Interference::AlwaysConflict = self.interference {
                return Err(StorageError::version_conflict("shop/orders", record.resource_version, 0));
            }
            if self.fired.swap(true, Ordering::SeqCst) {
                return self.store.update(record).await;
            }

            match self.interference {
                Interference::Edit => {
                    let current = self.store.fetch(&record.namespace, &record.name).await?.unwrap();
                    self.store.apply(current.with_data("owner", "team-a")).await?;
                    self.store.update(record).await
                }
                Interference::OptOut => {
                    let mut current = self.store.fetch(&record.namespace, &record.name).await?.unwrap();
                    current.annotations.remove(OPT_IN_ANNOTATION);
                    self.store.apply(current).await?;
                    self.store.update(record).await
                }
                Interference::Remove => {
                    self.store.remove(&record.namespace, &record.name).await?;
                    Err(StorageError::version_conflict("shop/orders", record.resource_version, 0))
                }
                Interference::AlwaysConflict => unreachable!(),
            }
        }

        async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Record>, StorageError> {
            self.store.fetch(namespace, name).await
        }
    }

    fn racing(interference: Interference) -> (Arc<InMemoryRecordStore>, Reconciler) {
        let store = Arc::new(InMemoryRecordStore::new());
        let writer = Arc::new(RacingWriter::new(store.clone(), interference));
        let reconciler = Reconciler::new(store.clone(), writer, Arc::new(InMemoryProvisioner::new()));
        (store, reconciler)
    }

    #[tokio::test]
    async fn test_conflict_rewrites_on_fresh_copy() {
        let (store, reconciler) = racing(Interference::Edit);
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        let stored = store.get("shop", "orders").await.unwrap().unwrap();
        assert_eq!(stored.handle(), Some(HANDLE));
        assert_eq!(stored.data.get("owner").map(String::as_str), Some("team-a"));
    }

    #[tokio::test]
    async fn test_conflict_with_opt_out_succeeds_without_write() {
        let (store, reconciler) = racing(Interference::OptOut);
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        let stored = store.get("shop", "orders").await.unwrap().unwrap();
        assert!(!stored.is_opted_in());
        assert!(stored.handle().is_none());
    }

    #[tokio::test]
    async fn test_conflict_with_deletion_returns_error() {
        let (store, reconciler) = racing(Interference::Remove);
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        let err = reconciler.reconcile(&key()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::WriteConflict { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_second_conflict_is_returned() {
        let (store, reconciler) = racing(Interference::AlwaysConflict);
        store.apply(Record::new("shop", "orders").opted_in()).await.unwrap();

        let err = reconciler.reconcile(&key()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::WriteConflict { .. }));
        assert!(err.is_retryable());
    }
}
