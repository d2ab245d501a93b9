//! In-memory record store for the Dataform controller.
//!
//! [`InMemoryRecordStore`] implements all three storage contracts from
//! `dataform-storage` at once, so it can stand in for both the watched cache
//! and the authoritative store in tests and local runs.
//!
//! # Example
//!
//! ```ignore
//! use dataform_core::Record;
//! use dataform_db_memory::InMemoryRecordStore;
//!
//! let store = InMemoryRecordStore::new();
//! store.apply(Record::new("shop", "orders").opted_in()).await?;
//! store.mark_synced();
//! ```

pub mod store;

pub use dataform_storage::{RecordLister, RecordWatcher, RecordWriter, StorageError};
pub use store::InMemoryRecordStore;

/// Creates a new shared in-memory store.
pub fn create_record_store() -> std::sync::Arc<InMemoryRecordStore> {
    std::sync::Arc::new(InMemoryRecordStore::new())
}
