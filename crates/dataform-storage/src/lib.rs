//! # dataform-storage
//!
//! Contracts between the controller and the declared-state record store.
//!
//! The store is split into three narrow capabilities so each consumer only
//! sees what it needs:
//!
//! - [`RecordLister`] - read-only lookups against the locally synced snapshot.
//!   Snapshots are handed out as `Arc<Record>` and are never mutated; callers
//!   clone before changing anything.
//! - [`RecordWatcher`] - the change notification stream plus a "cache synced"
//!   signal.
//! - [`RecordWriter`] - full-object write-back with optimistic concurrency.
//!
//! This crate contains no backend. See `dataform-db-memory` for the in-memory
//! implementation.
//!
//! ## Example
//!
//! ```ignore
//! use dataform_storage::{RecordLister, StorageError};
//!
//! async fn handle_of(
//!     lister: &dyn RecordLister,
//!     namespace: &str,
//!     name: &str,
//! ) -> Result<Option<String>, StorageError> {
//!     let record = lister.get(namespace, name).await?;
//!     Ok(record.and_then(|r| r.handle().map(str::to_string)))
//! }
//! ```

mod error;
pub mod events;
mod traits;

pub use error::{ErrorCategory, StorageError};
pub use events::{EventBroadcaster, RecordEvent, RecordEventType};
pub use traits::{RecordLister, RecordWatcher, RecordWriter};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared record lister.
pub type DynLister = std::sync::Arc<dyn RecordLister>;

/// Shared record watcher.
pub type DynWatcher = std::sync::Arc<dyn RecordWatcher>;

/// Shared record writer.
pub type DynWriter = std::sync::Arc<dyn RecordWriter>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use dataform_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::events::{EventBroadcaster, RecordEvent, RecordEventType};
    pub use crate::traits::{RecordLister, RecordWatcher, RecordWriter};
    pub use crate::{DynLister, DynWatcher, DynWriter, StorageResult};
}
