//! # dataform-controller
//!
//! Keeps declared records and managed database instances in sync.
//!
//! Records are watched through the `dataform-storage` contracts. Every change
//! queues the record's key; workers pull keys off a deduplicating,
//! rate-limited [`WorkQueue`] and hand them to the [`Reconciler`], which
//! creates or deletes instances through a `dataform-provisioner` client and
//! writes the instance handle back into the record.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dataform_controller::Controller;
//! use dataform_db_memory::InMemoryRecordStore;
//! use dataform_provisioner::InMemoryProvisioner;
//!
//! let store = Arc::new(InMemoryRecordStore::new());
//! let controller = Controller::builder()
//!     .with_lister(store.clone())
//!     .with_watcher(store.clone())
//!     .with_writer(store.clone())
//!     .with_provisioner(Arc::new(InMemoryProvisioner::new()))
//!     .build()?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! store.mark_synced();
//! controller.run(shutdown_rx).await?;
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod observability;
pub mod queue;
pub mod reconciler;
pub mod seed;

pub use controller::{Controller, ControllerBuilder};
pub use error::{ControllerError, ReconcileError};
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
