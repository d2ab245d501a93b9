//! Provisioning client contract for managed database instances.
//!
//! The controller only talks to the external system through [`Provisioner`].
//! Implementations must make both operations idempotent per identifier:
//!
//! - `create` for an identifier that already has an instance returns that
//!   instance instead of failing or creating a second one;
//! - `delete` for an identifier with no instance succeeds.
//!
//! [`InMemoryProvisioner`] is a deterministic implementation used by tests
//! and by the local binary.

pub mod error;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::ProvisionError;
pub use memory::{InMemoryProvisioner, ProvisionerStats};

/// An instance living in the external system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedInstance {
    /// Identifier derived from the owning record.
    pub identifier: String,
    /// Opaque handle returned by the external system.
    pub handle: String,
}

/// Client for the external provisioning API.
///
/// Must be safe to call concurrently for different identifiers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates the instance for `identifier`, or returns the existing one.
    async fn create(&self, identifier: &str) -> Result<ManagedInstance, ProvisionError>;

    /// Deletes the instance for `identifier`.
    ///
    /// Returns `Ok(())` when no such instance exists.
    async fn delete(&self, identifier: &str) -> Result<(), ProvisionError>;

    /// Looks up the instance for `identifier` without changing anything.
    async fn find(&self, identifier: &str) -> Result<Option<ManagedInstance>, ProvisionError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}

/// Shared provisioner trait object.
pub type DynProvisioner = std::sync::Arc<dyn Provisioner>;
