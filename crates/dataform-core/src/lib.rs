//! # dataform-core
//!
//! Shared types for the Dataform controller.
//!
//! A [`Record`] is the declared-state object an external actor writes into the
//! store. Records that carry the opt-in annotation get a managed database
//! instance, and the instance handle is written back into the record's data
//! map under [`HANDLE_FIELD`].
//!
//! Records are addressed two ways:
//! - a [`RecordKey`] (`namespace/name`) used as the work-queue item and for
//!   cache lookups;
//! - an instance identifier (`namespace-name`) used when talking to the
//!   provisioning API.

mod error;
mod key;
mod record;

pub use error::KeyError;
pub use key::{RecordKey, instance_identifier};
pub use record::{HANDLE_FIELD, OPT_IN_ANNOTATION, OPT_IN_VALUE, Record};
