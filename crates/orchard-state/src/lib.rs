//! orchard-state — embedded persistence for preview instances.
//!
//! A redb-backed, status-filterable store holding instance rows and their
//! captured build logs. Used by the scheduler as the source of truth for
//! the persisted request lifecycle.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{BuildLogRow, InstanceStore};
