//! orchard-backend — the compute-backend and VCS contracts.
//!
//! Defines the uniform lifecycle trait drivers implement, the typed
//! progress sink builds report through, the name-keyed registries built at
//! startup, the generic poll-until primitive behind every backend wait,
//! and the git VCS driver.

pub mod backend;
pub mod command;
pub mod git;
pub mod progress;
pub mod vcs;
pub mod wait;

pub use backend::{
    BackendRegistry, ComputeBackend, InstanceLogs, LogFilter, LogQuery, filter_captured,
};
pub use command::run_as_command;
pub use git::GitVcs;
pub use progress::{BuildEvent, ProgressSink};
pub use vcs::{RepoRef, Vcs, VcsRegistry};
pub use wait::{Waited, wait_for};
