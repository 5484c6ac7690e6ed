//! orchard-scheduler — persisted-work draining and build execution.
//!
//! The scheduler owns the three guarded sweeps (delete, retry, build), the
//! per-project limiter, build execution against the selected compute
//! backend, and the TTL reaper. Control flow: a request is validated
//! against the limiter, persisted as `queued`, picked up by the build
//! sweep, and driven through the backend with progress persisted as it
//! streams.

pub mod limiter;
pub mod reaper;
pub mod scheduler;
pub mod stats;

pub use limiter::check_limit;
pub use reaper::Reaper;
pub use scheduler::BuildScheduler;
pub use stats::{BuildStats, LogStatsSink, StatsSink};
