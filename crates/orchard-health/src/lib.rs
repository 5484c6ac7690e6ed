//! orchard-health — liveness probing for running instances.
//!
//! Converts a streak of probe outcomes per instance into a stable health
//! judgement the status reconciler folds into the externally visible
//! status.
//!
//! ```text
//! HealthMonitor
//!   ├── outer sweep: backend targets → register / unregister
//!   ├── per-key probe loop (initial delay → probe with timeout → period)
//!   └── status(key) — synchronous streak lookup
//! ```

pub mod monitor;

pub use monitor::{HealthMonitor, ProbeConfig, ProbeFn, ProbeTarget, TargetsFn};
