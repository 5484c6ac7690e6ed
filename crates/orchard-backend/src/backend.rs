//! The compute-backend contract.
//!
//! A backend drives the full lifecycle of preview instances on one compute
//! substrate. Resource names are derived deterministically from the
//! instance hash, so `instances()` can recover hashes from resource names
//! without a lookup table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use orchard_core::{BackendInstance, BackendStatus, Instance, OrchardError, OrchardResult};

use crate::progress::ProgressSink;

/// Per-stream log selection.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Keep only lines containing this substring.
    pub filter: Option<String>,
    /// Keep at most this many trailing lines.
    pub max_lines: Option<usize>,
}

/// A request for captured instance logs.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub hash: String,
    /// `None` disables the stream entirely.
    pub stdout: Option<LogFilter>,
    pub stderr: Option<LogFilter>,
}

/// Captured instance log text per stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceLogs {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Uniform lifecycle contract over a compute substrate.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// One-time initialization (maintenance jobs, watchers).
    async fn startup(&self) -> OrchardResult<()>;

    /// Drive a full build+run for the instance, emitting progress events.
    ///
    /// Resolves on success; emits an `errored` status and returns the error
    /// on failure.
    async fn build_instance(
        &self,
        instance: &Instance,
        progress: &ProgressSink,
    ) -> OrchardResult<()>;

    /// Cancel an in-flight build. Safe to call with none in flight.
    async fn stop_builder(&self, hash: &str) -> OrchardResult<()>;

    async fn start_instance(&self, instance: &Instance) -> OrchardResult<()>;

    async fn stop_instance(&self, hash: &str) -> OrchardResult<()>;

    /// Stop then start.
    async fn restart_instance(&self, instance: &Instance) -> OrchardResult<()> {
        self.stop_instance(&instance.hash).await?;
        self.start_instance(instance).await
    }

    /// Idempotent best-effort teardown; must not fail when resources are
    /// already absent.
    async fn delete_instance(&self, hash: &str) -> OrchardResult<()>;

    /// Raw substrate state for one instance.
    async fn instance_status(&self, instance: &Instance) -> OrchardResult<BackendStatus>;

    /// All instances this backend knows about, hashes recovered from
    /// resource names.
    async fn instances(&self) -> OrchardResult<Vec<BackendInstance>>;

    /// Captured runtime logs.
    async fn instance_logs(&self, query: &LogQuery) -> OrchardResult<InstanceLogs>;
}

/// Name-keyed backend registry, built once at startup.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn ComputeBackend>>,
    default_key: String,
}

impl BackendRegistry {
    pub fn new(default_key: impl Into<String>) -> Self {
        Self {
            backends: HashMap::new(),
            default_key: default_key.into(),
        }
    }

    pub fn insert(mut self, key: impl Into<String>, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backends.insert(key.into(), backend);
        self
    }

    pub fn get(&self, key: &str) -> OrchardResult<&Arc<dyn ComputeBackend>> {
        self.backends
            .get(key)
            .ok_or_else(|| OrchardError::Validation(format!("unknown backend: {key}")))
    }

    /// The backend selected by configuration.
    pub fn default_backend(&self) -> OrchardResult<&Arc<dyn ComputeBackend>> {
        self.get(&self.default_key)
    }
}

/// Apply a [`LogFilter`] to captured text.
pub fn filter_captured(text: &str, filter: &LogFilter) -> String {
    let mut lines: Vec<&str> = text
        .lines()
        .filter(|line| match &filter.filter {
            Some(needle) => line.contains(needle.as_str()),
            None => true,
        })
        .collect();
    if let Some(max) = filter.max_lines {
        if lines.len() > max {
            lines.drain(..lines.len() - max);
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keeps_matching_lines() {
        let text = "error: one\ninfo: two\nerror: three";
        let filtered = filter_captured(
            text,
            &LogFilter {
                filter: Some("error".to_string()),
                max_lines: None,
            },
        );
        assert_eq!(filtered, "error: one\nerror: three");
    }

    #[test]
    fn max_lines_keeps_the_tail() {
        let text = "a\nb\nc\nd";
        let filtered = filter_captured(
            text,
            &LogFilter {
                filter: None,
                max_lines: Some(2),
            },
        );
        assert_eq!(filtered, "c\nd");
    }

    #[test]
    fn registry_rejects_unknown_keys() {
        let registry = BackendRegistry::new("docker");
        assert!(matches!(
            registry.get("docker"),
            Err(OrchardError::Validation(_))
        ));
        assert!(matches!(
            registry.default_backend(),
            Err(OrchardError::Validation(_))
        ));
    }
}
