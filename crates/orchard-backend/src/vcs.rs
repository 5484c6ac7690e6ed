//! The VCS collaborator contract.
//!
//! A VCS driver checks out project sources on the host, produces the
//! equivalent command list for in-cluster builders, and fetches single
//! config files without a full checkout. Drivers are looked up from a
//! name-keyed registry built at startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use orchard_core::{OrchardError, OrchardResult, VcsCredentials};

use crate::progress::ProgressSink;

/// Everything a driver needs to locate one project branch.
#[derive(Debug, Clone, Default)]
pub struct RepoRef {
    pub project: String,
    pub branch: String,
    /// Repository path under the VCS host (e.g. "acme/web-app").
    pub repository_path: String,
    /// Subdirectory holding the project inside a monorepo checkout.
    pub mono_repo_path: Option<String>,
    pub credentials: VcsCredentials,
}

/// Version-control collaborator. Opaque, possibly slow, network-bound.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Check the branch out into `dest_dir`, reporting command output and
    /// process ids through the sink.
    async fn checkout(
        &self,
        repo: &RepoRef,
        dest_dir: &Path,
        progress: &ProgressSink,
    ) -> OrchardResult<()>;

    /// Shell command list performing the same checkout inside a builder pod.
    fn cluster_checkout_commands(&self, repo: &RepoRef) -> Vec<String>;

    /// Fetch one file from the branch without a checkout.
    async fn fetch_config_file(&self, repo: &RepoRef, file_name: &str) -> OrchardResult<String>;
}

/// Name-keyed VCS registry, built once at startup.
pub struct VcsRegistry {
    drivers: HashMap<String, Arc<dyn Vcs>>,
}

impl VcsRegistry {
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn insert(mut self, key: impl Into<String>, driver: Arc<dyn Vcs>) -> Self {
        self.drivers.insert(key.into(), driver);
        self
    }

    pub fn get(&self, key: &str) -> OrchardResult<&Arc<dyn Vcs>> {
        self.drivers
            .get(key)
            .ok_or_else(|| OrchardError::Validation(format!("unknown vcs: {key}")))
    }
}

impl Default for VcsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_vcs_is_a_validation_error() {
        let registry = VcsRegistry::new();
        assert!(matches!(
            registry.get("svn"),
            Err(OrchardError::Validation(_))
        ));
    }
}
