//! Orchestrator configuration (orchard.toml).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{OrchardError, OrchardResult};

/// Global orchestrator settings, the `[orchard]` section of orchard.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Backend registry key to dispatch to ("docker" or "k8s").
    pub backend: String,
    /// VCS registry key used when a project does not name one.
    pub default_vcs: String,
    /// Default URL template with `{hash}`/`{project}` placeholders.
    pub url_template: Option<String>,
    /// Global cap on concurrently generating instances.
    pub max_concurrent_builds: u32,
    /// Running age after which a generated instance is stopped. Unset = never.
    pub instance_stop_timeout_ms: Option<u64>,
    /// Age after which a generated instance is deleted. Unset = never.
    pub instance_delete_timeout_ms: Option<u64>,
    /// Route health probes through the local dev proxy.
    pub dev_mode: bool,
    pub projects: HashMap<String, ProjectConfig>,
    pub vcs_credentials: HashMap<String, VcsCredentials>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            default_vcs: "git".to_string(),
            url_template: None,
            max_concurrent_builds: 2,
            instance_stop_timeout_ms: None,
            instance_delete_timeout_ms: None,
            dev_mode: false,
            projects: HashMap::new(),
            vcs_credentials: HashMap::new(),
        }
    }
}

/// Per-project settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Repository path under the VCS host (e.g. "acme/web-app").
    pub repository_path: String,
    /// Subdirectory of the checkout holding the project, for monorepos.
    pub mono_repo_path: Option<String>,
    /// Per-project cap on simultaneously active instances. Unset = unlimited.
    pub max_running_instances: Option<u32>,
    pub url_template: Option<String>,
    /// VCS registry key override.
    pub vcs: Option<String>,
    pub default_branch: Option<String>,
}

/// Credentials for one VCS registry key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsCredentials {
    /// Host to clone from; defaults to the driver's well-known host.
    pub hostname: Option<String>,
    /// Name of the environment variable holding the auth token.
    pub auth_token_env: Option<String>,
}

impl GlobalConfig {
    pub fn from_toml(content: &str) -> OrchardResult<Self> {
        toml::from_str(content).map_err(|e| OrchardError::Validation(e.to_string()))
    }

    pub fn from_file(path: &Path) -> OrchardResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OrchardError::Validation(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Project settings, or a validation error for an unknown project.
    pub fn project(&self, name: &str) -> OrchardResult<&ProjectConfig> {
        self.projects
            .get(name)
            .ok_or_else(|| OrchardError::Validation(format!("unknown project: {name}")))
    }

    /// The effective URL template for a project.
    pub fn url_template_for(&self, project: &str) -> Option<&str> {
        self.projects
            .get(project)
            .and_then(|p| p.url_template.as_deref())
            .or(self.url_template.as_deref())
    }

    /// The VCS registry key to use for a project.
    pub fn vcs_for(&self, project: &str) -> &str {
        self.projects
            .get(project)
            .and_then(|p| p.vcs.as_deref())
            .unwrap_or(&self.default_vcs)
    }
}

/// Render the routable URL for an instance.
pub fn instance_href(template: &str, project: &str, hash: &str) -> String {
    template.replace("{hash}", hash).replace("{project}", project)
}
