//! Domain types for preview instances.
//!
//! An instance is one preview deployment of a project+branch+config
//! combination, identified by a content hash (see [`crate::hash`]).
//! Its lifecycle is tracked in three independent state spaces:
//! the persisted request lifecycle ([`CommonStatus`]), the raw substrate
//! state ([`BackendStatus`]), and the probe-derived [`HealthStatus`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A preview instance as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// Content-derived identifier, unique for the instance's whole life.
    pub hash: String,
    pub project: String,
    pub branch: String,
    /// VCS registry key (e.g. "git").
    pub vcs: String,
    /// Which named config block from the project's preview file to use.
    pub instance_config_name: String,
    /// URL template with `{hash}`/`{project}` placeholders.
    pub url_template: Option<String>,
    /// Extra build-time environment from the generate request.
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    /// Extra run-time environment from the generate request.
    #[serde(default)]
    pub run_env_variables: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub description: Option<String>,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    pub status: CommonStatus,
}

/// A request to generate an instance, before the hash is derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub project: String,
    pub branch: String,
    pub vcs: String,
    pub instance_config_name: String,
    pub url_template: Option<String>,
    #[serde(default)]
    pub env_variables: HashMap<String, String>,
    #[serde(default)]
    pub run_env_variables: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub description: Option<String>,
}

/// Persisted request-lifecycle status of an instance.
///
/// Transitions: `queued → generating → generated`, `generating → errored`,
/// and any non-terminal state → `deleting` (after which the row is removed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommonStatus {
    Queued,
    Generating,
    Generated,
    Deleting,
    Errored,
}

/// Raw substrate state as reported by a compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Starting,
    Running,
    Stopped,
    Errored,
    Unknown,
}

/// Health judgement derived from probe streaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Externally reported status: backend state refined by health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Starting,
    Running,
    Stopped,
    Errored,
    Unhealthy,
    Unknown,
}

/// One captured slice of build or command output.
///
/// A chunk with a `command` but no `duration_ms` marks the start of a timed
/// phase; the matching chunk with `duration_ms` and `exit_code` closes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutputChunk {
    pub command: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i64>,
}

impl OutputChunk {
    /// A plain informational stdout line.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            stdout: Some(text.into()),
            ..Self::default()
        }
    }

    /// Whether this chunk closes a timed command.
    pub fn is_finished_command(&self) -> bool {
        self.command.is_some() && self.duration_ms.is_some()
    }
}

/// A backend's view of one instance, recovered from resource naming.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInstance {
    pub hash: String,
    pub status: BackendStatus,
    /// Unix timestamp in milliseconds; 0 when the substrate has none.
    pub start_time: i64,
}

impl std::fmt::Display for CommonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommonStatus::Queued => "queued",
            CommonStatus::Generating => "generating",
            CommonStatus::Generated => "generated",
            CommonStatus::Deleting => "deleting",
            CommonStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendStatus::Starting => "starting",
            BackendStatus::Running => "running",
            BackendStatus::Stopped => "stopped",
            BackendStatus::Errored => "errored",
            BackendStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_status_serializes_snake_case() {
        let json = serde_json::to_string(&CommonStatus::Generating).unwrap();
        assert_eq!(json, "\"generating\"");
    }

    #[test]
    fn instance_round_trips_through_json() {
        let instance = Instance {
            hash: "abc123".to_string(),
            project: "web-app".to_string(),
            branch: "main".to_string(),
            vcs: "git".to_string(),
            instance_config_name: "default".to_string(),
            url_template: Some("https://{hash}.preview.example.com".to_string()),
            env_variables: HashMap::from([("A".to_string(), "1".to_string())]),
            run_env_variables: HashMap::new(),
            labels: HashMap::new(),
            description: None,
            created_at: 1_700_000_000_000,
            status: CommonStatus::Queued,
        };

        let json = serde_json::to_vec(&instance).unwrap();
        let back: Instance = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn finished_command_requires_both_fields() {
        let start = OutputChunk {
            command: Some("Build image".to_string()),
            ..OutputChunk::default()
        };
        assert!(!start.is_finished_command());

        let finish = OutputChunk {
            command: Some("Build image".to_string()),
            duration_ms: Some(1200),
            exit_code: Some(0),
            ..OutputChunk::default()
        };
        assert!(finish.is_finished_command());
    }
}
