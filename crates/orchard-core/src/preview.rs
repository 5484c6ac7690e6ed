//! The per-project preview config file (`preview.json`).
//!
//! Projects ship a `preview.json` at their root describing how to build and
//! run preview instances. The file has one `preview` section with global
//! values plus an `instances` list of named variants; every known field is
//! resolved through a single field/merge-strategy table, so instance values
//! either override or map-merge the section-level ones uniformly.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{OrchardError, OrchardResult};

/// File name looked up at the project root.
pub const PREVIEW_FILE_NAME: &str = "preview.json";

/// How an instance-level value combines with the section-level one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeStrategy {
    /// Instance value replaces the section value.
    Override,
    /// JSON maps are unioned, instance keys winning.
    MergeMap,
}

/// Every field the preview file may carry, with its merge strategy.
const FIELDS: &[(&str, MergeStrategy)] = &[
    ("urlTemplate", MergeStrategy::Override),
    ("env", MergeStrategy::MergeMap),
    ("runEnv", MergeStrategy::MergeMap),
    ("envInheritance", MergeStrategy::MergeMap),
    ("start", MergeStrategy::Override),
    ("dockerfilePath", MergeStrategy::Override),
    ("dockerfileContextPath", MergeStrategy::Override),
    ("instanceHealthcheck", MergeStrategy::Override),
    ("builderImage", MergeStrategy::Override),
    ("builderEnvSecretName", MergeStrategy::Override),
    ("instanceEnvSecretName", MergeStrategy::Override),
    ("instancePort", MergeStrategy::Override),
    ("instanceProbe", MergeStrategy::Override),
    ("startBuilderTimeoutMs", MergeStrategy::Override),
    ("startInstanceTimeoutMs", MergeStrategy::Override),
    ("buildTimeoutMs", MergeStrategy::Override),
    ("builderResources", MergeStrategy::Override),
    ("instanceResources", MergeStrategy::Override),
];

/// The start command for the runtime container.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Where the container backend probes an instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthcheckSpec {
    pub port: u16,
    pub path: String,
}

/// One fully resolved instance configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceConfig {
    pub name: String,
    pub url_template: Option<String>,
    /// Build-time environment defined by the project.
    pub env: HashMap<String, String>,
    /// Run-time environment defined by the project.
    pub run_env: HashMap<String, String>,
    /// Target env name → host env var to inherit the value from.
    pub env_inheritance: HashMap<String, String>,
    pub start: Option<StartCommand>,
    pub dockerfile_path: Option<String>,
    pub dockerfile_context_path: Option<String>,
    pub instance_healthcheck: Option<HealthcheckSpec>,
    pub builder_image: Option<String>,
    pub builder_env_secret_name: Option<String>,
    pub instance_env_secret_name: Option<String>,
    pub instance_port: Option<u16>,
    /// Backend-specific probe spec, passed through verbatim.
    pub instance_probe: Option<Value>,
    pub start_builder_timeout_ms: Option<u64>,
    pub start_instance_timeout_ms: Option<u64>,
    pub build_timeout_ms: Option<u64>,
    pub builder_resources: Option<Value>,
    pub instance_resources: Option<Value>,
}

/// Parse the preview file and resolve every named instance config.
pub fn parse_preview_file(text: &str) -> OrchardResult<Vec<InstanceConfig>> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| OrchardError::Validation(format!("invalid preview file: {e}")))?;

    let section = match root.get("preview") {
        Some(Value::Object(section)) => section,
        _ => return Ok(Vec::new()),
    };

    let base: Map<String, Value> = FIELDS
        .iter()
        .filter_map(|(field, _)| {
            section
                .get(*field)
                .map(|value| (field.to_string(), value.clone()))
        })
        .collect();

    let instances: Vec<Map<String, Value>> = match section.get("instances") {
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .collect(),
        // No instances list means a single unnamed config.
        _ => vec![Map::new()],
    };

    instances
        .into_iter()
        .map(|instance| resolve_instance(&base, instance))
        .collect()
}

/// Find the resolved config with the given name.
pub fn instance_config<'a>(
    configs: &'a [InstanceConfig],
    name: &str,
) -> Option<&'a InstanceConfig> {
    configs.iter().find(|config| config.name == name)
}

/// Load and parse the preview file from a checked-out project directory.
///
/// Returns `None` when the directory has no preview file.
pub fn load_from_dir(dir: &Path) -> OrchardResult<Option<Vec<InstanceConfig>>> {
    let path = dir.join(PREVIEW_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| OrchardError::Validation(format!("{}: {e}", path.display())))?;
    parse_preview_file(&text).map(Some)
}

fn resolve_instance(
    base: &Map<String, Value>,
    instance: Map<String, Value>,
) -> OrchardResult<InstanceConfig> {
    let mut resolved = Map::new();

    for (field, strategy) in FIELDS {
        let merged = match (base.get(*field), instance.get(*field)) {
            (Some(Value::Object(base_map)), Some(Value::Object(instance_map)))
                if *strategy == MergeStrategy::MergeMap =>
            {
                let mut union = base_map.clone();
                union.extend(instance_map.clone());
                Some(Value::Object(union))
            }
            (_, Some(value)) => Some(value.clone()),
            (Some(value), None) => Some(value.clone()),
            (None, None) => None,
        };
        if let Some(value) = merged {
            resolved.insert(field.to_string(), value);
        }
    }

    if let Some(name) = instance.get("name") {
        resolved.insert("name".to_string(), name.clone());
    }

    serde_json::from_value(Value::Object(resolved))
        .map_err(|e| OrchardError::Validation(format!("invalid instance config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "preview": {
            "urlTemplate": "https://{hash}.example.com",
            "env": {"NODE_ENV": "production", "BASE": "global"},
            "dockerfilePath": "Dockerfile.preview",
            "instances": [
                {"name": "default"},
                {
                    "name": "storybook",
                    "env": {"BASE": "storybook", "EXTRA": "1"},
                    "dockerfilePath": "Dockerfile.storybook",
                    "buildTimeoutMs": 600000
                }
            ]
        }
    }"#;

    #[test]
    fn section_values_flow_into_instances() {
        let configs = parse_preview_file(SAMPLE).unwrap();
        let default = instance_config(&configs, "default").unwrap();
        assert_eq!(
            default.url_template.as_deref(),
            Some("https://{hash}.example.com")
        );
        assert_eq!(default.dockerfile_path.as_deref(), Some("Dockerfile.preview"));
        assert_eq!(default.env["NODE_ENV"], "production");
    }

    #[test]
    fn maps_merge_with_instance_keys_winning() {
        let configs = parse_preview_file(SAMPLE).unwrap();
        let storybook = instance_config(&configs, "storybook").unwrap();
        assert_eq!(storybook.env["NODE_ENV"], "production");
        assert_eq!(storybook.env["BASE"], "storybook");
        assert_eq!(storybook.env["EXTRA"], "1");
    }

    #[test]
    fn scalars_override_instead_of_merging() {
        let configs = parse_preview_file(SAMPLE).unwrap();
        let storybook = instance_config(&configs, "storybook").unwrap();
        assert_eq!(
            storybook.dockerfile_path.as_deref(),
            Some("Dockerfile.storybook")
        );
        assert_eq!(storybook.build_timeout_ms, Some(600_000));
    }

    #[test]
    fn missing_instances_list_yields_single_unnamed_config() {
        let text = r#"{"preview": {"env": {"A": "1"}}}"#;
        let configs = parse_preview_file(text).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "");
        assert_eq!(configs[0].env["A"], "1");
    }

    #[test]
    fn missing_section_yields_no_configs() {
        let configs = parse_preview_file("{}").unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn invalid_json_is_a_validation_error() {
        assert!(matches!(
            parse_preview_file("not json"),
            Err(OrchardError::Validation(_))
        ));
    }

    #[test]
    fn unknown_name_is_none() {
        let configs = parse_preview_file(SAMPLE).unwrap();
        assert!(instance_config(&configs, "nope").is_none());
    }
}
