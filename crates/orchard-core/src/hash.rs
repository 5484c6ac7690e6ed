//! Content-derived instance identity.
//!
//! The hash is deterministic over project, branch, config name, VCS key and
//! the request-supplied env overrides, so repeated generate requests for the
//! same combination land on the same instance. Backend resource names are
//! in turn derived from this hash, which lets a backend recover the hash
//! from a resource name without a lookup table.

use std::collections::BTreeMap;
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::types::InstanceRequest;

/// Length of the hex identifier. Short enough for container and pod names,
/// long enough to make collisions across one installation implausible.
const HASH_LEN: usize = 12;

/// Derive the instance hash for a generate request.
pub fn instance_hash(request: &InstanceRequest) -> String {
    let mut hasher = Sha256::new();

    hasher.update(request.project.to_lowercase().as_bytes());
    hasher.update([0]);
    hasher.update(request.branch.as_bytes());
    hasher.update([0]);
    hasher.update(request.instance_config_name.as_bytes());
    hasher.update([0]);
    hasher.update(request.vcs.as_bytes());
    hasher.update([0]);

    hash_env(&mut hasher, &request.env_variables);
    hash_env(&mut hasher, &request.run_env_variables);

    let digest = hasher.finalize();
    hex::encode(digest)[..HASH_LEN].to_string()
}

/// Fold a map into the hasher with a stable key order.
fn hash_env(hasher: &mut Sha256, env: &HashMap<String, String>) {
    let sorted: BTreeMap<_, _> = env.iter().collect();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    hasher.update([0xff]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(project: &str, branch: &str) -> InstanceRequest {
        InstanceRequest {
            project: project.to_string(),
            branch: branch.to_string(),
            vcs: "git".to_string(),
            instance_config_name: "default".to_string(),
            ..InstanceRequest::default()
        }
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(
            instance_hash(&request("web", "main")),
            instance_hash(&request("web", "main"))
        );
    }

    #[test]
    fn hash_is_case_insensitive_on_project() {
        assert_eq!(
            instance_hash(&request("Web-App", "main")),
            instance_hash(&request("web-app", "main"))
        );
    }

    #[test]
    fn branch_changes_hash() {
        assert_ne!(
            instance_hash(&request("web", "main")),
            instance_hash(&request("web", "feature/x"))
        );
    }

    #[test]
    fn env_key_order_does_not_matter() {
        let mut a = request("web", "main");
        a.env_variables =
            HashMap::from([("A".into(), "1".into()), ("B".into(), "2".into())]);
        let mut b = request("web", "main");
        b.env_variables =
            HashMap::from([("B".into(), "2".into()), ("A".into(), "1".into())]);
        assert_eq!(instance_hash(&a), instance_hash(&b));
    }

    #[test]
    fn env_values_change_hash() {
        let mut a = request("web", "main");
        a.env_variables = HashMap::from([("A".into(), "1".into())]);
        let mut b = request("web", "main");
        b.env_variables = HashMap::from([("A".into(), "2".into())]);
        assert_ne!(instance_hash(&a), instance_hash(&b));
    }

    #[test]
    fn build_and_run_env_are_distinct_inputs() {
        let mut a = request("web", "main");
        a.env_variables = HashMap::from([("A".into(), "1".into())]);
        let mut b = request("web", "main");
        b.run_env_variables = HashMap::from([("A".into(), "1".into())]);
        assert_ne!(instance_hash(&a), instance_hash(&b));
    }

    #[test]
    fn hash_has_fixed_length() {
        assert_eq!(instance_hash(&request("web", "main")).len(), HASH_LEN);
    }
}
