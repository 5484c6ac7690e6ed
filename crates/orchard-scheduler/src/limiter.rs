//! Per-project running-instance limiter.
//!
//! An instance counts as active when its persisted status is `queued` or
//! `generating`, or when the backend reports it as `starting` or `running`.
//! Persisted status is the tie-break authority; the backend contribution
//! only widens the set. The instance being (re)generated is excluded, so
//! regenerating an already-active instance never trips its own limit.

use std::collections::HashMap;
use std::sync::Arc;

use orchard_backend::ComputeBackend;
use orchard_core::{BackendStatus, CommonStatus, GlobalConfig, OrchardError, OrchardResult};
use orchard_state::InstanceStore;

/// Reject the operation when admitting `hash` would exceed the project's
/// configured cap. Projects without a cap always admit.
pub async fn check_limit(
    store: &InstanceStore,
    backend: &Arc<dyn ComputeBackend>,
    global: &GlobalConfig,
    project: &str,
    hash: &str,
) -> OrchardResult<()> {
    let Some(limit) = global
        .projects
        .get(project)
        .and_then(|config| config.max_running_instances)
    else {
        return Ok(());
    };

    let instances = store.list_instances()?;
    let backend_status: HashMap<String, BackendStatus> = backend
        .instances()
        .await?
        .into_iter()
        .map(|instance| (instance.hash, instance.status))
        .collect();

    let active = instances
        .iter()
        .filter(|instance| {
            if instance.project != project || instance.hash == hash {
                return false;
            }
            let persisted_active = matches!(
                instance.status,
                CommonStatus::Queued | CommonStatus::Generating
            );
            let backend_active = matches!(
                backend_status.get(&instance.hash),
                Some(BackendStatus::Starting | BackendStatus::Running)
            );
            persisted_active || backend_active
        })
        .count();

    if active as u32 >= limit {
        return Err(OrchardError::LimitExceeded {
            project: project.to_string(),
            limit,
        });
    }
    Ok(())
}
