//! Container-status derivation and mapping.
//!
//! A pod's effective container status is its phase refined by the named
//! container's waiting/terminated reason, the synthetic `Ready` state
//! (running AND passing readiness), and `Terminating` once deletion is
//! requested. The resulting label maps onto the shared backend status
//! space so the scheduler stays backend-agnostic.

use orchard_core::{BackendStatus, OrchardError, OrchardResult};

use crate::resources::Pod;

/// Derive the status label for one container of a pod.
pub fn container_status(pod: &Pod, container_name: &str) -> String {
    let mut status = pod
        .status
        .phase
        .clone()
        .unwrap_or_else(|| "Unknown".to_string());

    if let Some(container) = pod
        .status
        .container_statuses
        .iter()
        .find(|status| status.name == container_name)
    {
        if let Some(state) = &container.state {
            if let Some(reason) = state.waiting.as_ref().and_then(|w| w.reason.clone()) {
                status = reason;
            } else if state.running.is_some() && container.ready {
                status = "Ready".to_string();
            } else if let Some(reason) =
                state.terminated.as_ref().and_then(|t| t.reason.clone())
            {
                status = reason;
            }
        }
    }

    if pod.metadata.deletion_timestamp.is_some() {
        status = "Terminating".to_string();
    }
    status
}

/// Map a container status label onto the shared backend status space.
pub fn map_cluster_status(status: &str) -> BackendStatus {
    match status {
        // Synthetic states.
        "Terminating" => BackendStatus::Stopped,
        "Ready" => BackendStatus::Running,

        // Pod phases. A running pod that is not yet ready is still starting.
        "Pending" | "Running" => BackendStatus::Starting,
        "Succeeded" => BackendStatus::Stopped,
        "Failed" => BackendStatus::Errored,

        // Waiting reasons.
        "ContainerCreating" => BackendStatus::Starting,
        "CrashLoopBackOff" | "ErrImagePull" | "ImagePullBackOff"
        | "CreateContainerConfigError" | "InvalidImageName" | "CreateContainerError" => {
            BackendStatus::Errored
        }

        // Terminated reasons.
        "Completed" => BackendStatus::Stopped,
        "OOMKilled" | "Error" | "ContainerCannotRun" | "DeadlineExceeded" => {
            BackendStatus::Errored
        }

        _ => BackendStatus::Unknown,
    }
}

/// Exit code of a terminated container.
pub fn container_exit_code(pod: &Pod, container_name: &str) -> OrchardResult<i64> {
    pod.status
        .container_statuses
        .iter()
        .find(|status| status.name == container_name)
        .and_then(|status| status.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .map(|terminated| terminated.exit_code)
        .ok_or_else(|| {
            OrchardError::backend(format!("exit code not found for container {container_name}"))
        })
}

/// Pod start time as unix milliseconds; 0 when not started.
pub fn pod_start_time(pod: &Pod) -> i64 {
    pod.status
        .start_time
        .as_deref()
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}
