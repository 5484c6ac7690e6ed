//! Status reconciliation.
//!
//! Merges the raw backend state with the health judgement into the one
//! externally visible status. A freshly started instance keeps reporting
//! `starting` even after the substrate says `running`, until the first
//! successful probe lands.

use crate::types::{BackendStatus, EffectiveStatus, HealthStatus};

/// Compute the externally reported status from backend + health state.
///
/// Any backend status other than `running` passes through unchanged.
pub fn effective_status(backend: BackendStatus, health: HealthStatus) -> EffectiveStatus {
    match backend {
        BackendStatus::Starting => EffectiveStatus::Starting,
        BackendStatus::Stopped => EffectiveStatus::Stopped,
        BackendStatus::Errored => EffectiveStatus::Errored,
        BackendStatus::Unknown => EffectiveStatus::Unknown,
        BackendStatus::Running => match health {
            HealthStatus::Healthy => EffectiveStatus::Running,
            HealthStatus::Unhealthy => EffectiveStatus::Unhealthy,
            HealthStatus::Unknown => EffectiveStatus::Starting,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_running_passes_through() {
        for (backend, expected) in [
            (BackendStatus::Starting, EffectiveStatus::Starting),
            (BackendStatus::Stopped, EffectiveStatus::Stopped),
            (BackendStatus::Errored, EffectiveStatus::Errored),
            (BackendStatus::Unknown, EffectiveStatus::Unknown),
        ] {
            for health in [
                HealthStatus::Healthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unknown,
            ] {
                assert_eq!(effective_status(backend, health), expected);
            }
        }
    }

    #[test]
    fn running_and_healthy_is_running() {
        assert_eq!(
            effective_status(BackendStatus::Running, HealthStatus::Healthy),
            EffectiveStatus::Running
        );
    }

    #[test]
    fn running_and_unhealthy_is_unhealthy() {
        assert_eq!(
            effective_status(BackendStatus::Running, HealthStatus::Unhealthy),
            EffectiveStatus::Unhealthy
        );
    }

    #[test]
    fn running_before_first_probe_is_starting() {
        assert_eq!(
            effective_status(BackendStatus::Running, HealthStatus::Unknown),
            EffectiveStatus::Starting
        );
    }
}
