//! orchard-k8s — the cluster-orchestrator backend.
//!
//! Implements the compute-backend contract against a multi-node cluster:
//! disposable builder pods for image builds, a deployment + service +
//! ingress triple per running instance, scale-to-zero stops, and a
//! node-parallel cleanup cronjob kept reconciled in the background.

pub mod backend;
pub mod client;
pub mod resources;
pub mod status;

pub use backend::{K8sBackend, K8sConfig};
pub use client::ClusterClient;
pub use status::{container_status, map_cluster_status};
