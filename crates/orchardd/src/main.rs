//! orchardd — the preview-instance orchestrator daemon.
//!
//! Single binary that assembles the orchestration subsystems:
//! - Instance store (redb)
//! - Backend and VCS registries built from orchard.toml
//! - Build scheduler with its three sweeps
//! - Health monitor (container backend)
//! - TTL reaper
//!
//! # Usage
//!
//! ```text
//! orchardd run --config /etc/orchard/orchard.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::info;

use orchard_backend::{BackendRegistry, ComputeBackend, GitVcs, Vcs, VcsRegistry};
use orchard_core::{GlobalConfig, OrchardError};
use orchard_docker::{DockerBackend, DockerConfig};
use orchard_health::{HealthMonitor, ProbeFn, TargetsFn};
use orchard_k8s::{ClusterClient, K8sBackend, K8sConfig};
use orchard_scheduler::{BuildScheduler, LogStatsSink, Reaper};
use orchard_state::InstanceStore;

#[derive(Parser)]
#[command(name = "orchardd", about = "Orchard preview-instance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator.
    Run {
        /// Path to orchard.toml.
        #[arg(long, default_value = "orchard.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/orchard")]
        data_dir: PathBuf,

        /// Scheduler sweep interval in seconds.
        #[arg(long, default_value = "5")]
        sweep_interval: u64,

        /// TTL reaper interval in seconds.
        #[arg(long, default_value = "300")]
        reaper_interval: u64,
    },
}

/// The full orchard.toml file.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    #[serde(default)]
    orchard: GlobalConfig,
    docker: Option<DockerConfig>,
    k8s: Option<K8sConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchard=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            data_dir,
            sweep_interval,
            reaper_interval,
        } => run(config, data_dir, sweep_interval, reaper_interval).await,
    }
}

async fn run(
    config_path: PathBuf,
    data_dir: PathBuf,
    sweep_interval: u64,
    reaper_interval: u64,
) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "orchard daemon starting");

    let raw = std::fs::read_to_string(&config_path)?;
    let config: DaemonConfig = toml::from_str(&raw)?;
    let global = Arc::new(config.orchard);

    std::fs::create_dir_all(&data_dir)?;
    let store = InstanceStore::open(&data_dir.join("orchard.redb"))?;
    info!(path = %data_dir.display(), "instance store opened");

    // ── Registries ─────────────────────────────────────────────────

    let vcs_registry = Arc::new(VcsRegistry::new().insert("git", Arc::new(GitVcs::new()) as Arc<dyn Vcs>));

    let mut backends = BackendRegistry::new(global.backend.clone());
    let mut docker_backend: Option<Arc<DockerBackend>> = None;

    if let Some(docker_config) = config.docker {
        let backend = Arc::new(DockerBackend::new(
            docker_config,
            global.clone(),
            vcs_registry.clone(),
        ));
        docker_backend = Some(backend.clone());
        backends = backends.insert("docker", backend as Arc<dyn ComputeBackend>);
        info!("container backend registered");
    }
    if let Some(k8s_config) = config.k8s {
        let client = match (&k8s_config.api_url, &k8s_config.api_token) {
            (Some(url), token) => ClusterClient::new(url.clone(), token.clone())?,
            (None, _) => ClusterClient::in_cluster()?,
        };
        let backend = Arc::new(K8sBackend::new(
            client,
            k8s_config,
            global.clone(),
            vcs_registry.clone(),
        ));
        backends = backends.insert("k8s", backend as Arc<dyn ComputeBackend>);
        info!("cluster backend registered");
    }
    let backends = Arc::new(backends);
    let backend = backends.default_backend()?.clone();
    backend.startup().await?;
    info!(backend = %global.backend, "compute backend started");

    // ── Subsystems ─────────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(BuildScheduler::new(
        store.clone(),
        backends.clone(),
        global.clone(),
        Arc::new(LogStatsSink),
    ));
    let scheduler_task = tokio::spawn(scheduler.clone().run(
        Duration::from_secs(sweep_interval),
        shutdown_rx.clone(),
    ));
    info!(interval = sweep_interval, "scheduler started");

    let reaper = Arc::new(Reaper::new(store.clone(), backends.clone(), global.clone()));
    let reaper_task = tokio::spawn(
        reaper
            .clone()
            .run(Duration::from_secs(reaper_interval), shutdown_rx.clone()),
    );
    info!(interval = reaper_interval, "reaper started");

    // The container backend's substrate has no probes of its own, so the
    // health monitor drives the backend's HTTP probe hook. The cluster
    // backend folds readiness into its own status space instead.
    let mut monitor_task = None;
    if let Some(docker) = docker_backend.filter(|_| global.backend == "docker") {
        let probe: ProbeFn = {
            let docker = docker.clone();
            let store = store.clone();
            Arc::new(move |hash: String| {
                let docker = docker.clone();
                let store = store.clone();
                Box::pin(async move {
                    let instance = store
                        .get_instance(&hash)?
                        .ok_or_else(|| OrchardError::NotFound(format!("instance {hash}")))?;
                    docker.probe_instance(&instance).await
                })
            })
        };
        let targets: TargetsFn = {
            let docker = docker.clone();
            Arc::new(move || {
                let docker = docker.clone();
                Box::pin(async move {
                    Ok(docker
                        .instances()
                        .await?
                        .into_iter()
                        .map(|instance| orchard_health::ProbeTarget {
                            key: instance.hash,
                            running: instance.status == orchard_core::BackendStatus::Running,
                            config: None,
                        })
                        .collect())
                })
            })
        };
        let monitor = Arc::new(HealthMonitor::new(probe, targets));
        let monitor_shutdown = shutdown_rx.clone();
        monitor_task = Some(tokio::spawn(async move {
            monitor.run(monitor_shutdown).await;
        }));
        info!("health monitor started");
    }

    // ── Shutdown ───────────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_task.await;
    let _ = reaper_task.await;
    if let Some(task) = monitor_task {
        let _ = task.await;
    }
    info!("orchard daemon stopped");
    Ok(())
}
