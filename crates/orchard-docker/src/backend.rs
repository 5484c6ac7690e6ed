//! Container-engine backend.
//!
//! Runs one container per instance on a single host, named
//! `orchard-<hash>` so the hash can be recovered from the container list.
//! Builds are sequential per hash and cancellable through a per-hash abort
//! flag observed at each pipeline checkpoint.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use croner::Cron;
use serde::Deserialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use orchard_backend::{
    ComputeBackend, InstanceLogs, LogQuery, ProgressSink, RepoRef, Vcs as _, VcsRegistry,
    filter_captured, run_as_command,
};
use orchard_core::preview::{self, InstanceConfig};
use orchard_core::{
    BackendInstance, BackendStatus, CommonStatus, GlobalConfig, Instance, OrchardError,
    OrchardResult, instance_href,
};

use crate::client::{
    BuildImageParams, CreateContainer, EndpointConfig, EngineClient, NetworkingConfig,
    pack_context,
};
use crate::probe;

/// Prefix for every engine resource the backend owns.
const ENTITY_PREFIX: &str = "orchard-";

/// Schedule used when the configured one does not parse.
const DEFAULT_MAINTENANCE_SCHEDULE: &str = "0 3 * * *";

/// `[docker]` section of orchard.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: PathBuf,
    /// Engine network the runtime containers join.
    pub network: Option<String>,
    /// Host directory holding per-instance checkouts.
    pub work_dir: PathBuf,
    pub healthcheck_port: u16,
    pub healthcheck_path: String,
    /// Cron expression for the dangling-image sweep.
    pub maintenance_schedule: Option<String>,
    /// Engine auth config file; defaults to `$HOME/.docker/config.json`.
    pub auth_config_path: Option<PathBuf>,
    /// Local proxy used for probes in dev mode.
    pub proxy_host: String,
    pub proxy_port: u16,
    pub probe_timeout_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/docker.sock"),
            network: None,
            work_dir: PathBuf::from("/var/lib/orchard/instances"),
            healthcheck_port: 80,
            healthcheck_path: "/".to_string(),
            maintenance_schedule: None,
            auth_config_path: None,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 3004,
            probe_timeout_ms: 3000,
        }
    }
}

pub struct DockerBackend {
    client: EngineClient,
    config: DockerConfig,
    global: Arc<GlobalConfig>,
    vcs: Arc<VcsRegistry>,
    /// In-flight builds: hash → abort flag.
    building: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl DockerBackend {
    pub fn new(config: DockerConfig, global: Arc<GlobalConfig>, vcs: Arc<VcsRegistry>) -> Self {
        Self {
            client: EngineClient::new(config.socket_path.clone()),
            config,
            global,
            vcs,
            building: Mutex::new(HashMap::new()),
        }
    }

    fn instance_root(&self, hash: &str) -> PathBuf {
        self.config.work_dir.join(hash)
    }

    /// Checkout directory of the project itself, monorepo path included.
    fn instance_path(&self, hash: &str, project: &str) -> PathBuf {
        let mut path = self.instance_root(hash);
        if let Some(sub) = self
            .global
            .projects
            .get(project)
            .and_then(|p| p.mono_repo_path.as_deref())
        {
            path = path.join(sub);
        }
        path
    }

    fn repo_ref(&self, instance: &Instance) -> OrchardResult<RepoRef> {
        let project = self.global.project(&instance.project)?;
        Ok(RepoRef {
            project: instance.project.clone(),
            branch: instance.branch.clone(),
            repository_path: project.repository_path.clone(),
            mono_repo_path: project.mono_repo_path.clone(),
            credentials: self
                .global
                .vcs_credentials
                .get(&instance.vcs)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Fire the abort flag for an in-flight build, if any.
    async fn abort_build(&self, hash: &str) {
        if let Some(flag) = self.building.lock().await.get(hash) {
            let _ = flag.send(true);
        }
    }

    /// Wrap a pipeline phase in an optional deadline; expiry fires the
    /// abort flag so in-flight engine calls unwind at their next checkpoint.
    async fn with_deadline<T>(
        &self,
        hash: &str,
        timeout_ms: Option<u64>,
        what: &str,
        fut: impl Future<Output = OrchardResult<T>>,
    ) -> OrchardResult<T> {
        match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(result) => result,
                Err(_) => {
                    self.abort_build(hash).await;
                    Err(OrchardError::Timeout(format!("{what} exceeded {ms}ms")))
                }
            },
            None => fut.await,
        }
    }

    async fn run_build(&self, instance: &Instance, progress: &ProgressSink) -> OrchardResult<()> {
        let hash = &instance.hash;
        let network = self.config.network.clone().ok_or_else(|| {
            OrchardError::Validation("engine network is not configured".to_string())
        })?;

        // Cleanup first: this also aborts a previous builder for the hash,
        // so the fresh abort flag is only registered afterwards.
        progress.message("Prepare...").await;
        let root = self.instance_root(hash);
        let _ = tokio::fs::remove_dir_all(&root).await;
        self.delete_instance(hash).await?;

        let (cancel_tx, cancel) = watch::channel(false);
        self.building
            .lock()
            .await
            .insert(hash.clone(), cancel_tx);

        progress.message("Fetch code...").await;
        let repo = self.repo_ref(instance)?;
        let vcs = self.vcs.get(&instance.vcs)?;
        vcs.checkout(&repo, &root, progress).await?;
        check_cancelled(&cancel)?;

        let instance_path = self.instance_path(hash, &instance.project);
        let configs = preview::load_from_dir(&instance_path)?.ok_or_else(|| {
            OrchardError::Validation(format!(
                "{} not found in checkout",
                preview::PREVIEW_FILE_NAME
            ))
        })?;
        let config = preview::instance_config(&configs, &instance.instance_config_name)
            .ok_or_else(|| {
                OrchardError::Validation(format!(
                    "instance config not found: {}",
                    instance.instance_config_name
                ))
            })?
            .clone();

        let (build_env, run_env) = resolve_envs(&config, instance);
        let dockerfile = config.dockerfile_path.clone().ok_or_else(|| {
            OrchardError::Validation("dockerfile path not configured".to_string())
        })?;
        let context_dir =
            instance_path.join(config.dockerfile_context_path.as_deref().unwrap_or("."));

        progress.message("Building image...").await;
        let entity = entity_name(hash);
        run_as_command(progress, "Build image", async {
            let context = {
                let dir = context_dir.clone();
                tokio::task::spawn_blocking(move || pack_context(&dir))
                    .await
                    .map_err(|e| OrchardError::backend(format!("context packing task: {e}")))??
            };
            let params = BuildImageParams {
                tag: entity.clone(),
                dockerfile,
                context,
                build_args: build_env,
                registry_config: self.registry_config(),
            };
            self.with_deadline(
                hash,
                config.build_timeout_ms,
                "image build",
                self.client.build_image(params, cancel.clone(), progress),
            )
            .await?;
            check_cancelled(&cancel)?;

            // The engine can report a successful stream without producing an
            // artifact; treat a missing image as a failed build.
            match self.client.inspect_image(&entity).await {
                Ok(_) => Ok(()),
                Err(err) if err.is_not_found() => {
                    Err(OrchardError::backend("image not found after build"))
                }
                Err(err) => Err(err),
            }
        })
        .await?;

        progress.message("Running container...").await;
        progress.status(CommonStatus::Generated).await;

        let cmd = config.start.as_ref().map(|start| {
            let mut cmd = vec![start.command.clone()];
            cmd.extend(start.args.iter().cloned());
            cmd
        });
        let spec = CreateContainer {
            image: entity.clone(),
            env: env_pairs(&run_env),
            cmd,
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    "orchard".to_string(),
                    EndpointConfig {
                        network_id: network,
                    },
                )]),
            }),
        };
        run_as_command(progress, "Run instance", async {
            self.with_deadline(hash, config.start_instance_timeout_ms, "instance start", async {
                self.client.create_container(&entity, &spec).await?;
                self.client.start_container(&entity).await
            })
            .await
        })
        .await?;

        progress.message("Done!").await;
        Ok(())
    }

    /// Registry credentials for the image build, already header-encoded.
    fn registry_config(&self) -> Option<String> {
        use base64::Engine as _;
        let engine = base64::engine::general_purpose::STANDARD;

        let path = self.config.auth_config_path.clone().or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| Path::new(&home).join(".docker/config.json"))
        })?;
        let text = std::fs::read_to_string(&path).ok()?;
        let parsed: serde_json::Value = serde_json::from_str(&text).ok()?;
        let auths = parsed.get("auths")?.as_object()?;

        for (registry, entry) in auths {
            let Some(auth) = entry.get("auth").and_then(|a| a.as_str()) else {
                continue;
            };
            let decoded = engine.decode(auth).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            let config = serde_json::json!({
                registry: {"username": username, "password": password}
            });
            return Some(engine.encode(config.to_string()));
        }
        None
    }

    /// HTTP probe hook used by the health monitor.
    ///
    /// Resolves the instance's routable host/port from its checked-out
    /// preview config, or routes through the local proxy in dev mode.
    pub async fn probe_instance(&self, instance: &Instance) -> OrchardResult<bool> {
        let instance_path = self.instance_path(&instance.hash, &instance.project);
        let configs = preview::load_from_dir(&instance_path)?
            .ok_or_else(|| OrchardError::NotFound("preview config file not found".to_string()))?;
        let config = preview::instance_config(&configs, &instance.instance_config_name);

        let (port, path) = config
            .and_then(|c| c.instance_healthcheck.as_ref())
            .map(|check| (check.port, check.path.clone()))
            .unwrap_or((
                self.config.healthcheck_port,
                self.config.healthcheck_path.clone(),
            ));
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);

        if self.global.dev_mode {
            let template = instance
                .url_template
                .as_deref()
                .or_else(|| self.global.url_template_for(&instance.project))
                .ok_or_else(|| {
                    OrchardError::Validation("url template not configured".to_string())
                })?;
            let href = instance_href(template, &instance.project, &instance.hash);
            let host = href
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or_default()
                .to_string();
            return probe::ping(
                &self.config.proxy_host,
                self.config.proxy_port,
                &path,
                Some(&host),
                timeout,
            )
            .await;
        }

        probe::ping(&entity_name(&instance.hash), port, &path, None, timeout).await
    }

    async fn prune_dangling_images(client: &EngineClient) {
        info!("pruning dangling images");
        match client.prune_images("24h").await {
            Ok(0) => info!("pruning complete, dangling images not found"),
            Ok(count) => info!(count, "pruning complete"),
            Err(err) => warn!(error = %err, "image pruning failed"),
        }
    }
}

#[async_trait]
impl ComputeBackend for DockerBackend {
    async fn startup(&self) -> OrchardResult<()> {
        let schedule = parse_maintenance_schedule(self.config.maintenance_schedule.as_deref());
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                let next = match schedule.find_next_occurrence(&Utc::now(), false) {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(error = %err, "maintenance schedule has no next run");
                        return;
                    }
                };
                info!(next = %next, "next maintenance scheduled");
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                Self::prune_dangling_images(&client).await;
            }
        });
        Ok(())
    }

    async fn build_instance(
        &self,
        instance: &Instance,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let result = self.run_build(instance, progress).await;

        self.building.lock().await.remove(&instance.hash);
        match &result {
            // A cancelled build was stopped on purpose; whoever stopped it
            // (regenerate, delete) owns the instance's next state.
            Err(OrchardError::Cancelled(_)) => {
                debug!(hash = %instance.hash, "build stopped while in flight");
            }
            Err(_) => progress.status(CommonStatus::Errored).await,
            Ok(()) => {}
        }
        result
    }

    async fn stop_builder(&self, hash: &str) -> OrchardResult<()> {
        if let Some(flag) = self.building.lock().await.remove(hash) {
            let _ = flag.send(true);
            debug!(%hash, "build aborted");
        }
        Ok(())
    }

    async fn start_instance(&self, instance: &Instance) -> OrchardResult<()> {
        self.client
            .start_container(&entity_name(&instance.hash))
            .await
    }

    async fn stop_instance(&self, hash: &str) -> OrchardResult<()> {
        if let Err(err) = self.client.stop_container(&entity_name(hash)).await {
            debug!(%hash, error = %err, "container stop ignored");
        }
        Ok(())
    }

    async fn delete_instance(&self, hash: &str) -> OrchardResult<()> {
        let _ = self.stop_builder(hash).await;
        let name = entity_name(hash);

        match self.client.inspect_container(&name).await {
            Ok(inspect) if inspect.state.status == "running" => {
                if let Err(err) = self.client.stop_container(&name).await {
                    debug!(%hash, error = %err, "container stop during delete ignored");
                }
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => debug!(%hash, error = %err, "container inspect during delete ignored"),
        }

        if let Err(err) = self.client.remove_container(&name, true).await {
            if !err.is_not_found() {
                debug!(%hash, error = %err, "container removal ignored");
            }
        }
        if let Err(err) = self.client.remove_image(&name).await {
            if !err.is_not_found() {
                debug!(%hash, error = %err, "image removal ignored");
            }
        }
        if let Err(err) = tokio::fs::remove_dir_all(self.instance_root(hash)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(%hash, error = %err, "instance directory removal ignored");
            }
        }
        Ok(())
    }

    async fn instance_status(&self, instance: &Instance) -> OrchardResult<BackendStatus> {
        let name = entity_name(&instance.hash);
        let containers = self.client.list_containers(true).await?;
        Ok(containers
            .iter()
            .find(|container| container.name() == name)
            .map(|container| map_container_state(&container.state))
            .unwrap_or(BackendStatus::Unknown))
    }

    async fn instances(&self) -> OrchardResult<Vec<BackendInstance>> {
        let containers = self.client.list_containers(true).await?;
        let mut instances = Vec::new();

        for container in containers {
            let Some(hash) = hash_from_entity(container.name()) else {
                continue;
            };
            let status = map_container_state(&container.state);
            let start_time = if status == BackendStatus::Running {
                match self.client.inspect_container(container.name()).await {
                    Ok(inspect) => parse_start_time(&inspect.state.started_at),
                    Err(err) => {
                        debug!(%hash, error = %err, "container inspect failed");
                        0
                    }
                }
            } else {
                0
            };
            instances.push(BackendInstance {
                hash: hash.to_string(),
                status,
                start_time,
            });
        }
        Ok(instances)
    }

    async fn instance_logs(&self, query: &LogQuery) -> OrchardResult<InstanceLogs> {
        let name = entity_name(&query.hash);
        let mut logs = InstanceLogs::default();

        if let Some(filter) = &query.stdout {
            let text = self
                .client
                .container_logs(&name, true, false, filter.max_lines)
                .await?;
            logs.stdout = Some(filter_captured(&text, filter));
        }
        if let Some(filter) = &query.stderr {
            let text = self
                .client
                .container_logs(&name, false, true, filter.max_lines)
                .await?;
            logs.stderr = Some(filter_captured(&text, filter));
        }
        Ok(logs)
    }
}

/// Engine resource name for an instance hash.
pub fn entity_name(hash: &str) -> String {
    format!("{ENTITY_PREFIX}{hash}")
}

/// Recover the hash from an engine resource name.
pub fn hash_from_entity(name: &str) -> Option<&str> {
    name.strip_prefix(ENTITY_PREFIX)
}

/// Map an engine container state onto the shared status space.
pub fn map_container_state(state: &str) -> BackendStatus {
    match state {
        "created" | "restarting" => BackendStatus::Starting,
        "running" => BackendStatus::Running,
        "removing" | "paused" | "exited" => BackendStatus::Stopped,
        "dead" => BackendStatus::Errored,
        _ => BackendStatus::Unknown,
    }
}

fn check_cancelled(cancel: &watch::Receiver<bool>) -> OrchardResult<()> {
    if *cancel.borrow() {
        Err(OrchardError::Cancelled("build stopped".to_string()))
    } else {
        Ok(())
    }
}

/// Resolve build and run environments.
///
/// Precedence, later wins: inherited host env < project config < request
/// overrides; the run environment additionally layers runEnv on top of the
/// full build environment.
fn resolve_envs(
    config: &InstanceConfig,
    instance: &Instance,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut build = HashMap::new();
    for (name, source) in &config.env_inheritance {
        if let Ok(value) = std::env::var(source) {
            build.insert(name.clone(), value);
        }
    }
    build.extend(config.env.clone());
    build.extend(instance.env_variables.clone());

    let mut run = build.clone();
    run.extend(config.run_env.clone());
    run.extend(instance.run_env_variables.clone());

    (build, run)
}

fn env_pairs(env: &HashMap<String, String>) -> Vec<String> {
    let mut pairs: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    pairs.sort();
    pairs
}

fn parse_start_time(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Validate the configured maintenance schedule, falling back to the
/// default on parse errors.
fn parse_maintenance_schedule(expression: Option<&str>) -> Cron {
    if let Some(expression) = expression {
        match Cron::new(expression).parse() {
            Ok(cron) => return cron,
            Err(err) => {
                warn!(%expression, error = %err, "invalid maintenance schedule, using default");
            }
        }
    }
    Cron::new(DEFAULT_MAINTENANCE_SCHEDULE)
        .parse()
        .unwrap_or_else(|_| unreachable!("default schedule is valid"))
}
