//! Cluster-orchestrator backend.
//!
//! Builds run as disposable, uniquely named pods executing checkout +
//! image build + push; the runtime is a managed single-replica deployment
//! with a service and an ingress, created and torn down together.
//! Stopping scales the deployment to zero for fast resume; deletion
//! removes all three resources. A background loop counts active cluster
//! nodes and upserts a cleanup cronjob parallelized across them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use orchard_backend::{
    ComputeBackend, InstanceLogs, LogQuery, ProgressSink, RepoRef, Vcs as _, VcsRegistry,
    filter_captured, run_as_command, wait_for,
};
use orchard_core::preview::{self, InstanceConfig};
use orchard_core::{
    BackendInstance, BackendStatus, CommonStatus, GlobalConfig, Instance, OrchardError,
    OrchardResult, instance_href,
};

use crate::client::ClusterClient;
use crate::resources::{
    Container, ContainerPort, CronJob, CronJobSpec, Deployment, DeploymentSpec, EnvFromSource,
    EnvVar, HostPathVolume, HttpIngressPath, HttpIngressRuleValue, Ingress, IngressBackend,
    IngressRule, IngressServiceBackend, IngressSpec, IngressTls, JobSpec, JobTemplateSpec,
    LabelSelector, ObjectMeta, Pod, PodSpec, PodTemplateSpec, Secret, SecretRef, Service,
    ServiceBackendPort, ServicePort, ServiceSpec, TopologySpreadConstraint, Volume, VolumeMount,
    is_node_active, label_selector,
};
use crate::status::{container_exit_code, container_status, map_cluster_status, pod_start_time};

const MANAGER_NAME: &str = "Orchard";
const MANAGED_BY_LABEL: (&str, &str) = ("app.kubernetes.io/managed-by", MANAGER_NAME);

const CLEANER_JOB_NAME: &str = "orchard-cleaner";

const BUILDER_CONTAINER_NAME: &str = "builder";
const CLEANER_CONTAINER_NAME: &str = "cleaner";
const INSTANCE_CONTAINER_NAME: &str = "application";

/// How long a freshly created deployment may take to materialize a pod.
const DEPLOYMENT_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_PERIOD: Duration = Duration::from_secs(1);

/// `[k8s]` section of orchard.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct K8sConfig {
    /// Explicit API endpoint; unset means in-cluster service-account auth.
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub namespace: String,
    /// Image repository the builder pushes instance images to.
    pub target_repository: String,
    /// Image for builder and cleaner pods (needs docker + git).
    pub builder_image: String,
    pub dockerfile_path: String,
    pub docker_socket_host_path: String,
    pub docker_creds_host_path: String,
    pub ingress_class_name: Option<String>,
    pub ingress_annotations: HashMap<String, String>,
    pub ingress_tls_secret_name: Option<String>,
    pub builder_env_secret_name: Option<String>,
    pub instance_env_secret_name: Option<String>,
    pub instance_port: u16,
    /// Probe spec passed through to the runtime container.
    pub instance_probe: Option<Value>,
    pub start_builder_timeout_ms: u64,
    pub start_instance_timeout_ms: u64,
    pub build_timeout_ms: u64,
    pub builder_resources: Option<Value>,
    pub instance_resources: Option<Value>,
    pub disable_cleaner: bool,
    pub cleaner_nodes_watch_period_secs: u64,
    pub cleaner_schedule: String,
    pub cleaner_random_delay_minutes: u64,
    pub cleaner_jobs_history_limit: i32,
    pub cleaner_prune_filter: String,
}

impl Default for K8sConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            namespace: "orchard".to_string(),
            target_repository: String::new(),
            builder_image: "docker:27-cli".to_string(),
            dockerfile_path: "Dockerfile.preview".to_string(),
            docker_socket_host_path: "/var/run/docker.sock".to_string(),
            docker_creds_host_path: "/var/lib/kubelet/config.json".to_string(),
            ingress_class_name: Some("nginx".to_string()),
            ingress_annotations: HashMap::new(),
            ingress_tls_secret_name: None,
            builder_env_secret_name: None,
            instance_env_secret_name: None,
            instance_port: 8080,
            instance_probe: None,
            start_builder_timeout_ms: 60_000,
            start_instance_timeout_ms: 300_000,
            build_timeout_ms: 1_200_000,
            builder_resources: None,
            instance_resources: None,
            disable_cleaner: false,
            cleaner_nodes_watch_period_secs: 60,
            cleaner_schedule: "0 3 * * *".to_string(),
            cleaner_random_delay_minutes: 120,
            cleaner_jobs_history_limit: 5,
            cleaner_prune_filter: "until=24h".to_string(),
        }
    }
}

/// Coordinates of one container inside a pod.
#[derive(Debug, Clone)]
struct ContainerInfo {
    namespace: String,
    pod_name: String,
    container_name: String,
}

/// Names of the three runtime resources for one instance.
struct ResourceNames {
    deployment: String,
    service: String,
    ingress: String,
}

fn resource_names(hash: &str) -> ResourceNames {
    ResourceNames {
        deployment: format!("{hash}-deployment"),
        service: format!("{hash}-service"),
        ingress: format!("{hash}-ingress"),
    }
}

/// Unique builder pod name: random suffix avoids colliding with a
/// still-terminating pod from a prior attempt.
fn builder_pod_name(hash: &str) -> String {
    format!("{hash}-builder-{}", random_suffix(5))
}

fn random_suffix(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn default_probe(port: u16) -> Value {
    json!({
        "httpGet": {"port": port, "scheme": "HTTP", "path": "/ping"},
        "initialDelaySeconds": 10,
        "periodSeconds": 5,
        "successThreshold": 1,
        "failureThreshold": 3,
    })
}

fn env_vars(env: &HashMap<String, String>) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    vars.sort_by(|a, b| a.name.cmp(&b.name));
    vars
}

pub struct K8sBackend {
    client: ClusterClient,
    config: K8sConfig,
    global: Arc<GlobalConfig>,
    vcs: Arc<VcsRegistry>,
}

impl K8sBackend {
    pub fn new(
        client: ClusterClient,
        config: K8sConfig,
        global: Arc<GlobalConfig>,
        vcs: Arc<VcsRegistry>,
    ) -> Self {
        Self {
            client,
            config,
            global,
            vcs,
        }
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

    fn instance_image(&self, project: &str, hash: &str) -> String {
        format!("{}/{project}:{hash}", self.config.target_repository)
    }

    /// Fetch and resolve the instance's preview config from the branch.
    async fn fetch_instance_config(&self, instance: &Instance) -> OrchardResult<InstanceConfig> {
        let repo = self.repo_ref(instance)?;
        let vcs = self.vcs.get(&instance.vcs)?;
        let text = vcs
            .fetch_config_file(&repo, preview::PREVIEW_FILE_NAME)
            .await?;
        let configs = preview::parse_preview_file(&text)?;
        preview::instance_config(&configs, &instance.instance_config_name)
            .cloned()
            .ok_or_else(|| {
                OrchardError::Validation(format!(
                    "instance config not found: {}",
                    instance.instance_config_name
                ))
            })
    }

    async fn run_build(
        &self,
        instance: &Instance,
        progress: &ProgressSink,
        builder_pod: &mut Option<String>,
    ) -> OrchardResult<()> {
        if self.config.target_repository.is_empty() {
            return Err(OrchardError::Validation(
                "target repository is not configured".to_string(),
            ));
        }

        let config = self.fetch_instance_config(instance).await?;
        let build_timeout = config.build_timeout_ms.unwrap_or(self.config.build_timeout_ms);
        let start_instance_timeout = config
            .start_instance_timeout_ms
            .unwrap_or(self.config.start_instance_timeout_ms);
        let start_builder_timeout = config
            .start_builder_timeout_ms
            .unwrap_or(self.config.start_builder_timeout_ms);

        let image = self.instance_image(&instance.project, &instance.hash);

        run_as_command(progress, "Build image", async {
            let info = self.run_builder_pod(instance, &config, &image).await?;
            *builder_pod = Some(info.pod_name.clone());

            self.wait_for_container_status(&info, &["Ready"], Some(start_builder_timeout))
                .await?;

            // Progress comes from the log tail; completion is detected by
            // polling container state, not by the stream.
            let tail = tokio::spawn({
                let client = self.client.clone();
                let info = info.clone();
                let progress = progress.clone();
                async move {
                    if let Err(err) = client
                        .follow_pod_log(
                            &info.namespace,
                            &info.pod_name,
                            &info.container_name,
                            &progress,
                        )
                        .await
                    {
                        debug!(pod = %info.pod_name, error = %err, "builder log tail ended");
                    }
                }
            });

            let terminal = self
                .wait_for_container_status(&info, &["Completed", "Error"], Some(build_timeout))
                .await;
            tail.abort();
            let terminal = terminal?;

            let pod = self.client.read_pod(&info.namespace, &info.pod_name).await?;
            let exit_code = container_exit_code(&pod, &info.container_name).unwrap_or(-1);

            if let Err(err) = self.client.delete_pod(&info.namespace, &info.pod_name).await {
                if !err.is_not_found() {
                    warn!(pod = %info.pod_name, error = %err, "builder pod cleanup failed");
                }
            }

            if terminal == "Error" {
                return Err(OrchardError::Backend {
                    message: format!("builder exited with code {exit_code}"),
                    exit_code: Some(exit_code),
                });
            }
            Ok(())
        })
        .await?;

        progress.status(CommonStatus::Generated).await;

        run_as_command(progress, "Run instance", async {
            self.delete_runtime_resources(&instance.hash).await;
            let info = self.create_runtime(instance, &config, &image).await?;
            self.wait_for_container_status(&info, &["Ready"], Some(start_instance_timeout))
                .await?;
            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Create the disposable builder pod running checkout + build + push.
    async fn run_builder_pod(
        &self,
        instance: &Instance,
        config: &InstanceConfig,
        image: &str,
    ) -> OrchardResult<ContainerInfo> {
        let namespace = &self.config.namespace;
        let dockerfile = config
            .dockerfile_path
            .clone()
            .unwrap_or_else(|| self.config.dockerfile_path.clone());
        let builder_image = config
            .builder_image
            .clone()
            .unwrap_or_else(|| self.config.builder_image.clone());
        let env_secret = config
            .builder_env_secret_name
            .clone()
            .or_else(|| self.config.builder_env_secret_name.clone());
        let resources = config
            .builder_resources
            .clone()
            .or_else(|| self.config.builder_resources.clone());

        let mut build_env = config.env.clone();
        build_env.extend(instance.env_variables.clone());
        let build_args = build_env
            .iter()
            .map(|(key, value)| format!("--build-arg {key}='{}'", value.replace('\'', "\\'")))
            .collect::<Vec<_>>()
            .join(" ");

        let mut secret_keys: Vec<String> = Vec::new();
        if let Some(secret_name) = &env_secret {
            let secret: Secret = self.client.read_secret(namespace, secret_name).await?;
            secret_keys = secret.data.keys().cloned().collect();
            secret_keys.sort();
        }
        let build_secrets = secret_keys
            .iter()
            .map(|key| format!("--secret id={key},env={key}"))
            .collect::<Vec<_>>()
            .join(" ");

        let repo = self.repo_ref(instance)?;
        let vcs = self.vcs.get(&instance.vcs)?;
        let mut commands = vcs.cluster_checkout_commands(&repo);
        commands.push(format!(
            "docker build . -f '{dockerfile}' -t {image} --network host {build_args} {build_secrets}"
        ));
        commands.push(format!("docker push {image}"));

        let mut spec = self.builder_pod_spec(
            BUILDER_CONTAINER_NAME,
            &builder_image,
            env_secret.as_deref(),
            resources,
            Some(&build_env),
            &commands,
        );
        spec.restart_policy = Some("Never".to_string());

        let pod = Pod {
            api_version: Some("v1".to_string()),
            kind: Some("Pod".to_string()),
            metadata: ObjectMeta {
                name: Some(builder_pod_name(&instance.hash)),
                labels: HashMap::from([
                    (MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string()),
                    ("type".to_string(), "builder".to_string()),
                    ("hash".to_string(), instance.hash.clone()),
                ]),
                ..ObjectMeta::default()
            },
            spec,
            ..Pod::default()
        };

        let created = self.client.create_pod(namespace, &pod).await?;
        container_info(&created, BUILDER_CONTAINER_NAME)
    }

    /// Create the deployment + service + ingress runtime for an instance.
    async fn create_runtime(
        &self,
        instance: &Instance,
        config: &InstanceConfig,
        image: &str,
    ) -> OrchardResult<ContainerInfo> {
        let namespace = &self.config.namespace;
        let hash = &instance.hash;
        let names = resource_names(hash);

        let env_secret = config
            .instance_env_secret_name
            .clone()
            .or_else(|| self.config.instance_env_secret_name.clone());
        let port = config.instance_port.unwrap_or(self.config.instance_port);
        let probe = config
            .instance_probe
            .clone()
            .or_else(|| self.config.instance_probe.clone())
            .unwrap_or_else(|| default_probe(port));
        let resources = config
            .instance_resources
            .clone()
            .or_else(|| self.config.instance_resources.clone());

        let mut run_env = config.env.clone();
        run_env.extend(instance.env_variables.clone());
        run_env.extend(config.run_env.clone());
        run_env.extend(instance.run_env_variables.clone());

        let selector_labels =
            HashMap::from([("app".to_string(), format!("{hash}-instance"))]);
        let mut common_labels = selector_labels.clone();
        common_labels.insert(MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string());
        common_labels.insert("hash".to_string(), hash.clone());

        let template = instance
            .url_template
            .as_deref()
            .or_else(|| {
                config
                    .url_template
                    .as_deref()
                    .or_else(|| self.global.url_template_for(&instance.project))
            })
            .ok_or_else(|| OrchardError::Validation("url template not configured".to_string()))?;
        let href = instance_href(template, &instance.project, hash);
        let host = href
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut pod_labels = common_labels.clone();
        pod_labels.insert("type".to_string(), "instance".to_string());

        let deployment = Deployment {
            api_version: Some("apps/v1".to_string()),
            kind: Some("Deployment".to_string()),
            metadata: ObjectMeta {
                name: Some(names.deployment.clone()),
                labels: common_labels.clone(),
                ..ObjectMeta::default()
            },
            spec: DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: selector_labels.clone(),
                },
                template: PodTemplateSpec {
                    metadata: ObjectMeta {
                        labels: pod_labels,
                        ..ObjectMeta::default()
                    },
                    spec: PodSpec {
                        containers: vec![Container {
                            name: INSTANCE_CONTAINER_NAME.to_string(),
                            image: image.to_string(),
                            image_pull_policy: Some("Always".to_string()),
                            env_from: env_secret
                                .map(|name| {
                                    vec![EnvFromSource {
                                        secret_ref: Some(SecretRef { name }),
                                    }]
                                })
                                .unwrap_or_default(),
                            env: env_vars(&run_env),
                            ports: vec![ContainerPort {
                                name: Some("app".to_string()),
                                protocol: Some("TCP".to_string()),
                                container_port: port,
                            }],
                            liveness_probe: Some(probe.clone()),
                            readiness_probe: Some(probe),
                            resources,
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    },
                },
            },
        };
        let deployment = self.client.create_deployment(namespace, &deployment).await?;

        let service = Service {
            api_version: Some("v1".to_string()),
            kind: Some("Service".to_string()),
            metadata: ObjectMeta {
                name: Some(names.service.clone()),
                labels: common_labels.clone(),
                ..ObjectMeta::default()
            },
            spec: ServiceSpec {
                selector: selector_labels,
                service_type: Some("NodePort".to_string()),
                ports: vec![ServicePort {
                    name: Some("app".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: i32::from(port),
                    target_port: i32::from(port),
                }],
                ip_families: vec!["IPv6".to_string(), "IPv4".to_string()],
                ip_family_policy: Some("PreferDualStack".to_string()),
            },
        };
        self.client.create_service(namespace, &service).await?;

        let ingress = Ingress {
            api_version: Some("networking.k8s.io/v1".to_string()),
            kind: Some("Ingress".to_string()),
            metadata: ObjectMeta {
                name: Some(names.ingress.clone()),
                labels: common_labels,
                annotations: self.config.ingress_annotations.clone(),
                ..ObjectMeta::default()
            },
            spec: IngressSpec {
                ingress_class_name: self.config.ingress_class_name.clone(),
                rules: vec![IngressRule {
                    host: host.clone(),
                    http: HttpIngressRuleValue {
                        paths: vec![HttpIngressPath {
                            path: "/".to_string(),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: IngressServiceBackend {
                                    name: names.service,
                                    port: ServiceBackendPort {
                                        number: i32::from(port),
                                    },
                                },
                            },
                        }],
                    },
                }],
                tls: self
                    .config
                    .ingress_tls_secret_name
                    .clone()
                    .map(|secret_name| {
                        vec![IngressTls {
                            secret_name,
                            hosts: vec![host],
                        }]
                    })
                    .unwrap_or_default(),
            },
        };
        self.client.create_ingress(namespace, &ingress).await?;

        // Single replica, so the deployment has exactly one pod to wait on.
        let pods = self.wait_for_deployment_pods(&deployment).await?;
        let pod = pods
            .first()
            .ok_or_else(|| OrchardError::backend(format!("no pods found for instance {hash}")))?;
        container_info(pod, INSTANCE_CONTAINER_NAME)
    }

    async fn wait_for_container_status(
        &self,
        info: &ContainerInfo,
        statuses: &[&str],
        timeout_ms: Option<u64>,
    ) -> OrchardResult<String> {
        let waited = wait_for(
            || async {
                let pod = self.client.read_pod(&info.namespace, &info.pod_name).await?;
                Ok(container_status(&pod, &info.container_name))
            },
            |status| statuses.contains(&status.as_str()),
            timeout_ms.map(Duration::from_millis),
            POLL_PERIOD,
        )
        .await?;

        if waited.timed_out {
            return Err(OrchardError::Timeout(format!(
                "container {}/{} stuck in {}, expected one of [{}]",
                info.pod_name,
                info.container_name,
                waited.value,
                statuses.join(", ")
            )));
        }
        Ok(waited.value)
    }

    async fn wait_for_deployment_pods(&self, deployment: &Deployment) -> OrchardResult<Vec<Pod>> {
        let selector = selector_of(deployment)?;
        let name = deployment.metadata.name.clone().unwrap_or_default();

        let waited = wait_for(
            || async { self.live_pods(&selector).await },
            |pods: &Vec<Pod>| !pods.is_empty(),
            Some(DEPLOYMENT_CREATION_TIMEOUT),
            POLL_PERIOD,
        )
        .await?;

        if waited.timed_out {
            return Err(OrchardError::Timeout(format!(
                "deployment {name} produced no pods"
            )));
        }
        Ok(waited.value)
    }

    /// Pods matching the selector, terminating ones excluded.
    async fn live_pods(&self, selector: &str) -> OrchardResult<Vec<Pod>> {
        Ok(self
            .client
            .list_pods(&self.config.namespace, selector)
            .await?
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .collect())
    }

    /// Deployments matching the selector, terminating ones excluded.
    async fn live_deployments(&self, selector: &str) -> OrchardResult<Vec<Deployment>> {
        Ok(self
            .client
            .list_deployments(&self.config.namespace, selector)
            .await?
            .into_iter()
            .filter(|deployment| deployment.metadata.deletion_timestamp.is_none())
            .collect())
    }

    /// Best-effort removal of the three runtime resources.
    async fn delete_runtime_resources(&self, hash: &str) {
        let namespace = &self.config.namespace;
        let names = resource_names(hash);

        for (kind, result) in [
            (
                "deployment",
                self.client.delete_deployment(namespace, &names.deployment).await,
            ),
            (
                "service",
                self.client.delete_service(namespace, &names.service).await,
            ),
            (
                "ingress",
                self.client.delete_ingress(namespace, &names.ingress).await,
            ),
        ] {
            if let Err(err) = result {
                if !err.is_not_found() {
                    debug!(%hash, kind, error = %err, "runtime teardown ignored");
                }
            }
        }
    }

    fn builder_pod_spec(
        &self,
        container_name: &str,
        image: &str,
        env_secret: Option<&str>,
        resources: Option<Value>,
        env: Option<&HashMap<String, String>>,
        commands: &[String],
    ) -> PodSpec {
        let mut script = vec!["set -ex".to_string()];
        script.extend(commands.iter().cloned());

        PodSpec {
            containers: vec![Container {
                name: container_name.to_string(),
                image: image.to_string(),
                image_pull_policy: Some("IfNotPresent".to_string()),
                volume_mounts: vec![
                    VolumeMount {
                        name: "docker-socket".to_string(),
                        mount_path: "/var/run/docker.sock".to_string(),
                    },
                    VolumeMount {
                        name: "docker-creds".to_string(),
                        mount_path: "/root/.docker/config.json".to_string(),
                    },
                ],
                env_from: env_secret
                    .map(|name| {
                        vec![EnvFromSource {
                            secret_ref: Some(SecretRef {
                                name: name.to_string(),
                            }),
                        }]
                    })
                    .unwrap_or_default(),
                env: env.map(env_vars).unwrap_or_default(),
                command: vec!["/bin/sh".to_string(), "-c".to_string()],
                args: vec![script.join("\n")],
                resources,
                ..Container::default()
            }],
            volumes: vec![
                Volume {
                    name: "docker-socket".to_string(),
                    host_path: Some(HostPathVolume {
                        path: self.config.docker_socket_host_path.clone(),
                        kind: Some("Socket".to_string()),
                    }),
                },
                Volume {
                    name: "docker-creds".to_string(),
                    host_path: Some(HostPathVolume {
                        path: self.config.docker_creds_host_path.clone(),
                        kind: Some("File".to_string()),
                    }),
                },
            ],
            ..PodSpec::default()
        }
    }

    /// Upsert the cleanup cronjob, parallelized across active nodes.
    async fn update_cleaner_job(&self, active_nodes: i32) -> OrchardResult<()> {
        let random_delay =
            rand::thread_rng().gen_range(0..=self.config.cleaner_random_delay_minutes * 60);
        let commands = vec![
            format!("sleep {random_delay}"),
            format!(
                "docker system prune --force --filter '{}'",
                self.config.cleaner_prune_filter
            ),
        ];

        let cleaner_labels = HashMap::from([
            (MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string()),
            ("jobgroup".to_string(), CLEANER_JOB_NAME.to_string()),
        ]);
        let mut pod_labels = cleaner_labels.clone();
        pod_labels.insert("type".to_string(), "cleaner".to_string());

        let mut spec = self.builder_pod_spec(
            CLEANER_CONTAINER_NAME,
            &self.config.builder_image,
            None,
            None,
            None,
            &commands,
        );
        spec.restart_policy = Some("Never".to_string());
        spec.termination_grace_period_seconds = Some(0);
        // Spread one cleaner pod per node; parallelism equals the number of
        // active nodes, so together the sweep covers the whole cluster.
        spec.topology_spread_constraints = vec![TopologySpreadConstraint {
            max_skew: 1,
            topology_key: "kubernetes.io/hostname".to_string(),
            when_unsatisfiable: "DoNotSchedule".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: cleaner_labels.clone(),
            }),
        }];

        let cron_job = CronJob {
            api_version: Some("batch/v1".to_string()),
            kind: Some("CronJob".to_string()),
            metadata: ObjectMeta {
                name: Some(CLEANER_JOB_NAME.to_string()),
                labels: cleaner_labels,
                ..ObjectMeta::default()
            },
            spec: CronJobSpec {
                schedule: self.config.cleaner_schedule.clone(),
                successful_jobs_history_limit: Some(self.config.cleaner_jobs_history_limit),
                failed_jobs_history_limit: Some(self.config.cleaner_jobs_history_limit),
                concurrency_policy: Some("Forbid".to_string()),
                job_template: JobTemplateSpec {
                    spec: JobSpec {
                        parallelism: Some(active_nodes),
                        template: PodTemplateSpec {
                            metadata: ObjectMeta {
                                labels: pod_labels,
                                ..ObjectMeta::default()
                            },
                            spec,
                        },
                    },
                },
            },
        };

        self.client
            .apply_cron_job(&self.config.namespace, CLEANER_JOB_NAME, &cron_job, MANAGER_NAME)
            .await
    }

    async fn cleaner_tick(&self) -> OrchardResult<()> {
        let nodes = self.client.list_nodes().await?;
        let active = nodes.iter().filter(|node| is_node_active(node)).count();
        debug!(total = nodes.len(), active, "counted cluster nodes");
        self.update_cleaner_job(active as i32).await
    }
}

fn container_info(pod: &Pod, container_name: &str) -> OrchardResult<ContainerInfo> {
    let metadata = &pod.metadata;
    let (Some(namespace), Some(pod_name)) = (metadata.namespace.clone(), metadata.name.clone())
    else {
        return Err(OrchardError::backend("pod has no metadata"));
    };
    if !pod.spec.containers.iter().any(|c| c.name == container_name) {
        return Err(OrchardError::backend(format!(
            "pod {pod_name} has no container {container_name}"
        )));
    }
    Ok(ContainerInfo {
        namespace,
        pod_name,
        container_name: container_name.to_string(),
    })
}

fn selector_of(deployment: &Deployment) -> OrchardResult<String> {
    let labels = &deployment.spec.selector.match_labels;
    if labels.is_empty() {
        return Err(OrchardError::backend("deployment has no selector labels"));
    }
    let pairs: Vec<(&str, &str)> = {
        let mut pairs: Vec<_> = labels
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        pairs.sort();
        pairs
    };
    Ok(label_selector(&pairs))
}

fn hash_of(deployment: &Deployment) -> Option<&str> {
    deployment.metadata.labels.get("hash").map(String::as_str)
}

#[async_trait]
impl ComputeBackend for K8sBackend {
    async fn startup(&self) -> OrchardResult<()> {
        if self.config.disable_cleaner {
            return Ok(());
        }
        let backend = K8sBackend {
            client: self.client.clone(),
            config: self.config.clone(),
            global: self.global.clone(),
            vcs: self.vcs.clone(),
        };
        let period = Duration::from_secs(self.config.cleaner_nodes_watch_period_secs);
        tokio::spawn(async move {
            info!("cluster cleaner loop started");
            loop {
                if let Err(err) = backend.cleaner_tick().await {
                    warn!(error = %err, "cleaner update failed");
                }
                tokio::time::sleep(period).await;
            }
        });
        Ok(())
    }

    async fn build_instance(
        &self,
        instance: &Instance,
        progress: &ProgressSink,
    ) -> OrchardResult<()> {
        let mut builder_pod = None;
        match self.run_build(instance, progress, &mut builder_pod).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // A vanished builder pod means the build was stopped, which
                // is expected rather than a failure.
                if let (OrchardError::NotFound(message), Some(pod)) = (&err, &builder_pod) {
                    if message.contains(pod.as_str()) {
                        debug!(hash = %instance.hash, "build stopped while in flight");
                        return Ok(());
                    }
                }
                progress.status(CommonStatus::Errored).await;
                Err(err)
            }
        }
    }

    async fn stop_builder(&self, hash: &str) -> OrchardResult<()> {
        self.client
            .delete_pods_by_selector(
                &self.config.namespace,
                &label_selector(&[("type", "builder"), ("hash", hash)]),
            )
            .await
    }

    async fn start_instance(&self, instance: &Instance) -> OrchardResult<()> {
        let config = self.fetch_instance_config(instance).await?;
        let image = self.instance_image(&instance.project, &instance.hash);

        self.delete_runtime_resources(&instance.hash).await;
        let info = self.create_runtime(instance, &config, &image).await?;
        self.wait_for_container_status(
            &info,
            &["Ready"],
            Some(
                config
                    .start_instance_timeout_ms
                    .unwrap_or(self.config.start_instance_timeout_ms),
            ),
        )
        .await?;
        Ok(())
    }

    async fn stop_instance(&self, hash: &str) -> OrchardResult<()> {
        // Scale to zero replicas so a later start resumes quickly.
        let names = resource_names(hash);
        match self
            .client
            .patch_deployment(
                &self.config.namespace,
                &names.deployment,
                &json!({"spec": {"replicas": 0}}),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_instance(&self, hash: &str) -> OrchardResult<()> {
        if let Err(err) = self.stop_builder(hash).await {
            if !err.is_not_found() {
                debug!(%hash, error = %err, "builder teardown ignored");
            }
        }
        self.delete_runtime_resources(hash).await;
        Ok(())
    }

    async fn instance_status(&self, instance: &Instance) -> OrchardResult<BackendStatus> {
        let selector = label_selector(&[
            (MANAGED_BY_LABEL.0, MANAGED_BY_LABEL.1),
            ("hash", &instance.hash),
        ]);
        let deployments = self.live_deployments(&selector).await?;
        let Some(deployment) = deployments.first() else {
            return Ok(BackendStatus::Unknown);
        };

        let pods = self.live_pods(&selector_of(deployment)?).await?;
        // No pod for an existing deployment means the instance is stopped.
        let Some(pod) = pods.first() else {
            return Ok(BackendStatus::Stopped);
        };
        Ok(map_cluster_status(&container_status(
            pod,
            INSTANCE_CONTAINER_NAME,
        )))
    }

    async fn instances(&self) -> OrchardResult<Vec<BackendInstance>> {
        let selector = label_selector(&[(MANAGED_BY_LABEL.0, MANAGED_BY_LABEL.1)]);
        let deployments = self.live_deployments(&selector).await?;

        let mut instances = Vec::new();
        for deployment in &deployments {
            let Some(hash) = hash_of(deployment) else {
                warn!(
                    deployment = deployment.metadata.name.as_deref().unwrap_or(""),
                    "managed deployment has no hash label"
                );
                continue;
            };
            let pods = self.live_pods(&selector_of(deployment)?).await?;
            let (status, start_time) = match pods.first() {
                Some(pod) => (
                    map_cluster_status(&container_status(pod, INSTANCE_CONTAINER_NAME)),
                    pod_start_time(pod),
                ),
                None => (BackendStatus::Stopped, 0),
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
        let selector =
            label_selector(&[("type", "instance"), ("hash", &query.hash)]);
        let pods = self.live_pods(&selector).await?;
        let pod = pods.first().ok_or_else(|| {
            OrchardError::NotFound(format!("pod for instance {} not found", query.hash))
        })?;
        let info = container_info(pod, INSTANCE_CONTAINER_NAME)?;

        // The cluster merges stdout and stderr into one stream.
        let Some(filter) = &query.stdout else {
            return Ok(InstanceLogs::default());
        };
        let text = self
            .client
            .pod_log(&info.namespace, &info.pod_name, &info.container_name, filter.max_lines)
            .await?;
        Ok(InstanceLogs {
            stdout: Some(filter_captured(&text, filter)),
            stderr: None,
        })
    }
}
