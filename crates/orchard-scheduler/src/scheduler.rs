//! Build scheduler — drains persisted work under concurrency caps.
//!
//! Three independently re-entrancy-guarded sweeps run on a fixed tick:
//! deletes, retries of builds whose backend process died, and new builds
//! up to the free capacity under the global concurrency limit. Each sweep
//! no-ops while its previous run is still active; per-item failures are
//! logged, never fatal to the sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use orchard_backend::{BackendRegistry, BuildEvent, ComputeBackend, ProgressSink};
use orchard_core::{
    BackendStatus, CommonStatus, GlobalConfig, Instance, InstanceRequest, OrchardError,
    OrchardResult, OutputChunk, instance_hash,
};
use orchard_state::InstanceStore;

use crate::limiter::check_limit;
use crate::stats::{BuildStats, StatsSink};

/// Capacity of the per-build progress channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

const GENERATE_ACTION: &str = "generate_instance";

/// One re-entrancy flag per sweep; a sweep skips its tick while the
/// previous run is still in flight.
#[derive(Default)]
struct SweepGuards {
    delete: AtomicBool,
    retry: AtomicBool,
    build: AtomicBool,
}

/// Released on drop.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BuildScheduler {
    store: InstanceStore,
    backends: Arc<BackendRegistry>,
    global: Arc<GlobalConfig>,
    stats: Arc<dyn StatsSink>,
    guards: SweepGuards,
}

impl BuildScheduler {
    pub fn new(
        store: InstanceStore,
        backends: Arc<BackendRegistry>,
        global: Arc<GlobalConfig>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            store,
            backends,
            global,
            stats,
            guards: SweepGuards::default(),
        }
    }

    fn backend(&self) -> OrchardResult<&Arc<dyn ComputeBackend>> {
        self.backends.default_backend()
    }

    // ── Entry points ───────────────────────────────────────────────

    /// Validate a generate request and persist it as `queued`.
    ///
    /// Limit violations surface synchronously and are never persisted as
    /// instance state.
    pub async fn enqueue(&self, request: InstanceRequest) -> OrchardResult<Instance> {
        if request.branch.trim().is_empty() {
            return Err(OrchardError::Validation("branch must not be empty".to_string()));
        }
        self.global.project(&request.project)?;

        let hash = instance_hash(&request);
        let backend = self.backend()?;
        check_limit(&self.store, backend, &self.global, &request.project, &hash).await?;

        // A regenerate supersedes any build already in flight for the hash.
        backend.stop_builder(&hash).await?;
        self.store.clear_instance_data(&hash)?;

        let instance = Instance {
            hash: hash.clone(),
            project: request.project,
            branch: request.branch,
            vcs: request.vcs,
            instance_config_name: request.instance_config_name,
            url_template: request.url_template,
            env_variables: request.env_variables,
            run_env_variables: request.run_env_variables,
            labels: request.labels,
            description: request.description,
            created_at: chrono::Utc::now().timestamp_millis(),
            status: CommonStatus::Queued,
        };
        self.store.insert_instance(&instance)?;
        info!(%hash, project = %instance.project, branch = %instance.branch, "instance queued");
        Ok(instance)
    }

    /// Mark an instance for the delete sweep.
    pub fn request_delete(&self, hash: &str) -> OrchardResult<()> {
        self.store
            .update_instance_status(hash, CommonStatus::Deleting)?;
        Ok(())
    }

    pub async fn start_instance(&self, hash: &str) -> OrchardResult<()> {
        let instance = self.instance(hash)?;
        let backend = self.backend()?;
        check_limit(&self.store, backend, &self.global, &instance.project, hash).await?;
        backend.start_instance(&instance).await
    }

    pub async fn stop_instance(&self, hash: &str) -> OrchardResult<()> {
        self.backend()?.stop_instance(hash).await
    }

    pub async fn restart_instance(&self, hash: &str) -> OrchardResult<()> {
        let instance = self.instance(hash)?;
        let backend = self.backend()?;
        check_limit(&self.store, backend, &self.global, &instance.project, hash).await?;
        backend.restart_instance(&instance).await
    }

    fn instance(&self, hash: &str) -> OrchardResult<Instance> {
        self.store
            .get_instance(hash)?
            .ok_or_else(|| OrchardError::NotFound(format!("instance {hash}")))
    }

    // ── Sweeps ─────────────────────────────────────────────────────

    /// Tear down instances persisted as `deleting` and clear their state.
    pub async fn delete_sweep(&self) {
        let Some(_guard) = SweepGuard::try_acquire(&self.guards.delete) else {
            return;
        };

        let instances = match self
            .store
            .get_instances_by_status(CommonStatus::Deleting, None)
        {
            Ok(instances) => instances,
            Err(err) => {
                error!(error = %err, "delete sweep query failed");
                return;
            }
        };

        for instance in instances {
            if let Err(err) = self.delete_one(&instance).await {
                error!(hash = %instance.hash, error = %err, "instance deletion failed");
            }
        }
    }

    async fn delete_one(&self, instance: &Instance) -> OrchardResult<()> {
        self.backend()?.delete_instance(&instance.hash).await?;
        self.store.clear_instance_data(&instance.hash)?;
        info!(hash = %instance.hash, "instance deleted");
        Ok(())
    }

    /// Re-enqueue `generating` instances whose backend process is observed
    /// errored — a build that crashed between enqueue and observation.
    pub async fn retry_sweep(&self) {
        let Some(_guard) = SweepGuard::try_acquire(&self.guards.retry) else {
            return;
        };

        let generating = match self
            .store
            .get_instances_by_status(CommonStatus::Generating, None)
        {
            Ok(instances) => instances,
            Err(err) => {
                error!(error = %err, "retry sweep query failed");
                return;
            }
        };
        if generating.is_empty() {
            return;
        }

        let backend_instances = match self.backend() {
            Ok(backend) => match backend.instances().await {
                Ok(instances) => instances,
                Err(err) => {
                    error!(error = %err, "retry sweep backend listing failed");
                    return;
                }
            },
            Err(err) => {
                error!(error = %err, "retry sweep has no backend");
                return;
            }
        };

        for instance in generating {
            // The backend creates the process right before starting the
            // app, so only observed failures are restarted; an absent
            // process may simply not exist yet.
            let crashed = backend_instances
                .iter()
                .any(|b| b.hash == instance.hash && b.status == BackendStatus::Errored);
            if !crashed {
                continue;
            }
            warn!(hash = %instance.hash, "backend process died, re-enqueueing build");
            if let Err(err) = self.enqueue(request_of(&instance)).await {
                error!(hash = %instance.hash, error = %err, "re-enqueue failed");
            }
        }
    }

    /// Start builds for the oldest queued instances up to free capacity.
    ///
    /// Builds are fire-and-forget per item; each failure lands in the
    /// instance's own persisted state, never in the sweep.
    pub async fn build_sweep(self: Arc<Self>) {
        let Some(_guard) = SweepGuard::try_acquire(&self.guards.build) else {
            return;
        };

        let generating = match self.store.count_generating() {
            Ok(count) => count,
            Err(err) => {
                error!(error = %err, "build sweep count failed");
                return;
            }
        };
        let limit = self.global.max_concurrent_builds as usize;
        let free = limit.saturating_sub(generating);
        if free == 0 {
            return;
        }

        let queued = match self
            .store
            .get_instances_by_status(CommonStatus::Queued, Some(free))
        {
            Ok(instances) => instances,
            Err(err) => {
                error!(error = %err, "build sweep query failed");
                return;
            }
        };

        for instance in queued {
            // Claim capacity before handing off, so the next tick sees it.
            if let Err(err) = self.claim_for_build(&instance.hash) {
                error!(hash = %instance.hash, error = %err, "build claim failed");
                continue;
            }
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                scheduler.run_build(instance).await;
            });
        }
    }

    fn claim_for_build(&self, hash: &str) -> OrchardResult<()> {
        self.store.clear_instance_logs(hash)?;
        self.store
            .update_instance_status(hash, CommonStatus::Generating)?;
        Ok(())
    }

    // ── Build execution ────────────────────────────────────────────

    /// Drive one build to completion, persisting progress as it arrives.
    ///
    /// The instance must already be claimed (`generating`). The build's
    /// logging context closes when this future finishes, success or
    /// failure.
    pub async fn run_build(&self, instance: Instance) {
        let hash = instance.hash.clone();
        let started = Instant::now();
        debug!(%hash, "build starting");

        let backend = match self.backend() {
            Ok(backend) => Arc::clone(backend),
            Err(err) => {
                self.record_build_failure(&hash, &err, started);
                return;
            }
        };

        let (sink, mut events) = ProgressSink::channel(PROGRESS_CHANNEL_CAPACITY);
        let build = tokio::spawn({
            let instance = instance.clone();
            async move { backend.build_instance(&instance, &sink).await }
        });

        // Single consumer: chunks are persisted in emission order.
        while let Some(event) = events.recv().await {
            match event {
                BuildEvent::Output(chunks) => {
                    if let Err(err) = self.store.insert_instance_logs(&hash, &chunks) {
                        warn!(%hash, error = %err, "log persistence failed");
                    }
                    for chunk in &chunks {
                        if chunk.is_finished_command() {
                            if let (Some(command), Some(duration)) =
                                (&chunk.command, chunk.duration_ms)
                            {
                                self.send_stats(&hash, command.clone(), duration);
                            }
                        }
                    }
                }
                BuildEvent::Status(status) => {
                    if let Err(err) = self.store.update_instance_status(&hash, status) {
                        warn!(%hash, error = %err, "status persistence failed");
                    }
                }
                BuildEvent::ProcessId(pid) => {
                    debug!(%hash, pid, "build process started");
                }
            }
        }

        match build.await {
            Ok(Ok(())) => {
                info!(%hash, elapsed_ms = started.elapsed().as_millis() as u64, "build finished");
            }
            // A stopped build was superseded or deleted; that flow owns the
            // instance's persisted state now.
            Ok(Err(OrchardError::Cancelled(_))) => {
                debug!(%hash, "build cancelled");
            }
            Ok(Err(err)) => self.record_build_failure(&hash, &err, started),
            Err(join_err) => {
                let err = OrchardError::backend(format!("build task failed: {join_err}"));
                self.record_build_failure(&hash, &err, started);
            }
        }
    }

    /// Persist a failed build: synthetic log entry plus `errored` status.
    fn record_build_failure(&self, hash: &str, err: &OrchardError, started: Instant) {
        warn!(%hash, error = %err, "build failed");
        let chunk = OutputChunk {
            command: Some("Build failed".to_string()),
            stdout: None,
            stderr: Some(err.to_string()),
            duration_ms: Some(0),
            exit_code: Some(err.exit_code()),
        };
        if let Err(log_err) = self.store.insert_instance_logs(hash, &[chunk]) {
            warn!(%hash, error = %log_err, "failure log persistence failed");
        }
        if let Err(status_err) = self
            .store
            .update_instance_status(hash, CommonStatus::Errored)
        {
            warn!(%hash, error = %status_err, "failure status persistence failed");
        }
        self.send_stats(
            hash,
            "BUILD_ERRORED".to_string(),
            started.elapsed().as_millis() as u64,
        );
    }

    fn send_stats(&self, hash: &str, step: String, elapsed_ms: u64) {
        let queue_depth = self
            .store
            .get_instances_by_status(CommonStatus::Queued, Some(100))
            .map(|queued| queued.len())
            .unwrap_or(0);
        self.stats.record(BuildStats {
            timestamp: chrono::Utc::now().timestamp_millis(),
            action: GENERATE_ACTION,
            hash: hash.to_string(),
            step,
            elapsed_ms,
            queue_depth,
        });
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// Run all three sweeps on a fixed tick until shutdown.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::join!(
                        self.delete_sweep(),
                        self.retry_sweep(),
                        Arc::clone(&self).build_sweep()
                    );
                }
                _ = shutdown.changed() => {
                    debug!("scheduler shutting down");
                    return;
                }
            }
        }
    }
}

/// Rebuild the generate request an instance was queued with.
fn request_of(instance: &Instance) -> InstanceRequest {
    InstanceRequest {
        project: instance.project.clone(),
        branch: instance.branch.clone(),
        vcs: instance.vcs.clone(),
        instance_config_name: instance.instance_config_name.clone(),
        url_template: instance.url_template.clone(),
        env_variables: instance.env_variables.clone(),
        run_env_variables: instance.run_env_variables.clone(),
        labels: instance.labels.clone(),
        description: instance.description.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::test_support::CapturingSink;
    use async_trait::async_trait;
    use orchard_backend::{InstanceLogs, LogQuery};
    use orchard_core::{BackendInstance, ProjectConfig};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Backend double: scripted listings, recorded calls, scripted builds.
    #[derive(Default)]
    struct MockBackend {
        listed: Mutex<Vec<BackendInstance>>,
        deleted: Mutex<Vec<String>>,
        stopped_builders: Mutex<Vec<String>>,
        /// Build behavior: emitted chunks, then this result.
        build_result: Mutex<HashMap<String, OrchardResult<()>>>,
        /// Builds that should never finish.
        hang_builds: bool,
    }

    impl MockBackend {
        fn list(&self, instances: Vec<BackendInstance>) {
            *self.listed.lock().unwrap() = instances;
        }
    }

    #[async_trait]
    impl ComputeBackend for MockBackend {
        async fn startup(&self) -> OrchardResult<()> {
            Ok(())
        }

        async fn build_instance(
            &self,
            instance: &Instance,
            progress: &ProgressSink,
        ) -> OrchardResult<()> {
            progress.message("Prepare...").await;
            progress.message("Fetch code...").await;
            if self.hang_builds {
                // Keep the instance generating for capacity tests.
                std::future::pending::<()>().await;
            }
            // Scripted failures abort here, the way a real backend stops
            // emitting once a phase fails.
            self.build_result
                .lock()
                .unwrap()
                .remove(&instance.hash)
                .unwrap_or(Ok(()))?;
            progress.status(CommonStatus::Generated).await;
            progress
                .chunk(OutputChunk {
                    command: Some("Build image".to_string()),
                    duration_ms: Some(5),
                    exit_code: Some(0),
                    ..OutputChunk::default()
                })
                .await;
            progress.message("Done!").await;
            Ok(())
        }

        async fn stop_builder(&self, hash: &str) -> OrchardResult<()> {
            self.stopped_builders.lock().unwrap().push(hash.to_string());
            Ok(())
        }

        async fn start_instance(&self, _instance: &Instance) -> OrchardResult<()> {
            Ok(())
        }

        async fn stop_instance(&self, _hash: &str) -> OrchardResult<()> {
            Ok(())
        }

        async fn delete_instance(&self, hash: &str) -> OrchardResult<()> {
            self.deleted.lock().unwrap().push(hash.to_string());
            Ok(())
        }

        async fn instance_status(&self, _instance: &Instance) -> OrchardResult<BackendStatus> {
            Ok(BackendStatus::Unknown)
        }

        async fn instances(&self) -> OrchardResult<Vec<BackendInstance>> {
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn instance_logs(&self, _query: &LogQuery) -> OrchardResult<InstanceLogs> {
            Ok(InstanceLogs::default())
        }
    }

    struct Fixture {
        scheduler: Arc<BuildScheduler>,
        backend: Arc<MockBackend>,
        store: InstanceStore,
        stats: Arc<CapturingSink>,
    }

    fn fixture_with(max_builds: u32, cap: Option<u32>, hang_builds: bool) -> Fixture {
        let store = InstanceStore::open_in_memory().unwrap();
        let backend = Arc::new(MockBackend {
            hang_builds,
            ..MockBackend::default()
        });
        let registry = Arc::new(
            BackendRegistry::new("mock")
                .insert("mock", backend.clone() as Arc<dyn ComputeBackend>),
        );
        let global = Arc::new(GlobalConfig {
            max_concurrent_builds: max_builds,
            projects: HashMap::from([(
                "web".to_string(),
                ProjectConfig {
                    repository_path: "acme/web".to_string(),
                    mono_repo_path: None,
                    max_running_instances: cap,
                    url_template: None,
                    vcs: None,
                    default_branch: None,
                },
            )]),
            ..GlobalConfig::default()
        });
        let stats = Arc::new(CapturingSink::default());
        let scheduler = Arc::new(BuildScheduler::new(
            store.clone(),
            registry,
            global,
            stats.clone(),
        ));
        Fixture {
            scheduler,
            backend,
            store,
            stats,
        }
    }

    fn request(branch: &str) -> InstanceRequest {
        InstanceRequest {
            project: "web".to_string(),
            branch: branch.to_string(),
            vcs: "git".to_string(),
            instance_config_name: "default".to_string(),
            ..InstanceRequest::default()
        }
    }

    #[tokio::test]
    async fn enqueue_persists_a_queued_instance() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        assert_eq!(instance.status, CommonStatus::Queued);
        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Queued
        );
        // Any in-flight build for the hash was superseded.
        assert_eq!(
            fx.backend.stopped_builders.lock().unwrap().as_slice(),
            [instance.hash.clone()]
        );
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_project() {
        let fx = fixture_with(2, None, false);
        let mut bad = request("main");
        bad.project = "nope".to_string();
        assert!(matches!(
            fx.scheduler.enqueue(bad).await,
            Err(OrchardError::Validation(_))
        ));
        let empty = request("  ");
        assert!(matches!(
            fx.scheduler.enqueue(empty).await,
            Err(OrchardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn build_sweep_starts_exactly_free_capacity() {
        let fx = fixture_with(2, None, true);
        for branch in ["b1", "b2", "b3", "b4", "b5"] {
            fx.scheduler.enqueue(request(branch)).await.unwrap();
        }

        fx.scheduler.clone().build_sweep().await;

        assert_eq!(fx.store.count_generating().unwrap(), 2);
        assert_eq!(
            fx.store
                .get_instances_by_status(CommonStatus::Queued, None)
                .unwrap()
                .len(),
            3
        );

        // No free capacity on the next tick.
        fx.scheduler.clone().build_sweep().await;
        assert_eq!(fx.store.count_generating().unwrap(), 2);
    }

    #[tokio::test]
    async fn build_sweep_takes_oldest_queued_first() {
        let fx = fixture_with(1, None, true);
        let first = fx.scheduler.enqueue(request("older")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = fx.scheduler.enqueue(request("newer")).await.unwrap();

        fx.scheduler.clone().build_sweep().await;

        assert_eq!(
            fx.store.get_instance(&first.hash).unwrap().unwrap().status,
            CommonStatus::Generating
        );
        assert_eq!(
            fx.store.get_instance(&second.hash).unwrap().unwrap().status,
            CommonStatus::Queued
        );
    }

    #[tokio::test]
    async fn run_build_persists_chunks_in_emission_order() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.store
            .update_instance_status(&instance.hash, CommonStatus::Generating)
            .unwrap();

        fx.scheduler.run_build(instance.clone()).await;

        let rows = fx.store.list_instance_logs(&instance.hash).unwrap();
        let lines: Vec<_> = rows
            .iter()
            .filter_map(|row| row.chunk.stdout.as_deref())
            .collect();
        assert_eq!(lines, ["Prepare...", "Fetch code...", "Done!"]);
        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Generated
        );
    }

    #[tokio::test]
    async fn failed_build_records_synthetic_entry_and_errored_status() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.backend.build_result.lock().unwrap().insert(
            instance.hash.clone(),
            Err(OrchardError::Backend {
                message: "builder crashed".to_string(),
                exit_code: Some(137),
            }),
        );
        fx.store
            .update_instance_status(&instance.hash, CommonStatus::Generating)
            .unwrap();

        fx.scheduler.run_build(instance.clone()).await;

        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Errored
        );
        let rows = fx.store.list_instance_logs(&instance.hash).unwrap();
        let last = rows.last().unwrap();
        assert_eq!(last.chunk.command.as_deref(), Some("Build failed"));
        assert_eq!(last.chunk.exit_code, Some(137));
        assert!(
            last.chunk
                .stderr
                .as_deref()
                .unwrap()
                .contains("builder crashed")
        );
        let steps: Vec<String> = fx
            .stats
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.step.clone())
            .collect();
        assert!(steps.contains(&"BUILD_ERRORED".to_string()));
    }

    #[tokio::test]
    async fn cancelled_build_does_not_stomp_persisted_state() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.backend.build_result.lock().unwrap().insert(
            instance.hash.clone(),
            Err(OrchardError::Cancelled("build stopped".to_string())),
        );

        // Simulate the regenerate that fired the cancel: the row is queued
        // again while the superseded build unwinds.
        fx.scheduler.run_build(instance.clone()).await;

        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Queued
        );
        let rows = fx.store.list_instance_logs(&instance.hash).unwrap();
        assert!(
            rows.iter()
                .all(|row| row.chunk.command.as_deref() != Some("Build failed"))
        );
    }

    #[tokio::test]
    async fn delete_sweep_tears_down_and_clears() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.scheduler.request_delete(&instance.hash).unwrap();

        fx.scheduler.delete_sweep().await;

        assert_eq!(
            fx.backend.deleted.lock().unwrap().as_slice(),
            [instance.hash.clone()]
        );
        assert!(fx.store.get_instance(&instance.hash).unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_a_missing_instance_changes_nothing() {
        let fx = fixture_with(2, None, false);
        fx.scheduler.request_delete("ghost").unwrap();
        fx.scheduler.delete_sweep().await;
        assert!(fx.backend.deleted.lock().unwrap().is_empty());
        assert!(fx.store.list_instances().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_sweep_requeues_crashed_builds_once() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.store
            .update_instance_status(&instance.hash, CommonStatus::Generating)
            .unwrap();
        fx.backend.list(vec![BackendInstance {
            hash: instance.hash.clone(),
            status: BackendStatus::Errored,
            start_time: 0,
        }]);

        fx.scheduler.retry_sweep().await;
        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Queued
        );

        // The instance is queued now, so repeated ticks do not touch it.
        fx.scheduler.retry_sweep().await;
        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Queued
        );
    }

    #[tokio::test]
    async fn retry_sweep_leaves_absent_processes_alone() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.store
            .update_instance_status(&instance.hash, CommonStatus::Generating)
            .unwrap();
        // Backend lists nothing: the process may not exist yet.
        fx.scheduler.retry_sweep().await;
        assert_eq!(
            fx.store.get_instance(&instance.hash).unwrap().unwrap().status,
            CommonStatus::Generating
        );
    }

    #[tokio::test]
    async fn per_project_cap_rejects_with_distinguished_error() {
        let fx = fixture_with(2, Some(1), false);
        let first = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.backend.list(vec![BackendInstance {
            hash: first.hash.clone(),
            status: BackendStatus::Running,
            start_time: 0,
        }]);

        let second = fx.scheduler.enqueue(request("feature")).await;
        match second {
            Err(OrchardError::LimitExceeded { project, limit }) => {
                assert_eq!(project, "web");
                assert_eq!(limit, 1);
            }
            other => panic!("expected limit error, got {other:?}"),
        }

        // Regenerating the already-active instance is permitted.
        fx.scheduler.enqueue(request("main")).await.unwrap();
    }

    #[tokio::test]
    async fn backend_only_activity_counts_toward_the_cap() {
        let fx = fixture_with(2, Some(1), false);
        let first = fx.scheduler.enqueue(request("main")).await.unwrap();
        // Store no longer marks it active, but the substrate still runs it.
        fx.store
            .update_instance_status(&first.hash, CommonStatus::Generated)
            .unwrap();
        fx.backend.list(vec![BackendInstance {
            hash: first.hash.clone(),
            status: BackendStatus::Running,
            start_time: 0,
        }]);

        assert!(matches!(
            fx.scheduler.enqueue(request("feature")).await,
            Err(OrchardError::LimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn finished_commands_emit_timing_stats() {
        let fx = fixture_with(2, None, false);
        let instance = fx.scheduler.enqueue(request("main")).await.unwrap();
        fx.store
            .update_instance_status(&instance.hash, CommonStatus::Generating)
            .unwrap();

        fx.scheduler.run_build(instance).await;

        let records = fx.stats.records.lock().unwrap();
        let timed: Vec<_> = records.iter().filter(|s| s.step == "Build image").collect();
        assert_eq!(timed.len(), 1);
        assert_eq!(timed[0].elapsed_ms, 5);
    }
}
