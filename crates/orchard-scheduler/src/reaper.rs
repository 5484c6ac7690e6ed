//! TTL reaper — stops and reclaims long-lived instances.
//!
//! Two guarded sweeps on a fixed tick: stop `generated` instances whose
//! backend start time exceeds the stop timeout, and mark instances older
//! than the delete timeout as `deleting` for the delete sweep to collect.
//! Either sweep is disabled when its timeout is unset.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use orchard_backend::BackendRegistry;
use orchard_core::{BackendStatus, CommonStatus, GlobalConfig};
use orchard_state::InstanceStore;

pub struct Reaper {
    store: InstanceStore,
    backends: Arc<BackendRegistry>,
    global: Arc<GlobalConfig>,
    stopping: AtomicBool,
    deleting: AtomicBool,
}

impl Reaper {
    pub fn new(
        store: InstanceStore,
        backends: Arc<BackendRegistry>,
        global: Arc<GlobalConfig>,
    ) -> Self {
        Self {
            store,
            backends,
            global,
            stopping: AtomicBool::new(false),
            deleting: AtomicBool::new(false),
        }
    }

    /// Stop running instances older than the stop timeout.
    pub async fn stop_sweep(&self) {
        let Some(timeout_ms) = self.global.instance_stop_timeout_ms else {
            return;
        };
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let result = self.stop_expired(timeout_ms).await;
        self.stopping.store(false, Ordering::Release);
        if let Err(err) = result {
            error!(error = %err, "stop sweep failed");
        }
    }

    async fn stop_expired(&self, timeout_ms: u64) -> orchard_core::OrchardResult<()> {
        let backend = self.backends.default_backend()?;
        let now = chrono::Utc::now().timestamp_millis();

        for process in backend.instances().await? {
            if process.status != BackendStatus::Running {
                continue;
            }
            let Some(instance) = self.store.get_instance(&process.hash)? else {
                continue;
            };
            // Only fully built instances are stopped; a shorter timeout than
            // the build itself would otherwise kill in-flight builds.
            if instance.status != CommonStatus::Generated {
                continue;
            }
            if now.saturating_sub(process.start_time) <= timeout_ms as i64 {
                continue;
            }
            debug!(hash = %process.hash, "stopping expired instance");
            if let Err(err) = backend.stop_instance(&process.hash).await {
                warn!(hash = %process.hash, error = %err, "expired instance stop failed");
            }
        }
        Ok(())
    }

    /// Mark instances older than the delete timeout for deletion.
    pub async fn delete_sweep(&self) {
        let Some(ttl_ms) = self.global.instance_delete_timeout_ms else {
            return;
        };
        if self
            .deleting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();
        match self.store.get_instances_by_ttl(ttl_ms, now) {
            Ok(expired) => {
                for instance in expired {
                    debug!(hash = %instance.hash, "marking expired instance for deletion");
                    if let Err(err) = self
                        .store
                        .update_instance_status(&instance.hash, CommonStatus::Deleting)
                    {
                        warn!(hash = %instance.hash, error = %err, "expiry marking failed");
                    }
                }
            }
            Err(err) => error!(error = %err, "delete sweep query failed"),
        }
        self.deleting.store(false, Ordering::Release);
    }

    /// Run both sweeps on a fixed tick until shutdown.
    pub async fn run(self: Arc<Self>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::join!(self.stop_sweep(), self.delete_sweep());
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchard_backend::{ComputeBackend, InstanceLogs, LogQuery, ProgressSink};
    use orchard_core::{BackendInstance, Instance, OrchardResult};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubBackend {
        listed: Mutex<Vec<BackendInstance>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ComputeBackend for StubBackend {
        async fn startup(&self) -> OrchardResult<()> {
            Ok(())
        }
        async fn build_instance(
            &self,
            _instance: &Instance,
            _progress: &ProgressSink,
        ) -> OrchardResult<()> {
            Ok(())
        }
        async fn stop_builder(&self, _hash: &str) -> OrchardResult<()> {
            Ok(())
        }
        async fn start_instance(&self, _instance: &Instance) -> OrchardResult<()> {
            Ok(())
        }
        async fn stop_instance(&self, hash: &str) -> OrchardResult<()> {
            self.stopped.lock().unwrap().push(hash.to_string());
            Ok(())
        }
        async fn delete_instance(&self, _hash: &str) -> OrchardResult<()> {
            Ok(())
        }
        async fn instance_status(
            &self,
            _instance: &Instance,
        ) -> OrchardResult<orchard_core::BackendStatus> {
            Ok(BackendStatus::Unknown)
        }
        async fn instances(&self) -> OrchardResult<Vec<BackendInstance>> {
            Ok(self.listed.lock().unwrap().clone())
        }
        async fn instance_logs(&self, _query: &LogQuery) -> OrchardResult<InstanceLogs> {
            Ok(InstanceLogs::default())
        }
    }

    fn instance(hash: &str, status: CommonStatus, created_at: i64) -> Instance {
        Instance {
            hash: hash.to_string(),
            project: "web".to_string(),
            branch: "main".to_string(),
            vcs: "git".to_string(),
            instance_config_name: "default".to_string(),
            url_template: None,
            env_variables: HashMap::new(),
            run_env_variables: HashMap::new(),
            labels: HashMap::new(),
            description: None,
            created_at,
            status,
        }
    }

    fn reaper_with(
        stop_ms: Option<u64>,
        delete_ms: Option<u64>,
    ) -> (Arc<Reaper>, Arc<StubBackend>, InstanceStore) {
        let store = InstanceStore::open_in_memory().unwrap();
        let backend = Arc::new(StubBackend::default());
        let registry = Arc::new(
            BackendRegistry::new("stub")
                .insert("stub", backend.clone() as Arc<dyn ComputeBackend>),
        );
        let global = Arc::new(GlobalConfig {
            instance_stop_timeout_ms: stop_ms,
            instance_delete_timeout_ms: delete_ms,
            ..GlobalConfig::default()
        });
        (
            Arc::new(Reaper::new(store.clone(), registry, global)),
            backend,
            store,
        )
    }

    #[tokio::test]
    async fn stop_sweep_stops_only_expired_generated_instances() {
        let (reaper, backend, store) = reaper_with(Some(1000), None);
        let now = chrono::Utc::now().timestamp_millis();

        store
            .insert_instance(&instance("old", CommonStatus::Generated, now))
            .unwrap();
        store
            .insert_instance(&instance("fresh", CommonStatus::Generated, now))
            .unwrap();
        store
            .insert_instance(&instance("building", CommonStatus::Generating, now))
            .unwrap();
        *backend.listed.lock().unwrap() = vec![
            BackendInstance {
                hash: "old".to_string(),
                status: BackendStatus::Running,
                start_time: now - 10_000,
            },
            BackendInstance {
                hash: "fresh".to_string(),
                status: BackendStatus::Running,
                start_time: now,
            },
            BackendInstance {
                hash: "building".to_string(),
                status: BackendStatus::Running,
                start_time: now - 10_000,
            },
        ];

        reaper.stop_sweep().await;

        assert_eq!(backend.stopped.lock().unwrap().as_slice(), ["old"]);
    }

    #[tokio::test]
    async fn stop_sweep_is_disabled_without_timeout() {
        let (reaper, backend, store) = reaper_with(None, None);
        store
            .insert_instance(&instance("old", CommonStatus::Generated, 0))
            .unwrap();
        *backend.listed.lock().unwrap() = vec![BackendInstance {
            hash: "old".to_string(),
            status: BackendStatus::Running,
            start_time: 0,
        }];

        reaper.stop_sweep().await;
        assert!(backend.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_sweep_marks_expired_generated_instances() {
        let (reaper, _backend, store) = reaper_with(None, Some(1000));
        let now = chrono::Utc::now().timestamp_millis();
        store
            .insert_instance(&instance("old", CommonStatus::Generated, now - 10_000))
            .unwrap();
        store
            .insert_instance(&instance("fresh", CommonStatus::Generated, now))
            .unwrap();

        reaper.delete_sweep().await;

        assert_eq!(
            store.get_instance("old").unwrap().unwrap().status,
            CommonStatus::Deleting
        );
        assert_eq!(
            store.get_instance("fresh").unwrap().unwrap().status,
            CommonStatus::Generated
        );
    }
}
