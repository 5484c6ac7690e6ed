//! Health monitor — per-instance liveness probing.
//!
//! An outer loop asks the backend for currently running keys and keeps one
//! probe task per key. Each task waits an initial delay, then probes with a
//! per-probe timeout and re-schedules itself a fixed period after every
//! settled probe — a key never has two probes outstanding. Probe streaks
//! are clamped at their thresholds and one outcome resets the opposite
//! counter. The monitor performs no persistence and exposes only a
//! synchronous status lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use orchard_core::{HealthStatus, OrchardResult};

/// Per-key probe configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub initial_delay: Duration,
    pub period: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            period: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            success_threshold: 1,
            failure_threshold: 3,
        }
    }
}

/// One key the backend currently knows about.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub key: String,
    pub running: bool,
    /// Overrides the default probe config when set.
    pub config: Option<ProbeConfig>,
}

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Probe one key; resolves to whether the instance answered healthy.
pub type ProbeFn = Arc<dyn Fn(String) -> BoxFuture<OrchardResult<bool>> + Send + Sync>;

/// List the keys the backend currently reports, with their run state.
pub type TargetsFn = Arc<dyn Fn() -> BoxFuture<OrchardResult<Vec<ProbeTarget>>> + Send + Sync>;

struct EntryState {
    consecutive_success: u32,
    consecutive_failure: u32,
}

struct Entry {
    config: ProbeConfig,
    state: EntryState,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    probe: ProbeFn,
}

/// Manages probe loops for all running instances of one backend.
pub struct HealthMonitor {
    inner: Arc<Inner>,
    targets: TargetsFn,
    sweep_period: Duration,
}

impl HealthMonitor {
    pub fn new(probe: ProbeFn, targets: TargetsFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                probe,
            }),
            targets,
            sweep_period: Duration::from_secs(10),
        }
    }

    pub fn with_sweep_period(mut self, period: Duration) -> Self {
        self.sweep_period = period;
        self
    }

    /// Current health judgement for a key. `unknown` when not tracked or
    /// when neither streak has reached its threshold.
    pub fn status(&self, key: &str) -> HealthStatus {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) => {
                if entry.state.consecutive_success >= entry.config.success_threshold {
                    HealthStatus::Healthy
                } else if entry.state.consecutive_failure >= entry.config.failure_threshold {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Unknown
                }
            }
            None => HealthStatus::Unknown,
        }
    }

    /// Keys with an active entry.
    pub fn tracked_keys(&self) -> Vec<String> {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }

    /// Run the outer registration loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(error = %err, "health target sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("health monitor shutting down");
                    self.clear();
                    return;
                }
            }
        }
    }

    /// One registration pass: register running keys, drop the rest.
    pub async fn sweep(&self) -> OrchardResult<()> {
        let targets = (self.targets)().await?;

        let mut seen_running = Vec::new();
        for target in &targets {
            if target.running {
                self.register(&target.key, target.config.clone());
                seen_running.push(target.key.clone());
            } else {
                self.unregister(&target.key);
            }
        }

        // An entry exists only while the backend reports the key as running;
        // keys that vanished from the listing are dropped too.
        let stale: Vec<String> = {
            let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .keys()
                .filter(|key| !seen_running.contains(key))
                .cloned()
                .collect()
        };
        for key in stale {
            self.unregister(&key);
        }

        Ok(())
    }

    /// Start tracking a key. Re-registering keeps the existing streaks and
    /// probe loop, only refreshing the config.
    pub fn register(&self, key: &str, config: Option<ProbeConfig>) {
        let config = config.unwrap_or_default();
        let is_new = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.config = config.clone();
                    false
                }
                None => {
                    entries.insert(
                        key.to_string(),
                        Entry {
                            config: config.clone(),
                            state: EntryState {
                                consecutive_success: 0,
                                consecutive_failure: 0,
                            },
                            task: None,
                        },
                    );
                    true
                }
            }
        };

        if is_new {
            debug!(%key, "health entry registered");
            let task = tokio::spawn(probe_loop(self.inner.clone(), key.to_string()));
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get_mut(key) {
                entry.task = Some(task);
            } else {
                // Unregistered between insert and spawn.
                task.abort();
            }
        }
    }

    /// Stop tracking a key, cancelling any pending probe.
    pub fn unregister(&self, key: &str) {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.remove(key)
        };
        if let Some(entry) = removed {
            if let Some(task) = entry.task {
                task.abort();
            }
            debug!(%key, "health entry unregistered");
        }
    }

    fn clear(&self) {
        for key in self.tracked_keys() {
            self.unregister(&key);
        }
    }

    #[cfg(test)]
    fn record(&self, key: &str, healthy: bool) {
        record_outcome(&self.inner, key, healthy);
    }

    #[cfg(test)]
    fn streaks(&self, key: &str) -> (u32, u32) {
        let entries = self.inner.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key).expect("entry");
        (
            entry.state.consecutive_success,
            entry.state.consecutive_failure,
        )
    }
}

/// The probe loop for a single key. Exits when the entry is gone.
async fn probe_loop(inner: Arc<Inner>, key: String) {
    let Some((mut delay, _)) = entry_config(&inner, &key) else {
        return;
    };

    loop {
        tokio::time::sleep(delay).await;

        let Some((_, config)) = entry_config(&inner, &key) else {
            return;
        };

        let healthy = match tokio::time::timeout(config.timeout, (inner.probe)(key.clone())).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                debug!(%key, error = %err, "health probe failed");
                false
            }
            Err(_) => {
                debug!(%key, "health probe timed out");
                false
            }
        };

        if !record_outcome(&inner, &key, healthy) {
            return;
        }
        delay = config.period;
    }
}

fn entry_config(inner: &Arc<Inner>, key: &str) -> Option<(Duration, ProbeConfig)> {
    let entries = inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries
        .get(key)
        .map(|entry| (entry.config.initial_delay, entry.config.clone()))
}

/// Update the streaks for a settled probe. Returns false when the entry is
/// gone.
fn record_outcome(inner: &Arc<Inner>, key: &str, healthy: bool) -> bool {
    let mut entries = inner.entries.lock().unwrap_or_else(|e| e.into_inner());
    let Some(entry) = entries.get_mut(key) else {
        return false;
    };
    let state = &mut entry.state;
    if healthy {
        state.consecutive_success =
            (state.consecutive_success + 1).min(entry.config.success_threshold);
        state.consecutive_failure = 0;
    } else {
        state.consecutive_failure =
            (state.consecutive_failure + 1).min(entry.config.failure_threshold);
        state.consecutive_success = 0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn monitor_with(probe_result: Arc<AtomicBool>, targets: Vec<ProbeTarget>) -> HealthMonitor {
        let probe: ProbeFn = Arc::new(move |_key| {
            let result = probe_result.clone();
            Box::pin(async move { Ok(result.load(Ordering::SeqCst)) })
        });
        let targets: TargetsFn = Arc::new(move || {
            let targets = targets.clone();
            Box::pin(async move { Ok(targets) })
        });
        HealthMonitor::new(probe, targets)
    }

    fn static_monitor() -> HealthMonitor {
        monitor_with(Arc::new(AtomicBool::new(true)), Vec::new())
    }

    fn fast_config(success: u32, failure: u32) -> ProbeConfig {
        ProbeConfig {
            initial_delay: Duration::from_millis(1),
            period: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
            success_threshold: success,
            failure_threshold: failure,
        }
    }

    /// Initial delay far beyond the test horizon, so the probe loop never
    /// interferes with manually recorded streaks.
    fn manual_config(success: u32, failure: u32) -> ProbeConfig {
        ProbeConfig {
            initial_delay: Duration::from_secs(3600),
            period: Duration::from_secs(3600),
            timeout: Duration::from_millis(50),
            success_threshold: success,
            failure_threshold: failure,
        }
    }

    #[tokio::test]
    async fn untracked_key_is_unknown() {
        let monitor = static_monitor();
        assert_eq!(monitor.status("ghost"), HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn three_failures_flip_unknown_to_unhealthy() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(1, 3)));

        monitor.record("a", false);
        monitor.record("a", false);
        assert_eq!(monitor.status("a"), HealthStatus::Unknown);
        monitor.record("a", false);
        assert_eq!(monitor.status("a"), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn one_success_resets_failures_and_recovers() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(1, 3)));

        for _ in 0..3 {
            monitor.record("a", false);
        }
        assert_eq!(monitor.status("a"), HealthStatus::Unhealthy);

        monitor.record("a", true);
        assert_eq!(monitor.status("a"), HealthStatus::Healthy);
        assert_eq!(monitor.streaks("a"), (1, 0));
    }

    #[tokio::test]
    async fn streaks_are_never_both_positive() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(2, 3)));

        for healthy in [true, false, true, true, false] {
            monitor.record("a", healthy);
            let (success, failure) = monitor.streaks("a");
            assert!(success == 0 || failure == 0);
        }
    }

    #[tokio::test]
    async fn streaks_clamp_at_thresholds() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(1, 3)));

        for _ in 0..10 {
            monitor.record("a", false);
        }
        assert_eq!(monitor.streaks("a"), (0, 3));

        for _ in 0..10 {
            monitor.record("a", true);
        }
        assert_eq!(monitor.streaks("a"), (1, 0));
    }

    #[tokio::test]
    async fn re_register_preserves_streaks() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(1, 3)));
        monitor.record("a", true);

        monitor.register("a", Some(manual_config(1, 5)));
        assert_eq!(monitor.status("a"), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn unregister_drops_the_entry() {
        let monitor = static_monitor();
        monitor.register("a", Some(manual_config(1, 3)));
        monitor.record("a", true);
        monitor.unregister("a");
        assert_eq!(monitor.status("a"), HealthStatus::Unknown);
        assert!(monitor.tracked_keys().is_empty());

        // Unregistering again is harmless.
        monitor.unregister("a");
    }

    #[tokio::test]
    async fn sweep_registers_running_and_drops_the_rest() {
        let monitor = monitor_with(
            Arc::new(AtomicBool::new(true)),
            vec![
                ProbeTarget {
                    key: "up".to_string(),
                    running: true,
                    config: Some(fast_config(1, 3)),
                },
                ProbeTarget {
                    key: "down".to_string(),
                    running: false,
                    config: None,
                },
            ],
        );
        // Pre-seed an entry for a key the backend no longer lists.
        monitor.register("vanished", Some(manual_config(1, 3)));

        monitor.sweep().await.unwrap();

        let mut keys = monitor.tracked_keys();
        keys.sort();
        assert_eq!(keys, ["up"]);
    }

    #[tokio::test]
    async fn probe_loop_drives_key_to_healthy() {
        let monitor = monitor_with(
            Arc::new(AtomicBool::new(true)),
            vec![ProbeTarget {
                key: "a".to_string(),
                running: true,
                config: Some(fast_config(1, 3)),
            }],
        );
        monitor.sweep().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while monitor.status("a") != HealthStatus::Healthy {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("key never became healthy");
    }

    #[tokio::test]
    async fn probe_errors_count_as_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_probe = calls.clone();
        let probe: ProbeFn = Arc::new(move |_key| {
            calls_probe.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(orchard_core::OrchardError::backend("unreachable")) })
        });
        let targets: TargetsFn = Arc::new(|| Box::pin(async { Ok(Vec::new()) }));
        let monitor = HealthMonitor::new(probe, targets);
        monitor.register("a", Some(fast_config(1, 2)));

        tokio::time::timeout(Duration::from_secs(2), async {
            while monitor.status("a") != HealthStatus::Unhealthy {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("key never became unhealthy");
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }
}
