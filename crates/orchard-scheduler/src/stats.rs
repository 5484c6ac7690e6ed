//! Fire-and-forget build stats.
//!
//! Not required for correctness; the default sink emits structured log
//! events.

use tracing::info;

/// One per-action stats record.
#[derive(Debug, Clone)]
pub struct BuildStats {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub action: &'static str,
    pub hash: String,
    /// Finished command name, or a terminal marker like `BUILD_ERRORED`.
    pub step: String,
    pub elapsed_ms: u64,
    /// Queued instances at emission time.
    pub queue_depth: usize,
}

/// Telemetry sink for build stats.
pub trait StatsSink: Send + Sync {
    fn record(&self, stats: BuildStats);
}

/// Default sink: structured log events.
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn record(&self, stats: BuildStats) {
        info!(
            target: "orchard::stats",
            action = stats.action,
            hash = %stats.hash,
            step = %stats.step,
            elapsed_ms = stats.elapsed_ms,
            queue_depth = stats.queue_depth,
            "stats"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Captures records for assertions.
    #[derive(Default)]
    pub struct CapturingSink {
        pub records: Mutex<Vec<BuildStats>>,
    }

    impl StatsSink for CapturingSink {
        fn record(&self, stats: BuildStats) {
            self.records.lock().unwrap().push(stats);
        }
    }
}
