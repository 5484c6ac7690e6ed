//! Timed command wrapping for build phases.
//!
//! Long phases ("Build image", "Run instance") are bracketed by a start
//! event carrying the command name and a finish event carrying duration and
//! exit code, so consumers can render phase timings. The finish event is
//! emitted on failure too.

use std::future::Future;

use tokio::time::Instant;

use orchard_core::{OrchardResult, OutputChunk};

use crate::progress::ProgressSink;

/// Run a build phase as a named, timed command.
pub async fn run_as_command<T, Fut>(
    progress: &ProgressSink,
    name: &str,
    fut: Fut,
) -> OrchardResult<T>
where
    Fut: Future<Output = OrchardResult<T>>,
{
    progress
        .chunk(OutputChunk {
            command: Some(name.to_string()),
            ..OutputChunk::default()
        })
        .await;

    let start = Instant::now();
    let result = fut.await;

    let exit_code = match &result {
        Ok(_) => 0,
        Err(err) => err.exit_code(),
    };
    progress
        .chunk(OutputChunk {
            command: Some(name.to_string()),
            duration_ms: Some(start.elapsed().as_millis() as u64),
            exit_code: Some(exit_code),
            ..OutputChunk::default()
        })
        .await;

    result
}
