//! Generic poll-until primitive.
//!
//! Every asynchronous wait in the backends (builder ready, build finished,
//! deployment pod materialized) is this one loop: fetch, test, sleep.
//! Absence of a timeout means wait indefinitely.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use orchard_core::OrchardResult;

/// Outcome of a [`wait_for`] call.
#[derive(Debug)]
pub struct Waited<T> {
    /// The last fetched value, whether or not the predicate held.
    pub value: T,
    pub timed_out: bool,
}

/// Poll `get` every `period` until `predicate` holds or `timeout` elapses.
///
/// Errors from `get` propagate immediately.
pub async fn wait_for<T, G, Fut, P>(
    mut get: G,
    predicate: P,
    timeout: Option<Duration>,
    period: Duration,
) -> OrchardResult<Waited<T>>
where
    G: FnMut() -> Fut,
    Fut: Future<Output = OrchardResult<T>>,
    P: Fn(&T) -> bool,
{
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let value = get().await?;
        if predicate(&value) {
            return Ok(Waited {
                value,
                timed_out: false,
            });
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(Waited {
                    value,
                    timed_out: true,
                });
            }
        }
        tokio::time::sleep(period).await;
    }
}
