//! Build-progress reporting.
//!
//! A build has exactly one producer (the compute backend) and one consumer
//! (the scheduler's build task). Events flow through a bounded channel and
//! the stream ends when the producer side is dropped; build failure is
//! signalled separately by the backend's returned `Result`, after an
//! `errored` status event.

use tokio::sync::mpsc;

use orchard_core::{CommonStatus, OutputChunk};

/// One progress event emitted during a build.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// Captured output chunks, in emission order.
    Output(Vec<OutputChunk>),
    /// A persisted-lifecycle status update.
    Status(CommonStatus),
    /// The OS process id of the currently running build step.
    ProcessId(u32),
}

/// Producer handle for build progress events.
///
/// Sends block when the consumer is behind (bounded channel) and are
/// silently dropped once the consumer is gone — a backend must be able to
/// finish unwinding a build whose subscriber already went away.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<BuildEvent>,
}

impl ProgressSink {
    /// Create a sink and its consuming receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BuildEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn output(&self, chunks: Vec<OutputChunk>) {
        let _ = self.tx.send(BuildEvent::Output(chunks)).await;
    }

    pub async fn chunk(&self, chunk: OutputChunk) {
        self.output(vec![chunk]).await;
    }

    /// Emit a plain informational line.
    pub async fn message(&self, text: impl Into<String>) {
        self.chunk(OutputChunk::message(text)).await;
    }

    pub async fn status(&self, status: CommonStatus) {
        let _ = self.tx.send(BuildEvent::Status(status)).await;
    }

    pub async fn process_id(&self, pid: u32) {
        let _ = self.tx.send(BuildEvent::ProcessId(pid)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (sink, mut rx) = ProgressSink::channel(8);
        sink.message("one").await;
        sink.status(CommonStatus::Generated).await;
        sink.message("two").await;
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], BuildEvent::Output(chunks) if chunks[0].stdout.as_deref() == Some("one")));
        assert!(matches!(events[1], BuildEvent::Status(CommonStatus::Generated)));
        assert!(matches!(&events[2], BuildEvent::Output(chunks) if chunks[0].stdout.as_deref() == Some("two")));
    }

    #[tokio::test]
    async fn stream_ends_when_producer_drops() {
        let (sink, mut rx) = ProgressSink::channel(8);
        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_consumer_gone_does_not_panic() {
        let (sink, rx) = ProgressSink::channel(1);
        drop(rx);
        sink.message("into the void").await;
        sink.status(CommonStatus::Errored).await;
    }
}
