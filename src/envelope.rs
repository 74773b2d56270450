//! Broker transport envelope and commit acknowledgements.
//!
//! An envelope owns one broker message until its offset is committed. The
//! commit channel points back at the broker task, which folds acks into
//! per-partition high-water marks; workers never talk to the consumer
//! directly.

use tokio::sync::mpsc;

/// Offset acknowledgement sent back to the broker task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAck {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// One broker message in flight through the engine.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Channel back to the broker task. Unbounded: committing must never
    /// block a worker.
    pub commit: mpsc::UnboundedSender<CommitAck>,
    /// Set on supervisor-generated heartbeat envelopes. These skip decode
    /// and evaluation entirely.
    pub heartbeat: bool,
}

impl Envelope {
    pub fn new(
        payload: Vec<u8>,
        topic: String,
        partition: i32,
        offset: i64,
        commit: mpsc::UnboundedSender<CommitAck>,
    ) -> Self {
        Self {
            payload,
            topic,
            partition,
            offset,
            commit,
            heartbeat: false,
        }
    }

    /// A synthetic heartbeat marker. Carries no broker coordinates, so
    /// acknowledging it is a no-op.
    pub fn heartbeat(commit: mpsc::UnboundedSender<CommitAck>) -> Self {
        Self {
            payload: Vec::new(),
            topic: String::new(),
            partition: -1,
            offset: -1,
            commit,
            heartbeat: true,
        }
    }

    /// Mark this message as fully processed. Send failure means the broker
    /// task is already gone, which only happens during teardown.
    pub fn ack(&self) {
        if self.offset < 0 {
            return;
        }
        let _ = self.commit.send(CommitAck {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        });
    }
}
