//! Front dispatcher.
//!
//! Sits between the broker consumer and the worker pool. Per envelope it
//! decodes the metric body, commits and drops what cannot or should not be
//! evaluated (point updates, samples past the age cutoff), and routes the
//! rest to a worker by asset identity. The shard mapping is what guarantees
//! a single worker sees all samples of one asset, which the accumulators
//! rely on.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::envelope::Envelope;
use crate::metric::{self, Decoded, DecodeError};
use crate::stats::EngineStats;

#[derive(Debug)]
pub enum DispatchError {
    /// The payload did not decode; the envelope stays uncommitted.
    Decode(DecodeError),
    /// The target worker's input queue is gone (shutdown in progress).
    WorkerGone,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Decode(err) => write!(f, "dispatch decode failure: {err}"),
            DispatchError::WorkerGone => write!(f, "worker input queue closed"),
        }
    }
}

impl std::error::Error for DispatchError {}

pub struct MetricDispatcher {
    workers: Vec<mpsc::Sender<Envelope>>,
    age_cutoff: chrono::Duration,
    stats: Arc<EngineStats>,
}

impl MetricDispatcher {
    pub fn new(
        workers: Vec<mpsc::Sender<Envelope>>,
        age_cutoff_minutes: i64,
        stats: Arc<EngineStats>,
    ) -> Self {
        assert!(!workers.is_empty(), "dispatcher needs at least one worker");
        Self {
            workers,
            age_cutoff: chrono::Duration::minutes(age_cutoff_minutes),
            stats,
        }
    }

    /// Route one envelope. Sends block when the target worker's queue is
    /// full, which is the backpressure path from workers up to the broker.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        self.stats.mark_consumed();

        let sample = match metric::decode(&envelope.payload) {
            Ok(Decoded::Sample(sample)) => sample,
            Ok(Decoded::Point) => {
                // schemaless point updates carry nothing to evaluate
                trace!("committing point update at {}", envelope.offset);
                envelope.ack();
                return Ok(());
            }
            Err(err) => return Err(DispatchError::Decode(err)),
        };

        if Utc::now() - sample.ts > self.age_cutoff {
            debug!(
                "dropping {} from {}: older than the age cutoff",
                sample.path, sample.asset_id
            );
            envelope.ack();
            return Ok(());
        }

        let shard = sample.asset_id.unsigned_abs() as usize % self.workers.len();
        self.workers[shard]
            .send(envelope)
            .await
            .map_err(|_| DispatchError::WorkerGone)
    }
}
