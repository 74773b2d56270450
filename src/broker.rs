//! Broker consumer and offset committer.
//!
//! One task owns the Kafka consumer. Messages flow through the front
//! dispatcher into the worker pool; commit acknowledgements flow back over
//! an unbounded channel and are folded into per-partition high-water marks.
//! Marks are flushed to the broker on a configurable interval, and a
//! partition's committed offset never decreases even when acks arrive out of
//! order (workers complete messages independently of each other).

use std::collections::HashMap;

use anyhow::Context;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::dispatcher::{DispatchError, MetricDispatcher};
use crate::envelope::{CommitAck, Envelope};

/// Per-partition high-water marks with monotonicity enforcement.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    high_water: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one ack. Returns the next offset to commit for the partition
    /// when the ack advances its mark, `None` when it is stale.
    pub fn observe(&mut self, ack: &CommitAck) -> Option<i64> {
        let key = (ack.topic.clone(), ack.partition);
        match self.high_water.get(&key) {
            Some(&current) if ack.offset <= current => None,
            _ => {
                self.high_water.insert(key, ack.offset);
                // the broker convention: commit the offset of the next
                // message to read
                Some(ack.offset + 1)
            }
        }
    }
}

fn build_consumer(config: &KafkaConfig) -> anyhow::Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", config.offset_reset.as_kafka_value())
        // offsets commit through the tracker, never automatically
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .create()
        .context("failed to create Kafka consumer")?;

    let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .with_context(|| format!("failed to subscribe to {topics:?}"))?;

    Ok(consumer)
}

/// Consume until shutdown. Owns the consumer, the dispatcher handle and the
/// commit fold; exits after a final synchronous commit flush.
pub async fn run_consumer(
    config: KafkaConfig,
    dispatcher: MetricDispatcher,
    commit_tx: mpsc::UnboundedSender<CommitAck>,
    mut commit_rx: mpsc::UnboundedReceiver<CommitAck>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let consumer = build_consumer(&config)?;
    info!(
        "consuming {:?} as group {}",
        config.topics, config.consumer_group
    );

    let mut tracker = OffsetTracker::new();
    // partitions with offsets not yet flushed to the broker
    let mut pending: HashMap<(String, i32), i64> = HashMap::new();

    let mut flush_ticker =
        tokio::time::interval(std::time::Duration::from_millis(config.commit_interval_ms.max(1)));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            Some(ack) = commit_rx.recv() => {
                if let Some(next) = tracker.observe(&ack) {
                    pending.insert((ack.topic, ack.partition), next);
                }
            }

            _ = flush_ticker.tick() => {
                flush_commits(&consumer, &mut pending, CommitMode::Async);
            }

            message = consumer.recv() => {
                match message {
                    Ok(message) => {
                        let envelope = Envelope::new(
                            message.payload().unwrap_or_default().to_vec(),
                            message.topic().to_string(),
                            message.partition(),
                            message.offset(),
                            commit_tx.clone(),
                        );
                        match dispatcher.dispatch(envelope).await {
                            Ok(()) => {}
                            Err(DispatchError::Decode(err)) => {
                                // uncommitted: redelivered after restart
                                error!("invalid data: {err}");
                            }
                            Err(DispatchError::WorkerGone) => {
                                warn!("worker pool gone, stopping consumer");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        error!("consumer error: {err}");
                    }
                }
            }
        }
    }

    // fold whatever acks are already queued, then flush synchronously
    while let Ok(ack) = commit_rx.try_recv() {
        if let Some(next) = tracker.observe(&ack) {
            pending.insert((ack.topic, ack.partition), next);
        }
    }
    flush_commits(&consumer, &mut pending, CommitMode::Sync);

    info!("consumer stopped");
    Ok(())
}

fn flush_commits(
    consumer: &StreamConsumer,
    pending: &mut HashMap<(String, i32), i64>,
    mode: CommitMode,
) {
    if pending.is_empty() {
        return;
    }

    let mut tpl = TopicPartitionList::new();
    for ((topic, partition), next) in pending.iter() {
        if let Err(err) = tpl.add_partition_offset(topic, *partition, Offset::Offset(*next)) {
            error!("failed to stage offset {next} for {topic}/{partition}: {err}");
        }
    }

    match consumer.commit(&tpl, mode) {
        Ok(()) => {
            debug!("committed offsets for {} partitions", pending.len());
            pending.clear();
        }
        Err(err) => {
            // marks stay pending; the next flush retries
            warn!("offset commit failed: {err}");
        }
    }
}
