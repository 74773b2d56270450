//! Sharded evaluation worker.
//!
//! One worker owns one shard of the asset space. It is a single-threaded
//! select loop: envelopes arrive on the input queue, alarm POSTs and cache
//! writes run as spawned tasks, and their completions come back through the
//! result channel. The tracking maps are only ever touched on the worker
//! task itself, which is what makes the offset bookkeeping race-free.
//!
//! ## Commit policy
//!
//! | case | commit? |
//! |---|---|
//! | heartbeat envelope | yes, after the async cache write is spawned |
//! | empty payload | yes |
//! | decode error | no (worker dies, message redelivered) |
//! | discarded by path/prefix filter | yes |
//! | no rules (`Unconfigured`) | yes |
//! | rules exist, no tag matches | yes |
//! | alarms dispatched | deferred until every POST reported back |
//! | cache unreachable (`Transient`) | no, retried after the eye-wait |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use crate::accumulate::AccumulatorSet;
use crate::alarm::{AlarmDispatcher, AlarmEvent, DispatchResult};
use crate::cache::{LookupError, ThresholdCache};
use crate::config::CycloneConfig;
use crate::envelope::Envelope;
use crate::evaluate;
use crate::metric::{self, Decoded, MetricSample, HEARTBEAT_PATH};
use crate::stats::EngineStats;

/// Extra drain time granted to in-flight POSTs on top of the request
/// timeout.
const DRAIN_GRACE: Duration = Duration::from_millis(300);

/// Offset bookkeeping for one envelope with in-flight alarms.
struct Tracked {
    outstanding: usize,
    envelope: Envelope,
}

/// Outcome of processing one envelope.
enum Outcome {
    Done,
    /// Cache or profile service unreachable. Carries the derived samples so
    /// the retry skips the non-idempotent accumulator fold.
    Transient(PendingWork),
    Fatal(String),
}

enum EvalOutcome {
    Done,
    Transient,
    Fatal(String),
}

struct PendingWork {
    envelope: Envelope,
    samples: Vec<MetricSample>,
}

pub struct Worker {
    num: usize,
    input_rx: mpsc::Receiver<Envelope>,
    shutdown_rx: watch::Receiver<bool>,
    death_tx: mpsc::Sender<anyhow::Error>,
    result_tx: mpsc::Sender<DispatchResult>,
    result_rx: mpsc::Receiver<DispatchResult>,
    cache: Arc<ThresholdCache>,
    dispatcher: AlarmDispatcher,
    accumulators: AccumulatorSet,
    tracking: HashMap<Uuid, Tracked>,
    tasks: JoinSet<()>,
    discard: HashSet<String>,
    allow_prefixes: Vec<String>,
    api_version: String,
    test_mode: bool,
    result_grace: Duration,
    stats: Arc<EngineStats>,
}

/// Handle returned by [`Worker::spawn`]: the input queue plus the join
/// handle the supervisor waits on during shutdown.
pub struct WorkerHandle {
    pub num: usize,
    pub input: mpsc::Sender<Envelope>,
    pub join: tokio::task::JoinHandle<()>,
}

impl Worker {
    /// Build and launch one worker. The input queue is bounded by the
    /// configured handler queue length; sends block on backpressure.
    pub fn spawn(
        num: usize,
        config: &CycloneConfig,
        cache: Arc<ThresholdCache>,
        dispatcher: AlarmDispatcher,
        shutdown_rx: watch::Receiver<bool>,
        death_tx: mpsc::Sender<anyhow::Error>,
        stats: Arc<EngineStats>,
    ) -> WorkerHandle {
        let (input_tx, input_rx) = mpsc::channel(config.handler_queue_length.max(1));
        let (result_tx, result_rx) = mpsc::channel(config.handler_queue_length.max(1));

        let worker = Worker {
            num,
            input_rx,
            shutdown_rx,
            death_tx,
            result_tx,
            result_rx,
            cache,
            dispatcher,
            accumulators: AccumulatorSet::new(),
            tracking: HashMap::new(),
            tasks: JoinSet::new(),
            discard: config.discard_metrics.iter().cloned().collect(),
            allow_prefixes: config.allow_prefixes.clone(),
            api_version: config.api_version.clone(),
            test_mode: config.test_mode,
            result_grace: Duration::from_millis(config.request_timeout_ms) + DRAIN_GRACE,
            stats,
        };

        let join = tokio::spawn(worker.run());

        WorkerHandle {
            num,
            input: input_tx,
            join,
        }
    }

    #[instrument(skip(self), fields(worker = self.num))]
    async fn run(mut self) {
        debug!("starting evaluation worker");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                maybe_envelope = self.input_rx.recv() => {
                    let Some(envelope) = maybe_envelope else {
                        // input closed by the supervisor
                        break;
                    };
                    match self.process(envelope).await {
                        Outcome::Done => {}
                        Outcome::Transient(pending) => {
                            if !self.eye_wait(pending).await {
                                break;
                            }
                        }
                        Outcome::Fatal(err) => {
                            self.die(err).await;
                            break;
                        }
                    }
                }

                Some(result) = self.result_rx.recv() => {
                    if let Err(err) = self.handle_result(result) {
                        self.die(err).await;
                        break;
                    }
                }
            }
        }

        self.drain().await;
        debug!("evaluation worker stopped");
    }

    /// Full processing of one envelope, accumulator fold included.
    async fn process(&mut self, envelope: Envelope) -> Outcome {
        if envelope.heartbeat {
            let cache = self.cache.clone();
            let num = self.num;
            self.tasks.spawn(async move { cache.heartbeat(num).await });
            envelope.ack();
            return Outcome::Done;
        }

        if envelope.payload.is_empty() {
            warn!("ignoring empty message at {}/{}", envelope.topic, envelope.offset);
            envelope.ack();
            return Outcome::Done;
        }

        let sample = match metric::decode(&envelope.payload) {
            Ok(Decoded::Sample(sample)) => sample,
            Ok(Decoded::Point) => {
                envelope.ack();
                return Outcome::Done;
            }
            Err(err) => {
                error!("invalid data at {}/{}: {err}", envelope.topic, envelope.offset);
                return Outcome::Fatal(format!("invalid metric payload: {err}"));
            }
        };

        // wire-level heartbeat marker from older emitters
        if sample.path == HEARTBEAT_PATH {
            let cache = self.cache.clone();
            let num = self.num;
            self.tasks.spawn(async move { cache.heartbeat(num).await });
            envelope.ack();
            return Outcome::Done;
        }

        if self.discard.contains(&sample.path) {
            self.stats.mark_discarded();
            envelope.ack();
            return Outcome::Done;
        }

        if !self.allow_prefixes.is_empty()
            && !self
                .allow_prefixes
                .iter()
                .any(|prefix| sample.path.starts_with(prefix))
        {
            self.stats.mark_discarded();
            envelope.ack();
            return Outcome::Done;
        }

        self.stats.mark_processed();

        let samples = self.accumulators.fold(sample);
        if samples.is_empty() {
            // consumed into a partial cycle, nothing to evaluate yet
            envelope.ack();
            return Outcome::Done;
        }

        match self.evaluate_samples(&envelope, &samples).await {
            EvalOutcome::Done => Outcome::Done,
            EvalOutcome::Transient => Outcome::Transient(PendingWork { envelope, samples }),
            EvalOutcome::Fatal(err) => Outcome::Fatal(err),
        }
    }

    /// Lookup, rank and dispatch for the derived samples of one envelope.
    /// Retryable: alarms are only dispatched once every lookup succeeded, so
    /// a transient return has no side effects beyond best-effort cache
    /// writes.
    async fn evaluate_samples(
        &mut self,
        envelope: &Envelope,
        samples: &[MetricSample],
    ) -> EvalOutcome {
        let mut alarms: Vec<AlarmEvent> = Vec::new();

        for sample in samples {
            if !sample.is_numeric() {
                trace!("skipping non-numeric metric {}", sample.path);
                continue;
            }

            let mut sample = sample.clone();

            if sample.tags.is_empty() {
                // cheap profile probe for tag hints before the full lookup
                match self.cache.configuration_ids(&sample.lookup_id()).await {
                    Ok(ids) if !ids.is_empty() => sample.tags = ids,
                    Ok(_) | Err(LookupError::Unconfigured) => continue,
                    Err(LookupError::Transient(msg)) => {
                        warn!("configuration id probe unavailable: {msg}");
                        return EvalOutcome::Transient;
                    }
                }
            }

            let rules = match self.cache.lookup_threshold(&sample.lookup_id()).await {
                Ok(rules) => rules,
                Err(LookupError::Unconfigured) => {
                    debug!(
                        "no thresholds configured for {} from {}",
                        sample.path, sample.asset_id
                    );
                    continue;
                }
                Err(LookupError::Transient(msg)) => {
                    error!("threshold lookup unavailable: {msg}");
                    return EvalOutcome::Transient;
                }
            };

            let mut evaluations = 0u64;
            for rule in rules.values() {
                if !evaluate::rule_matches(&sample, rule) {
                    continue;
                }

                debug!(
                    "evaluating metric {} from {} against config {}",
                    sample.path, sample.asset_id, rule.id
                );
                let evaluation = evaluate::evaluate_rule(&sample, rule);
                evaluations += evaluation.evaluations;

                let alarm = AlarmEvent::build(&sample, rule, &evaluation, &self.api_version);

                let cache = self.cache.clone();
                let rule_id = rule.id.clone();
                self.tasks
                    .spawn(async move { cache.update_evaluated(&rule_id).await });

                if self.test_mode {
                    continue;
                }
                self.stats.mark_alarm();
                alarms.push(alarm);
            }

            self.stats.mark_evaluations(evaluations);
            if evaluations == 0 {
                debug!(
                    "metric {}({}) matched no configurations",
                    sample.path, sample.asset_id
                );
            }
        }

        if alarms.is_empty() {
            envelope.ack();
            return EvalOutcome::Done;
        }

        let tracking_id = Uuid::new_v4();
        self.tracking.insert(
            tracking_id,
            Tracked {
                outstanding: alarms.len(),
                envelope: envelope.clone(),
            },
        );

        for alarm in alarms {
            let dispatcher = self.dispatcher.clone();
            let result_tx = self.result_tx.clone();
            self.tasks.spawn(async move {
                let result = dispatcher.send(alarm, tracking_id).await;
                let _ = result_tx.send(result).await;
            });
        }

        EvalOutcome::Done
    }

    /// A dispatch completion arrived. Errors returned here are fatal for the
    /// worker.
    fn handle_result(&mut self, result: DispatchResult) -> Result<(), String> {
        if result.internal {
            return Err(result
                .error
                .unwrap_or_else(|| "internal dispatch error".to_string()));
        }

        match (result.error, result.alarm) {
            (None, _) => {
                self.update_offset(result.tracking_id);
                Ok(())
            }
            (Some(err), Some(alarm)) => {
                debug!("transient dispatch failure, starting resender: {err}");
                let dispatcher = self.dispatcher.clone();
                let result_tx = self.result_tx.clone();
                let shutdown_rx = self.shutdown_rx.clone();
                let tracking_id = result.tracking_id;
                self.tasks.spawn(async move {
                    if let Some(outcome) = dispatcher.resend(alarm, tracking_id, shutdown_rx).await
                    {
                        let _ = result_tx.send(outcome).await;
                    }
                });
                Ok(())
            }
            (Some(err), None) => {
                // resend budget exhausted; leave the offset uncommitted so
                // the message is redelivered after a restart
                warn!("abandoning alarm delivery: {err}");
                self.tracking.remove(&result.tracking_id);
                Ok(())
            }
        }
    }

    fn update_offset(&mut self, tracking_id: Uuid) {
        let Some(tracked) = self.tracking.get_mut(&tracking_id) else {
            trace!("completion for unknown tracking id {tracking_id}");
            return;
        };
        tracked.outstanding -= 1;
        if tracked.outstanding == 0 {
            tracked.envelope.ack();
            self.tracking.remove(&tracking_id);
        }
    }

    /// The cache answered `Transient`: park the pending work, keep serving
    /// results and the shutdown signal, and retry once the backend answers
    /// probes again. Returns false when the run loop must stop.
    async fn eye_wait(&mut self, pending: PendingWork) -> bool {
        warn!("entering cache wait loop");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return false;
                    }
                }

                Some(result) = self.result_rx.recv() => {
                    if let Err(err) = self.handle_result(result) {
                        self.die(err).await;
                        return false;
                    }
                }

                _ = self.cache.wait_available() => {
                    debug!("cache backend answering again, retrying envelope");
                    match self.evaluate_samples(&pending.envelope, &pending.samples).await {
                        EvalOutcome::Done => return true,
                        // backend flapped; keep waiting
                        EvalOutcome::Transient => {}
                        EvalOutcome::Fatal(err) => {
                            self.die(err).await;
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn die(&mut self, err: String) {
        error!("worker {} dying: {err}", self.num);
        let _ = self
            .death_tx
            .send(anyhow::anyhow!("worker {}: {err}", self.num))
            .await;

        // hold position until the supervisor flips the shutdown signal, so
        // the drain below runs under shutdown semantics
        while !*self.shutdown_rx.borrow() {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Shutdown path: best-effort processing of queued envelopes, a bounded
    /// window for in-flight dispatch results, then wait for spawned tasks.
    async fn drain(&mut self) {
        while let Ok(envelope) = self.input_rx.try_recv() {
            if let Outcome::Fatal(err) = self.process(envelope).await {
                warn!("dropping envelope during drain: {err}");
            }
        }

        let deadline = tokio::time::Instant::now() + self.result_grace;
        loop {
            tokio::select! {
                Some(result) = self.result_rx.recv() => {
                    if let Err(err) = self.handle_result(result) {
                        warn!("ignoring fatal result during drain: {err}");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        while self.tasks.join_next().await.is_some() {}
    }
}
