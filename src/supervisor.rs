//! Engine assembly and lifecycle.
//!
//! The supervisor builds the shared cache client, the alarm dispatcher with
//! its process-wide concurrency limit, one worker per logical CPU, and the
//! broker consumer. It then runs the main loop: route heartbeats, watch for
//! OS signals and worker deaths, and on either execute the shutdown
//! sequence: stop the consumer, flip the shutdown signal, give workers a
//! bounded window to drain, and surface a non-zero exit when a worker died
//! fatally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use crate::alarm::AlarmDispatcher;
use crate::broker;
use crate::cache::{CacheBackend, RedisCache, ThresholdCache};
use crate::config::Config;
use crate::dispatcher::MetricDispatcher;
use crate::envelope::Envelope;
use crate::stats::{self, EngineStats};
use crate::worker::Worker;

/// Cadence of the liveness heartbeat pushed to every worker.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Hard deadline for the whole shutdown sequence.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Run the engine until shutdown. Returns an error when a worker died
/// fatally; the caller turns that into a non-zero exit.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let stats = EngineStats::new();

    let backend: Arc<dyn CacheBackend> = Arc::new(
        RedisCache::connect(&config.redis)
            .await
            .context("cache backend unavailable at startup")?,
    );
    run_with_backend(config, backend, stats).await
}

/// Engine assembly with an injected cache backend. Split out so tests and
/// local development can run against the in-memory backend.
pub async fn run_with_backend(
    config: Config,
    backend: Arc<dyn CacheBackend>,
    stats: Arc<EngineStats>,
) -> anyhow::Result<()> {
    let cache = Arc::new(ThresholdCache::new(backend, &config.lookup));
    let limit = Arc::new(Semaphore::new(config.cyclone.concurrency_limit.max(1)));
    let alarm_dispatcher = AlarmDispatcher::new(&config.cyclone, limit, stats.clone());

    let worker_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (death_tx, mut death_rx) = mpsc::channel(worker_count);
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    let mut workers = Vec::with_capacity(worker_count);
    for num in 0..worker_count {
        let handle = Worker::spawn(
            num,
            &config.cyclone,
            cache.clone(),
            alarm_dispatcher.clone(),
            shutdown_rx.clone(),
            death_tx.clone(),
            stats.clone(),
        );
        info!("launched evaluation worker #{num}");
        workers.push(handle);
    }

    let front = MetricDispatcher::new(
        workers.iter().map(|h| h.input.clone()).collect(),
        config.cyclone.age_cutoff_minutes,
        stats.clone(),
    );

    let mut consumer_task = tokio::spawn(broker::run_consumer(
        config.kafka.clone(),
        front,
        commit_tx.clone(),
        commit_rx,
        shutdown_rx.clone(),
    ));

    if config.misc.produce_metrics {
        info!("launching stats reporter");
        tokio::spawn(stats::run_reporter(
            stats.clone(),
            config.misc.instance_name.clone(),
            Duration::from_secs(config.misc.metrics_interval_seconds.max(1)),
            shutdown_rx.clone(),
        ));
    }

    let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the immediate first tick carries no signal worth writing
    heartbeat.tick().await;

    info!("all components started, evaluation active");

    let mut fault: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }

            _ = terminate.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }

            Some(err) = death_rx.recv() => {
                error!("handler died: {err:#}");
                fault = Some(err);
                break;
            }

            result = &mut consumer_task => {
                match result {
                    Ok(Ok(())) => info!("consumer exited"),
                    Ok(Err(err)) => {
                        error!("consumer failed: {err:#}");
                        fault = Some(err);
                    }
                    Err(err) => {
                        error!("consumer task panicked: {err}");
                        fault = Some(anyhow::anyhow!("consumer task panicked: {err}"));
                    }
                }
                break;
            }

            _ = heartbeat.tick() => {
                // detached sends: a full worker queue must never stall the
                // ticker
                for handle in &workers {
                    let input = handle.input.clone();
                    let commit = commit_tx.clone();
                    tokio::spawn(async move {
                        let _ = input.send(Envelope::heartbeat(commit)).await;
                    });
                }
            }
        }
    }

    // shutdown sequence: consumer first, then the workers
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + SHUTDOWN_DEADLINE;

    if !consumer_task.is_finished() {
        match tokio::time::timeout_at(deadline, &mut consumer_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!("consumer exited with error: {err:#}"),
            Ok(Err(err)) => warn!("consumer task panicked: {err}"),
            Err(_) => warn!("consumer did not stop within the shutdown deadline"),
        }
    }

    for handle in workers {
        let num = handle.num;
        if tokio::time::timeout_at(deadline, handle.join).await.is_err() {
            warn!("worker {num} did not stop within the shutdown deadline");
        }
    }

    // late deaths reported while draining
    while let Ok(err) = death_rx.try_recv() {
        error!("handler died: {err:#}");
        if fault.is_none() {
            fault = Some(err);
        }
    }

    match fault {
        Some(err) => Err(err.context("shutting down after fatal handler death")),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}
