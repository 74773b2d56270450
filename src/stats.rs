//! Process-wide counters and gauges.
//!
//! Workers and the broker consumer share one [`EngineStats`] behind an `Arc`
//! and bump atomics on the hot path. When metric production is enabled, the
//! supervisor runs a ticker that logs a snapshot at the configured interval.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Default)]
pub struct EngineStats {
    /// Messages read off the broker.
    consumed: AtomicU64,
    /// Messages that reached threshold evaluation.
    processed: AtomicU64,
    /// Messages dropped by the discard list or prefix filter.
    discarded: AtomicU64,
    /// Individual threshold comparisons performed.
    evaluations: AtomicU64,
    /// Alarm events handed to the dispatcher.
    alarms: AtomicU64,
    /// 1 while the alarm sink is failing and a resender is active.
    alarmapi_error: AtomicI64,
}

/// Point-in-time copy of the counters, loggable as JSON.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub processed: u64,
    pub discarded: u64,
    pub evaluations: u64,
    pub alarms: u64,
    pub alarmapi_error: i64,
}

impl EngineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_evaluations(&self, count: u64) {
        self.evaluations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mark_alarm(&self) {
        self.alarms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_alarmapi_error(&self, broken: bool) {
        self.alarmapi_error
            .store(if broken { 1 } else { 0 }, Ordering::Relaxed);
    }

    pub fn alarmapi_error(&self) -> i64 {
        self.alarmapi_error.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            alarms: self.alarms.load(Ordering::Relaxed),
            alarmapi_error: self.alarmapi_error(),
        }
    }
}

/// Periodically log a stats snapshot until shutdown.
pub async fn run_reporter(
    stats: Arc<EngineStats>,
    instance_name: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let prefix = if instance_name.is_empty() {
        "cyclone".to_string()
    } else {
        format!("cyclone/{instance_name}")
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = stats.snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(target: "cyclone::stats", "{prefix} {json}"),
                    Err(_) => info!(target: "cyclone::stats", "{prefix} {snapshot:?}"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
