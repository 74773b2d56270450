//! Derived-metric accumulators.
//!
//! Raw counter samples (`/sys/...` paths) are not directly comparable against
//! thresholds; they first pass through a per-asset state machine that turns
//! counter snapshots into usage and rate gauges. Four families exist: CPU,
//! context switches, memory and disk. Paths outside every family pass
//! through unchanged.
//!
//! All four families share the monotonic-time rule: a sample newer than the
//! partial cycle under assembly discards that partial and starts a new one,
//! a sample for the same timestamp fills in its field idempotently, and an
//! older sample is dropped. Out-of-order arrivals inside one cycle are fine;
//! late cycles are not.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::metric::{MetricSample, MetricValue, ValueKind};

pub mod cpu;
pub mod ctx;
pub mod disk;
pub mod mem;

pub use cpu::CpuAccumulator;
pub use ctx::CtxAccumulator;
pub use disk::DiskAccumulator;
pub use mem::MemAccumulator;

/// Per-worker accumulator state, keyed by asset (and mountpoint for disk).
/// Shard affinity guarantees a single worker sees all samples of one asset,
/// so no locking is needed.
#[derive(Debug, Default)]
pub struct AccumulatorSet {
    cpu: HashMap<i64, CpuAccumulator>,
    ctx: HashMap<i64, CtxAccumulator>,
    mem: HashMap<i64, MemAccumulator>,
    disk: HashMap<(i64, String), DiskAccumulator>,
}

impl AccumulatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample through its family. Returns the derived samples ready
    /// for evaluation: the untouched input for non-family paths, nothing
    /// while a cycle is still assembling, or the computed gauges once a
    /// cycle completes.
    pub fn fold(&mut self, sample: MetricSample) -> Vec<MetricSample> {
        if cpu::is_input(&sample.path) {
            let acc = self.cpu.entry(sample.asset_id).or_default();
            return acc.update(&sample).into_iter().collect();
        }

        if ctx::is_input(&sample.path) {
            let acc = self.ctx.entry(sample.asset_id).or_default();
            return acc.update(&sample).into_iter().collect();
        }

        if mem::is_input(&sample.path) {
            let acc = self.mem.entry(sample.asset_id).or_default();
            return acc.update(&sample).into_iter().collect();
        }

        if disk::is_input(&sample.path) {
            // tag[0] carries the mountpoint; without it the sample cannot be
            // attributed to a device
            let Some(mountpoint) = sample.tags.first().cloned() else {
                return Vec::new();
            };
            let acc = self
                .disk
                .entry((sample.asset_id, mountpoint))
                .or_default();
            return acc.update(&sample);
        }

        vec![sample]
    }
}

/// Round half-up at `places` decimal digits.
pub(crate) fn round_half_up(value: f64, places: i32) -> f64 {
    let pow = 10f64.powi(places);
    let scaled = value * pow;
    let floor = scaled.floor();
    let rounded = if scaled - floor >= 0.5 {
        scaled.ceil()
    } else {
        floor
    };
    rounded / pow
}

/// Build a derived gauge sample. Derived metrics carry no tags or labels of
/// their own; threshold matching happens against the raw sample's tags
/// upstream in the worker.
pub(crate) fn derived(
    asset_id: i64,
    path: String,
    ts: DateTime<Utc>,
    kind: ValueKind,
    value: MetricValue,
    unit: &str,
) -> MetricSample {
    MetricSample {
        asset_id,
        path,
        ts,
        kind,
        value,
        unit: unit.to_string(),
        tags: Vec::new(),
        labels: HashMap::new(),
    }
}

/// Apply the monotonic-time rule to a partial cycle, then set the sample's
/// field via `apply`. Returns false when the sample is stale and was
/// dropped.
pub(crate) fn observe_cycle<C: Default>(
    next_time: &mut Option<DateTime<Utc>>,
    next: &mut C,
    ts: DateTime<Utc>,
    apply: impl FnOnce(&mut C),
) -> bool {
    match *next_time {
        None => {
            *next_time = Some(ts);
        }
        Some(current) if current == ts => {}
        Some(current) if current > ts => return false,
        Some(_) => {
            // newer cycle started; the partial one is abandoned
            *next = C::default();
            *next_time = Some(ts);
        }
    }
    apply(next);
    true
}
