//! Memory usage derivation.
//!
//! Collects the eight `/sys/memory/*` gauges of one measurement cycle and
//! emits `memory.usage.percent` as `100 - free/total * 100`. Unlike the
//! counter-based families no baseline is needed: the first complete cycle
//! already emits.

use chrono::{DateTime, Utc};

use crate::metric::{MetricSample, MetricValue, ValueKind};

use super::{derived, observe_cycle, round_half_up};

const PATHS: [&str; 8] = [
    "/sys/memory/active",
    "/sys/memory/buffers",
    "/sys/memory/cached",
    "/sys/memory/free",
    "/sys/memory/inactive",
    "/sys/memory/swapfree",
    "/sys/memory/swaptotal",
    "/sys/memory/total",
];

pub const OUTPUT_PATH: &str = "memory.usage.percent";

pub fn is_input(path: &str) -> bool {
    PATHS.contains(&path)
}

#[derive(Debug, Clone, Copy, Default)]
struct Distribution {
    active: Option<i64>,
    buffers: Option<i64>,
    cached: Option<i64>,
    free: Option<i64>,
    inactive: Option<i64>,
    swapfree: Option<i64>,
    swaptotal: Option<i64>,
    total: Option<i64>,
}

impl Distribution {
    fn set(&mut self, path: &str, value: i64) {
        match path {
            "/sys/memory/active" => self.active = Some(value),
            "/sys/memory/buffers" => self.buffers = Some(value),
            "/sys/memory/cached" => self.cached = Some(value),
            "/sys/memory/free" => self.free = Some(value),
            "/sys/memory/inactive" => self.inactive = Some(value),
            "/sys/memory/swapfree" => self.swapfree = Some(value),
            "/sys/memory/swaptotal" => self.swaptotal = Some(value),
            "/sys/memory/total" => self.total = Some(value),
            _ => {}
        }
    }

    fn complete(&self) -> bool {
        self.active.is_some()
            && self.buffers.is_some()
            && self.cached.is_some()
            && self.free.is_some()
            && self.inactive.is_some()
            && self.swapfree.is_some()
            && self.swaptotal.is_some()
            && self.total.is_some()
    }
}

#[derive(Debug, Default)]
pub struct MemAccumulator {
    asset_id: i64,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    next: Distribution,
}

impl MemAccumulator {
    pub fn update(&mut self, sample: &MetricSample) -> Option<MetricSample> {
        if !is_input(&sample.path) {
            return None;
        }
        let value = sample.int_value()?;

        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }

        let path = sample.path.clone();
        if !observe_cycle(&mut self.next_time, &mut self.next, sample.ts, |d| {
            d.set(&path, value)
        }) {
            return None;
        }

        self.calculate()
    }

    fn calculate(&mut self) -> Option<MetricSample> {
        let next_time = self.next_time?;
        if !self.next.complete() {
            return None;
        }

        // do not walk backwards in time
        if self.curr_time.is_some_and(|curr| curr >= next_time) {
            return None;
        }

        let free = self.next.free.unwrap_or(0);
        let total = self.next.total.unwrap_or(0);

        self.curr_time = Some(next_time);
        self.next_time = None;
        self.next = Distribution::default();

        if total == 0 {
            return None;
        }

        let usage = round_half_up(100.0 - (free as f64 / total as f64) * 100.0, 2);

        Some(derived(
            self.asset_id,
            OUTPUT_PATH.to_string(),
            next_time,
            ValueKind::Real,
            MetricValue::Real(usage),
            "%",
        ))
    }
}
