//! CPU usage derivation.
//!
//! Consumes the seven bulk `/sys/cpu/count/*` counters (tagged `cpu`, not the
//! per-core variants) and emits `cpu.usage.percent` once two complete cycles
//! exist: the first complete cycle only establishes the baseline.

use chrono::{DateTime, Utc};

use crate::metric::{MetricSample, MetricValue, ValueKind};

use super::{derived, observe_cycle, round_half_up};

const PATHS: [&str; 7] = [
    "/sys/cpu/count/idle",
    "/sys/cpu/count/iowait",
    "/sys/cpu/count/irq",
    "/sys/cpu/count/nice",
    "/sys/cpu/count/softirq",
    "/sys/cpu/count/system",
    "/sys/cpu/count/user",
];

pub const OUTPUT_PATH: &str = "cpu.usage.percent";

pub fn is_input(path: &str) -> bool {
    PATHS.contains(&path)
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    idle: Option<i64>,
    iowait: Option<i64>,
    irq: Option<i64>,
    nice: Option<i64>,
    softirq: Option<i64>,
    system: Option<i64>,
    user: Option<i64>,
}

impl Counter {
    fn set(&mut self, path: &str, value: i64) {
        match path {
            "/sys/cpu/count/idle" => self.idle = Some(value),
            "/sys/cpu/count/iowait" => self.iowait = Some(value),
            "/sys/cpu/count/irq" => self.irq = Some(value),
            "/sys/cpu/count/nice" => self.nice = Some(value),
            "/sys/cpu/count/softirq" => self.softirq = Some(value),
            "/sys/cpu/count/system" => self.system = Some(value),
            "/sys/cpu/count/user" => self.user = Some(value),
            _ => {}
        }
    }

    fn complete(&self) -> bool {
        self.idle.is_some()
            && self.iowait.is_some()
            && self.irq.is_some()
            && self.nice.is_some()
            && self.softirq.is_some()
            && self.system.is_some()
            && self.user.is_some()
    }

    /// Idle time includes iowait.
    fn idle_sum(&self) -> i64 {
        self.idle.unwrap_or(0) + self.iowait.unwrap_or(0)
    }

    fn non_idle_sum(&self) -> i64 {
        self.user.unwrap_or(0)
            + self.nice.unwrap_or(0)
            + self.system.unwrap_or(0)
            + self.irq.unwrap_or(0)
            + self.softirq.unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct CpuAccumulator {
    asset_id: i64,
    curr_time: Option<DateTime<Utc>>,
    next_time: Option<DateTime<Utc>>,
    next: Counter,
    // baseline captured from the previous complete cycle
    idle: i64,
    total: i64,
    primed: bool,
}

impl CpuAccumulator {
    /// Fold one raw counter sample; returns the usage gauge when a cycle
    /// beyond the baseline completes.
    pub fn update(&mut self, sample: &MetricSample) -> Option<MetricSample> {
        if !is_input(&sample.path) {
            return None;
        }
        // bulk counters only, per-core samples carry cpuN tags
        if !sample.tags.iter().any(|t| t == "cpu") {
            return None;
        }
        let value = sample.int_value()?;

        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }

        let path = sample.path.clone();
        if !observe_cycle(&mut self.next_time, &mut self.next, sample.ts, |c| {
            c.set(&path, value)
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

        let next_idle = self.next.idle_sum();
        let next_total = next_idle + self.next.non_idle_sum();

        if !self.primed {
            self.idle = next_idle;
            self.total = next_total;
            self.primed = true;
            self.advance(next_time);
            return None;
        }

        if self.curr_time.is_some_and(|curr| curr >= next_time) {
            return None;
        }

        let total_diff = next_total - self.total;
        let idle_diff = next_idle - self.idle;

        self.idle = next_idle;
        self.total = next_total;
        self.advance(next_time);

        // identical counters across cycles carry no usable signal
        if total_diff == 0 {
            return None;
        }

        let usage = round_half_up(
            (total_diff - idle_diff) as f64 / total_diff as f64 * 100.0,
            4,
        );

        Some(derived(
            self.asset_id,
            OUTPUT_PATH.to_string(),
            next_time,
            ValueKind::Real,
            MetricValue::Real(usage),
            "%",
        ))
    }

    fn advance(&mut self, completed: DateTime<Utc>) {
        self.curr_time = Some(completed);
        self.next_time = None;
        self.next = Counter::default();
    }
}
