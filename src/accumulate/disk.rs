//! Disk usage and throughput derivation.
//!
//! Consumes the four `/sys/disk/blk_*` counters of one device, keyed by the
//! mountpoint carried in the first tag. Total/used arrive in 1KiB blocks,
//! read/written in 512B blocks; everything is normalized to bytes. Four
//! gauges are emitted per completed cycle beyond the baseline, each suffixed
//! with the mountpoint:
//!
//! - `disk.write.per.second:<mp>`
//! - `disk.read.per.second:<mp>`
//! - `disk.free:<mp>`
//! - `disk.usage.percent:<mp>`

use chrono::{DateTime, Utc};

use crate::metric::{MetricSample, MetricValue, ValueKind};

use super::{derived, observe_cycle, round_half_up};

const PATHS: [&str; 4] = [
    "/sys/disk/blk_total",
    "/sys/disk/blk_used",
    "/sys/disk/blk_read",
    "/sys/disk/blk_wrtn",
];

pub fn is_input(path: &str) -> bool {
    PATHS.contains(&path)
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    // all in bytes after normalization
    total: Option<i64>,
    used: Option<i64>,
    read: Option<i64>,
    written: Option<i64>,
}

impl Counter {
    fn set(&mut self, path: &str, raw: i64) {
        match path {
            "/sys/disk/blk_total" => self.total = Some(raw * 1024),
            "/sys/disk/blk_used" => self.used = Some(raw * 1024),
            "/sys/disk/blk_read" => self.read = Some(raw * 512),
            "/sys/disk/blk_wrtn" => self.written = Some(raw * 512),
            _ => {}
        }
    }

    fn complete(&self) -> bool {
        self.total.is_some() && self.used.is_some() && self.read.is_some() && self.written.is_some()
    }
}

#[derive(Debug, Default)]
pub struct DiskAccumulator {
    asset_id: i64,
    mountpoint: String,
    curr_time: Option<DateTime<Utc>>,
    curr: Counter,
    next_time: Option<DateTime<Utc>>,
    next: Counter,
    primed: bool,
}

impl DiskAccumulator {
    /// Fold one raw block counter; returns the four derived gauges when a
    /// cycle beyond the baseline completes, an empty vec otherwise.
    pub fn update(&mut self, sample: &MetricSample) -> Vec<MetricSample> {
        if !is_input(&sample.path) {
            return Vec::new();
        }
        let Some(mountpoint) = sample.tags.first() else {
            return Vec::new();
        };
        let Some(value) = sample.int_value() else {
            return Vec::new();
        };

        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }
        if self.mountpoint.is_empty() {
            self.mountpoint = mountpoint.clone();
        }
        if &self.mountpoint != mountpoint {
            return Vec::new();
        }

        let path = sample.path.clone();
        if !observe_cycle(&mut self.next_time, &mut self.next, sample.ts, |c| {
            c.set(&path, value)
        }) {
            return Vec::new();
        }

        self.calculate()
    }

    fn calculate(&mut self) -> Vec<MetricSample> {
        let Some(next_time) = self.next_time else {
            return Vec::new();
        };
        if !self.next.complete() {
            return Vec::new();
        }

        let total = self.next.total.unwrap_or(0);
        let used = self.next.used.unwrap_or(0);
        let bytes_free = total - used;

        if !self.primed {
            self.primed = true;
            self.advance(next_time);
            return Vec::new();
        }

        let Some(curr_time) = self.curr_time else {
            return Vec::new();
        };
        if curr_time >= next_time {
            return Vec::new();
        }

        let delta = (next_time - curr_time).num_milliseconds() as f64 / 1_000.0;
        let reads = self.next.read.unwrap_or(0) - self.curr.read.unwrap_or(0);
        let writes = self.next.written.unwrap_or(0) - self.curr.written.unwrap_or(0);
        let read_bps = round_half_up(reads as f64 / delta, 2);
        let write_bps = round_half_up(writes as f64 / delta, 2);

        let usage = if total == 0 {
            0.0
        } else {
            round_half_up(used as f64 / total as f64 * 100.0, 2)
        };

        self.advance(next_time);

        vec![
            derived(
                self.asset_id,
                format!("disk.write.per.second:{}", self.mountpoint),
                next_time,
                ValueKind::Real,
                MetricValue::Real(write_bps),
                "B",
            ),
            derived(
                self.asset_id,
                format!("disk.read.per.second:{}", self.mountpoint),
                next_time,
                ValueKind::Real,
                MetricValue::Real(read_bps),
                "B",
            ),
            derived(
                self.asset_id,
                format!("disk.free:{}", self.mountpoint),
                next_time,
                ValueKind::Integer,
                MetricValue::Integer(bytes_free),
                "B",
            ),
            derived(
                self.asset_id,
                format!("disk.usage.percent:{}", self.mountpoint),
                next_time,
                ValueKind::Real,
                MetricValue::Real(usage),
                "%",
            ),
        ]
    }

    fn advance(&mut self, completed: DateTime<Utc>) {
        self.curr_time = Some(completed);
        self.curr = self.next;
        self.next_time = None;
        self.next = Counter::default();
    }
}
