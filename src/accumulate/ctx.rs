//! Context-switch rate derivation.
//!
//! `/sys/cpu/ctx` is a monotonically increasing counter; the derived
//! `cpu.ctx.per.second` gauge is the delta over wall time between two
//! snapshots. The first snapshot only establishes the baseline.

use chrono::{DateTime, Utc};

use crate::metric::{MetricSample, MetricValue, ValueKind};

use super::{derived, round_half_up};

const PATH: &str = "/sys/cpu/ctx";

pub const OUTPUT_PATH: &str = "cpu.ctx.per.second";

pub fn is_input(path: &str) -> bool {
    path == PATH
}

#[derive(Debug, Default)]
pub struct CtxAccumulator {
    asset_id: i64,
    curr: Option<(DateTime<Utc>, i64)>,
}

impl CtxAccumulator {
    pub fn update(&mut self, sample: &MetricSample) -> Option<MetricSample> {
        if !is_input(&sample.path) {
            return None;
        }
        let value = sample.int_value()?;

        if self.asset_id == 0 {
            self.asset_id = sample.asset_id;
        }

        match self.curr {
            None => {
                self.curr = Some((sample.ts, value));
                None
            }
            // do not walk backwards in time
            Some((curr_ts, _)) if curr_ts >= sample.ts => None,
            Some((curr_ts, curr_value)) => {
                let delta = (sample.ts - curr_ts).num_milliseconds() as f64 / 1_000.0;
                let rate = round_half_up((value - curr_value) as f64 / delta, 2);
                self.curr = Some((sample.ts, value));

                Some(derived(
                    self.asset_id,
                    OUTPUT_PATH.to_string(),
                    sample.ts,
                    ValueKind::Real,
                    MetricValue::Real(rate),
                    "#",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn ctx_sample(ts_secs: i64, value: i64) -> MetricSample {
        MetricSample {
            asset_id: 1239,
            path: PATH.to_string(),
            ts: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            kind: ValueKind::Long,
            value: MetricValue::Integer(value),
            unit: "#".to_string(),
            tags: vec![],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn first_sample_is_baseline_only() {
        let mut acc = CtxAccumulator::default();
        assert!(acc.update(&ctx_sample(100, 50_000)).is_none());
    }

    #[test]
    fn second_sample_emits_rate() {
        let mut acc = CtxAccumulator::default();
        acc.update(&ctx_sample(100, 50_000));

        let out = acc.update(&ctx_sample(110, 62_000)).expect("rate emitted");
        assert_eq!(out.path, OUTPUT_PATH);
        assert_eq!(out.asset_id, 1239);
        // 12_000 switches over 10s
        assert_eq!(out.real_value(), Some(1_200.0));
    }

    #[test]
    fn rate_rounds_half_up_to_two_places() {
        let mut acc = CtxAccumulator::default();
        acc.update(&ctx_sample(0, 0));

        // 100 / 3s = 33.333... → 33.33
        let out = acc.update(&ctx_sample(3, 100)).unwrap();
        assert_eq!(out.real_value(), Some(33.33));
    }

    #[test]
    fn stale_and_duplicate_timestamps_are_dropped() {
        let mut acc = CtxAccumulator::default();
        acc.update(&ctx_sample(100, 50_000));

        assert!(acc.update(&ctx_sample(100, 51_000)).is_none());
        assert!(acc.update(&ctx_sample(90, 40_000)).is_none());

        // the baseline was not disturbed
        let out = acc.update(&ctx_sample(110, 51_000)).unwrap();
        assert_eq!(out.real_value(), Some(100.0));
    }
}
