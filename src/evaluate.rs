//! Severity ranking of a metric value against a threshold rule.
//!
//! A rule only applies when the metric's tag list carries the rule's ID as a
//! well-formed UUID (the gate is deliberately narrow: hyphenated hex with a
//! version nibble of 1-5, or the nil UUID; anything else is silently
//! skipped). Severity levels are checked from 9 down to 1 and the first
//! broken level wins.

use std::sync::LazyLock;

use regex::Regex;
use tracing::error;

use crate::metric::{MetricSample, ValueKind};
use crate::thresholds::ThresholdRule;

static RULE_UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        "^[[:xdigit:]]{8}-[[:xdigit:]]{4}-[1-5][[:xdigit:]]{3}-[[:xdigit:]]{4}-[[:xdigit:]]{12}$",
        "|^0{8}-0{4}-0{4}-0{4}-0{12}$",
    ))
    .expect("rule uuid pattern must compile")
});

/// Severity levels in ranking order, worst first.
const LEVELS: [&str; 9] = ["9", "8", "7", "6", "5", "4", "3", "2", "1"];

/// Outcome of ranking one (sample, rule) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Broken severity level, `0` when every configured level holds.
    pub level: i64,
    /// Threshold value of the broken level. Only meaningful when `level > 0`.
    pub threshold: i64,
    /// The metric value rendered for alarm messages.
    pub value_text: String,
    /// Number of threshold comparisons performed. A rule without thresholds
    /// still counts as one evaluation.
    pub evaluations: u64,
}

/// Accepts exactly the hyphenated UUID shape used for rule IDs.
pub fn is_rule_uuid(tag: &str) -> bool {
    RULE_UUID.is_match(tag)
}

/// The UUID gate: a rule evaluates only when one of the sample's tags is a
/// valid UUID equal to the rule ID.
pub fn rule_matches(sample: &MetricSample, rule: &ThresholdRule) -> bool {
    sample
        .tags
        .iter()
        .any(|tag| is_rule_uuid(tag) && *tag == rule.id)
}

/// Rank `sample` against `rule`, worst level first, short-circuiting on the
/// first broken level.
pub fn evaluate_rule(sample: &MetricSample, rule: &ThresholdRule) -> Evaluation {
    let mut evaluations = 0u64;
    let value_text = render_value(sample);

    for level in LEVELS {
        let Some(&threshold) = rule.thresholds.get(level) else {
            continue;
        };
        evaluations += 1;

        let broken = match sample.kind {
            ValueKind::Integer | ValueKind::Long => sample
                .int_value()
                .and_then(|value| compare_int(&rule.predicate, value, threshold)),
            ValueKind::Real => sample
                .real_value()
                .and_then(|value| compare_real(&rule.predicate, value, threshold as f64)),
            ValueKind::Text => None,
        };

        let broken = match broken {
            Some(broken) => broken,
            None => {
                error!(
                    "unknown predicate {:?} in rule {}, treating as not broken",
                    rule.predicate, rule.id
                );
                false
            }
        };

        if broken {
            return Evaluation {
                level: level.parse().expect("ranking levels are numeric"),
                threshold,
                value_text,
                evaluations,
            };
        }
    }

    Evaluation {
        level: 0,
        threshold: 0,
        value_text,
        // a rule with no thresholds still produces one Ok verdict
        evaluations: evaluations.max(1),
    }
}

fn render_value(sample: &MetricSample) -> String {
    match sample.kind {
        ValueKind::Real => sample
            .real_value()
            .map(|v| format!("{v:.2}"))
            .unwrap_or_default(),
        _ => sample
            .int_value()
            .map(|v| v.to_string())
            .unwrap_or_default(),
    }
}

fn compare_int(predicate: &str, value: i64, threshold: i64) -> Option<bool> {
    match predicate {
        "<" => Some(value < threshold),
        "<=" => Some(value <= threshold),
        "==" => Some(value == threshold),
        "!=" => Some(value != threshold),
        ">=" => Some(value >= threshold),
        ">" => Some(value > threshold),
        _ => None,
    }
}

fn compare_real(predicate: &str, value: f64, threshold: f64) -> Option<bool> {
    match predicate {
        "<" => Some(value < threshold),
        "<=" => Some(value <= threshold),
        "==" => Some(value == threshold),
        "!=" => Some(value != threshold),
        ">=" => Some(value >= threshold),
        ">" => Some(value > threshold),
        _ => None,
    }
}
