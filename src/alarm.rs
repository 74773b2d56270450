//! Alarm event model and HTTP dispatch.
//!
//! Every alarm is POSTed to the sink as a single-element JSON array. A
//! process-wide semaphore bounds the number of concurrent POSTs across all
//! workers. Response classification is fixed by the sink's contract:
//!
//! - `< 209`: delivered
//! - `209..=499`: permanent failure caused on our side; the request JSON is
//!   logged and the worker treats it as fatal
//! - `>= 500` / network error: transient; the resender takes over
//!
//! Results never act on worker state directly: they travel back through the
//! worker's result channel and only the worker task touches its tracking
//! maps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CycloneConfig;
use crate::evaluate::Evaluation;
use crate::metric::MetricSample;
use crate::stats::EngineStats;
use crate::thresholds::ThresholdRule;

/// Delay before the first resend attempt.
const RESEND_FIRST_DELAY: Duration = Duration::from_millis(50);
/// Delay between subsequent resend attempts.
const RESEND_STEADY_DELAY: Duration = Duration::from_secs(5);
/// Resend attempts before giving up on an alarm.
const RESEND_BUDGET: u32 = 5;

/// Fallback when a rule carries no on-call information.
const NO_ONCALL: &str = "No oncall information available";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub source: String,
    pub event_id: String,
    pub version: String,
    pub sourcehost: String,
    pub on_call: String,
    pub targethost: String,
    pub message: String,
    pub level: i64,
    pub timestamp: String,
    pub check: String,
    pub monitoring: String,
    pub team: String,
}

impl AlarmEvent {
    /// Assemble the outgoing event for one evaluated (sample, rule) pair.
    pub fn build(
        sample: &MetricSample,
        rule: &ThresholdRule,
        evaluation: &Evaluation,
        api_version: &str,
    ) -> Self {
        let message = if evaluation.level == 0 {
            "Ok.".to_string()
        } else {
            format!(
                "Metric {} has broken threshold. Value {} {} {}",
                sample.path, evaluation.value_text, rule.predicate, evaluation.threshold
            )
        };

        let on_call = if rule.oncall.is_empty() {
            NO_ONCALL.to_string()
        } else {
            rule.oncall.clone()
        };

        Self {
            source: format!("{} / {}", rule.targethost, rule.source),
            event_id: rule.id.clone(),
            version: api_version.to_string(),
            sourcehost: rule.targethost.clone(),
            on_call,
            targethost: rule.targethost.clone(),
            message,
            level: evaluation.level,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            check: format!("cyclone({})", sample.path),
            monitoring: rule.monitoring.clone(),
            team: rule.team.clone(),
        }
    }
}

/// Completion report of one alarm POST, funneled through the worker's result
/// channel.
#[derive(Debug)]
pub struct DispatchResult {
    pub tracking_id: Uuid,
    pub error: Option<String>,
    /// Permanent failure caused on our side (encode error or 4xx). Fatal for
    /// the worker.
    pub internal: bool,
    /// Present on transient failures so the resender can take over. Absent
    /// on success and on resend exhaustion.
    pub alarm: Option<AlarmEvent>,
}

impl DispatchResult {
    fn success(tracking_id: Uuid) -> Self {
        Self {
            tracking_id,
            error: None,
            internal: false,
            alarm: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Shared alarm sink client. Cloneable; all clones share the semaphore and
/// stats.
#[derive(Clone)]
pub struct AlarmDispatcher {
    client: reqwest::Client,
    destination: String,
    limit: Arc<Semaphore>,
    stats: Arc<EngineStats>,
    retry_count: u32,
    retry_min_wait: Duration,
    retry_max_wait: Duration,
}

impl AlarmDispatcher {
    pub fn new(config: &CycloneConfig, limit: Arc<Semaphore>, stats: Arc<EngineStats>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(config.request_timeout_ms))
                .build()
                .expect("failed to build HTTP client"),
            destination: config.destination_uri.clone(),
            limit,
            stats,
            retry_count: config.retry_count,
            retry_min_wait: Duration::from_millis(config.retry_min_wait_ms),
            retry_max_wait: Duration::from_millis(config.retry_max_wait_ms),
        }
    }

    /// POST one alarm and classify the outcome. Network errors are retried
    /// with capped exponential backoff before being reported transient.
    #[instrument(skip(self, alarm), fields(event_id = %alarm.event_id, level = alarm.level))]
    pub async fn send(&self, alarm: AlarmEvent, tracking_id: Uuid) -> DispatchResult {
        let body = match serde_json::to_vec(&[&alarm]) {
            Ok(body) => body,
            Err(err) => {
                error!("failed to encode alarm for {}: {err}", alarm.event_id);
                return DispatchResult {
                    tracking_id,
                    error: Some(err.to_string()),
                    internal: true,
                    alarm: Some(alarm),
                };
            }
        };

        let _permit = self
            .limit
            .acquire()
            .await
            .expect("alarm concurrency semaphore closed");

        let mut attempt = 0u32;
        loop {
            match self.post(&body).await {
                Ok(response) => return self.classify(response, alarm, tracking_id).await,
                Err(err) => {
                    if attempt >= self.retry_count {
                        error!("failed to send alarm for {}: {err}", alarm.event_id);
                        return DispatchResult {
                            tracking_id,
                            error: Some(err.to_string()),
                            internal: false,
                            alarm: Some(alarm),
                        };
                    }
                    let backoff = self
                        .retry_min_wait
                        .saturating_mul(1 << attempt)
                        .min(self.retry_max_wait);
                    warn!(
                        "alarm POST attempt {} for {} failed: {err}, retrying in {backoff:?}",
                        attempt + 1,
                        alarm.event_id
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn post(&self, body: &[u8]) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(&self.destination)
            .header("Content-Type", "application/json; charset=utf-8")
            .body(body.to_vec())
            .send()
            .await
    }

    async fn classify(
        &self,
        response: reqwest::Response,
        alarm: AlarmEvent,
        tracking_id: Uuid,
    ) -> DispatchResult {
        let status = response.status().as_u16();
        info!(
            "dispatched alarm for {} at level {}, returncode was {status}",
            alarm.event_id, alarm.level
        );

        if status < 209 {
            return DispatchResult::success(tracking_id);
        }

        let body = response.text().await.unwrap_or_default();
        let err = format!("alarm sink answered {status}: {body}");
        error!("{err}");

        if status < 500 {
            // caused on our side; log the request so it can be reproduced
            match serde_json::to_string(&[&alarm]) {
                Ok(json) => error!("request JSON: {json}"),
                Err(_) => error!("request JSON could not be re-encoded"),
            }
            return DispatchResult {
                tracking_id,
                error: Some(err),
                internal: true,
                alarm: Some(alarm),
            };
        }

        DispatchResult {
            tracking_id,
            error: Some(err),
            internal: false,
            alarm: Some(alarm),
        }
    }

    /// Retry loop for a transiently failed alarm: first attempt after 50ms,
    /// then every 5s, bounded by the resend budget. Returns `None` when cut
    /// short by shutdown; otherwise the result to feed back through the
    /// worker's result channel. Never commits anything itself.
    #[instrument(skip(self, alarm, shutdown_rx), fields(event_id = %alarm.event_id))]
    pub async fn resend(
        &self,
        alarm: AlarmEvent,
        tracking_id: Uuid,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Option<DispatchResult> {
        self.stats.set_alarmapi_error(true);

        let body = match serde_json::to_vec(&[&alarm]) {
            // encoding succeeded before the transient failure; a failure here
            // means the alarm itself is unsendable
            Err(err) => {
                error!("failed to re-encode alarm for {}: {err}", alarm.event_id);
                return Some(DispatchResult {
                    tracking_id,
                    error: Some(err.to_string()),
                    internal: true,
                    alarm: None,
                });
            }
            Ok(body) => body,
        };

        let mut delay = RESEND_FIRST_DELAY;
        for _ in 0..RESEND_BUDGET {
            if *shutdown_rx.borrow() {
                return None;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = RESEND_STEADY_DELAY;

            // resend attempts count against the same POST concurrency bound
            // as first deliveries
            let _permit = self
                .limit
                .acquire()
                .await
                .expect("alarm concurrency semaphore closed");

            match self.post(&body).await {
                Ok(response) if response.status().as_u16() < 209 => {
                    info!("resend for {} succeeded", alarm.event_id);
                    self.stats.set_alarmapi_error(false);
                    return Some(DispatchResult::success(tracking_id));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    error!("resend for {} answered {status}: {body}", alarm.event_id);
                }
                Err(err) => {
                    error!("resend for {} failed: {err}", alarm.event_id);
                }
            }
        }

        warn!(
            "giving up on alarm for {} after {RESEND_BUDGET} resend attempts",
            alarm.event_id
        );
        Some(DispatchResult {
            tracking_id,
            error: Some(format!(
                "alarm for {} abandoned after {RESEND_BUDGET} resend attempts",
                alarm.event_id
            )),
            internal: false,
            alarm: None,
        })
    }
}
