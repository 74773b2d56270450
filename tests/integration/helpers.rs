//! Helper functions for integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use cyclone::alarm::AlarmDispatcher;
use cyclone::cache::{MemoryCache, ThresholdCache};
use cyclone::config::{CycloneConfig, LookupConfig};
use cyclone::dispatcher::MetricDispatcher;
use cyclone::envelope::{CommitAck, Envelope};
use cyclone::stats::EngineStats;
use cyclone::worker::{Worker, WorkerHandle};
use tokio::sync::{mpsc, watch, Semaphore};
use wiremock::MockServer;

pub const RULE_ID: &str = "0ca537a1-79b0-44a9-9e29-ec23ab6dcf13";

/// A worker pool plus front dispatcher wired against mock HTTP services,
/// with the broker replaced by a bare commit channel.
pub struct Pipeline {
    pub front: MetricDispatcher,
    pub workers: Vec<WorkerHandle>,
    pub commit_tx: mpsc::UnboundedSender<CommitAck>,
    pub commit_rx: mpsc::UnboundedReceiver<CommitAck>,
    pub shutdown_tx: watch::Sender<bool>,
    pub death_rx: mpsc::Receiver<anyhow::Error>,
    pub stats: Arc<EngineStats>,
    pub backend: Arc<MemoryCache>,
}

pub async fn build_pipeline(
    profile: &MockServer,
    sink: &MockServer,
    worker_count: usize,
) -> Pipeline {
    let profile_url = url::Url::parse(&profile.uri()).unwrap();
    let lookup: LookupConfig = serde_json::from_value(serde_json::json!({
        "host": profile_url.host_str().unwrap(),
        "port": profile_url.port().unwrap(),
        "path": "api/v1/configuration",
        "ttl_seconds": 86400
    }))
    .unwrap();

    let config: CycloneConfig = serde_json::from_value(serde_json::json!({
        "destination_uri": format!("{}/alarms", sink.uri()),
        "request_timeout_ms": 1000,
        "retry_count": 0,
        "handler_queue_length": 32,
        "age_cutoff_minutes": 30
    }))
    .unwrap();

    let stats = EngineStats::new();
    let backend = Arc::new(MemoryCache::new());
    let cache = Arc::new(ThresholdCache::new(backend.clone(), &lookup));
    let dispatcher = AlarmDispatcher::new(&config, Arc::new(Semaphore::new(16)), stats.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (death_tx, death_rx) = mpsc::channel(worker_count.max(1));
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    let mut workers = Vec::new();
    for num in 0..worker_count {
        workers.push(Worker::spawn(
            num,
            &config,
            cache.clone(),
            dispatcher.clone(),
            shutdown_rx.clone(),
            death_tx.clone(),
            stats.clone(),
        ));
    }

    let front = MetricDispatcher::new(
        workers.iter().map(|h| h.input.clone()).collect(),
        config.age_cutoff_minutes,
        stats.clone(),
    );

    Pipeline {
        front,
        workers,
        commit_tx,
        commit_rx,
        shutdown_tx,
        death_rx,
        stats,
        backend,
    }
}

impl Pipeline {
    pub fn envelope(&self, offset: i64, payload: &str) -> Envelope {
        Envelope::new(
            payload.as_bytes().to_vec(),
            "metrics".to_string(),
            0,
            offset,
            self.commit_tx.clone(),
        )
    }

    pub async fn expect_commit(&mut self, offset: i64) {
        let ack = tokio::time::timeout(Duration::from_secs(5), self.commit_rx.recv())
            .await
            .expect("commit must arrive")
            .expect("commit channel open");
        assert_eq!(ack.offset, offset);
    }

    pub async fn shutdown(self) {
        self.shutdown_tx.send(true).unwrap();
        for handle in self.workers {
            handle.join.await.unwrap();
        }
    }
}

pub fn metric_payload(
    asset_id: i64,
    path: &str,
    ts: DateTime<Utc>,
    kind: &str,
    value: &str,
    tags: &[&str],
) -> String {
    let tags_json = serde_json::to_string(tags).unwrap();
    format!(
        r#"[{asset_id}, "{path}", "{}", "{kind}", "", "{value}", {tags_json}, {{}}]"#,
        ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

/// The eight raw memory samples of one measurement cycle.
pub fn memory_cycle(asset_id: i64, ts: DateTime<Utc>, free: i64, total: i64) -> Vec<String> {
    [
        ("/sys/memory/active", 100),
        ("/sys/memory/buffers", 10),
        ("/sys/memory/cached", 20),
        ("/sys/memory/inactive", 30),
        ("/sys/memory/swapfree", 0),
        ("/sys/memory/swaptotal", 0),
        ("/sys/memory/free", free),
        ("/sys/memory/total", total),
    ]
    .iter()
    .map(|(path, value)| metric_payload(asset_id, path, ts, "long", &value.to_string(), &[]))
    .collect()
}

pub fn profile_body(rule_id: &str, predicate: &str, thresholds: &[(u16, i64)]) -> serde_json::Value {
    let thresholds: Vec<serde_json::Value> = thresholds
        .iter()
        .map(|(level, value)| {
            serde_json::json!({"predicate": predicate, "level": level, "value": value})
        })
        .collect();

    serde_json::json!({
        "configurations": [{
            "configuration_item_id": rule_id,
            "metric": "memory.usage.percent",
            "host_id": "7",
            "oncall": "storage pager",
            "interval": 60,
            "metadata": {
                "monitoring": "monitoring.example.com",
                "string": "storage",
                "source": "profile-service",
                "targethost": "web01.example.com"
            },
            "thresholds": thresholds
        }]
    })
}

/// Decode the alarm events POSTed to the mock sink.
pub async fn sink_alarms(sink: &MockServer) -> Vec<serde_json::Value> {
    let mut alarms = Vec::new();
    for request in sink.received_requests().await.unwrap() {
        let body: Vec<serde_json::Value> = serde_json::from_slice(&request.body).unwrap();
        alarms.extend(body);
    }
    alarms
}
