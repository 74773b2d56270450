//! Runtime configuration.
//!
//! The configuration file is JSON. Every section is optional and falls back
//! to defaults, so a minimal file only needs the broker and sink addresses.

use serde::Deserialize;
use tracing::trace;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub cyclone: CycloneConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub misc: MiscConfig,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Where to start when the group has no committed offset:
    /// `oldest` or `newest`.
    #[serde(default = "default_offset_reset")]
    pub offset_reset: OffsetReset,
    #[serde(default = "default_commit_interval_ms")]
    pub commit_interval_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Accepted for compatibility with old deployments, no longer used.
    #[serde(default)]
    pub zookeeper: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Oldest,
    Newest,
}

impl OffsetReset {
    pub fn as_kafka_value(self) -> &'static str {
        match self {
            OffsetReset::Oldest => "earliest",
            OffsetReset::Newest => "latest",
        }
    }
}

/// Evaluation engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CycloneConfig {
    #[serde(default = "default_destination_uri")]
    pub destination_uri: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Evaluate but never POST. Messages commit immediately.
    #[serde(default)]
    pub test_mode: bool,
    /// Upper bound on in-flight alarm POSTs across all workers.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_min_wait_ms")]
    pub retry_min_wait_ms: u64,
    #[serde(default = "default_retry_max_wait_ms")]
    pub retry_max_wait_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_handler_queue_length")]
    pub handler_queue_length: usize,
    /// Samples older than this are committed and dropped without evaluation.
    #[serde(default = "default_age_cutoff_minutes")]
    pub age_cutoff_minutes: i64,
    /// Exact metric paths that are never evaluated.
    #[serde(default)]
    pub discard_metrics: Vec<String>,
    /// When non-empty, only paths starting with one of these prefixes are
    /// evaluated.
    #[serde(default)]
    pub allow_prefixes: Vec<String>,
}

/// Profile service endpoint plus cache lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct LookupConfig {
    #[serde(default = "default_lookup_host")]
    pub host: String,
    #[serde(default = "default_lookup_port")]
    pub port: u16,
    #[serde(default = "default_lookup_path")]
    pub path: String,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl LookupConfig {
    /// Base URL of the configuration endpoint, without the lookup ID.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/{}", self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_connect")]
    pub connect: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: i64,
}

impl RedisConfig {
    /// Connection URL in the form the redis client understands.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.connect, self.db)
        } else {
            format!("redis://:{}@{}/{}", self.password, self.connect, self.db)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Directory for the logfile. Empty means log to stderr.
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default)]
    pub debug: bool,
    /// Reopen the logfile on SIGUSR2 (external logrotate support).
    #[serde(default)]
    pub rotate_on_usr2: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiscConfig {
    /// Prefix for the periodic stats snapshot, useful when several instances
    /// share a log aggregator.
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub produce_metrics: bool,
    /// Snapshot flush cadence.
    #[serde(default = "default_metrics_interval_seconds")]
    pub metrics_interval_seconds: u64,
    /// Graphite endpoint keys are recognized for deployment compatibility;
    /// an external relay ships the logged snapshots.
    #[serde(default)]
    pub graphite_host: String,
    #[serde(default = "default_graphite_port")]
    pub graphite_port: u16,
    #[serde(default = "default_graphite_prefix")]
    pub graphite_prefix: String,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["metrics".to_string()]
}

fn default_consumer_group() -> String {
    "cyclone".to_string()
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Newest
}

fn default_commit_interval_ms() -> u64 {
    2_000
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_destination_uri() -> String {
    "http://localhost:9100/api/v1/alarms".to_string()
}

fn default_api_version() -> String {
    "1.0".to_string()
}

fn default_concurrency_limit() -> usize {
    32
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_min_wait_ms() -> u64 {
    100
}

fn default_retry_max_wait_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_handler_queue_length() -> usize {
    16
}

fn default_age_cutoff_minutes() -> i64 {
    60
}

fn default_lookup_host() -> String {
    "localhost".to_string()
}

fn default_lookup_port() -> u16 {
    7_777
}

fn default_lookup_path() -> String {
    "api/v1/configuration".to_string()
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_redis_connect() -> String {
    "localhost:6379".to_string()
}

fn default_log_file() -> String {
    "cyclone.log".to_string()
}

fn default_metrics_interval_seconds() -> u64 {
    60
}

fn default_graphite_port() -> u16 {
    2_003
}

fn default_graphite_prefix() -> String {
    "cyclone".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty kafka config must deserialize")
    }
}

impl Default for CycloneConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty cyclone config must deserialize")
    }
}

impl Default for LookupConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty lookup config must deserialize")
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty redis config must deserialize")
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty log config must deserialize")
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty misc config must deserialize")
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|err| anyhow::anyhow!("invalid configuration file {path}: {err}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
