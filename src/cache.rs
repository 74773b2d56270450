//! Read-through threshold cache.
//!
//! Rule lookups hit the local cache backend first; on a miss the profile
//! service is queried and its answer is written back with a TTL. A 404 is
//! cached too (negative caching) so unconfigured metrics do not hammer the
//! profile service. Positive and negative entries share the same TTL.
//!
//! Cache layout:
//!
//! - `<rule_id>` → rule JSON, with TTL
//! - `<lookup_id>` → hash `{rule_id: stored-at}` pointing at the rule keys,
//!   same TTL, so both expire together
//! - `<lookup_id>` → hash `{unconfigured: stored-at}` marks a negative entry
//! - `evaluation` → hash `{rule_id: last-evaluated-at}`, best effort
//! - `heartbeat` → hash `{cyclone-alive, cyclone-alive-<n>}`, best effort

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::{LookupConfig, RedisConfig};
use crate::thresholds::{ConfigurationData, ThresholdRule};

/// Marker field of a negative cache entry.
const UNCONFIGURED: &str = "unconfigured";
/// Hash key tracking when each rule last fired an evaluation.
const EVALUATION_KEY: &str = "evaluation";
/// Hash key carrying liveness timestamps.
const HEARTBEAT_KEY: &str = "heartbeat";

/// How often the availability probe retries while the backend is down.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

pub type CacheResult<T> = Result<T, CacheError>;

/// Backend-level failure. Always treated as transient by callers.
#[derive(Debug)]
pub struct CacheError(pub String);

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache backend error: {}", self.0)
    }
}

impl std::error::Error for CacheError {}

/// Outcome of a threshold lookup that did not produce rules.
#[derive(Debug)]
pub enum LookupError {
    /// The profile service has no rules for this lookup key (possibly known
    /// via the negative cache).
    Unconfigured,
    /// Cache backend or profile service unreachable; retry later, never
    /// cache this.
    Transient(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Unconfigured => write!(f, "no thresholds configured"),
            LookupError::Transient(msg) => write!(f, "threshold lookup unavailable: {msg}"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Minimal TTL key-value contract the engine needs: plain keys with expiry,
/// hashes, and a liveness probe. Redis satisfies it; tests use the
/// in-memory implementation.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>>;
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()>;
    async fn ping(&self) -> CacheResult<()>;
}

/// Redis-backed implementation.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(config: &RedisConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|err| CacheError(format!("invalid redis url: {err}")))?;
        let manager = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError(format!("redis connect failed: {err}")))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError(err.to_string()))
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| CacheError(err.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| CacheError(err.to_string()))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| CacheError(err.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| CacheError(err.to_string()))
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|err| CacheError(err.to_string()))
    }
}

/// In-memory backend with real TTL handling. Used by tests and by local
/// development without a redis instance.
#[derive(Default)]
pub struct MemoryCache {
    entries: tokio::sync::Mutex<HashMap<String, MemoryEntry>>,
    unavailable: std::sync::atomic::AtomicBool,
}

struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<std::time::Instant>,
}

enum MemoryValue {
    Plain(String),
    Hash(HashMap<String, String>),
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at
            .is_some_and(|at| at <= std::time::Instant::now())
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a backend outage: every operation fails until flipped back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> CacheResult<()> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            Err(CacheError("backend unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn hgetall(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(HashMap::new())
            }
            Some(MemoryEntry {
                value: MemoryValue::Hash(map),
                ..
            }) => Ok(map.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(MemoryEntry {
                value: MemoryValue::Plain(v),
                ..
            }) => Ok(Some(v.clone())),
            _ => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Plain(value.to_string()),
                expires_at: Some(std::time::Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> CacheResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Hash(HashMap::new()),
                expires_at: None,
            });
        if entry.expired() {
            *entry = MemoryEntry {
                value: MemoryValue::Hash(HashMap::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            MemoryValue::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            MemoryValue::Plain(_) => Err(CacheError("wrong type for hset".to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(std::time::Instant::now() + ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check_available()
    }
}

/// The read-through cache client handed to every worker.
pub struct ThresholdCache {
    backend: Arc<dyn CacheBackend>,
    http: reqwest::Client,
    base_url: String,
    ttl: Duration,
}

impl ThresholdCache {
    pub fn new(backend: Arc<dyn CacheBackend>, lookup: &LookupConfig) -> Self {
        Self {
            backend,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            base_url: lookup.base_url(),
            ttl: Duration::from_secs(lookup.ttl_seconds),
        }
    }

    /// Full lookup path: cache, then profile service, with negative caching.
    pub async fn lookup_threshold(
        &self,
        lookup_id: &str,
    ) -> Result<HashMap<String, ThresholdRule>, LookupError> {
        let index = self
            .backend
            .hgetall(lookup_id)
            .await
            .map_err(|err| LookupError::Transient(err.to_string()))?;

        if index.len() == 1 && index.contains_key(UNCONFIGURED) {
            return Err(LookupError::Unconfigured);
        }

        if !index.is_empty() {
            if let Some(rules) = self.assemble_cached(&index).await {
                return Ok(rules);
            }
            // rule keys expired underneath the index; fall through to refetch
        }

        self.fetch_and_store(lookup_id).await
    }

    /// Read every rule the lookup index references. None when any rule key
    /// is missing or undecodable, forcing a refetch.
    async fn assemble_cached(
        &self,
        index: &HashMap<String, String>,
    ) -> Option<HashMap<String, ThresholdRule>> {
        let mut rules = HashMap::new();
        for rule_id in index.keys().filter(|k| k.as_str() != UNCONFIGURED) {
            let raw = self.backend.get(rule_id).await.ok()??;
            let rule: ThresholdRule = serde_json::from_str(&raw).ok()?;
            rules.insert(rule.id.clone(), rule);
        }
        Some(rules)
    }

    async fn fetch_and_store(
        &self,
        lookup_id: &str,
    ) -> Result<HashMap<String, ThresholdRule>, LookupError> {
        let url = format!("{}/{}", self.base_url, lookup_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| LookupError::Transient(err.to_string()))?;

        match response.status().as_u16() {
            200 => {
                let data: ConfigurationData = response
                    .json()
                    .await
                    .map_err(|err| LookupError::Transient(err.to_string()))?;

                let mut rules = HashMap::new();
                for item in data.configurations {
                    let rule = item.into_rule();
                    self.store_rule(lookup_id, &rule).await;
                    rules.insert(rule.id.clone(), rule);
                }
                Ok(rules)
            }
            404 => {
                self.store_unconfigured(lookup_id).await;
                Err(LookupError::Unconfigured)
            }
            status => Err(LookupError::Transient(format!(
                "profile service returned {status} for {lookup_id}"
            ))),
        }
    }

    /// Write one rule plus its index entry. Write failures only cost the
    /// caching, not the lookup, so they are logged and swallowed.
    async fn store_rule(&self, lookup_id: &str, rule: &ThresholdRule) {
        let raw = match serde_json::to_string(rule) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("failed to serialize rule {}: {err}", rule.id);
                return;
            }
        };
        let now = Utc::now().to_rfc3339();

        for result in [
            self.backend.set_ex(&rule.id, &raw, self.ttl).await,
            self.backend.hset(lookup_id, &rule.id, &now).await,
            self.backend.expire(lookup_id, self.ttl).await,
        ] {
            if let Err(err) = result {
                warn!("failed to cache rule {}: {err}", rule.id);
                return;
            }
        }
    }

    async fn store_unconfigured(&self, lookup_id: &str) {
        let now = Utc::now().to_rfc3339();
        for result in [
            self.backend.hset(lookup_id, UNCONFIGURED, &now).await,
            self.backend.expire(lookup_id, self.ttl).await,
        ] {
            if let Err(err) = result {
                warn!("failed to cache negative entry for {lookup_id}: {err}");
                return;
            }
        }
    }

    /// Cheaper profile probe for the empty-tags short-circuit: returns the
    /// configured rule IDs without populating the cache.
    pub async fn configuration_ids(&self, lookup_id: &str) -> Result<Vec<String>, LookupError> {
        let url = format!("{}/{}", self.base_url, lookup_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| LookupError::Transient(err.to_string()))?;

        match response.status().as_u16() {
            200 => {
                let data: ConfigurationData = response
                    .json()
                    .await
                    .map_err(|err| LookupError::Transient(err.to_string()))?;
                Ok(data
                    .configurations
                    .into_iter()
                    .map(|item| item.configuration_item_id)
                    .collect())
            }
            404 => Err(LookupError::Unconfigured),
            status => Err(LookupError::Transient(format!(
                "profile service returned {status} for {lookup_id}"
            ))),
        }
    }

    /// Record that a rule was evaluated. Best effort.
    pub async fn update_evaluated(&self, rule_id: &str) {
        let now = Utc::now().to_rfc3339();
        if let Err(err) = self.backend.hset(EVALUATION_KEY, rule_id, &now).await {
            debug!("failed to record evaluation of {rule_id}: {err}");
        }
    }

    /// Record worker liveness. Best effort.
    pub async fn heartbeat(&self, worker: usize) {
        let now = Utc::now().to_rfc3339();
        if let Err(err) = self.backend.hset(HEARTBEAT_KEY, "cyclone-alive", &now).await {
            warn!("failed to set heartbeat: {err}");
            return;
        }
        let field = format!("cyclone-alive-{worker}");
        if let Err(err) = self.backend.hset(HEARTBEAT_KEY, &field, &now).await {
            warn!("failed to set heartbeat for worker {worker}: {err}");
        }
    }

    /// Block until the cache backend answers a probe again. Workers race
    /// this against their shutdown signal.
    pub async fn wait_available(&self) {
        loop {
            if self.backend.ping().await.is_ok() {
                return;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }
}
