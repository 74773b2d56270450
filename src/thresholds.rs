//! Threshold rule model and the profile-service wire protocol.
//!
//! The profile service answers `GET /<path>/<lookupID>` with a configuration
//! document listing every rule applicable under that lookup key. Rules are
//! flattened into [`ThresholdRule`] for caching and evaluation: one
//! comparison predicate plus a map from severity level (`"1"`..`"9"`) to the
//! integer threshold at that level.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A cached threshold profile for one (lookup key, rule) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub id: String,
    pub metric: String,
    pub host_id: u64,
    pub oncall: String,
    pub interval: u64,
    pub monitoring: String,
    pub team: String,
    pub source: String,
    pub targethost: String,
    /// One of `<`, `<=`, `==`, `!=`, `>=`, `>`. Kept as the wire string:
    /// unknown predicates must degrade to "not broken" at evaluation time,
    /// not fail the decode.
    pub predicate: String,
    /// Severity level → threshold value. Levels are decimal strings so the
    /// cached JSON matches the wire protocol.
    pub thresholds: BTreeMap<String, i64>,
}

/// Top-level response of the profile service.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationData {
    pub configurations: Vec<ConfigurationItem>,
}

/// One monitoring profile definition as served by the profile service.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationItem {
    pub configuration_item_id: String,
    pub metric: String,
    #[serde(default, deserialize_with = "de_string_or_u64")]
    pub host_id: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub oncall: String,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub metadata: ConfigurationMetaData,
    #[serde(default)]
    pub thresholds: Vec<ConfigurationThreshold>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigurationMetaData {
    #[serde(default)]
    pub monitoring: String,
    // upstream serializes this field under the tag "string"; accept both
    #[serde(default, alias = "string")]
    pub team: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub targethost: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigurationThreshold {
    pub predicate: String,
    pub level: u16,
    pub value: i64,
}

impl ConfigurationItem {
    /// Flatten into the cached rule shape. The predicate of the last
    /// threshold entry wins; profiles carry one predicate across levels.
    pub fn into_rule(self) -> ThresholdRule {
        let mut predicate = String::new();
        let mut thresholds = BTreeMap::new();
        for entry in self.thresholds {
            predicate = entry.predicate;
            thresholds.insert(entry.level.to_string(), entry.value);
        }

        ThresholdRule {
            id: self.configuration_item_id,
            metric: self.metric,
            host_id: self.host_id,
            oncall: self.oncall,
            interval: self.interval,
            monitoring: self.metadata.monitoring,
            team: self.metadata.team,
            source: self.metadata.source,
            targethost: self.metadata.targethost,
            predicate,
            thresholds,
        }
    }
}

/// The profile service encodes `host_id` as a JSON string; some emitters
/// send a bare number.
fn de_string_or_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_RESPONSE: &str = r#"{
        "configurations": [{
            "configuration_item_id": "0ca537a1-79b0-44a9-9e29-ec23ab6dcf13",
            "metric": "memory.usage.percent",
            "host_id": "7",
            "oncall": "storage team pager",
            "interval": 60,
            "metadata": {
                "monitoring": "monitoring.example.com",
                "string": "storage",
                "source": "profile-service",
                "targethost": "web01.example.com"
            },
            "thresholds": [
                {"predicate": ">", "level": 5, "value": 80},
                {"predicate": ">", "level": 9, "value": 95}
            ]
        }]
    }"#;

    #[test]
    fn profile_response_decodes_and_flattens() {
        let data: ConfigurationData = serde_json::from_str(PROFILE_RESPONSE).unwrap();
        assert_eq!(data.configurations.len(), 1);

        let rule = data.configurations.into_iter().next().unwrap().into_rule();
        assert_eq!(rule.id, "0ca537a1-79b0-44a9-9e29-ec23ab6dcf13");
        assert_eq!(rule.host_id, 7);
        assert_eq!(rule.predicate, ">");
        assert_eq!(rule.team, "storage");
        assert_eq!(rule.targethost, "web01.example.com");
        assert_eq!(rule.thresholds.get("5"), Some(&80));
        assert_eq!(rule.thresholds.get("9"), Some(&95));
        assert_eq!(rule.thresholds.len(), 2);
    }

    #[test]
    fn numeric_host_id_is_accepted() {
        let raw = r#"{
            "configuration_item_id": "x",
            "metric": "m",
            "host_id": 42,
            "thresholds": []
        }"#;
        let item: ConfigurationItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.host_id, 42);

        let rule = item.into_rule();
        assert!(rule.thresholds.is_empty());
        assert!(rule.predicate.is_empty());
    }

    #[test]
    fn cached_rule_roundtrips_through_json() {
        let data: ConfigurationData = serde_json::from_str(PROFILE_RESPONSE).unwrap();
        let rule = data.configurations.into_iter().next().unwrap().into_rule();

        let json = serde_json::to_string(&rule).unwrap();
        let back: ThresholdRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
