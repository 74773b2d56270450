//! Metric sample model and wire codecs.
//!
//! Two wire variants arrive on the same topics:
//!
//! 1. A JSON tuple `[assetID, path, timestamp, type, unit, value, tags, labels]`
//!    where the value is transported as a string and parsed per the declared
//!    type.
//! 2. A binary frame: one format-tag byte followed by a MessagePack record
//!    (`0x00` = full record, `0x01` = schemaless point update).
//!
//! Both decode into the same immutable [`MetricSample`]. The lookup ID
//! derived from a sample is the primary index for threshold rules, so the
//! hash is fixed: SHA-256 over the decimal asset ID followed by the path,
//! rendered as lowercase hex.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Wire path of broker-carried heartbeat markers. In-process heartbeats use
/// the explicit envelope flag instead; this constant only exists so payloads
/// produced by older emitters are still recognized.
pub const HEARTBEAT_PATH: &str = "_internal.cyclone.heartbeat";

/// Format tag of the binary full-record frame.
const FORMAT_RECORD: u8 = 0x00;
/// Format tag of the binary point-update frame.
const FORMAT_POINT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Integer,
    Long,
    Real,
    Text,
}

impl ValueKind {
    fn parse(s: &str) -> Option<ValueKind> {
        match s {
            "integer" => Some(ValueKind::Integer),
            "long" => Some(ValueKind::Long),
            "real" => Some(ValueKind::Real),
            "string" => Some(ValueKind::Text),
            _ => None,
        }
    }

    pub fn as_wire_str(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Long => "long",
            ValueKind::Real => "real",
            ValueKind::Text => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

/// One decoded metric sample. Immutable after decode.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub asset_id: i64,
    pub path: String,
    pub ts: DateTime<Utc>,
    pub kind: ValueKind,
    pub value: MetricValue,
    pub unit: String,
    pub tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl MetricSample {
    /// Primary index for threshold rules. Deterministic across decoders:
    /// `sha256_hex(decimal(asset_id) || path)`, lowercase.
    pub fn lookup_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.asset_id.to_string().as_bytes());
        hasher.update(self.path.as_bytes());
        hex_lower(&hasher.finalize())
    }

    /// Whether the sample can be compared against integer thresholds.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            ValueKind::Integer | ValueKind::Long | ValueKind::Real
        )
    }

    pub fn int_value(&self) -> Option<i64> {
        match self.value {
            MetricValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn real_value(&self) -> Option<f64> {
        match self.value {
            MetricValue::Real(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Sample(MetricSample),
    /// Compressed point update without a schema. The engine cannot evaluate
    /// these; the dispatcher commits and drops them.
    Point,
}

#[derive(Debug)]
pub enum DecodeError {
    /// Payload is not valid JSON / MessagePack.
    Syntax(String),
    /// Payload parsed but does not have the expected shape.
    Shape(&'static str),
    /// The declared value type is not one we know.
    UnknownKind(String),
    /// The value string does not parse as the declared type.
    Value(String),
    /// The timestamp is not RFC 3339 / a valid Unix time.
    Timestamp(String),
    /// Zero-length payload.
    Empty,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Syntax(msg) => write!(f, "malformed metric payload: {msg}"),
            DecodeError::Shape(msg) => write!(f, "unexpected metric shape: {msg}"),
            DecodeError::UnknownKind(kind) => write!(f, "unknown metric type: {kind}"),
            DecodeError::Value(msg) => write!(f, "invalid metric value: {msg}"),
            DecodeError::Timestamp(msg) => write!(f, "invalid metric timestamp: {msg}"),
            DecodeError::Empty => write!(f, "empty metric payload"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one broker payload, sniffing the wire variant from the first byte.
pub fn decode(payload: &[u8]) -> Result<Decoded, DecodeError> {
    match payload.first() {
        None => Err(DecodeError::Empty),
        Some(b'[') | Some(b'{') => decode_json(payload).map(Decoded::Sample),
        Some(&FORMAT_POINT) => Ok(Decoded::Point),
        Some(&FORMAT_RECORD) => decode_record(&payload[1..]).map(Decoded::Sample),
        Some(tag) => Err(DecodeError::Syntax(format!(
            "unknown binary format tag {tag:#04x}"
        ))),
    }
}

/// Variant 1: JSON tuple with the value transported as a string.
fn decode_json(payload: &[u8]) -> Result<MetricSample, DecodeError> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_slice(payload).map_err(|err| DecodeError::Syntax(err.to_string()))?;

    if raw.len() != 8 {
        return Err(DecodeError::Shape("expected 8-element tuple"));
    }

    let asset_id = raw[0]
        .as_i64()
        .ok_or(DecodeError::Shape("asset id must be an integer"))?;
    let path = raw[1]
        .as_str()
        .ok_or(DecodeError::Shape("path must be a string"))?
        .to_string();
    let ts_raw = raw[2]
        .as_str()
        .ok_or(DecodeError::Shape("timestamp must be a string"))?;
    let kind_raw = raw[3]
        .as_str()
        .ok_or(DecodeError::Shape("type must be a string"))?;
    let unit = raw[4]
        .as_str()
        .ok_or(DecodeError::Shape("unit must be a string"))?
        .to_string();
    let value_raw = raw[5]
        .as_str()
        .ok_or(DecodeError::Shape("value must be a string"))?;

    let ts = DateTime::parse_from_rfc3339(ts_raw)
        .map_err(|err| DecodeError::Timestamp(format!("{ts_raw}: {err}")))?
        .with_timezone(&Utc);

    let kind =
        ValueKind::parse(kind_raw).ok_or_else(|| DecodeError::UnknownKind(kind_raw.to_string()))?;

    let value = match kind {
        ValueKind::Integer | ValueKind::Long => MetricValue::Integer(
            value_raw
                .parse::<i64>()
                .map_err(|err| DecodeError::Value(format!("{value_raw}: {err}")))?,
        ),
        ValueKind::Real => MetricValue::Real(
            value_raw
                .parse::<f64>()
                .map_err(|err| DecodeError::Value(format!("{value_raw}: {err}")))?,
        ),
        ValueKind::Text => MetricValue::Text(value_raw.to_string()),
    };

    let tags = raw[6]
        .as_array()
        .ok_or(DecodeError::Shape("tags must be an array"))?
        .iter()
        .map(|t| {
            t.as_str()
                .map(str::to_string)
                .ok_or(DecodeError::Shape("tags must be strings"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let labels = raw[7]
        .as_object()
        .ok_or(DecodeError::Shape("labels must be an object"))?
        .iter()
        .map(|(k, v)| {
            v.as_str()
                .map(|v| (k.clone(), v.to_string()))
                .ok_or(DecodeError::Shape("label values must be strings"))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(MetricSample {
        asset_id,
        path,
        ts,
        kind,
        value,
        unit,
        tags,
        labels,
    })
}

/// Variant 2: MessagePack record after the format-tag byte.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordMsg {
    id: i64,
    #[serde(default)]
    #[allow(dead_code)]
    org_id: i64,
    name: String,
    #[serde(default)]
    #[allow(dead_code)]
    interval: i64,
    value: f64,
    #[serde(default)]
    unit: String,
    time: i64,
    mtype: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn decode_record(payload: &[u8]) -> Result<MetricSample, DecodeError> {
    let record: RecordMsg =
        rmp_serde::from_slice(payload).map_err(|err| DecodeError::Syntax(err.to_string()))?;

    let ts = Utc
        .timestamp_opt(record.time, 0)
        .single()
        .ok_or_else(|| DecodeError::Timestamp(format!("unix time {}", record.time)))?;

    let (kind, value) = match record.mtype.as_str() {
        "gauge" | "count" | "counter" | "rate" => (ValueKind::Real, MetricValue::Real(record.value)),
        other => return Err(DecodeError::UnknownKind(other.to_string())),
    };

    // key=value entries carry label semantics, bare entries stay tags
    let mut tags = Vec::new();
    let mut labels = HashMap::new();
    for entry in record.tags {
        match entry.split_once('=') {
            Some((key, val)) => {
                labels.insert(key.to_string(), val.to_string());
            }
            None => tags.push(entry),
        }
    }

    Ok(MetricSample {
        asset_id: record.id,
        path: record.name,
        ts,
        kind,
        value,
        unit: record.unit,
        tags,
        labels,
    })
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
