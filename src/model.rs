use crate::error::QueryError;
use crate::sketch::DigestSketch;
use crate::sum::ExactSum;
use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use std::fmt;
use std::str::FromStr;

/// A validated sensor reading. Immutable once written; two readings with
/// identical fields are still two rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    pub device_type: String,
    #[serde(default)]
    pub zone: Option<String>,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        zone: Option<&str>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            zone: zone.map(str::to_string),
            value,
            timestamp,
        }
    }

    pub fn group_value(&self, key: GroupKey) -> Option<&str> {
        match key {
            GroupKey::Device => Some(self.device_id.as_str()),
            GroupKey::Zone => self.zone.as_deref(),
            GroupKey::DeviceType => Some(self.device_type.as_str()),
        }
    }
}

/// Reading as it arrives from a producer, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundReading {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl InboundReading {
    /// Returns the storable reading, or `None` when a required field is
    /// missing, an id is blank or the value is not finite.
    pub fn validate(&self) -> Option<Reading> {
        let device_id = non_blank(self.device_id.as_deref())?;
        let device_type = non_blank(self.device_type.as_deref())?;
        let value = self.value.filter(|v| v.is_finite())?;
        let timestamp = self.timestamp?;
        Some(Reading {
            device_id: device_id.to_string(),
            device_type: device_type.to_string(),
            zone: non_blank(self.zone.as_deref()).map(str::to_string),
            value,
            timestamp,
        })
    }
}

impl From<Reading> for InboundReading {
    fn from(reading: Reading) -> Self {
        Self {
            device_id: Some(reading.device_id),
            device_type: Some(reading.device_type),
            zone: reading.zone,
            value: Some(reading.value),
            timestamp: Some(reading.timestamp),
            seq: None,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    Device,
    Zone,
    DeviceType,
}

impl GroupKey {
    /// Groupings that have hourly rollups maintained by the refresher.
    pub const ROLLUP_GROUPS: [GroupKey; 2] = [GroupKey::Device, GroupKey::Zone];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKey::Device => "device",
            GroupKey::Zone => "zone",
            GroupKey::DeviceType => "device_type",
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            GroupKey::Device => "device_id",
            GroupKey::Zone => "zone",
            GroupKey::DeviceType => "device_type",
        }
    }

    pub fn has_rollups(&self) -> bool {
        Self::ROLLUP_GROUPS.contains(self)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupKey {
    type Err = QueryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "device" | "device_id" | "deviceId" => Ok(GroupKey::Device),
            "zone" => Ok(GroupKey::Zone),
            "device_type" | "device-type" | "deviceType" => Ok(GroupKey::DeviceType),
            other => Err(QueryError::UnknownGroupKey(other.to_string())),
        }
    }
}

/// Pre-aggregated summary of one `[bucket_start, bucket_start + 1h)` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    pub group_key: GroupKey,
    pub group_value: String,
    pub bucket_start: DateTime<Utc>,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    /// Partials behind `sum`, merged by range queries instead of `sum`.
    pub sum_partials: ExactSum,
    pub avg: f64,
    pub count: u64,
    pub summary: DigestSketch,
}

/// Range aggregate. `count == 0` with every statistic `None` means no data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub group_key: GroupKey,
    pub group_value: String,
    #[serde(rename = "startTime")]
    pub start: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end: DateTime<Utc>,
    #[serde(rename = "minimum")]
    pub min: Option<f64>,
    #[serde(rename = "maximum")]
    pub max: Option<f64>,
    #[serde(rename = "average")]
    pub avg: Option<f64>,
    #[serde(rename = "dataPointCount")]
    pub count: u64,
    #[serde(rename = "q1")]
    pub p25: Option<f64>,
    #[serde(rename = "median")]
    pub p50: Option<f64>,
    #[serde(rename = "q3")]
    pub p75: Option<f64>,
    pub p95: Option<f64>,
    /// True when percentiles came from merged digests rather than exact ranks.
    pub approximate: bool,
}

impl Aggregate {
    pub fn empty(
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            group_key,
            group_value: group_value.to_string(),
            start,
            end,
            min: None,
            max: None,
            avg: None,
            count: 0,
            p25: None,
            p50: None,
            p75: None,
            p95: None,
            approximate: false,
        }
    }
}

/// Parses a `{prefix}/{producer}/readings` publish into its producer id and
/// readings. The payload is either a single reading object or an array of
/// them; fields that fail to parse are left empty so validation drops them.
pub fn parse_readings_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<(String, Vec<InboundReading>)>> {
    let Some(rest) = topic
        .strip_prefix(topic_prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return Ok(None);
    };
    let producer = match rest.split('/').collect::<Vec<_>>().as_slice() {
        [producer, "readings"] => producer.trim(),
        _ => return Ok(None),
    };
    if producer.is_empty() {
        return Ok(None);
    }

    let readings = match simd_json::to_borrowed_value(payload)? {
        BorrowedValue::Array(items) => items.iter().map(wire_reading).collect(),
        value @ BorrowedValue::Object(_) => vec![wire_reading(&value)],
        _ => bail!("readings payload must be a JSON object or array"),
    };
    Ok(Some((producer.to_string(), readings)))
}

fn wire_reading(value: &BorrowedValue<'_>) -> InboundReading {
    let BorrowedValue::Object(obj) = value else {
        return InboundReading::default();
    };
    let field = |camel: &str, snake: &str| obj.get(camel).or_else(|| obj.get(snake));
    let text = |camel: &str, snake: &str| {
        field(camel, snake)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    InboundReading {
        device_id: text("deviceId", "device_id"),
        device_type: text("deviceType", "device_type"),
        zone: text("zone", "zone"),
        value: field("value", "value").and_then(number),
        timestamp: field("timestamp", "ts").and_then(wire_timestamp),
        seq: field("seq", "seq").and_then(|v| v.as_u64()),
    }
}

fn number(value: &BorrowedValue<'_>) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
}

fn wire_timestamp(value: &BorrowedValue<'_>) -> Option<DateTime<Utc>> {
    if let Some(raw) = value.as_str() {
        return parse_timestamp_str(raw);
    }
    if let Some(ms) = value.as_i64() {
        return millis_to_dt(ms);
    }
    if let Some(ms) = value.as_u64() {
        return millis_to_dt(ms as i64);
    }
    value
        .as_f64()
        .and_then(|secs| millis_to_dt((secs * 1000.0) as i64))
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.fff]` taken as UTC.
pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}
