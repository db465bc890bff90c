use crate::model::GroupKey;
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode or decode stored summary: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{group_key} scan is out of order at {group_value} {timestamp}")]
    UnorderedScan {
        group_key: GroupKey,
        group_value: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("start {start} must be before end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("unknown group key '{0}' (expected device, zone or device_type)")]
    UnknownGroupKey(String),
    #[error("no hourly rollups are maintained for group key {0}")]
    RollupsUnavailable(GroupKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("dead-letter sink rejected batch of {len} readings: {source}")]
    DeadLetter {
        len: usize,
        #[source]
        source: StoreError,
    },
}
