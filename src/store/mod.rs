//! Storage collaborators: the append-only raw reading store, the hourly
//! rollup table and the dead-letter sink.

mod memory;
mod postgres;

pub use memory::{MemoryStore, RangeScan};
pub use postgres::{build_pool, ensure_schema, PgStore};

#[cfg(test)]
pub(crate) use postgres::testing;

use crate::error::StoreError;
use crate::model::{GroupKey, HourlyRollup, InboundReading, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Writes every row or none of them. Returns the number of rows written.
    async fn insert_batch(&self, rows: &[Reading]) -> Result<u64, StoreError>;

    /// Rows whose `group_key` column equals `group_value` with
    /// `start <= timestamp < end`, oldest first.
    async fn query_range(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// Every row that has a value for `group_key`, ordered by that value
    /// (byte order) and then by timestamp.
    async fn scan_group(
        &self,
        group_key: GroupKey,
    ) -> Result<BoxStream<'_, Result<Reading, StoreError>>, StoreError>;
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Rollups for `group_value` with `start_bucket <= bucket_start < end_bucket`.
    async fn query_buckets(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start_bucket: DateTime<Utc>,
        end_bucket: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, StoreError>;

    /// Atomically swaps the full bucket set of one grouping. On error the
    /// previous set stays visible.
    async fn replace_all(
        &self,
        group_key: GroupKey,
        buckets: Vec<HourlyRollup>,
    ) -> Result<(), StoreError>;
}

/// A batch that exhausted its write attempts, kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub batch: Vec<InboundReading>,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(batch: Vec<InboundReading>, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError>;
}
