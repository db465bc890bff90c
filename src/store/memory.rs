use super::{DeadLetter, DeadLetterSink, RawStore, RollupStore};
use crate::error::StoreError;
use crate::model::{GroupKey, HourlyRollup, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

type BucketMap = BTreeMap<(String, DateTime<Utc>), HourlyRollup>;

/// A raw range scan issued against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScan {
    pub group_key: GroupKey,
    pub group_value: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// In-process implementation of every storage collaborator. Used by the
/// simulator and tests; supports injected write and refresh failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: RwLock<Vec<Reading>>,
    rollups: RwLock<HashMap<GroupKey, BucketMap>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    insert_failures: AtomicU32,
    failing_scans: Mutex<HashSet<GroupKey>>,
    dead_letter_failures: AtomicU32,
    range_scans: Mutex<Vec<RangeScan>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls to `insert_batch` fail.
    pub fn fail_next_inserts(&self, count: u32) {
        self.insert_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` dead-letter writes fail.
    pub fn fail_next_dead_letters(&self, count: u32) {
        self.dead_letter_failures.store(count, Ordering::SeqCst);
    }

    /// Full scans of `group_key` fail until cleared.
    pub fn fail_scans_for(&self, group_key: GroupKey, failing: bool) {
        if let Ok(mut guard) = self.failing_scans.lock() {
            if failing {
                guard.insert(group_key);
            } else {
                guard.remove(&group_key);
            }
        }
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.readings.read().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().await.clone()
    }

    pub async fn rollups(&self, group_key: GroupKey) -> Vec<HourlyRollup> {
        self.rollups
            .read()
            .await
            .get(&group_key)
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn range_scans(&self) -> Vec<RangeScan> {
        self.range_scans
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn clear_range_scans(&self) {
        if let Ok(mut guard) = self.range_scans.lock() {
            guard.clear();
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn insert_batch(&self, rows: &[Reading]) -> Result<u64, StoreError> {
        if Self::take_failure(&self.insert_failures) {
            return Err(StoreError::Unavailable(
                "injected raw store write failure".to_string(),
            ));
        }
        let mut guard = self.readings.write().await;
        guard.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn query_range(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        if let Ok(mut scans) = self.range_scans.lock() {
            scans.push(RangeScan {
                group_key,
                group_value: group_value.to_string(),
                start,
                end,
            });
        }
        let guard = self.readings.read().await;
        let mut rows: Vec<Reading> = guard
            .iter()
            .filter(|r| r.group_value(group_key) == Some(group_value))
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    async fn scan_group(
        &self,
        group_key: GroupKey,
    ) -> Result<BoxStream<'_, Result<Reading, StoreError>>, StoreError> {
        let failing = self
            .failing_scans
            .lock()
            .map(|guard| guard.contains(&group_key))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Unavailable(format!(
                "injected scan failure for {group_key}"
            )));
        }
        let mut snapshot: Vec<Reading> = self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| r.group_value(group_key).is_some())
            .cloned()
            .collect();
        snapshot.sort_by(|a, b| {
            a.group_value(group_key)
                .cmp(&b.group_value(group_key))
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }
}

#[async_trait]
impl RollupStore for MemoryStore {
    async fn query_buckets(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start_bucket: DateTime<Utc>,
        end_bucket: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, StoreError> {
        if start_bucket >= end_bucket {
            return Ok(Vec::new());
        }
        let guard = self.rollups.read().await;
        let Some(buckets) = guard.get(&group_key) else {
            return Ok(Vec::new());
        };
        let from = (group_value.to_string(), start_bucket);
        let to = (group_value.to_string(), end_bucket);
        Ok(buckets.range(from..to).map(|(_, r)| r.clone()).collect())
    }

    async fn replace_all(
        &self,
        group_key: GroupKey,
        buckets: Vec<HourlyRollup>,
    ) -> Result<(), StoreError> {
        let replacement: BucketMap = buckets
            .into_iter()
            .map(|r| ((r.group_value.clone(), r.bucket_start), r))
            .collect();
        self.rollups.write().await.insert(group_key, replacement);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for MemoryStore {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        if Self::take_failure(&self.dead_letter_failures) {
            return Err(StoreError::Unavailable(
                "injected dead-letter failure".to_string(),
            ));
        }
        self.dead_letters.write().await.push(letter);
        Ok(())
    }
}
