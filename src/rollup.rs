use crate::bucket::floor_to_hour;
use crate::error::StoreError;
use crate::model::{GroupKey, HourlyRollup, Reading};
use crate::sketch::DigestSketch;
use crate::store::{RawStore, RollupStore};
use crate::sum::ExactSum;
use chrono::{DateTime, Utc};
use futures::{future, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub status: RefreshStatus,
    pub message: String,
    pub duration_ms: u64,
    pub refreshed_groups: Vec<GroupKey>,
    pub failed_groups: Vec<(GroupKey, String)>,
    pub timestamp: DateTime<Utc>,
}

/// Recomputes hourly rollups from the raw store, one grouping at a time.
#[derive(Clone)]
pub struct RollupRefresher {
    raw: Arc<dyn RawStore>,
    rollups: Arc<dyn RollupStore>,
}

impl RollupRefresher {
    pub fn new(raw: Arc<dyn RawStore>, rollups: Arc<dyn RollupStore>) -> Self {
        Self { raw, rollups }
    }

    /// Refreshes every tracked grouping. A failed grouping leaves its previous
    /// rollups in place and does not stop the others.
    pub async fn refresh_all(&self) -> RefreshReport {
        tracing::info!("starting hourly rollup refresh");
        let started = Instant::now();
        let mut refreshed_groups = Vec::new();
        let mut failed_groups = Vec::new();

        for group_key in GroupKey::ROLLUP_GROUPS {
            match self.refresh_group(group_key).await {
                Ok(buckets) => {
                    tracing::info!(group = %group_key, buckets, "refreshed hourly rollups");
                    refreshed_groups.push(group_key);
                }
                Err(err) => {
                    tracing::error!(
                        group = %group_key,
                        error = %err,
                        "failed to refresh hourly rollups"
                    );
                    failed_groups.push((group_key, err.to_string()));
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, message) = if failed_groups.is_empty() {
            (
                RefreshStatus::Success,
                "All hourly rollups refreshed successfully".to_string(),
            )
        } else {
            let detail = failed_groups
                .iter()
                .map(|(group, err)| format!("{group}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            (
                RefreshStatus::Error,
                format!("Failed to refresh hourly rollups: {detail}"),
            )
        };
        tracing::info!(?status, duration_ms, "hourly rollup refresh finished");

        RefreshReport {
            status,
            message,
            duration_ms,
            refreshed_groups,
            failed_groups,
            timestamp: Utc::now(),
        }
    }

    /// Folds the ordered group scan into buckets, sealing each one as the
    /// scan moves past it, then swaps the result in.
    pub async fn refresh_group(&self, group_key: GroupKey) -> Result<usize, StoreError> {
        let builder = self
            .raw
            .scan_group(group_key)
            .await?
            .try_fold(HourlyRollupBuilder::new(group_key), |mut builder, reading| {
                future::ready(builder.push(&reading).map(|()| builder))
            })
            .await?;
        let buckets = builder.finish();
        let len = buckets.len();
        self.rollups.replace_all(group_key, buckets).await?;
        Ok(len)
    }
}

struct OpenBucket {
    group_value: String,
    bucket_start: DateTime<Utc>,
    values: Vec<f64>,
}

impl OpenBucket {
    fn seal(self, group_key: GroupKey) -> HourlyRollup {
        seal_bucket(group_key, self.group_value, self.bucket_start, self.values)
    }
}

/// Builds rollups from readings ordered by group value and then timestamp.
/// Only the bucket being filled holds raw values.
pub struct HourlyRollupBuilder {
    group_key: GroupKey,
    open: Option<OpenBucket>,
    sealed: Vec<HourlyRollup>,
}

impl HourlyRollupBuilder {
    pub fn new(group_key: GroupKey) -> Self {
        Self {
            group_key,
            open: None,
            sealed: Vec::new(),
        }
    }

    /// Rows without a value for the grouping are skipped. A row that sorts
    /// before the open bucket is rejected, since its bucket may already be
    /// sealed.
    pub fn push(&mut self, reading: &Reading) -> Result<(), StoreError> {
        let Some(group_value) = reading.group_value(self.group_key) else {
            return Ok(());
        };
        let bucket_start = floor_to_hour(reading.timestamp);
        if let Some(open) = &mut self.open {
            if open.group_value == group_value && open.bucket_start == bucket_start {
                open.values.push(reading.value);
                return Ok(());
            }
            if (group_value, bucket_start) < (open.group_value.as_str(), open.bucket_start) {
                return Err(StoreError::UnorderedScan {
                    group_key: self.group_key,
                    group_value: group_value.to_string(),
                    timestamp: reading.timestamp,
                });
            }
        }
        let next = OpenBucket {
            group_value: group_value.to_string(),
            bucket_start,
            values: vec![reading.value],
        };
        if let Some(done) = self.open.replace(next) {
            self.sealed.push(done.seal(self.group_key));
        }
        Ok(())
    }

    pub fn finish(mut self) -> Vec<HourlyRollup> {
        if let Some(done) = self.open.take() {
            self.sealed.push(done.seal(self.group_key));
        }
        self.sealed
    }
}

/// Groups readings into hour buckets per group value. Output order and
/// summaries depend only on the multiset of readings, not their order.
pub fn build_hourly_rollups<I>(group_key: GroupKey, readings: I) -> Vec<HourlyRollup>
where
    I: IntoIterator<Item = Reading>,
{
    let mut buckets: BTreeMap<(String, DateTime<Utc>), Vec<f64>> = BTreeMap::new();
    for reading in readings {
        let Some(group_value) = reading.group_value(group_key) else {
            continue;
        };
        buckets
            .entry((group_value.to_string(), floor_to_hour(reading.timestamp)))
            .or_default()
            .push(reading.value);
    }

    buckets
        .into_iter()
        .map(|((group_value, bucket_start), values)| {
            seal_bucket(group_key, group_value, bucket_start, values)
        })
        .collect()
}

fn seal_bucket(
    group_key: GroupKey,
    group_value: String,
    bucket_start: DateTime<Utc>,
    mut values: Vec<f64>,
) -> HourlyRollup {
    values.sort_by(f64::total_cmp);
    let count = values.len() as u64;
    let min = values.first().copied().unwrap_or_default();
    let max = values.last().copied().unwrap_or_default();
    let sum_partials: ExactSum = values.iter().copied().collect();
    let sum = sum_partials.value();
    HourlyRollup {
        group_key,
        group_value,
        bucket_start,
        min,
        max,
        sum,
        sum_partials,
        avg: sum / count as f64,
        count,
        summary: DigestSketch::from_values(values),
    }
}

/// Runs `refresh_all` every `interval` until the task is aborted.
pub fn spawn_refresh_scheduler(refresher: RollupRefresher, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = refresher.refresh_all().await;
            if report.status == RefreshStatus::Error {
                tracing::warn!(message = %report.message, "scheduled rollup refresh failed");
            }
        }
    })
}
