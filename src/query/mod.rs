//! Range aggregate queries: an exact raw-scan engine and a hybrid engine that
//! answers fully covered hours from rollups.

mod exact;
mod hybrid;

pub use exact::ExactAggregateEngine;
pub use hybrid::{plan_segments, HybridAggregateEngine, SegmentPlan, Span};

use crate::error::QueryError;
use crate::model::{Aggregate, GroupKey, HourlyRollup, Reading};
use crate::sketch::{ExactSketch, MergeableSketch, QuantileSketch};
use crate::store::{RawStore, RollupStore};
use crate::sum::ExactSum;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub(crate) fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), QueryError> {
    if start >= end {
        return Err(QueryError::InvalidRange { start, end });
    }
    Ok(())
}

/// min/max/sum/count of one partial view of a range. The sum is exact, so
/// the average does not depend on how the range was split.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PartialStats {
    min: Option<f64>,
    max: Option<f64>,
    sum: ExactSum,
    count: u64,
}

impl PartialStats {
    pub(crate) fn observe(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.sum.add(value);
        self.count += 1;
    }

    pub(crate) fn absorb(&mut self, rollup: &HourlyRollup) {
        if rollup.count == 0 {
            return;
        }
        self.min = Some(self.min.map_or(rollup.min, |m| m.min(rollup.min)));
        self.max = Some(self.max.map_or(rollup.max, |m| m.max(rollup.max)));
        if rollup.sum_partials.is_empty() {
            self.sum.add(rollup.sum);
        } else {
            self.sum.merge(&rollup.sum_partials);
        }
        self.count += rollup.count;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

pub(crate) fn finish(
    group_key: GroupKey,
    group_value: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    stats: PartialStats,
    mut sketch: QuantileSketch,
) -> Aggregate {
    if stats.count == 0 {
        return Aggregate::empty(group_key, group_value, start, end);
    }
    sketch.seal();
    let percentiles = sketch.percentiles();
    Aggregate {
        group_key,
        group_value: group_value.to_string(),
        start,
        end,
        min: stats.min,
        max: stats.max,
        avg: Some(stats.sum.value() / stats.count as f64),
        count: stats.count,
        p25: percentiles.p25,
        p50: percentiles.p50,
        p75: percentiles.p75,
        p95: percentiles.p95,
        approximate: !sketch.is_exact(),
    }
}

/// Exact aggregate over raw rows. Both engines use this for raw-only ranges,
/// which is what makes their answers identical there.
pub(crate) fn aggregate_readings(
    group_key: GroupKey,
    group_value: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    rows: &[Reading],
) -> Aggregate {
    let mut stats = PartialStats::default();
    let mut sketch = ExactSketch::new();
    for row in rows {
        stats.observe(row.value);
        sketch.insert(row.value);
    }
    finish(
        group_key,
        group_value,
        start,
        end,
        stats,
        QuantileSketch::Exact(sketch),
    )
}

/// Query surface for the API layer: raw listings plus the exact and
/// partitioned aggregate modes, keyed by group name strings.
#[derive(Clone)]
pub struct QueryService {
    raw: Arc<dyn RawStore>,
    exact: ExactAggregateEngine,
    hybrid: HybridAggregateEngine,
}

impl QueryService {
    pub fn new(raw: Arc<dyn RawStore>, rollups: Arc<dyn RollupStore>) -> Self {
        Self {
            exact: ExactAggregateEngine::new(raw.clone()),
            hybrid: HybridAggregateEngine::new(raw.clone(), rollups),
            raw,
        }
    }

    /// Raw readings in `[start, end)`, newest first.
    pub async fn readings(
        &self,
        group_key: &str,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, QueryError> {
        let group_key: GroupKey = group_key.parse()?;
        validate_range(start, end)?;
        let mut rows = self
            .raw
            .query_range(group_key, group_value, start, end)
            .await?;
        rows.reverse();
        Ok(rows)
    }

    pub async fn exact_aggregate(
        &self,
        group_key: &str,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Aggregate, QueryError> {
        let group_key: GroupKey = group_key.parse()?;
        self.exact
            .exact_aggregate(group_key, group_value, start, end)
            .await
    }

    pub async fn partitioned_aggregate(
        &self,
        group_key: &str,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Aggregate, QueryError> {
        let group_key: GroupKey = group_key.parse()?;
        self.hybrid
            .partitioned_aggregate(group_key, group_value, start, end)
            .await
    }
}
