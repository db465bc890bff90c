use super::{aggregate_readings, finish, validate_range, PartialStats};
use crate::bucket::{bucket_width, floor_to_hour, hour_buckets, is_hour_aligned};
use crate::error::{QueryError, StoreError};
use crate::model::{Aggregate, GroupKey, Reading};
use crate::sketch::{MergeableSketch, QuantileSketch};
use crate::store::{RawStore, RollupStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Span {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// How a partitioned query splits its range.
///
/// `Raw` covers ranges whose start and end fall in the same or adjacent
/// hours; there is no fully covered hour between them. Otherwise `head` runs
/// from the start to the end of its hour, `body` is the run of whole hours
/// answered from rollups, and `tail` runs from the last hour boundary to the
/// end when the end is not itself on a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentPlan {
    Raw(Span),
    Split {
        head: Span,
        body: Span,
        tail: Option<Span>,
    },
}

pub fn plan_segments(start: DateTime<Utc>, end: DateTime<Utc>) -> SegmentPlan {
    let start_bucket = floor_to_hour(start);
    let end_bucket = floor_to_hour(end);
    let head_end = start_bucket + bucket_width();
    if end_bucket <= head_end {
        return SegmentPlan::Raw(Span { start, end });
    }
    let tail = (!is_hour_aligned(end)).then_some(Span {
        start: end_bucket,
        end,
    });
    SegmentPlan::Split {
        head: Span {
            start,
            end: head_end,
        },
        body: Span {
            start: head_end,
            end: end_bucket,
        },
        tail,
    }
}

/// Answers whole hours from rollups and only the partial edges from raw
/// data. Results carry `approximate = true` whenever a rollup digest was
/// merged into the percentiles.
#[derive(Clone)]
pub struct HybridAggregateEngine {
    raw: Arc<dyn RawStore>,
    rollups: Arc<dyn RollupStore>,
}

impl HybridAggregateEngine {
    pub fn new(raw: Arc<dyn RawStore>, rollups: Arc<dyn RollupStore>) -> Self {
        Self { raw, rollups }
    }

    pub async fn partitioned_aggregate(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Aggregate, QueryError> {
        validate_range(start, end)?;
        if !group_key.has_rollups() {
            return Err(QueryError::RollupsUnavailable(group_key));
        }

        let (head, body, tail) = match plan_segments(start, end) {
            SegmentPlan::Raw(span) => {
                let rows = self.scan(group_key, group_value, span).await?;
                tracing::debug!(
                    group = %group_key,
                    group_value,
                    rows = rows.len(),
                    "partitioned aggregate answered from raw data only"
                );
                return Ok(aggregate_readings(group_key, group_value, start, end, &rows));
            }
            SegmentPlan::Split { head, body, tail } => (head, body, tail),
        };

        let (head_rows, body_rollups, tail_rows) = tokio::try_join!(
            self.scan(group_key, group_value, head),
            self.rollups
                .query_buckets(group_key, group_value, body.start, body.end),
            async {
                match tail {
                    Some(span) => self.scan(group_key, group_value, span).await,
                    None => Ok(Vec::new()),
                }
            },
        )?;

        let expected_buckets = hour_buckets(body.start, body.end).count();
        if body_rollups.len() < expected_buckets {
            tracing::debug!(
                group = %group_key,
                group_value,
                expected_buckets,
                found = body_rollups.len(),
                "some covered hours have no rollup"
            );
        }

        let mut stats = PartialStats::default();
        let mut sketch = QuantileSketch::default();
        for row in &head_rows {
            stats.observe(row.value);
            sketch.insert(row.value);
        }
        for row in &tail_rows {
            stats.observe(row.value);
            sketch.insert(row.value);
        }
        for rollup in &body_rollups {
            stats.absorb(rollup);
            sketch.merge_digest(&rollup.summary);
        }

        tracing::debug!(
            group = %group_key,
            group_value,
            head_rows = head_rows.len(),
            body_buckets = body_rollups.len(),
            tail_rows = tail_rows.len(),
            count = stats.count(),
            "partitioned aggregate merged"
        );
        Ok(finish(group_key, group_value, start, end, stats, sketch))
    }

    async fn scan(
        &self,
        group_key: GroupKey,
        group_value: &str,
        span: Span,
    ) -> Result<Vec<Reading>, StoreError> {
        if span.is_empty() {
            return Ok(Vec::new());
        }
        self.raw
            .query_range(group_key, group_value, span.start, span.end)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::RollupRefresher;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn kitchen(value: f64, at: DateTime<Utc>) -> Reading {
        Reading::new("D1", "THERMOSTAT", Some("kitchen"), value, at)
    }

    #[test]
    fn same_or_adjacent_hour_ranges_stay_raw() {
        let start = ts("2024-01-01T10:15:00Z");
        assert_eq!(
            plan_segments(start, ts("2024-01-01T10:45:00Z")),
            SegmentPlan::Raw(Span {
                start,
                end: ts("2024-01-01T10:45:00Z")
            })
        );
        assert!(matches!(
            plan_segments(start, ts("2024-01-01T11:59:00Z")),
            SegmentPlan::Raw(_)
        ));
        assert!(matches!(
            plan_segments(start, ts("2024-01-01T11:00:00Z")),
            SegmentPlan::Raw(_)
        ));
    }

    #[test]
    fn longer_ranges_split_on_hour_boundaries() {
        let plan = plan_segments(ts("2024-01-01T10:15:00Z"), ts("2024-01-01T13:40:00Z"));
        assert_eq!(
            plan,
            SegmentPlan::Split {
                head: Span {
                    start: ts("2024-01-01T10:15:00Z"),
                    end: ts("2024-01-01T11:00:00Z"),
                },
                body: Span {
                    start: ts("2024-01-01T11:00:00Z"),
                    end: ts("2024-01-01T13:00:00Z"),
                },
                tail: Some(Span {
                    start: ts("2024-01-01T13:00:00Z"),
                    end: ts("2024-01-01T13:40:00Z"),
                }),
            }
        );

        let aligned = plan_segments(ts("2024-01-01T10:00:00Z"), ts("2024-01-01T14:00:00Z"));
        let SegmentPlan::Split { head, body, tail } = aligned else {
            panic!("expected split plan");
        };
        assert_eq!(head.end, ts("2024-01-01T11:00:00Z"));
        assert_eq!(body.end, ts("2024-01-01T14:00:00Z"));
        assert_eq!(tail, None);
    }

    async fn seeded_store(t0: DateTime<Utc>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut rows = Vec::new();
        for minute in (0..240i32).step_by(10) {
            rows.push(Reading::new(
                "D1",
                "THERMOSTAT",
                Some("kitchen"),
                f64::from(minute % 60),
                t0 + Duration::minutes(i64::from(minute)),
            ));
        }
        store.insert_batch(&rows).await.unwrap();
        RollupRefresher::new(store.clone(), store.clone())
            .refresh_all()
            .await;
        store.clear_range_scans();
        store
    }

    #[tokio::test]
    async fn middle_hours_come_from_rollups() {
        let t0 = ts("2024-01-01T10:00:00Z");
        let store = seeded_store(t0).await;
        let engine = HybridAggregateEngine::new(store.clone(), store.clone());

        let start = t0 + Duration::minutes(30);
        let end = t0 + Duration::minutes(210);
        let agg = engine
            .partitioned_aggregate(GroupKey::Device, "D1", start, end)
            .await
            .unwrap();

        // head 10:30..11:00 = 3 rows, body 11:00..13:00 = 12, tail 13:00..13:30 = 3
        assert_eq!(agg.count, 18);
        assert_eq!(agg.min, Some(0.0));
        assert_eq!(agg.max, Some(50.0));
        assert!(agg.approximate);

        let scans = store.range_scans();
        assert_eq!(scans.len(), 2);
        for scan in scans {
            assert!(scan.end <= t0 + Duration::hours(1) || scan.start >= t0 + Duration::hours(3));
        }
    }

    #[tokio::test]
    async fn raw_only_ranges_match_exact_engine() {
        let t0 = ts("2024-01-01T10:00:00Z");
        let store = Arc::new(MemoryStore::new());
        store
            .insert_batch(&[
                kitchen(21.5, t0 + Duration::minutes(20)),
                kitchen(22.25, t0 + Duration::minutes(50)),
                kitchen(19.75, t0 + Duration::minutes(70)),
            ])
            .await
            .unwrap();
        let hybrid = HybridAggregateEngine::new(store.clone(), store.clone());
        let exact = super::super::ExactAggregateEngine::new(store.clone());

        let start = t0 + Duration::minutes(10);
        let end = t0 + Duration::minutes(100);
        let a = hybrid
            .partitioned_aggregate(GroupKey::Zone, "kitchen", start, end)
            .await
            .unwrap();
        let b = exact
            .exact_aggregate(GroupKey::Zone, "kitchen", start, end)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert!(!a.approximate);
    }

    #[tokio::test]
    async fn device_type_has_no_rollups() {
        let engine = HybridAggregateEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );
        let t0 = ts("2024-01-01T10:00:00Z");
        let err = engine
            .partitioned_aggregate(GroupKey::DeviceType, "THERMOSTAT", t0, t0 + Duration::hours(4))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::RollupsUnavailable(_)));
    }
}
