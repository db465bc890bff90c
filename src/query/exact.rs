use super::{aggregate_readings, validate_range};
use crate::error::QueryError;
use crate::model::{Aggregate, GroupKey};
use crate::store::RawStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Aggregates straight from raw readings. Always exact, cost grows with the
/// number of rows in range.
#[derive(Clone)]
pub struct ExactAggregateEngine {
    raw: Arc<dyn RawStore>,
}

impl ExactAggregateEngine {
    pub fn new(raw: Arc<dyn RawStore>) -> Self {
        Self { raw }
    }

    pub async fn exact_aggregate(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Aggregate, QueryError> {
        validate_range(start, end)?;
        let rows = self
            .raw
            .query_range(group_key, group_value, start, end)
            .await?;
        tracing::debug!(
            group = %group_key,
            group_value,
            rows = rows.len(),
            "exact aggregate scan"
        );
        Ok(aggregate_readings(group_key, group_value, start, end, &rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Reading;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn thermo(value: f64, at: DateTime<Utc>) -> Reading {
        Reading::new("THERMO-01", "THERMOSTAT", Some("living-room"), value, at)
    }

    #[tokio::test]
    async fn three_readings_aggregate_exactly() {
        let store = Arc::new(MemoryStore::new());
        let t0 = ts("2024-03-01T10:00:00Z");
        store
            .insert_batch(&[
                thermo(10.0, t0 + Duration::minutes(5)),
                thermo(20.0, t0 + Duration::minutes(15)),
                thermo(30.0, t0 + Duration::minutes(25)),
            ])
            .await
            .unwrap();
        let engine = ExactAggregateEngine::new(store);

        let agg = engine
            .exact_aggregate(GroupKey::Device, "THERMO-01", t0, t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(agg.count, 3);
        assert_eq!(agg.min, Some(10.0));
        assert_eq!(agg.max, Some(30.0));
        assert_eq!(agg.avg, Some(20.0));
        assert_eq!(agg.p25, Some(15.0));
        assert_eq!(agg.p50, Some(20.0));
        assert_eq!(agg.p75, Some(25.0));
        assert!(!agg.approximate);
    }

    #[tokio::test]
    async fn empty_range_reports_zero_count() {
        let engine = ExactAggregateEngine::new(Arc::new(MemoryStore::new()));
        let t0 = ts("2024-03-01T10:00:00Z");
        let agg = engine
            .exact_aggregate(GroupKey::Zone, "attic", t0, t0 + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(agg.count, 0);
        assert_eq!(agg.min, None);
        assert_eq!(agg.avg, None);
        assert_eq!(agg.p95, None);
    }

    #[tokio::test]
    async fn device_type_is_queryable_exactly() {
        let store = Arc::new(MemoryStore::new());
        let t0 = ts("2024-03-01T10:00:00Z");
        store
            .insert_batch(&[
                Reading::new("HR-01", "HEART_RATE", Some("gym"), 70.0, t0),
                Reading::new("HR-11", "HEART_RATE", Some("home"), 90.0, t0),
            ])
            .await
            .unwrap();
        let agg = ExactAggregateEngine::new(store)
            .exact_aggregate(GroupKey::DeviceType, "HEART_RATE", t0, t0 + Duration::hours(30))
            .await
            .unwrap();
        assert_eq!(agg.count, 2);
        assert_eq!(agg.avg, Some(80.0));
    }
}
