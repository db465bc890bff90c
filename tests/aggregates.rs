use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sensor_rollups::ingest::{BatchOutcome, ReadingIngestor, RetryPolicy};
use sensor_rollups::model::{GroupKey, InboundReading, Reading};
use sensor_rollups::pipeline::IngestStats;
use sensor_rollups::query::{ExactAggregateEngine, HybridAggregateEngine, QueryService};
use sensor_rollups::rollup::{RefreshStatus, RollupRefresher};
use sensor_rollups::store::{MemoryStore, RawStore};
use std::sync::Arc;

fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
}

fn ingestor(store: &Arc<MemoryStore>) -> ReadingIngestor {
    ReadingIngestor::new(
        store.clone(),
        store.clone(),
        RetryPolicy {
            base_delay: std::time::Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        Arc::new(IngestStats::new()),
    )
}

fn thermo(device: &str, zone: &str, value: f64, at: DateTime<Utc>) -> Reading {
    Reading::new(device, "THERMOSTAT", Some(zone), value, at)
}

#[tokio::test]
async fn ingested_readings_aggregate_exactly() {
    let store = Arc::new(MemoryStore::new());
    let t0 = ts("2024-04-02T08:00:00Z");
    let batch: Vec<InboundReading> = [10.0, 20.0, 30.0]
        .into_iter()
        .enumerate()
        .map(|(i, v)| thermo("D1", "lab", v, t0 + Duration::minutes(i as i64)).into())
        .collect();
    let outcome = ingestor(&store).ingest_batch(&batch).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Written { rows: 3, dropped: 0 });

    let service = QueryService::new(store.clone(), store.clone());
    let agg = service
        .exact_aggregate("device", "D1", t0, t0 + Duration::minutes(3))
        .await
        .unwrap();
    assert_eq!(agg.min, Some(10.0));
    assert_eq!(agg.max, Some(30.0));
    assert_eq!(agg.avg, Some(20.0));
    assert_eq!(agg.count, 3);
    assert_eq!(agg.p50, Some(20.0));
}

#[tokio::test]
async fn empty_zone_reports_absence() {
    let store = Arc::new(MemoryStore::new());
    let service = QueryService::new(store.clone(), store);
    let start = ts("2024-04-02T08:00:00Z");
    for end in [start + Duration::minutes(30), start + Duration::hours(6)] {
        let exact = service.exact_aggregate("zone", "Z", start, end).await.unwrap();
        let hybrid = service
            .partitioned_aggregate("zone", "Z", start, end)
            .await
            .unwrap();
        for agg in [exact, hybrid] {
            assert_eq!(agg.count, 0);
            assert_eq!(agg.min, None);
            assert_eq!(agg.max, None);
            assert_eq!(agg.avg, None);
            assert_eq!(agg.p50, None);
            assert_eq!(agg.p95, None);
        }
    }
}

#[tokio::test]
async fn middle_hour_is_served_from_rollups() {
    let store = Arc::new(MemoryStore::new());
    let t0 = ts("2024-04-02T10:00:00Z");
    let mut rows = Vec::new();
    // Edge hours: two rows inside the query range and one outside each.
    rows.push(thermo("D1", "lab", 5.0, t0 + Duration::minutes(10)));
    rows.push(thermo("D1", "lab", 6.0, t0 + Duration::minutes(40)));
    rows.push(thermo("D1", "lab", 7.0, t0 + Duration::minutes(50)));
    for minute in 0..12i32 {
        rows.push(thermo(
            "D1",
            "lab",
            20.0 + f64::from(minute),
            t0 + Duration::hours(1) + Duration::minutes(i64::from(minute) * 5),
        ));
    }
    rows.push(thermo("D1", "lab", 40.0, t0 + Duration::hours(2) + Duration::minutes(5)));
    rows.push(thermo("D1", "lab", 41.0, t0 + Duration::hours(2) + Duration::minutes(20)));
    rows.push(thermo("D1", "lab", 42.0, t0 + Duration::hours(2) + Duration::minutes(45)));
    store.insert_batch(&rows).await.unwrap();

    let report = RollupRefresher::new(store.clone(), store.clone())
        .refresh_all()
        .await;
    assert_eq!(report.status, RefreshStatus::Success);
    store.clear_range_scans();

    let start = t0 + Duration::minutes(30);
    let end = t0 + Duration::hours(2) + Duration::minutes(30);
    let hybrid = HybridAggregateEngine::new(store.clone(), store.clone())
        .partitioned_aggregate(GroupKey::Device, "D1", start, end)
        .await
        .unwrap();

    let middle_start = t0 + Duration::hours(1);
    let middle_end = t0 + Duration::hours(2);
    let scans = store.range_scans();
    assert!(!scans.is_empty());
    for scan in &scans {
        assert!(
            scan.end <= middle_start || scan.start >= middle_end,
            "raw scan {scan:?} overlaps the rollup hour"
        );
    }
    // head: 6, 7; body: 12 rows; tail: 40, 41
    assert_eq!(hybrid.count, 2 + 12 + 2);
    assert!(hybrid.approximate);

    let exact = ExactAggregateEngine::new(store.clone())
        .exact_aggregate(GroupKey::Device, "D1", start, end)
        .await
        .unwrap();
    assert_eq!(hybrid.count, exact.count);
    assert_eq!(hybrid.min, exact.min);
    assert_eq!(hybrid.max, exact.max);
    assert_eq!(hybrid.avg, exact.avg);
    let (approx, truth) = (hybrid.p50.unwrap(), exact.p50.unwrap());
    assert!((approx - truth).abs() <= 2.0, "p50 {approx} vs {truth}");
}

#[tokio::test]
async fn same_hour_ranges_match_exact_engine() {
    let store = Arc::new(MemoryStore::new());
    let t0 = ts("2024-04-02T14:00:00Z");
    let rows: Vec<Reading> = (0..57i32)
        .map(|i| {
            let value = 18.0 + f64::from((i * 37) % 23) * 0.37;
            let at = t0 + Duration::seconds(i64::from(i) * 61);
            thermo("THERMO-01", "living-room", value, at)
        })
        .collect();
    store.insert_batch(&rows).await.unwrap();
    RollupRefresher::new(store.clone(), store.clone())
        .refresh_all()
        .await;

    let service = QueryService::new(store.clone(), store.clone());
    for (start, end) in [
        (t0, t0 + Duration::hours(1)),
        (t0 + Duration::minutes(7), t0 + Duration::minutes(53)),
        (t0 + Duration::minutes(20), t0 + Duration::minutes(95)),
    ] {
        for group in [("device", "THERMO-01"), ("zone", "living-room")] {
            let exact = service
                .exact_aggregate(group.0, group.1, start, end)
                .await
                .unwrap();
            let hybrid = service
                .partitioned_aggregate(group.0, group.1, start, end)
                .await
                .unwrap();
            assert_eq!(exact, hybrid);
            assert!(exact.count > 0);
        }
    }
}

#[tokio::test]
async fn multi_hour_average_matches_exact_engine_bit_for_bit() {
    let t0 = ts("2024-04-02T00:00:00Z");
    for seed in [1u64, 7, 42, 2024] {
        let mut rng = StdRng::seed_from_u64(seed);
        let rows: Vec<Reading> = (0..300i64)
            .map(|minute| {
                let value = rng.gen_range(-300.0..700.0);
                thermo("D1", "lab", value, t0 + Duration::minutes(minute))
            })
            .collect();
        let store = Arc::new(MemoryStore::new());
        store.insert_batch(&rows).await.unwrap();
        RollupRefresher::new(store.clone(), store.clone())
            .refresh_all()
            .await;

        let service = QueryService::new(store.clone(), store.clone());
        let start = t0 + Duration::minutes(17);
        let end = t0 + Duration::minutes(281);
        for group in [("device", "D1"), ("zone", "lab")] {
            let exact = service
                .exact_aggregate(group.0, group.1, start, end)
                .await
                .unwrap();
            let hybrid = service
                .partitioned_aggregate(group.0, group.1, start, end)
                .await
                .unwrap();
            assert!(hybrid.approximate);
            assert_eq!(hybrid.count, exact.count);
            assert_eq!(hybrid.count, 281 - 17);
            assert_eq!(hybrid.min, exact.min);
            assert_eq!(hybrid.max, exact.max);
            assert_eq!(
                hybrid.avg.map(f64::to_bits),
                exact.avg.map(f64::to_bits),
                "seed {seed}: {:?} vs {:?}",
                hybrid.avg,
                exact.avg
            );
        }
    }
}

#[tokio::test]
async fn duplicate_readings_are_counted_twice() {
    let store = Arc::new(MemoryStore::new());
    let t0 = ts("2024-04-02T08:00:00Z");
    let reading: InboundReading = thermo("D9", "attic", 12.5, t0).into();
    let ingestor = ingestor(&store);
    ingestor.ingest_batch(&[reading.clone()]).await.unwrap();
    ingestor.ingest_batch(&[reading]).await.unwrap();

    let service = QueryService::new(store.clone(), store.clone());
    let agg = service
        .exact_aggregate("zone", "attic", t0, t0 + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(agg.count, 2);
    assert_eq!(store.readings().await.len(), 2);
}

#[tokio::test]
async fn partitioned_aggregate_rejects_bad_requests() {
    let store = Arc::new(MemoryStore::new());
    let service = QueryService::new(store.clone(), store);
    let t0 = ts("2024-04-02T08:00:00Z");
    assert!(service
        .partitioned_aggregate("zone", "lab", t0 + Duration::hours(1), t0)
        .await
        .is_err());
    assert!(service
        .partitioned_aggregate("floor", "lab", t0, t0 + Duration::hours(1))
        .await
        .is_err());
}
