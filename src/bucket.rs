use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

pub const BUCKET_SECONDS: i64 = 3600;

pub fn bucket_width() -> ChronoDuration {
    ChronoDuration::seconds(BUCKET_SECONDS)
}

pub fn align_down(ts: DateTime<Utc>, interval_seconds: i64) -> DateTime<Utc> {
    let interval = interval_seconds.max(1);
    let interval_ms = interval * 1000;
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(interval_ms) * interval_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

/// Truncates to the start of the containing hour (minute, second and
/// sub-second parts zeroed).
pub fn floor_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    align_down(ts, BUCKET_SECONDS)
}

pub fn is_hour_aligned(ts: DateTime<Utc>) -> bool {
    floor_to_hour(ts) == ts
}

/// Hour bucket starts in `[start_bucket, end_bucket)`.
pub fn hour_buckets(
    start_bucket: DateTime<Utc>,
    end_bucket: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> {
    let first = floor_to_hour(start_bucket);
    std::iter::successors(Some(first), |prev| Some(*prev + bucket_width()))
        .take_while(move |bucket| *bucket < end_bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn floors_to_hour() {
        assert_eq!(
            floor_to_hour(ts("2024-05-01T10:59:59.999Z")),
            ts("2024-05-01T10:00:00Z")
        );
        assert_eq!(
            floor_to_hour(ts("2024-05-01T10:00:00Z")),
            ts("2024-05-01T10:00:00Z")
        );
        assert!(is_hour_aligned(ts("2024-05-01T00:00:00Z")));
        assert!(!is_hour_aligned(ts("2024-05-01T00:00:01Z")));
    }

    #[test]
    fn floors_before_epoch() {
        assert_eq!(
            floor_to_hour(ts("1969-12-31T23:30:00Z")),
            ts("1969-12-31T23:00:00Z")
        );
    }

    #[test]
    fn enumerates_half_open_hours() {
        let hours: Vec<_> =
            hour_buckets(ts("2024-05-01T10:00:00Z"), ts("2024-05-01T13:00:00Z")).collect();
        assert_eq!(
            hours,
            vec![
                ts("2024-05-01T10:00:00Z"),
                ts("2024-05-01T11:00:00Z"),
                ts("2024-05-01T12:00:00Z"),
            ]
        );
        assert_eq!(
            hour_buckets(ts("2024-05-01T10:00:00Z"), ts("2024-05-01T10:00:00Z")).count(),
            0
        );
    }
}
