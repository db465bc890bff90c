use super::{DeadLetter, DeadLetterSink, RawStore, RollupStore};
use crate::error::StoreError;
use crate::model::{GroupKey, HourlyRollup, Reading};
use crate::sketch::DigestSketch;
use crate::sum::ExactSum;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json as SqlJson;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

// Postgres caps a statement at 65535 bind parameters.
const READING_ROWS_PER_STATEMENT: usize = 10_000;
const ROLLUP_ROWS_PER_STATEMENT: usize = 5_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id bigserial primary key,
            device_id text not null,
            device_type text not null,
            zone text null,
            value double precision not null,
            ts timestamptz not null,
            inserted_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    for (name, column) in [
        ("sensor_readings_device_ts_idx", "device_id"),
        ("sensor_readings_zone_ts_idx", "zone"),
        ("sensor_readings_type_ts_idx", "device_type"),
    ] {
        let statement =
            format!("CREATE INDEX IF NOT EXISTS {name} ON sensor_readings ({column}, ts)");
        sqlx::query(&statement).execute(pool).await?;
    }
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hourly_rollups (
            group_key text not null,
            group_value text not null,
            bucket_start timestamptz not null,
            min_value double precision not null,
            max_value double precision not null,
            sum_value double precision not null,
            sum_partials double precision[] not null default '{}',
            average_value double precision not null,
            data_point_count bigint not null,
            percentile_summary jsonb not null,
            refreshed_at timestamptz not null default now(),
            primary key (group_key, group_value, bucket_start)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "ALTER TABLE hourly_rollups \
         ADD COLUMN IF NOT EXISTS sum_partials double precision[] not null default '{}'",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reading_dead_letters (
            id uuid primary key,
            batch jsonb not null,
            reason text not null,
            attempts int not null,
            failed_at timestamptz not null
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_offsets (
            partition_id text primary key,
            committed_seq bigint not null,
            updated_at timestamptz not null default now()
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn reading_from_row(row: &PgRow) -> Result<Reading, sqlx::Error> {
    Ok(Reading {
        device_id: row.try_get("device_id")?,
        device_type: row.try_get("device_type")?,
        zone: row.try_get("zone")?,
        value: row.try_get("value")?,
        timestamp: row.try_get("ts")?,
    })
}

// COLLATE "C" matches the byte order the rollup builder expects.
fn scan_sql(group_key: GroupKey) -> &'static str {
    match group_key {
        GroupKey::Device => {
            r#"
            SELECT device_id, device_type, zone, value, ts
            FROM sensor_readings
            ORDER BY device_id COLLATE "C", ts, id
            "#
        }
        GroupKey::Zone => {
            r#"
            SELECT device_id, device_type, zone, value, ts
            FROM sensor_readings
            WHERE zone IS NOT NULL
            ORDER BY zone COLLATE "C", ts, id
            "#
        }
        GroupKey::DeviceType => {
            r#"
            SELECT device_id, device_type, zone, value, ts
            FROM sensor_readings
            ORDER BY device_type COLLATE "C", ts, id
            "#
        }
    }
}

#[async_trait]
impl RawStore for PgStore {
    async fn insert_batch(&self, rows: &[Reading]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(READING_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO sensor_readings (device_id, device_type, zone, value, ts) ",
            );
            builder.push_values(chunk.iter(), |mut b, reading| {
                b.push_bind(&reading.device_id)
                    .push_bind(&reading.device_type)
                    .push_bind(&reading.zone)
                    .push_bind(reading.value)
                    .push_bind(reading.timestamp);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn query_range(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        let sql = format!(
            r#"
            SELECT device_id, device_type, zone, value, ts
            FROM sensor_readings
            WHERE {} = $1
              AND ts >= $2
              AND ts < $3
            ORDER BY ts, id
            "#,
            group_key.column()
        );
        let rows = sqlx::query(&sql)
            .bind(group_value)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| reading_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn scan_group(
        &self,
        group_key: GroupKey,
    ) -> Result<BoxStream<'_, Result<Reading, StoreError>>, StoreError> {
        let stream = sqlx::query(scan_sql(group_key))
            .fetch(&self.pool)
            .map(|row| {
                row.and_then(|row| reading_from_row(&row))
                    .map_err(StoreError::from)
            })
            .boxed();
        Ok(stream)
    }
}

#[async_trait]
impl RollupStore for PgStore {
    async fn query_buckets(
        &self,
        group_key: GroupKey,
        group_value: &str,
        start_bucket: DateTime<Utc>,
        end_bucket: DateTime<Utc>,
    ) -> Result<Vec<HourlyRollup>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT group_value, bucket_start, min_value, max_value, sum_value,
                   sum_partials, average_value, data_point_count, percentile_summary
            FROM hourly_rollups
            WHERE group_key = $1
              AND group_value = $2
              AND bucket_start >= $3
              AND bucket_start < $4
            ORDER BY bucket_start
            "#,
        )
        .bind(group_key.as_str())
        .bind(group_value)
        .bind(start_bucket)
        .bind(end_bucket)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let summary: SqlJson<DigestSketch> = row.try_get("percentile_summary")?;
            let partials: Vec<f64> = row.try_get("sum_partials")?;
            out.push(HourlyRollup {
                group_key,
                group_value: row.try_get("group_value")?,
                bucket_start: row.try_get("bucket_start")?,
                min: row.try_get("min_value")?,
                max: row.try_get("max_value")?,
                sum: row.try_get("sum_value")?,
                sum_partials: ExactSum::from_partials(partials),
                avg: row.try_get("average_value")?,
                count: row.try_get::<i64, _>("data_point_count")?.max(0) as u64,
                summary: summary.0,
            });
        }
        Ok(out)
    }

    async fn replace_all(
        &self,
        group_key: GroupKey,
        buckets: Vec<HourlyRollup>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM hourly_rollups WHERE group_key = $1")
            .bind(group_key.as_str())
            .execute(&mut *tx)
            .await?;

        for chunk in buckets.chunks(ROLLUP_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO hourly_rollups (group_key, group_value, bucket_start, \
                 min_value, max_value, sum_value, sum_partials, average_value, \
                 data_point_count, percentile_summary) ",
            );
            builder.push_values(chunk.iter(), |mut b, rollup| {
                b.push_bind(group_key.as_str())
                    .push_bind(&rollup.group_value)
                    .push_bind(rollup.bucket_start)
                    .push_bind(rollup.min)
                    .push_bind(rollup.max)
                    .push_bind(rollup.sum)
                    .push_bind(rollup.sum_partials.partials())
                    .push_bind(rollup.avg)
                    .push_bind(rollup.count as i64)
                    .push_bind(SqlJson(&rollup.summary));
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgStore {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reading_dead_letters (id, batch, reason, attempts, failed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(letter.id)
        .bind(SqlJson(&letter.batch))
        .bind(&letter.reason)
        .bind(letter.attempts as i32)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{drop_schema, setup_test_pool, test_database_url};
    use super::*;
    use crate::rollup::{build_hourly_rollups, RollupRefresher};
    use std::sync::Arc;
    use futures::TryStreamExt;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_pg_store_roundtrip() -> Result<()> {
        let Some(database_url) = test_database_url() else {
            return Ok(());
        };
        let schema = format!("rollups_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgStore::new(pool);

        let at = ts("2024-01-01T00:15:00Z");
        let reading = Reading::new("D1", "THERMOSTAT", Some("kitchen"), 21.5, at);
        // Duplicates are distinct rows.
        let written = store
            .insert_batch(&[reading.clone(), reading.clone()])
            .await?;
        assert_eq!(written, 2);

        let rows = store
            .query_range(
                GroupKey::Zone,
                "kitchen",
                ts("2024-01-01T00:00:00Z"),
                ts("2024-01-01T01:00:00Z"),
            )
            .await?;
        assert_eq!(rows, vec![reading.clone(), reading.clone()]);

        let scanned: Vec<Reading> = store
            .scan_group(GroupKey::Device)
            .await?
            .try_collect()
            .await?;
        let rollups = build_hourly_rollups(GroupKey::Device, scanned);
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].sum_partials.value(), 43.0);
        store.replace_all(GroupKey::Device, rollups.clone()).await?;
        store.replace_all(GroupKey::Device, rollups.clone()).await?;

        let stored = store
            .query_buckets(
                GroupKey::Device,
                "D1",
                ts("2024-01-01T00:00:00Z"),
                ts("2024-01-01T01:00:00Z"),
            )
            .await?;
        assert_eq!(stored, rollups);

        // Lower-case ids sort after upper-case ones in byte order, which the
        // streaming refresh relies on.
        store
            .insert_batch(&[
                Reading::new("a1", "THERMOSTAT", None, 0.1, at),
                Reading::new("B1", "THERMOSTAT", None, 0.2, at),
            ])
            .await?;
        let store = Arc::new(store);
        let refreshed = RollupRefresher::new(store.clone(), store.clone())
            .refresh_group(GroupKey::Device)
            .await?;
        assert_eq!(refreshed, 3);

        store
            .dead_letter(DeadLetter::new(vec![reading.into()], "disk full", 3))
            .await?;
        let dead: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reading_dead_letters")
            .fetch_one(store.pool())
            .await?;
        assert_eq!(dead, 1);

        drop_schema(&database_url, &schema).await?;
        Ok(())
    }
}
