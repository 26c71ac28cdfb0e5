use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use super::{StoreResult, TargetStore};
use crate::error::StoreError;
use crate::metrics::aggregate::{
    LatencyBucket, PercentileTriple, StatusPercentiles, UptimeRange, UptimeSummary, WindowMetrics,
    PERCENTILE_FRACTIONS,
};
use crate::model::{Frequency, MonitoredTarget, Region, Tick};

/// Upper bound on waiting for a pooled connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Rows per `INSERT` statement; 5 binds per row keeps us far below
/// Postgres' 65 535 bind parameter limit.
const ROWS_PER_INSERT: usize = 10_000;

/// Idempotent bootstrap of the tables the pipeline touches.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS region (
        id   UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        name TEXT NOT NULL UNIQUE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS website (
        id         UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        url        TEXT NOT NULL,
        frequency  TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_by TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS website_region (
        website_id UUID NOT NULL REFERENCES website (id) ON DELETE CASCADE,
        region_id  UUID NOT NULL REFERENCES region (id),
        PRIMARY KEY (website_id, region_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS website_tick (
        time             TIMESTAMPTZ NOT NULL,
        response_time_ms BIGINT,
        status           TEXT NOT NULL,
        region_id        UUID NOT NULL REFERENCES region (id),
        website_id       UUID NOT NULL REFERENCES website (id) ON DELETE CASCADE
    )"#,
    "CREATE INDEX IF NOT EXISTS website_tick_website_time_idx ON website_tick (website_id, time DESC)",
    "CREATE INDEX IF NOT EXISTS website_frequency_idx ON website (frequency)",
];

const TICK_COLUMNS: &str = "wt.time, wt.response_time_ms, wt.status, \
     wt.region_id::text AS region_id, wt.website_id::text AS website_id";

/// Epoch-aligned bucket of `$5` seconds.
const BUCKET: &str = "date_bin(make_interval(secs => $5), wt.time, TIMESTAMPTZ 'epoch')";

/// Bucket width as the seconds argument of `make_interval`.
fn interval_secs(width: chrono::Duration) -> f64 {
    width.num_milliseconds().max(1) as f64 / 1000.0
}

/// PostgreSQL-backed target store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create any missing tables and indexes.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("store schema ready");
        Ok(())
    }
}

fn tick_from_row(row: &PgRow) -> StoreResult<Tick> {
    let status: String = row.try_get("status")?;
    Ok(Tick {
        time: row.try_get("time")?,
        response_time_ms: row.try_get("response_time_ms")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        region_id: row.try_get("region_id")?,
        website_id: row.try_get("website_id")?,
    })
}

#[async_trait]
impl TargetStore for PgStore {
    async fn targets_by_frequency(&self, tier: Frequency) -> StoreResult<Vec<MonitoredTarget>> {
        let rows = sqlx::query(
            r#"
            SELECT
                w.id::text AS id,
                w.url,
                w.frequency,
                r.id::text AS region_id,
                r.name     AS region_name
            FROM website w
            JOIN website_region wr ON w.id = wr.website_id
            JOIN region r          ON wr.region_id = r.id
            WHERE w.frequency = $1
            ORDER BY w.id, r.name
            "#,
        )
        .bind(tier.as_str())
        .fetch_all(&self.pool)
        .await?;

        // Rows arrive sorted by target id: fold consecutive rows into one target.
        let mut targets: Vec<MonitoredTarget> = Vec::new();
        for row in &rows {
            let id: String = row.try_get("id")?;
            let region = Region {
                id: row.try_get("region_id")?,
                name: row.try_get("region_name")?,
            };

            match targets.last_mut() {
                Some(last) if last.id == id => last.regions.push(region),
                _ => {
                    let frequency: String = row.try_get("frequency")?;
                    targets.push(MonitoredTarget {
                        id,
                        url: row.try_get("url")?,
                        frequency: frequency.parse().map_err(StoreError::Corrupt)?,
                        regions: vec![region],
                    });
                }
            }
        }

        debug!(tier = %tier, count = targets.len(), "loaded targets");
        Ok(targets)
    }

    async fn region_by_name(&self, name: &str) -> StoreResult<Region> {
        let row = sqlx::query("SELECT id::text AS id, name FROM region WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("region `{name}`")))?;

        Ok(Region {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    async fn batch_insert_ticks(&self, ticks: &[Tick]) -> StoreResult<u64> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in ticks.chunks(ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO website_tick (time, response_time_ms, status, region_id, website_id) ",
            );
            builder.push_values(chunk, |mut row, tick| {
                row.push_bind(tick.time)
                    .push_bind(tick.response_time_ms)
                    .push_bind(tick.status.as_str())
                    .push_bind(tick.region_id.clone())
                    .push_unseparated("::uuid")
                    .push_bind(tick.website_id.clone())
                    .push_unseparated("::uuid");
            });

            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        // Dropping `tx` without commit rolls everything back.
        tx.commit().await?;
        Ok(inserted)
    }

    async fn latest_statuses(&self, website_id: &str, limit: usize) -> StoreResult<Vec<Tick>> {
        let query = format!(
            "SELECT {TICK_COLUMNS} FROM website_tick wt \
             WHERE wt.website_id = $1::uuid \
             ORDER BY wt.time DESC \
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(website_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut ticks = rows.iter().map(tick_from_row).collect::<StoreResult<Vec<_>>>()?;
        ticks.reverse();
        Ok(ticks)
    }

    async fn ticks_between(
        &self,
        website_id: &str,
        region: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Tick>> {
        let query = format!(
            "SELECT {TICK_COLUMNS} FROM website_tick wt \
             JOIN region r ON wt.region_id = r.id \
             WHERE wt.website_id = $1::uuid \
               AND wt.time BETWEEN $2 AND $3 \
               AND ($4::text IS NULL OR r.name = $4) \
             ORDER BY wt.time ASC"
        );
        let rows = sqlx::query(&query)
            .bind(website_id)
            .bind(from)
            .bind(to)
            .bind(region)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(tick_from_row).collect()
    }

    // ── Aggregates ──────────────────────────────────────────────

    async fn bucketed_latency(
        &self,
        website_id: &str,
        region: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        width: chrono::Duration,
    ) -> StoreResult<Vec<LatencyBucket>> {
        let query = format!(
            "SELECT {BUCKET} AS bucket, \
                    ROUND(AVG(wt.response_time_ms))::bigint AS avg_response_ms \
             FROM website_tick wt \
             JOIN region r ON wt.region_id = r.id \
             WHERE wt.website_id = $1::uuid \
               AND r.name = $2 \
               AND wt.time BETWEEN $3 AND $4 \
             GROUP BY bucket \
             ORDER BY bucket ASC"
        );
        let rows = sqlx::query(&query)
            .bind(website_id)
            .bind(region)
            .bind(from)
            .bind(to)
            .bind(interval_secs(width))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> StoreResult<LatencyBucket> {
                Ok(LatencyBucket {
                    bucket: row.try_get("bucket")?,
                    avg_response_ms: row.try_get("avg_response_ms")?,
                })
            })
            .collect()
    }

    async fn window_metrics(
        &self,
        website_id: &str,
        region: Option<&str>,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        bucket: chrono::Duration,
    ) -> StoreResult<WindowMetrics> {
        // Status votes: up = 1, down = 0, unknown ticks excluded.
        let query = format!(
            "WITH w AS ( \
                 SELECT wt.time, wt.response_time_ms, wt.status \
                 FROM website_tick wt \
                 JOIN region r ON wt.region_id = r.id \
                 WHERE wt.website_id = $1::uuid \
                   AND wt.time > $2 AND wt.time <= $3 \
                   AND ($4::text IS NULL OR r.name = $4) \
             ), \
             buckets AS ( \
                 SELECT 100.0 * AVG(CASE WHEN wt.status = 'up' THEN 1 ELSE 0 END) AS availability \
                 FROM w wt \
                 GROUP BY {BUCKET} \
             ) \
             SELECT \
                 (SELECT percentile_cont($6::double precision[]) \
                         WITHIN GROUP (ORDER BY response_time_ms::double precision) \
                  FROM w) AS response_time_ms, \
                 (SELECT percentile_disc($6::double precision[]) \
                         WITHIN GROUP (ORDER BY CASE status WHEN 'up' THEN 1 ELSE 0 END) \
                         FILTER (WHERE status <> 'unknown') \
                  FROM w) AS status, \
                 (SELECT percentile_cont($6::double precision[]) \
                         WITHIN GROUP (ORDER BY availability::double precision) \
                  FROM buckets) AS availability_pct"
        );
        let row = sqlx::query(&query)
            .bind(website_id)
            .bind(after)
            .bind(until)
            .bind(region)
            .bind(interval_secs(bucket))
            .bind(PERCENTILE_FRACTIONS.to_vec())
            .fetch_one(&self.pool)
            .await?;

        Ok(WindowMetrics {
            response_time_ms: PercentileTriple::from_ordered(row.try_get("response_time_ms")?),
            status: StatusPercentiles::from_votes(row.try_get("status")?),
            availability_pct: PercentileTriple::from_ordered(row.try_get("availability_pct")?),
        })
    }

    async fn uptime(&self, website_id: &str, range: UptimeRange) -> StoreResult<UptimeSummary> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)                                              AS total,
                COUNT(*) FILTER (WHERE status = 'up')                 AS up,
                COALESCE(AVG(response_time_ms)::double precision, 0)  AS avg_response_ms
            FROM website_tick
            WHERE website_id = $1::uuid
              AND time BETWEEN $2 AND $3
            "#,
        )
        .bind(website_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let up: i64 = row.try_get("up")?;
        Ok(UptimeSummary::from_counts(
            range,
            total.max(0) as u64,
            up.max(0) as u64,
            row.try_get("avg_response_ms")?,
        ))
    }
}
