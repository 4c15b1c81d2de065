//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Reads from the report API do not block consumer writes
//! - **Migrations**: Schema versioning with sqlx (`./migrations`)
//! - **Idempotent inserts**: `ON CONFLICT DO NOTHING` on `(source, observed_at)`

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, QueryRange, StorageBackend, StoreStats};
use super::error::{StorageError, StorageResult};
use super::schema::PersistedMetric;

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use fleetpulse::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./metrics.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("SQLite backend ready");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }

    fn row_to_metric(row: &SqliteRow) -> PersistedMetric {
        PersistedMetric {
            source: row.get("source"),
            value: row.get("value"),
            observed_at: Self::millis_to_timestamp(row.get("observed_at")),
        }
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, metric), fields(source = %metric.source))]
    async fn insert_metric(&self, metric: &PersistedMetric) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO metrics (source, observed_at, value)
            VALUES (?, ?, ?)
            ON CONFLICT (source, observed_at) DO NOTHING
            "#,
        )
        .bind(&metric.source)
        .bind(metric.observed_at.timestamp_millis())
        .bind(metric.value)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!("metric already stored at {}", metric.observed_at);
        }

        Ok(inserted)
    }

    #[instrument(skip(self), fields(source = %query.source))]
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<PersistedMetric>> {
        let limit = query
            .limit
            .map(|l| l.min(i64::MAX as usize) as i64)
            .unwrap_or(-1);

        let rows = sqlx::query(
            r#"
            SELECT source, observed_at, value
            FROM metrics
            WHERE source = ? AND observed_at >= ? AND observed_at <= ?
            ORDER BY observed_at ASC
            LIMIT ?
            "#,
        )
        .bind(&query.source)
        .bind(query.start.timestamp_millis())
        .bind(query.end.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_metric).collect())
    }

    #[instrument(skip(self))]
    async fn query_latest(
        &self,
        source: &str,
        limit: usize,
    ) -> StorageResult<Vec<PersistedMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT source, observed_at, value
            FROM metrics
            WHERE source = ?
            ORDER BY observed_at DESC
            LIMIT ?
            "#,
        )
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<_> = rows.iter().map(Self::row_to_metric).collect();
        // Chronological order (oldest first)
        results.reverse();
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn query_recent(&self, limit: usize) -> StorageResult<Vec<PersistedMetric>> {
        let rows = sqlx::query(
            r#"
            SELECT source, observed_at, value
            FROM metrics
            ORDER BY observed_at DESC, source DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut results: Vec<_> = rows.iter().map(Self::row_to_metric).collect();
        results.reverse();
        Ok(results)
    }

    async fn list_sources(&self) -> StorageResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT source FROM metrics ORDER BY source ASC")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(source,)| source).collect())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite backend operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<StoreStats> {
        let (total, sources, oldest, newest): (i64, i64, Option<i64>, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*), COUNT(DISTINCT source), MIN(observed_at), MAX(observed_at)
                FROM metrics
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            backend: "sqlite".to_string(),
            total_metrics: total.max(0) as u64,
            sources: sources.max(0) as u64,
            oldest: oldest.map(Self::millis_to_timestamp),
            newest: newest.map(Self::millis_to_timestamp),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
