//! Analytics federation over a SQLite store.
//!
//! One file holds the audit tables written by telemetry; the measurement
//! replica is attached to the same connection under a configurable schema
//! name, so aggregate queries run next to the logs without touching the
//! primary database. The pool has exactly one connection, which serializes
//! telemetry writes and analytics reads.
//!
//! Exclusion lists are the one place where user input is spliced into SQL
//! text: device IDs go through [`quote_literal`] and box bounds are
//! validated finite numbers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::backend::QueryContext;
use crate::config::AnalyticsConfig;
use crate::error::{QueryError, QueryResult};
use crate::filters::Limit;
use crate::geo::BoundingBox;
use crate::migrate;
use crate::models::{AiSessionLog, Measurement, QueryLogEntry};
use crate::normalize::{measurement_from_record, RawRecord, RawValue};
use crate::telemetry::TelemetrySink;

/// Quote a string as a SQL literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> QueryResult<String> {
    if value.contains('\0') {
        return Err(QueryError::invalid("exclude_device_ids", "must not contain NUL"));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

fn number(name: &str, v: f64) -> QueryResult<String> {
    if v.is_finite() {
        Ok(format!("{}", v))
    } else {
        Err(QueryError::invalid(name, "must be a finite number"))
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !s.starts_with(|c: char| c.is_ascii_digit())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Device and area exclusions for analytics queries.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub device_ids: Vec<String>,
    pub boxes: Vec<BoundingBox>,
}

impl Exclusions {
    /// Conditions to AND onto a `WHERE` clause.
    pub fn conditions(&self) -> QueryResult<Vec<String>> {
        let mut out = Vec::new();
        if !self.device_ids.is_empty() {
            let quoted = self
                .device_ids
                .iter()
                .map(|id| quote_literal(id))
                .collect::<QueryResult<Vec<_>>>()?;
            out.push(format!(
                "(device_id IS NULL OR device_id NOT IN ({}))",
                quoted.join(", ")
            ));
        }
        for b in &self.boxes {
            out.push(format!(
                "NOT (latitude BETWEEN {} AND {} AND longitude BETWEEN {} AND {})",
                number("min_lat", b.min_lat)?,
                number("max_lat", b.max_lat)?,
                number("min_lon", b.min_lon)?,
                number("max_lon", b.max_lon)?,
            ));
        }
        Ok(out)
    }
}

/// Grouping key for [`AnalyticsEngine::grouped_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Year,
    Month,
    Detector,
}

impl FromStr for GroupBy {
    type Err = QueryError;

    fn from_str(s: &str) -> QueryResult<Self> {
        match s {
            "year" => Ok(Self::Year),
            "month" => Ok(Self::Month),
            "detector" => Ok(Self::Detector),
            _ => Err(QueryError::invalid("group_by", "must be one of year, month, detector")),
        }
    }
}

impl GroupBy {
    fn expr(&self) -> &'static str {
        match self {
            Self::Year => "COALESCE(substr(captured_at, 1, 4), 'unknown')",
            Self::Month => "COALESCE(substr(captured_at, 1, 7), 'unknown')",
            Self::Detector => "COALESCE(NULLIF(detector, ''), 'unknown')",
        }
    }
}

/// Sort direction for [`AnalyticsEngine::extremes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremeOrder {
    Max,
    Min,
}

impl FromStr for ExtremeOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> QueryResult<Self> {
        match s {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            _ => Err(QueryError::invalid("order", "must be max or min")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsBucket {
    pub bucket: String,
    pub count: i64,
    pub avg_value: Option<f64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub calls: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub total_results: i64,
    pub last_called_at: String,
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    pool: SqlitePool,
    schema: String,
    has_replica: bool,
}

impl AnalyticsEngine {
    pub async fn open(config: &AnalyticsConfig) -> Result<Self> {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("analytics.path is not configured"))?;
        Self::open_path(path, config.attach_path.as_deref(), &config.attach_schema).await
    }

    pub async fn open_path(path: &Path, attach: Option<&Path>, schema: &str) -> Result<Self> {
        if !is_identifier(schema) {
            anyhow::bail!("invalid attach schema name '{}'", schema);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if let Some(attach) = attach {
            let file = attach.to_string_lossy().into_owned();
            let sql = format!("ATTACH DATABASE ? AS {}", schema);
            pool_options = pool_options.after_connect(move |conn, _meta| {
                let file = file.clone();
                let sql = sql.clone();
                Box::pin(async move {
                    sqlx::query(&sql).bind(file).execute(&mut *conn).await?;
                    Ok(())
                })
            });
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open analytics store: {}", path.display()))?;
        migrate::apply(&pool).await?;

        let has_replica = match attach {
            Some(_) => {
                let n: i64 = sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = 'measurements'",
                    schema
                ))
                .fetch_one(&pool)
                .await?;
                n > 0
            }
            None => false,
        };

        Ok(Self {
            pool,
            schema: schema.to_string(),
            has_replica,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn has_replica(&self) -> bool {
        self.has_replica
    }

    fn replica_table(&self) -> QueryResult<String> {
        if self.has_replica {
            Ok(format!("{}.measurements", self.schema))
        } else {
            Err(QueryError::Analytics(
                "no measurement replica is attached to the analytics store".into(),
            ))
        }
    }

    pub async fn insert_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_logs (tool_name, params_json, result_count, duration_ms, client_info, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.tool_name)
        .bind(entry.params.to_string())
        .bind(entry.result_count)
        .bind(entry.duration_ms)
        .bind(&entry.client_info)
        .bind(timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_session_log(&self, entry: &AiSessionLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO ai_session_logs (session_id, tool_name, query, duration_ms, commit_hash, error, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.session_id)
        .bind(&entry.tool_name)
        .bind(&entry.sanitized_query)
        .bind(entry.duration_ms)
        .bind(&entry.commit_hash)
        .bind(&entry.error)
        .bind(timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count, mean, min and max of `value` per bucket.
    pub async fn grouped_stats(
        &self,
        ctx: &QueryContext,
        group_by: GroupBy,
        exclusions: &Exclusions,
    ) -> QueryResult<Vec<StatsBucket>> {
        let table = self.replica_table()?;
        let mut conditions = vec!["value IS NOT NULL".to_string()];
        conditions.extend(exclusions.conditions()?);

        let sql = format!(
            "SELECT {} AS bucket, COUNT(*) AS count, AVG(value) AS avg_value, \
             CAST(MIN(value) AS REAL) AS min_value, CAST(MAX(value) AS REAL) AS max_value \
             FROM {} WHERE {} GROUP BY bucket ORDER BY bucket",
            group_by.expr(),
            table,
            conditions.join(" AND ")
        );
        ctx.record_query(sql.clone());

        let rows = ctx
            .run("radiation_stats", sqlx::query(&sql).fetch_all(&self.pool))
            .await?;
        Ok(rows
            .iter()
            .map(|row| StatsBucket {
                bucket: row.try_get("bucket").unwrap_or_else(|_| "unknown".to_string()),
                count: row.try_get("count").unwrap_or(0),
                avg_value: row.try_get("avg_value").ok().flatten(),
                min_value: row.try_get("min_value").ok().flatten(),
                max_value: row.try_get("max_value").ok().flatten(),
            })
            .collect())
    }

    /// Highest or lowest readings outside the exclusions.
    pub async fn extremes(
        &self,
        ctx: &QueryContext,
        order: ExtremeOrder,
        limit: Limit,
        exclusions: &Exclusions,
    ) -> QueryResult<Vec<Measurement>> {
        let table = self.replica_table()?;
        let mut conditions = vec![
            "value IS NOT NULL".to_string(),
            "latitude IS NOT NULL".to_string(),
            "longitude IS NOT NULL".to_string(),
        ];
        conditions.extend(exclusions.conditions()?);
        let direction = match order {
            ExtremeOrder::Max => "DESC",
            ExtremeOrder::Min => "ASC",
        };

        let sql = format!(
            "SELECT CAST(id AS INTEGER) AS id, CAST(value AS REAL) AS value, \
             CAST(unit AS TEXT) AS unit, CAST(captured_at AS TEXT) AS captured_at, \
             CAST(latitude AS REAL) AS latitude, CAST(longitude AS REAL) AS longitude, \
             CAST(device_id AS TEXT) AS device_id, CAST(detector AS TEXT) AS detector, \
             CAST(track_id AS TEXT) AS track_id \
             FROM {} WHERE {} ORDER BY value {}, id LIMIT ?",
            table,
            conditions.join(" AND "),
            direction
        );
        ctx.record_query(sql.clone());

        let rows = ctx
            .run(
                "extreme_readings",
                sqlx::query(&sql).bind(limit.get()).fetch_all(&self.pool),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| measurement_from_record(&replica_record(row)))
            .collect())
    }

    /// Per-tool call counts over the last `days` days.
    pub async fn usage_summary(
        &self,
        ctx: &QueryContext,
        days: i64,
        limit: Limit,
    ) -> QueryResult<Vec<ToolUsage>> {
        let since = timestamp(Utc::now() - ChronoDuration::days(days));
        let sql = "SELECT tool_name, COUNT(*) AS calls, AVG(duration_ms) AS avg_duration_ms, \
                   MAX(duration_ms) AS max_duration_ms, SUM(result_count) AS total_results, \
                   MAX(created_at) AS last_called_at \
                   FROM query_logs WHERE created_at >= ? \
                   GROUP BY tool_name ORDER BY calls DESC, tool_name LIMIT ?";
        ctx.record_query(sql);

        let rows = ctx
            .run(
                "query_usage",
                sqlx::query(sql)
                    .bind(since)
                    .bind(limit.get())
                    .fetch_all(&self.pool),
            )
            .await?;
        let usage = rows.iter().map(tool_usage).collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(usage)
    }

    pub async fn query_log_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM query_logs")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn tool_usage(row: &SqliteRow) -> Result<ToolUsage, sqlx::Error> {
    Ok(ToolUsage {
        tool_name: row.try_get("tool_name")?,
        calls: row.try_get("calls")?,
        avg_duration_ms: row.try_get::<Option<f64>, _>("avg_duration_ms")?.unwrap_or(0.0),
        max_duration_ms: row.try_get::<Option<i64>, _>("max_duration_ms")?.unwrap_or(0),
        total_results: row.try_get::<Option<i64>, _>("total_results")?.unwrap_or(0),
        last_called_at: row.try_get::<Option<String>, _>("last_called_at")?.unwrap_or_default(),
    })
}

fn replica_record(row: &SqliteRow) -> RawRecord {
    let mut r = RawRecord::new();
    r.insert("id", lift(row.try_get::<Option<i64>, _>("id"), RawValue::Int));
    for name in ["value", "latitude", "longitude"] {
        r.insert(name, lift(row.try_get::<Option<f64>, _>(name), RawValue::Float));
    }
    for name in ["unit", "captured_at", "device_id", "detector", "track_id"] {
        r.insert(name, lift(row.try_get::<Option<String>, _>(name), RawValue::Text));
    }
    r
}

fn lift<T>(res: Result<Option<T>, sqlx::Error>, f: impl FnOnce(T) -> RawValue) -> RawValue {
    match res {
        Ok(Some(v)) => f(v),
        _ => RawValue::Null,
    }
}

#[async_trait]
impl TelemetrySink for AnalyticsEngine {
    fn name(&self) -> &str {
        "analytics"
    }

    async fn write_query_log(&self, entry: &QueryLogEntry) -> Result<()> {
        self.insert_query_log(entry).await
    }

    async fn write_session_log(&self, entry: &AiSessionLog) -> Result<()> {
        self.insert_session_log(entry).await
    }
}
