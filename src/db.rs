use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use std::time::Duration;

use crate::config::Config;
use crate::normalize::{RawRecord, RawValue};
use crate::sql::SqlArg;

/// Open the primary database pool.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let url = config
        .db
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("db.url is not configured"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db.max_connections)
        .acquire_timeout(Duration::from_secs(config.db.connect_timeout_secs))
        .connect(url)
        .await?;

    Ok(pool)
}

/// Whether `measurements.detector` exists. Older replicas lack it.
pub async fn has_detector_column(pool: &PgPool) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.columns \
         WHERE table_name = 'measurements' AND column_name = 'detector')",
    )
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Bind positional arguments in order.
pub fn bind_args<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    args: &[SqlArg],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Int(v) => query.bind(*v),
            SqlArg::Float(v) => query.bind(*v),
            SqlArg::Text(v) => query.bind(v.clone()),
            SqlArg::Time(v) => query.bind(*v),
            SqlArg::TextList(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Convert a row into a [`RawRecord`] by inspecting column types.
///
/// Unknown types are read as text when the driver allows it and dropped
/// otherwise, so a surprising column never fails the whole row.
pub fn row_to_record(row: &PgRow) -> RawRecord {
    let mut record = RawRecord::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => opt(row.try_get::<Option<bool>, _>(i), RawValue::Bool),
            "INT2" => opt(row.try_get::<Option<i16>, _>(i), |v| RawValue::Int(v.into())),
            "INT4" => opt(row.try_get::<Option<i32>, _>(i), |v| RawValue::Int(v.into())),
            "INT8" => opt(row.try_get::<Option<i64>, _>(i), RawValue::Int),
            "FLOAT4" => opt(row.try_get::<Option<f32>, _>(i), |v| RawValue::Float(v.into())),
            "FLOAT8" => opt(row.try_get::<Option<f64>, _>(i), RawValue::Float),
            "BYTEA" => opt(row.try_get::<Option<Vec<u8>>, _>(i), RawValue::Bytes),
            "TIMESTAMPTZ" => opt(row.try_get::<Option<DateTime<Utc>>, _>(i), RawValue::Time),
            "TIMESTAMP" => opt(row.try_get::<Option<NaiveDateTime>, _>(i), |v| {
                RawValue::Time(v.and_utc())
            }),
            "JSON" | "JSONB" => opt(row.try_get::<Option<Value>, _>(i), RawValue::Json),
            "INT4[]" => opt(row.try_get::<Option<Vec<i32>>, _>(i), |v| {
                RawValue::Json(Value::from(v))
            }),
            "INT8[]" => opt(row.try_get::<Option<Vec<i64>>, _>(i), |v| {
                RawValue::Json(Value::from(v))
            }),
            _ => opt(row.try_get::<Option<String>, _>(i), RawValue::Text),
        };
        record.insert(column.name(), value);
    }
    record
}

fn opt<T>(res: Result<Option<T>, sqlx::Error>, f: impl FnOnce(T) -> RawValue) -> RawValue {
    match res {
        Ok(Some(v)) => f(v),
        _ => RawValue::Null,
    }
}
