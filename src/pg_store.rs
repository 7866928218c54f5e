//! [`MeasurementSource`] over the PostGIS database.
//!
//! Every list query goes through [`SelectBuilder`], so the page and its
//! `total_available` count share one predicate. Rows are converted with
//! [`db::row_to_record`] and normalized like REST objects.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;

use crate::backend::{MeasurementSource, QueryContext};
use crate::config::Config;
use crate::db;
use crate::error::{QueryError, QueryResult};
use crate::filters::{
    AreaQuery, HistoryQuery, Limit, LimitBounds, RadiusQuery, SensorQuery, SpectrumQuery, TrackQuery,
};
use crate::models::{Measurement, ResultPage, Sensor, Spectrum, Track, TrackSummary};
use crate::normalize::{
    measurement_from_record, sensor_from_record, spectrum_from_record, track_summary_from_record,
    RawRecord, RawValue,
};
use crate::router::Source;
use crate::sql::{like_pattern, make_point, Predicate, QueryPair, SelectBuilder, SqlArg, Statement};

const SINGLE: LimitBounds = LimitBounds::new(1, 1, 1);

const TRACK_FROM: &str = "tracks t LEFT JOIN LATERAL (\
    SELECT COUNT(*) AS measurement_count, \
    MIN(m.latitude) AS min_lat, MAX(m.latitude) AS max_lat, \
    MIN(m.longitude) AS min_lon, MAX(m.longitude) AS max_lon, \
    MIN(m.captured_at) AS started_at, MAX(m.captured_at) AS ended_at, \
    AVG(m.value)::float8 AS avg_value \
    FROM measurements m WHERE m.track_id = t.track_id) agg ON TRUE";

const TRACK_COLUMNS: &str = "t.track_id, t.name, t.uploader, t.detector, \
    t.created_at AS uploaded_at, t.user_id, agg.measurement_count, \
    agg.min_lat, agg.max_lat, agg.min_lon, agg.max_lon, \
    agg.started_at, agg.ended_at, agg.avg_value";

const SPECTRUM_FROM: &str = "spectra s JOIN measurements m ON m.id = s.measurement_id";

const SPECTRUM_COLUMNS: &str = "s.measurement_id, s.channel_count, s.energy_min_kev, \
    s.energy_max_kev, s.device_model, s.calibration, m.captured_at, m.latitude, m.longitude";

pub struct PgStore {
    pool: PgPool,
    has_detector: bool,
}

impl PgStore {
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        let has_detector = match db::has_detector_column(&pool).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "detector column probe failed; omitting detector");
                false
            }
        };
        Ok(Self { pool, has_detector })
    }

    pub fn has_detector(&self) -> bool {
        self.has_detector
    }

    fn measurement_columns(&self) -> String {
        format!(
            "m.id, m.value, m.unit, m.captured_at, m.latitude, m.longitude, m.device_id, \
             m.height, {}, m.track_id, m.has_spectrum",
            if self.has_detector {
                "m.detector"
            } else {
                "NULL::text AS detector"
            }
        )
    }

    /// Run a data statement and its count statement.
    async fn page(
        &self,
        ctx: &QueryContext,
        what: &str,
        pair: QueryPair,
    ) -> QueryResult<(Vec<RawRecord>, i64)> {
        ctx.record_query(pair.select.sql.clone());
        let select =
            db::bind_args(sqlx::query(&pair.select.sql), &pair.select.args).fetch_all(&self.pool);
        let count =
            db::bind_args(sqlx::query(&pair.count.sql), &pair.count.args).fetch_one(&self.pool);
        let (rows, count_row) = ctx.run(what, async { tokio::try_join!(select, count) }).await?;
        let total: i64 = count_row.try_get(0)?;
        Ok((rows.iter().map(db::row_to_record).collect(), total))
    }

    async fn rows(
        &self,
        ctx: &QueryContext,
        what: &str,
        stmt: Statement,
    ) -> QueryResult<Vec<RawRecord>> {
        ctx.record_query(stmt.sql.clone());
        let rows = ctx
            .run(
                what,
                db::bind_args(sqlx::query(&stmt.sql), &stmt.args).fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.iter().map(db::row_to_record).collect())
    }

    /// Decode a page of rows. Rows that fail normalization are dropped and
    /// taken out of `total` too, so the count keeps describing the rows a
    /// caller can actually receive.
    fn decode_page<T>(
        records: &[RawRecord],
        total: i64,
        what: &str,
        decode: fn(&RawRecord) -> Option<T>,
    ) -> ResultPage<T> {
        let items: Vec<T> = records.iter().filter_map(decode).collect();
        let skipped = records.len() - items.len();
        if skipped > 0 {
            tracing::warn!(skipped, what, "dropped database rows that could not be decoded");
        }
        let total = (total - skipped as i64).max(items.len() as i64);
        ResultPage::with_total(items, total)
    }

    /// Attach account username and email to track rows.
    ///
    /// A failed lookup leaves attribution to the free-text uploader.
    async fn attribute(&self, ctx: &QueryContext, records: &mut [RawRecord]) {
        let ids: Vec<i64> = records
            .iter()
            .filter_map(|r| r.int(&["user_id"]))
            .collect();
        if ids.is_empty() {
            return;
        }
        let lookup = sqlx::query("SELECT id, username, email FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool);
        let rows = match ctx.run("users lookup", lookup).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "uploader attribution unavailable");
                return;
            }
        };
        let accounts: HashMap<i64, (Option<String>, Option<String>)> = rows
            .iter()
            .filter_map(|row| {
                let id: i64 = row.try_get("id").ok()?;
                let username: Option<String> = row.try_get("username").ok().flatten();
                let email: Option<String> = row.try_get("email").ok().flatten();
                Some((id, (username, email)))
            })
            .collect();
        for r in records.iter_mut() {
            let Some((username, email)) = r.int(&["user_id"]).and_then(|id| accounts.get(&id))
            else {
                continue;
            };
            if let Some(u) = username {
                r.insert("user_username", RawValue::Text(u.clone()));
            }
            if let Some(e) = email {
                r.insert("user_email", RawValue::Text(e.clone()));
            }
        }
    }

    fn fixed_sensor_predicate(q: &SensorQuery) -> Predicate {
        let mut p = Predicate::new()
            .and("m.device_id IS NOT NULL", vec![])
            .and("m.track_id IS NULL", vec![])
            .any_text("m.device_id", &q.device_ids);
        if let Some(bbox) = &q.bbox {
            p = p.within_box("m.location", bbox);
        }
        p
    }
}

#[async_trait]
impl MeasurementSource for PgStore {
    fn source(&self) -> Source {
        Source::Database
    }

    async fn radius(
        &self,
        ctx: &QueryContext,
        q: &RadiusQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        let columns = format!(
            "{}, ST_Distance(m.location::geography, {}::geography, false) AS distance_m",
            self.measurement_columns(),
            make_point()
        );
        let pair = SelectBuilder::new(columns, "measurements m")
            .column_args(vec![
                SqlArg::Float(q.center.longitude),
                SqlArg::Float(q.center.latitude),
            ])
            .filter(
                Predicate::new()
                    .within_radius("m.location", q.center, q.radius_m)
                    .time_window("m.captured_at", &q.window),
            )
            .order_by("distance_m, m.id")
            .build(q.limit);
        let (records, total) = self.page(ctx, "query_radiation", pair).await?;
        Ok(Self::decode_page(&records, total, "measurement", measurement_from_record))
    }

    async fn area(&self, ctx: &QueryContext, q: &AreaQuery) -> QueryResult<ResultPage<Measurement>> {
        let pair = SelectBuilder::new(self.measurement_columns(), "measurements m")
            .filter(
                Predicate::new()
                    .within_box("m.location", &q.bbox)
                    .time_window("m.captured_at", &q.window),
            )
            .order_by("m.captured_at DESC, m.id")
            .build(q.limit);
        let (records, total) = self.page(ctx, "search_area", pair).await?;
        Ok(Self::decode_page(&records, total, "measurement", measurement_from_record))
    }

    async fn tracks(
        &self,
        ctx: &QueryContext,
        q: &TrackQuery,
    ) -> QueryResult<ResultPage<TrackSummary>> {
        let mut p = Predicate::new().time_window("t.created_at", &q.window()?);
        if let Some(term) = &q.uploader {
            let pattern = like_pattern(term);
            p = p.and(
                "(t.uploader ILIKE ? ESCAPE '\\' OR t.user_id IN (\
                 SELECT u.id FROM users u WHERE u.username ILIKE ? ESCAPE '\\' \
                 OR u.email ILIKE ? ESCAPE '\\'))",
                vec![
                    SqlArg::Text(pattern.clone()),
                    SqlArg::Text(pattern.clone()),
                    SqlArg::Text(pattern),
                ],
            );
        }
        if let Some(term) = &q.detector {
            p = p.ilike("t.detector", term);
        }
        let pair = SelectBuilder::new(TRACK_COLUMNS, TRACK_FROM)
            .filter(p)
            .order_by("t.created_at DESC NULLS LAST, t.track_id")
            .build(q.limit);

        let (mut records, total) = self.page(ctx, "list_tracks", pair).await?;
        self.attribute(ctx, &mut records).await;
        Ok(Self::decode_page(&records, total, "track", track_summary_from_record))
    }

    async fn track(&self, ctx: &QueryContext, track_id: &str, limit: Limit) -> QueryResult<Track> {
        let head = SelectBuilder::new(TRACK_COLUMNS, TRACK_FROM)
            .filter(Predicate::new().eq_text("t.track_id", track_id))
            .build(Limit::clamped(None, SINGLE));
        let mut heads = self.rows(ctx, "get_track", head.select).await?;
        self.attribute(ctx, &mut heads).await;
        let summary = heads
            .first()
            .and_then(track_summary_from_record)
            .ok_or_else(|| QueryError::NotFound(format!("track {}", track_id)))?;

        let body = SelectBuilder::new(self.measurement_columns(), "measurements m")
            .filter(Predicate::new().eq_text("m.track_id", track_id))
            .order_by("m.captured_at, m.id")
            .build(limit);
        let records = self.rows(ctx, "get_track", body.select).await?;
        let measurements = records.iter().filter_map(measurement_from_record).collect();

        Ok(Track {
            summary,
            measurements,
        })
    }

    async fn sensors(&self, ctx: &QueryContext, q: &SensorQuery) -> QueryResult<ResultPage<Sensor>> {
        let columns = format!(
            "DISTINCT ON (m.device_id) m.device_id, m.latitude, m.longitude, \
             m.captured_at AS last_reading_at, m.value AS last_value, m.unit, {}",
            if self.has_detector {
                "m.detector"
            } else {
                "NULL::text AS detector"
            }
        );
        let pair = SelectBuilder::new(columns, "measurements m")
            .count_expr("COUNT(DISTINCT m.device_id)")
            .filter(Self::fixed_sensor_predicate(q))
            .order_by("m.device_id, m.captured_at DESC")
            .build(q.limit);
        let (records, total) = self.page(ctx, "list_sensors", pair).await?;
        Ok(Self::decode_page(&records, total, "sensor", sensor_from_record))
    }

    async fn sensor_current(
        &self,
        ctx: &QueryContext,
        q: &SensorQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        let columns = format!("DISTINCT ON (m.device_id) {}", self.measurement_columns());
        let pair = SelectBuilder::new(columns, "measurements m")
            .count_expr("COUNT(DISTINCT m.device_id)")
            .filter(Self::fixed_sensor_predicate(q))
            .order_by("m.device_id, m.captured_at DESC")
            .build(q.limit);
        let (records, total) = self.page(ctx, "sensor_current", pair).await?;
        Ok(Self::decode_page(&records, total, "measurement", measurement_from_record))
    }

    async fn sensor_history(
        &self,
        ctx: &QueryContext,
        q: &HistoryQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        let pair = SelectBuilder::new(self.measurement_columns(), "measurements m")
            .filter(
                Predicate::new()
                    .eq_text("m.device_id", &q.device_id)
                    .time_window("m.captured_at", &q.window),
            )
            .order_by("m.captured_at DESC, m.id")
            .build(q.limit);
        let (records, total) = self.page(ctx, "sensor_history", pair).await?;
        Ok(Self::decode_page(&records, total, "measurement", measurement_from_record))
    }

    async fn spectra(
        &self,
        ctx: &QueryContext,
        q: &SpectrumQuery,
    ) -> QueryResult<ResultPage<Spectrum>> {
        let mut p = Predicate::new();
        if let Some(bbox) = &q.bbox {
            p = p.within_box("m.location", bbox);
        }
        let pair = SelectBuilder::new(SPECTRUM_COLUMNS, SPECTRUM_FROM)
            .filter(p)
            .order_by("m.captured_at DESC, s.measurement_id")
            .build(q.limit);
        let (records, total) = self.page(ctx, "list_spectra", pair).await?;
        Ok(Self::decode_page(&records, total, "spectrum", spectrum_from_record))
    }

    async fn spectrum(&self, ctx: &QueryContext, measurement_id: i64) -> QueryResult<Spectrum> {
        let pair = SelectBuilder::new(format!("{}, s.channels", SPECTRUM_COLUMNS), SPECTRUM_FROM)
            .filter(Predicate::new().and("s.measurement_id = ?", vec![SqlArg::Int(measurement_id)]))
            .build(Limit::clamped(None, SINGLE));
        let records = self.rows(ctx, "get_spectrum", pair.select).await?;
        records
            .first()
            .and_then(spectrum_from_record)
            .ok_or_else(|| QueryError::NotFound(format!("spectrum for measurement {}", measurement_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reading(id: i64) -> RawRecord {
        RawRecord::new()
            .with("id", RawValue::Int(id))
            .with("value", RawValue::Float(35.0))
            .with("unit", RawValue::Text("cpm".into()))
            .with(
                "captured_at",
                RawValue::Time(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap()),
            )
            .with("latitude", RawValue::Float(35.5))
            .with("longitude", RawValue::Float(139.5))
    }

    #[test]
    fn test_undecodable_row_leaves_total() {
        let broken = RawRecord::new()
            .with("id", RawValue::Int(3))
            .with("value", RawValue::Float(35.0));
        let records = vec![reading(1), reading(2), broken];

        let page = PgStore::decode_page(&records, 3, "measurement", measurement_from_record);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_available, Some(2));
    }

    #[test]
    fn test_total_beyond_page_is_kept() {
        let broken = RawRecord::new().with("id", RawValue::Int(9));
        let records = vec![reading(1), broken];

        let page = PgStore::decode_page(&records, 40, "measurement", measurement_from_record);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total_available, Some(39));
    }

    #[test]
    fn test_total_never_below_items() {
        let page = PgStore::decode_page(&[reading(1), reading(2)], 0, "measurement", measurement_from_record);
        assert_eq!(page.total_available, Some(2));
    }
}
