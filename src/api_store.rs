//! [`MeasurementSource`] over the REST API.
//!
//! The upstream API only filters by center and distance, so every other
//! filter is re-applied here after the fetch, with the same boundary rules
//! as the database path: boxes are inclusive on every edge and time
//! windows are `[start, end)`.

use async_trait::async_trait;

use crate::api::ApiClient;
use crate::backend::{MeasurementSource, QueryContext};
use crate::error::{ApiError, QueryError, QueryResult};
use crate::filters::{AreaQuery, Limit, RadiusQuery, SensorQuery, TimeWindow, TrackQuery};
use crate::models::{Measurement, ResultPage, Sensor, Track, TrackSummary};
use crate::normalize::{measurement_from_record, sensor_from_record, track_summary_from_record, RawRecord};
use crate::router::{Operation, Source};

/// Over-fetch factor that leaves room for local re-filtering.
const FETCH_FACTOR: i64 = 2;
/// Upstream page size ceiling.
const MAX_PER_PAGE: i64 = 1000;

pub struct ApiStore {
    client: ApiClient,
    max_radius_m: f64,
}

impl ApiStore {
    pub fn new(client: ApiClient, max_radius_m: f64) -> Self {
        Self {
            client,
            max_radius_m,
        }
    }

    fn per_page(limit: Limit) -> i64 {
        (limit.get() * FETCH_FACTOR).min(MAX_PER_PAGE)
    }
}

fn measurements(records: &[RawRecord]) -> Vec<Measurement> {
    let parsed: Vec<Measurement> = records.iter().filter_map(measurement_from_record).collect();
    if parsed.len() < records.len() {
        tracing::debug!(
            skipped = records.len() - parsed.len(),
            "dropped upstream measurements without id, value, time or location"
        );
    }
    parsed
}

fn newest_first(items: &mut [Measurement]) {
    items.sort_by(|a, b| b.captured_at.cmp(&a.captured_at).then(a.id.cmp(&b.id)));
}

fn not_found_on_404(err: QueryError, what: String) -> QueryError {
    match err {
        QueryError::Upstream(ApiError::Status { status: 404, .. }) => QueryError::NotFound(what),
        other => other,
    }
}

#[async_trait]
impl MeasurementSource for ApiStore {
    fn source(&self) -> Source {
        Source::RestApi
    }

    async fn radius(
        &self,
        ctx: &QueryContext,
        q: &RadiusQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        let records = self
            .client
            .measurements(ctx, q.center, q.radius_m, &q.window, Self::per_page(q.limit))
            .await?;

        let mut items: Vec<Measurement> = measurements(&records)
            .into_iter()
            .filter(|m| q.window.contains(m.captured_at))
            .filter_map(|mut m| {
                let d = crate::geo::haversine_m(
                    q.center.latitude,
                    q.center.longitude,
                    m.latitude,
                    m.longitude,
                );
                (d <= q.radius_m).then(|| {
                    m.distance_m = Some(d);
                    m
                })
            })
            .collect();
        items.sort_by(|a, b| {
            a.distance_m
                .partial_cmp(&b.distance_m)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        items.truncate(q.limit.as_usize());
        Ok(ResultPage::new(items))
    }

    /// Approximated by a capped covering circle around the box centroid,
    /// then cut back to the exact box.
    async fn area(&self, ctx: &QueryContext, q: &AreaQuery) -> QueryResult<ResultPage<Measurement>> {
        let (center, radius_m) = q.bbox.fetch_circle(self.max_radius_m);
        if radius_m < q.bbox.covering_radius_m() {
            tracing::debug!(radius_m, "covering radius capped; box corners may be under-fetched");
        }
        let records = self
            .client
            .measurements(ctx, center, radius_m, &q.window, Self::per_page(q.limit))
            .await?;

        let mut items: Vec<Measurement> = measurements(&records)
            .into_iter()
            .filter(|m| q.bbox.contains(m.latitude, m.longitude))
            .filter(|m| q.window.contains(m.captured_at))
            .collect();
        newest_first(&mut items);
        items.truncate(q.limit.as_usize());
        Ok(ResultPage::new(items))
    }

    async fn tracks(
        &self,
        ctx: &QueryContext,
        q: &TrackQuery,
    ) -> QueryResult<ResultPage<TrackSummary>> {
        if q.uploader.is_some() || q.detector.is_some() {
            return Err(QueryError::BackendRequired {
                operation: Operation::ListTracks.name(),
                reason: "uploader and detector filters are not supported by the REST API".into(),
            });
        }
        let window = q.window()?;
        let records = self
            .client
            .imports(ctx, &window, Self::per_page(q.limit))
            .await?;

        let mut items: Vec<TrackSummary> = records
            .iter()
            .filter_map(track_summary_from_record)
            .filter(|t| uploaded_within(t, &window))
            .collect();
        items.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        items.truncate(q.limit.as_usize());
        Ok(ResultPage::new(items))
    }

    async fn track(&self, ctx: &QueryContext, track_id: &str, limit: Limit) -> QueryResult<Track> {
        let record = self
            .client
            .import(ctx, track_id)
            .await
            .map_err(|e| not_found_on_404(e, format!("track {}", track_id)))?;
        let summary = track_summary_from_record(&record)
            .ok_or_else(|| QueryError::NotFound(format!("track {}", track_id)))?;

        let records = self
            .client
            .track_measurements(ctx, track_id, limit.get())
            .await?;
        let mut items = measurements(&records);
        for m in &mut items {
            m.track_id = Some(summary.track_id.clone());
        }
        items.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then(a.id.cmp(&b.id)));
        items.truncate(limit.as_usize());

        Ok(Track {
            summary: summary.with_aggregates(&items),
            measurements: items,
        })
    }

    async fn sensors(&self, ctx: &QueryContext, q: &SensorQuery) -> QueryResult<ResultPage<Sensor>> {
        if q.bbox.is_some() || !q.device_ids.is_empty() {
            return Err(QueryError::BackendRequired {
                operation: Operation::ListSensors.name(),
                reason: "sensor filters are not supported by the REST API".into(),
            });
        }
        let records = self.client.devices(ctx).await?;
        let mut items: Vec<Sensor> = records.iter().filter_map(sensor_from_record).collect();
        items.truncate(q.limit.as_usize());
        Ok(ResultPage::new(items))
    }
}

/// Tracks without an upload time only pass an unbounded window.
fn uploaded_within(t: &TrackSummary, window: &TimeWindow) -> bool {
    match t.uploaded_at {
        Some(at) => window.contains(at),
        None => window.is_unbounded(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn summary(uploaded: Option<i32>) -> TrackSummary {
        TrackSummary {
            track_id: "1".into(),
            name: None,
            uploader: None,
            detector: None,
            uploaded_at: uploaded.map(|y| Utc.with_ymd_and_hms(y, 6, 1, 0, 0, 0).unwrap()),
            measurement_count: None,
            min_lat: None,
            max_lat: None,
            min_lon: None,
            max_lon: None,
            started_at: None,
            ended_at: None,
            avg_value: None,
        }
    }

    #[test]
    fn test_upload_window_filter() {
        let w = TimeWindow::calendar(2025, None).unwrap();
        assert!(uploaded_within(&summary(Some(2025)), &w));
        assert!(!uploaded_within(&summary(Some(2024)), &w));
        assert!(!uploaded_within(&summary(None), &w));
        assert!(uploaded_within(&summary(None), &TimeWindow::default()));
    }

    #[test]
    fn test_per_page_overfetches_with_ceiling() {
        let b = crate::filters::LimitBounds::new(1, 10_000, 25);
        assert_eq!(ApiStore::per_page(Limit::clamped(Some(10), b)), 20);
        assert_eq!(ApiStore::per_page(Limit::clamped(Some(5000), b)), 1000);
    }

    #[test]
    fn test_404_becomes_not_found() {
        let err = QueryError::from(ApiError::Status {
            url: "u".into(),
            status: 404,
            body: String::new(),
        });
        assert!(matches!(
            not_found_on_404(err, "track 9".into()),
            QueryError::NotFound(_)
        ));
    }
}
