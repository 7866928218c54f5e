//! Typed client for the upstream measurement REST API.
//!
//! One attempt per call, bounded by both the client timeout and the
//! caller's [`QueryContext`] deadline. Failures are classified into
//! [`ApiError`] variants so callers can tell a dead upstream from a
//! rejected request or a garbled body.

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

use crate::backend::QueryContext;
use crate::config::ApiConfig;
use crate::error::{ApiError, QueryError, QueryResult};
use crate::filters::TimeWindow;
use crate::geo::GeoPoint;
use crate::normalize::RawRecord;

/// Longest error body kept in [`ApiError::Status`].
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("radquery/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid api.base_url {:?}", config.base_url))?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "api.base_url {:?} cannot carry a path",
            config.base_url
        );
        Ok(Self { client, base_url })
    }

    /// `GET /measurements.json` around a point.
    pub async fn measurements(
        &self,
        ctx: &QueryContext,
        center: GeoPoint,
        distance_m: f64,
        window: &TimeWindow,
        per_page: i64,
    ) -> QueryResult<Vec<RawRecord>> {
        let mut query = vec![
            ("latitude", center.latitude.to_string()),
            ("longitude", center.longitude.to_string()),
            ("distance", format!("{:.0}", distance_m.ceil())),
            ("per_page", per_page.to_string()),
        ];
        push_window(&mut query, "captured_after", "captured_before", window);
        let body = self.get_json(ctx, &["measurements.json"], &query).await?;
        self.records(&["measurements.json"], body)
    }

    /// `GET /measurements.json?measurement_import_id=...`
    pub async fn track_measurements(
        &self,
        ctx: &QueryContext,
        track_id: &str,
        per_page: i64,
    ) -> QueryResult<Vec<RawRecord>> {
        let query = vec![
            ("measurement_import_id", track_id.to_string()),
            ("per_page", per_page.to_string()),
        ];
        let body = self.get_json(ctx, &["measurements.json"], &query).await?;
        self.records(&["measurements.json"], body)
    }

    /// `GET /bgeigie_imports.json`, newest first.
    pub async fn imports(
        &self,
        ctx: &QueryContext,
        window: &TimeWindow,
        per_page: i64,
    ) -> QueryResult<Vec<RawRecord>> {
        let mut query = vec![
            ("per_page", per_page.to_string()),
            ("order", "created_at desc".to_string()),
        ];
        push_window(&mut query, "uploaded_after", "uploaded_before", window);
        let body = self.get_json(ctx, &["bgeigie_imports.json"], &query).await?;
        self.records(&["bgeigie_imports.json"], body)
    }

    /// `GET /bgeigie_imports/{id}.json`
    pub async fn import(&self, ctx: &QueryContext, track_id: &str) -> QueryResult<RawRecord> {
        let file = format!("{}.json", track_id);
        let segments = ["bgeigie_imports", file.as_str()];
        let body = self.get_json(ctx, &segments, &[]).await?;
        RawRecord::from_json(body).ok_or_else(|| {
            ApiError::Malformed {
                url: self.url(&segments).to_string(),
                reason: "expected a JSON object".into(),
            }
            .into()
        })
    }

    /// `GET /devices.json`
    pub async fn devices(&self, ctx: &QueryContext) -> QueryResult<Vec<RawRecord>> {
        let body = self.get_json(ctx, &["devices.json"], &[]).await?;
        self.records(&["devices.json"], body)
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json(
        &self,
        ctx: &QueryContext,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> QueryResult<Value> {
        let url = self.url(segments).to_string();
        tracing::debug!(%url, "upstream request");
        ctx.run(&format!("GET {}", url), async {
            let resp = self
                .client
                .get(&url)
                .query(query)
                .send()
                .await
                .map_err(|e| ApiError::NoResponse {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

            let status = resp.status();
            if !status.is_success() {
                let body: String = resp
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(MAX_ERROR_BODY)
                    .collect();
                return Err(QueryError::from(ApiError::Status {
                    url: url.clone(),
                    status: status.as_u16(),
                    body,
                }));
            }

            let text = resp.text().await.map_err(|e| ApiError::NoResponse {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            serde_json::from_str::<Value>(&text).map_err(|e| {
                QueryError::from(ApiError::Malformed {
                    url: url.clone(),
                    reason: e.to_string(),
                })
            })
        })
        .await
    }

    fn records(&self, segments: &[&str], body: Value) -> QueryResult<Vec<RawRecord>> {
        match body {
            Value::Array(items) => Ok(items.into_iter().filter_map(RawRecord::from_json).collect()),
            _ => Err(ApiError::Malformed {
                url: self.url(segments).to_string(),
                reason: "expected a JSON array".into(),
            }
            .into()),
        }
    }
}

fn push_window(
    query: &mut Vec<(&'static str, String)>,
    after: &'static str,
    before: &'static str,
    window: &TimeWindow,
) {
    if let Some(start) = window.start {
        query.push((after, format_time(start)));
    }
    if let Some(end) = window.end {
        query.push((before, format_time(end)));
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
