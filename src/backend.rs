//! Backend seam shared by the database and REST API paths.
//!
//! [`MeasurementSource`] is implemented by [`crate::pg_store::PgStore`] and
//! [`crate::api_store::ApiStore`]; tests substitute in-memory fakes.
//! [`Backends`] bundles the live handles and is passed to every tool
//! through [`crate::traits::ToolContext`].

use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::analytics::AnalyticsEngine;
use crate::api::ApiClient;
use crate::api_store::ApiStore;
use crate::config::Config;
use crate::error::{QueryError, QueryResult};
use crate::filters::{AreaQuery, HistoryQuery, Limit, RadiusQuery, SensorQuery, SpectrumQuery, TrackQuery};
use crate::models::{Measurement, ResultPage, Sensor, Spectrum, Track, TrackSummary};
use crate::pg_store::PgStore;
use crate::router::{Availability, Operation, RouteRequest, Source, SourceRouter};
use crate::telemetry::{HttpLogSink, Telemetry, TelemetrySink};

/// Per-invocation deadline plus the last statement executed.
///
/// Cloning shares the statement slot, so the dispatcher can read what a
/// handler executed after it returns.
#[derive(Debug, Clone)]
pub struct QueryContext {
    deadline: Instant,
    last_query: Arc<Mutex<Option<String>>>,
}

impl QueryContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            last_query: Arc::new(Mutex::new(None)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Await `fut`, failing with [`QueryError::Timeout`] past the deadline.
    pub async fn run<T, E, F>(&self, what: &str, fut: F) -> QueryResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<QueryError>,
    {
        match tokio::time::timeout_at(self.deadline, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(QueryError::Timeout(what.to_string())),
        }
    }

    pub fn record_query(&self, statement: impl Into<String>) {
        if let Ok(mut slot) = self.last_query.lock() {
            *slot = Some(statement.into());
        }
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().ok().and_then(|slot| slot.clone())
    }
}

fn db_only(op: Operation, reason: &str) -> QueryError {
    QueryError::BackendRequired {
        operation: op.name(),
        reason: reason.to_string(),
    }
}

/// One backend able to answer measurement queries.
///
/// Database-only operations default to `BackendRequired`, which is what
/// the REST implementation inherits.
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    fn source(&self) -> Source;

    async fn radius(&self, ctx: &QueryContext, q: &RadiusQuery)
        -> QueryResult<ResultPage<Measurement>>;

    async fn area(&self, ctx: &QueryContext, q: &AreaQuery) -> QueryResult<ResultPage<Measurement>>;

    async fn tracks(&self, ctx: &QueryContext, q: &TrackQuery)
        -> QueryResult<ResultPage<TrackSummary>>;

    async fn track(&self, ctx: &QueryContext, track_id: &str, limit: Limit) -> QueryResult<Track>;

    async fn sensors(&self, ctx: &QueryContext, q: &SensorQuery) -> QueryResult<ResultPage<Sensor>>;

    async fn sensor_current(
        &self,
        _ctx: &QueryContext,
        _q: &SensorQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        Err(db_only(Operation::SensorCurrent, "sensor telemetry has no REST equivalent"))
    }

    async fn sensor_history(
        &self,
        _ctx: &QueryContext,
        _q: &HistoryQuery,
    ) -> QueryResult<ResultPage<Measurement>> {
        Err(db_only(Operation::SensorHistory, "sensor telemetry has no REST equivalent"))
    }

    async fn spectra(
        &self,
        _ctx: &QueryContext,
        _q: &SpectrumQuery,
    ) -> QueryResult<ResultPage<Spectrum>> {
        Err(db_only(Operation::ListSpectra, "spectral channel data has no REST equivalent"))
    }

    async fn spectrum(&self, _ctx: &QueryContext, _measurement_id: i64) -> QueryResult<Spectrum> {
        Err(db_only(Operation::GetSpectrum, "spectral channel data has no REST equivalent"))
    }
}

/// Live backend handles. Constructed once at startup and shared.
#[derive(Clone)]
pub struct Backends {
    pub config: Arc<Config>,
    pub database: Option<Arc<dyn MeasurementSource>>,
    pub api: Option<Arc<dyn MeasurementSource>>,
    pub analytics: Option<AnalyticsEngine>,
    pub telemetry: Telemetry,
    pub router: SourceRouter,
}

impl Backends {
    /// No backends at all; tools that need data fail with 503.
    pub fn empty(config: Arc<Config>) -> Self {
        Self {
            config,
            database: None,
            api: None,
            analytics: None,
            telemetry: Telemetry::disabled(),
            router: SourceRouter::from_clock(),
        }
    }

    pub fn with_database(mut self, source: Arc<dyn MeasurementSource>) -> Self {
        self.database = Some(source);
        self
    }

    pub fn with_api(mut self, source: Arc<dyn MeasurementSource>) -> Self {
        self.api = Some(source);
        self
    }

    pub fn with_analytics(mut self, engine: AnalyticsEngine) -> Self {
        self.analytics = Some(engine);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_router(mut self, router: SourceRouter) -> Self {
        self.router = router;
        self
    }

    /// Connect everything the config names. A backend that fails to come up
    /// is logged and left unavailable; startup never fails on it.
    pub async fn connect(config: Arc<Config>) -> anyhow::Result<Self> {
        let mut backends = Self::empty(config.clone());

        if config.db.url.is_some() {
            match PgStore::connect(&config).await {
                Ok(store) => {
                    tracing::info!(detector_column = store.has_detector(), "database available");
                    backends.database = Some(Arc::new(store));
                }
                Err(e) => tracing::warn!(error = %e, "database unavailable"),
            }
        }

        if config.api.enabled {
            let client = ApiClient::new(&config.api)?;
            tracing::info!(base_url = %config.api.base_url, "REST API enabled");
            backends.api = Some(Arc::new(ApiStore::new(client, config.api.max_radius_m)));
        }

        let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::new();
        if config.analytics.path.is_some() {
            match AnalyticsEngine::open(&config.analytics).await {
                Ok(engine) => {
                    tracing::info!(replica = engine.has_replica(), "analytics store available");
                    sinks.push(Arc::new(engine.clone()));
                    backends.analytics = Some(engine);
                }
                Err(e) => tracing::warn!(error = %e, "analytics store unavailable"),
            }
        }
        if let Some(url) = &config.telemetry.forward_url {
            sinks.push(Arc::new(HttpLogSink::new(url.clone())?));
        }
        backends.telemetry = Telemetry::new(sinks, &config.telemetry);

        Ok(backends)
    }

    pub fn availability(&self) -> Availability {
        Availability {
            database: self.database.is_some(),
            api: self.api.is_some(),
        }
    }

    /// Route a request and hand back the chosen backend.
    pub fn select(
        &self,
        req: &RouteRequest<'_>,
    ) -> QueryResult<(Source, Arc<dyn MeasurementSource>)> {
        let source = self.router.route(req, self.availability())?;
        let backend = match source {
            Source::Database => self.database.clone(),
            Source::RestApi => self.api.clone(),
        };
        backend
            .map(|b| (source, b))
            .ok_or(QueryError::BackendUnavailable(req.op.name()))
    }

    pub fn analytics(&self) -> QueryResult<&AnalyticsEngine> {
        self.analytics
            .as_ref()
            .ok_or_else(|| QueryError::Analytics("analytics store is not configured".into()))
    }

    /// Fresh context bounded by `server.request_timeout_secs`.
    pub fn query_context(&self) -> QueryContext {
        QueryContext::with_timeout(Duration::from_secs(self.config.server.request_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_yields_timeout() {
        let ctx = QueryContext::with_timeout(Duration::from_millis(50));
        let res: QueryResult<()> = ctx
            .run("slow query", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, QueryError>(())
            })
            .await;
        let err = res.unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
        assert_eq!(err.http_status(), 408);
    }

    #[tokio::test]
    async fn test_context_records_last_query() {
        let ctx = QueryContext::with_timeout(Duration::from_secs(1));
        let shared = ctx.clone();
        assert!(ctx.last_query().is_none());
        shared.record_query("SELECT 1");
        shared.record_query("SELECT 2");
        assert_eq!(ctx.last_query().as_deref(), Some("SELECT 2"));
    }

    #[test]
    fn test_empty_backends_select_fails() {
        let b = Backends::empty(Arc::new(Config::minimal()));
        let req = RouteRequest::new(Operation::SearchArea, &[]);
        assert!(matches!(b.select(&req), Err(QueryError::BackendUnavailable(_))));
        let req = RouteRequest::new(Operation::GetSpectrum, &[]);
        assert!(matches!(b.select(&req), Err(QueryError::BackendRequired { .. })));
    }
}
