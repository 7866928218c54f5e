//! Backend selection.
//!
//! [`SourceRouter::route`] is a pure function of the operation, the filters
//! the request carries, which backends are up, and the injected current
//! year. It never performs I/O.
//!
//! # Rules
//!
//! 1. If the operation or any of its filters is unsupported by the REST API,
//!    the database is required; its absence is a `BackendRequired` error.
//! 2. If the database is down, use the REST API.
//! 3. `list_tracks` with no year, or a year at or after `current_year - 1`,
//!    prefers the REST API (latest-upload ordering, no replica lag). Older
//!    bounded windows go to the database.
//! 4. Everything else prefers the database.
//!
//! A preferred backend that is disabled falls through to the other one.

use serde::Serialize;

use crate::error::{QueryError, QueryResult};

/// The two data sources a query can be served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Source {
    #[serde(rename = "database")]
    Database,
    #[serde(rename = "api")]
    RestApi,
}

impl Source {
    /// Label used in the `source` field of every response envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Database => "database",
            Source::RestApi => "api",
        }
    }

    /// Whether this source can serve `op` at all.
    pub fn supports_operation(&self, op: Operation) -> bool {
        match self {
            Source::Database => true,
            Source::RestApi => matches!(
                op,
                Operation::QueryRadiation
                    | Operation::SearchArea
                    | Operation::ListTracks
                    | Operation::GetTrack
                    | Operation::ListSensors
            ),
        }
    }

    /// Whether this source can apply `filter` for `op`, natively or by
    /// re-filtering locally after fetch.
    pub fn supports_filter(&self, op: Operation, filter: Filter) -> bool {
        match self {
            Source::Database => true,
            Source::RestApi => match (op, filter) {
                (_, Filter::Uploader) | (_, Filter::Detector) => false,
                (Operation::ListSensors, Filter::BoundingBox) => false,
                (Operation::ListSensors, Filter::DeviceId) => false,
                _ => true,
            },
        }
    }
}

/// Logical operations that need a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    QueryRadiation,
    SearchArea,
    ListTracks,
    GetTrack,
    ListSensors,
    SensorCurrent,
    SensorHistory,
    ListSpectra,
    GetSpectrum,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::QueryRadiation => "query_radiation",
            Operation::SearchArea => "search_area",
            Operation::ListTracks => "list_tracks",
            Operation::GetTrack => "get_track",
            Operation::ListSensors => "list_sensors",
            Operation::SensorCurrent => "sensor_current",
            Operation::SensorHistory => "sensor_history",
            Operation::ListSpectra => "list_spectra",
            Operation::GetSpectrum => "get_spectrum",
        }
    }

    fn no_rest_reason(&self) -> &'static str {
        match self {
            Operation::SensorCurrent | Operation::SensorHistory => {
                "sensor telemetry has no REST equivalent"
            }
            Operation::ListSpectra | Operation::GetSpectrum => {
                "spectral channel data has no REST equivalent"
            }
            _ => "operation has no REST equivalent",
        }
    }
}

/// Optional filters whose support differs between backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    BoundingBox,
    Radius,
    TimeWindow,
    YearMonth,
    Uploader,
    Detector,
    DeviceId,
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::BoundingBox => "bounding box",
            Filter::Radius => "radius",
            Filter::TimeWindow => "time window",
            Filter::YearMonth => "year/month",
            Filter::Uploader => "uploader",
            Filter::Detector => "detector",
            Filter::DeviceId => "device_id",
        }
    }
}

/// Externally observed backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub database: bool,
    pub api: bool,
}

/// One routing request.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub op: Operation,
    pub filters: &'a [Filter],
    /// Start year of the requested window; `None` means unbounded.
    pub year: Option<i32>,
}

impl<'a> RouteRequest<'a> {
    pub fn new(op: Operation, filters: &'a [Filter]) -> Self {
        Self {
            op,
            filters,
            year: None,
        }
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }
}

/// Chooses a [`Source`] per request.
///
/// A router built with [`SourceRouter::from_clock`] reads the wall-clock
/// year on every call, so a long-running server rolls over at New Year.
#[derive(Debug, Clone, Copy)]
pub struct SourceRouter {
    pinned_year: Option<i32>,
}

impl SourceRouter {
    /// Router with a fixed current year.
    pub fn new(current_year: i32) -> Self {
        Self {
            pinned_year: Some(current_year),
        }
    }

    /// Router that follows the wall clock.
    pub fn from_clock() -> Self {
        Self { pinned_year: None }
    }

    pub fn current_year(&self) -> i32 {
        self.pinned_year.unwrap_or_else(crate::filters::current_year)
    }

    /// Years at or after this value count as "recent".
    pub fn recency_cutoff(&self) -> i32 {
        self.current_year() - 1
    }

    pub fn route(&self, req: &RouteRequest<'_>, avail: Availability) -> QueryResult<Source> {
        let op = req.op;

        if !Source::RestApi.supports_operation(op) {
            return self.require_database(op, op.no_rest_reason().to_string(), avail);
        }
        if let Some(f) = req
            .filters
            .iter()
            .find(|f| !Source::RestApi.supports_filter(op, **f))
        {
            return self.require_database(
                op,
                format!("the {} filter is not supported by the REST API", f.name()),
                avail,
            );
        }

        let preferred = match op {
            Operation::ListTracks => match req.year {
                Some(y) if y < self.recency_cutoff() => Source::Database,
                _ => Source::RestApi,
            },
            _ => Source::Database,
        };

        match (preferred, avail.database, avail.api) {
            (Source::Database, true, _) => Ok(Source::Database),
            (Source::RestApi, _, true) => Ok(Source::RestApi),
            (_, true, false) => Ok(Source::Database),
            (_, false, true) => Ok(Source::RestApi),
            (_, false, false) => Err(QueryError::BackendUnavailable(op.name())),
        }
    }

    fn require_database(
        &self,
        op: Operation,
        reason: String,
        avail: Availability,
    ) -> QueryResult<Source> {
        if avail.database {
            Ok(Source::Database)
        } else {
            Err(QueryError::BackendRequired {
                operation: op.name(),
                reason,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: Availability = Availability {
        database: true,
        api: true,
    };
    const API_ONLY: Availability = Availability {
        database: false,
        api: true,
    };
    const DB_ONLY: Availability = Availability {
        database: true,
        api: false,
    };
    const NONE: Availability = Availability {
        database: false,
        api: false,
    };

    fn router() -> SourceRouter {
        SourceRouter::new(2026)
    }

    #[test]
    fn test_geo_queries_prefer_database() {
        let r = router();
        for op in [Operation::QueryRadiation, Operation::SearchArea, Operation::GetTrack] {
            assert_eq!(r.route(&RouteRequest::new(op, &[]), BOTH).unwrap(), Source::Database);
            assert_eq!(r.route(&RouteRequest::new(op, &[]), API_ONLY).unwrap(), Source::RestApi);
        }
    }

    #[test]
    fn test_db_only_operations_fail_fast_without_database() {
        let r = router();
        for op in [
            Operation::SensorCurrent,
            Operation::SensorHistory,
            Operation::ListSpectra,
            Operation::GetSpectrum,
        ] {
            let err = r.route(&RouteRequest::new(op, &[]), API_ONLY).unwrap_err();
            assert!(matches!(err, QueryError::BackendRequired { .. }), "{:?}", op);
            assert_eq!(err.http_status(), 503);
            assert_eq!(r.route(&RouteRequest::new(op, &[]), BOTH).unwrap(), Source::Database);
        }
    }

    #[test]
    fn test_recent_tracks_go_to_api() {
        let r = router();
        let req = RouteRequest::new(Operation::ListTracks, &[]);
        assert_eq!(r.route(&req, BOTH).unwrap(), Source::RestApi);

        let filters = [Filter::YearMonth];
        for year in [2025, 2026] {
            let req = RouteRequest::new(Operation::ListTracks, &filters).with_year(Some(year));
            assert_eq!(r.route(&req, BOTH).unwrap(), Source::RestApi, "year {}", year);
        }
    }

    #[test]
    fn test_historical_tracks_go_to_database() {
        let r = router();
        let filters = [Filter::YearMonth];
        let req = RouteRequest::new(Operation::ListTracks, &filters).with_year(Some(2024));
        assert_eq!(r.route(&req, BOTH).unwrap(), Source::Database);
        // Without the database the same request still succeeds via the API.
        assert_eq!(r.route(&req, API_ONLY).unwrap(), Source::RestApi);
    }

    #[test]
    fn test_recent_tracks_fall_back_to_database_when_api_disabled() {
        let r = router();
        let req = RouteRequest::new(Operation::ListTracks, &[]);
        assert_eq!(r.route(&req, DB_ONLY).unwrap(), Source::Database);
    }

    #[test]
    fn test_uploader_filter_requires_database() {
        let r = router();
        let filters = [Filter::Uploader];
        let req = RouteRequest::new(Operation::ListTracks, &filters);
        // Even a recent window goes to the database when the filter needs it.
        assert_eq!(r.route(&req, BOTH).unwrap(), Source::Database);
        let err = r.route(&req, API_ONLY).unwrap_err();
        assert!(err.to_string().contains("uploader"));
    }

    #[test]
    fn test_sensor_bbox_requires_database() {
        let r = router();
        let filters = [Filter::BoundingBox];
        let req = RouteRequest::new(Operation::ListSensors, &filters);
        assert!(matches!(
            r.route(&req, API_ONLY),
            Err(QueryError::BackendRequired { .. })
        ));
        let plain = RouteRequest::new(Operation::ListSensors, &[]);
        assert_eq!(r.route(&plain, API_ONLY).unwrap(), Source::RestApi);
    }

    #[test]
    fn test_no_backend() {
        let r = router();
        let err = r
            .route(&RouteRequest::new(Operation::SearchArea, &[]), NONE)
            .unwrap_err();
        assert!(matches!(err, QueryError::BackendUnavailable("search_area")));
    }

    #[test]
    fn test_clock_router_reads_year_per_call() {
        let r = SourceRouter::from_clock();
        assert_eq!(r.current_year(), crate::filters::current_year());
        assert_eq!(r.recency_cutoff(), crate::filters::current_year() - 1);
        assert_eq!(SourceRouter::new(2031).recency_cutoff(), 2030);

        // Two years back is historical whatever year the clock says.
        let old = crate::filters::current_year() - 2;
        let req = RouteRequest::new(Operation::ListTracks, &[]).with_year(Some(old));
        assert_eq!(r.route(&req, BOTH).unwrap(), Source::Database);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let r = router();
        let filters = [Filter::YearMonth, Filter::TimeWindow];
        let req = RouteRequest::new(Operation::ListTracks, &filters).with_year(Some(2019));
        let first = r.route(&req, BOTH).unwrap();
        for _ in 0..100 {
            assert_eq!(r.route(&req, BOTH).unwrap(), first);
        }
    }
}
