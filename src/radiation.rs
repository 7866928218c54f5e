//! Geographic measurement search: `query_radiation` and `search_area`.
//!
//! Both tools prefer the database and fall back to the REST API. Results
//! from either path obey the same boundary rules (see [`crate::geo`]).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{QueryError, QueryResult};
use crate::filters::{AreaQuery, Limit, LimitBounds, RadiusQuery, TimeWindow};
use crate::geo::GeoPoint;
use crate::models::envelope;
use crate::params::{box_properties, opt_f64, opt_i64, req_bbox, req_f64, time_window};
use crate::router::{Filter, Operation, RouteRequest};
use crate::traits::{Tool, ToolContext};

pub const RADIUS_LIMIT: LimitBounds = LimitBounds::new(1, 200, 25);
pub const AREA_LIMIT: LimitBounds = LimitBounds::new(1, 200, 25);

pub const MIN_RADIUS_M: f64 = 25.0;
pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const DEFAULT_RADIUS_M: f64 = 1_500.0;

pub(crate) fn window_properties() -> Value {
    json!({
        "since": { "type": "string", "description": "Captured at or after (YYYY-MM-DD or RFC 3339)" },
        "until": { "type": "string", "description": "Captured before (YYYY-MM-DD or RFC 3339)" }
    })
}

pub(crate) fn with_window(mut filters: Vec<Filter>, window: &TimeWindow) -> Vec<Filter> {
    if !window.is_unbounded() {
        filters.push(Filter::TimeWindow);
    }
    filters
}

pub fn parse_radius_query(params: &Value) -> QueryResult<RadiusQuery> {
    let center = GeoPoint::new(req_f64(params, "lat")?, req_f64(params, "lon")?)?;
    let radius_m = opt_f64(params, "radius_m").unwrap_or(DEFAULT_RADIUS_M);
    if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&radius_m) {
        return Err(QueryError::invalid(
            "radius_m",
            format!("must be within [{}, {}]", MIN_RADIUS_M, MAX_RADIUS_M),
        ));
    }
    Ok(RadiusQuery {
        center,
        radius_m,
        window: time_window(params)?,
        limit: Limit::clamped(opt_i64(params, "limit"), RADIUS_LIMIT),
    })
}

pub fn parse_area_query(params: &Value) -> QueryResult<AreaQuery> {
    Ok(AreaQuery {
        bbox: req_bbox(params)?,
        window: time_window(params)?,
        limit: Limit::clamped(opt_i64(params, "limit"), AREA_LIMIT),
    })
}

/// Measurements within a radius of a point, nearest first.
pub struct QueryRadiationTool;

#[async_trait]
impl Tool for QueryRadiationTool {
    fn name(&self) -> &str {
        "query_radiation"
    }

    fn description(&self) -> &str {
        "Radiation measurements within a radius of a point, nearest first"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = json!({
            "lat": { "type": "number", "minimum": -90, "maximum": 90, "description": "Latitude of the center" },
            "lon": { "type": "number", "minimum": -180, "maximum": 180, "description": "Longitude of the center" },
            "radius_m": {
                "type": "number",
                "minimum": MIN_RADIUS_M,
                "maximum": MAX_RADIUS_M,
                "default": DEFAULT_RADIUS_M,
                "description": "Search radius in meters"
            },
            "limit": {
                "type": "integer",
                "minimum": RADIUS_LIMIT.min,
                "maximum": RADIUS_LIMIT.max,
                "default": RADIUS_LIMIT.default
            }
        });
        if let (Some(p), Value::Object(w)) = (props.as_object_mut(), window_properties()) {
            p.extend(w);
        }
        json!({
            "type": "object",
            "properties": props,
            "required": ["lat", "lon"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_radius_query(&params)?;
        let filters = with_window(vec![Filter::Radius], &q.window);
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::QueryRadiation, &filters))?;
        let page = backend.radius(ctx.query(), &q).await?;
        envelope(source, "measurements", page)
    }
}

/// Measurements inside a bounding box, newest first.
pub struct SearchAreaTool;

#[async_trait]
impl Tool for SearchAreaTool {
    fn name(&self) -> &str {
        "search_area"
    }

    fn description(&self) -> &str {
        "Radiation measurements inside a bounding box, newest first"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = box_properties("Search area");
        props.insert(
            "limit".into(),
            json!({
                "type": "integer",
                "minimum": AREA_LIMIT.min,
                "maximum": AREA_LIMIT.max,
                "default": AREA_LIMIT.default
            }),
        );
        if let Value::Object(w) = window_properties() {
            props.extend(w);
        }
        json!({
            "type": "object",
            "properties": props,
            "required": ["min_lat", "max_lat", "min_lon", "max_lon"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_area_query(&params)?;
        let filters = with_window(vec![Filter::BoundingBox], &q.window);
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::SearchArea, &filters))?;
        let page = backend.area(ctx.query(), &q).await?;
        envelope(source, "measurements", page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_defaults() {
        let q = parse_radius_query(&json!({"lat": 35.0, "lon": 139.0})).unwrap();
        assert_eq!(q.radius_m, DEFAULT_RADIUS_M);
        assert_eq!(q.limit.get(), 25);
        assert!(q.window.is_unbounded());
    }

    #[test]
    fn test_radius_out_of_range_rejected() {
        for r in [10.0, 50_001.0] {
            let err = parse_radius_query(&json!({"lat": 35.0, "lon": 139.0, "radius_m": r}))
                .unwrap_err();
            assert!(matches!(err, QueryError::InvalidParam { ref name, .. } if name == "radius_m"));
        }
    }

    #[test]
    fn test_bad_center_rejected() {
        let err = parse_radius_query(&json!({"lat": 91.0, "lon": 0.0})).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_limit_clamped_not_rejected() {
        let q = parse_radius_query(&json!({"lat": 0, "lon": 0, "limit": 100_000})).unwrap();
        assert_eq!(q.limit.get(), RADIUS_LIMIT.max);
    }

    #[test]
    fn test_area_requires_box() {
        assert!(parse_area_query(&json!({"min_lat": 35, "max_lat": 36})).is_err());
        let q = parse_area_query(&json!({
            "min_lat": 35, "max_lat": 36, "min_lon": 139, "max_lon": 140, "limit": 10
        }))
        .unwrap();
        assert_eq!(q.limit.get(), 10);
        assert!(q.bbox.contains(35.0, 140.0));
    }

    #[test]
    fn test_window_adds_filter() {
        let w = time_window(&json!({"since": "2020-01-01"})).unwrap();
        assert_eq!(
            with_window(vec![Filter::Radius], &w),
            vec![Filter::Radius, Filter::TimeWindow]
        );
        assert_eq!(
            with_window(vec![Filter::Radius], &TimeWindow::default()),
            vec![Filter::Radius]
        );
    }
}
