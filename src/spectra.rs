//! Gamma spectrum tools: `list_spectra` and `get_spectrum`.
//!
//! Database only. Listings omit the channel array; the single fetch
//! includes it.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{QueryError, QueryResult};
use crate::filters::{Limit, LimitBounds, SpectrumQuery};
use crate::models::{envelope, single_envelope};
use crate::params::{box_properties, opt_bbox, opt_i64, opt_str};
use crate::router::{Filter, Operation, RouteRequest};
use crate::traits::{Tool, ToolContext};

pub const SPECTRUM_LIMIT: LimitBounds = LimitBounds::new(1, 100, 20);

pub fn parse_spectrum_query(params: &Value) -> QueryResult<SpectrumQuery> {
    Ok(SpectrumQuery {
        bbox: opt_bbox(params)?,
        limit: Limit::clamped(opt_i64(params, "limit"), SPECTRUM_LIMIT),
    })
}

/// Accepts an integer, or a numeric string from a path segment.
pub fn parse_measurement_id(params: &Value) -> QueryResult<i64> {
    if let Some(id) = opt_i64(params, "measurement_id") {
        return Ok(id);
    }
    opt_str(params, "measurement_id")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| QueryError::invalid("measurement_id", "expected an integer"))
}

pub struct ListSpectraTool;

#[async_trait]
impl Tool for ListSpectraTool {
    fn name(&self) -> &str {
        "list_spectra"
    }

    fn description(&self) -> &str {
        "List gamma spectra metadata, optionally within an area"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = box_properties("Optional area");
        props.insert(
            "limit".into(),
            json!({
                "type": "integer",
                "minimum": SPECTRUM_LIMIT.min,
                "maximum": SPECTRUM_LIMIT.max,
                "default": SPECTRUM_LIMIT.default
            }),
        );
        json!({ "type": "object", "properties": props })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_spectrum_query(&params)?;
        let filters: Vec<Filter> = q.bbox.iter().map(|_| Filter::BoundingBox).collect();
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::ListSpectra, &filters))?;
        let page = backend.spectra(ctx.query(), &q).await?;
        envelope(source, "spectra", page)
    }
}

pub struct GetSpectrumTool;

#[async_trait]
impl Tool for GetSpectrumTool {
    fn name(&self) -> &str {
        "get_spectrum"
    }

    fn description(&self) -> &str {
        "Fetch one gamma spectrum including raw channel counts"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "measurement_id": { "type": "integer", "description": "Parent measurement id" }
            },
            "required": ["measurement_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let id = parse_measurement_id(&params)?;
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::GetSpectrum, &[]))?;
        let spectrum = backend.spectrum(ctx.query(), id).await?;
        single_envelope(source, "spectrum", &spectrum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_id_forms() {
        assert_eq!(parse_measurement_id(&json!({"measurement_id": 42})).unwrap(), 42);
        assert_eq!(parse_measurement_id(&json!({"measurement_id": "42"})).unwrap(), 42);
        assert!(parse_measurement_id(&json!({"measurement_id": "x"})).is_err());
    }

    #[test]
    fn test_spectrum_query_defaults() {
        let q = parse_spectrum_query(&json!({})).unwrap();
        assert!(q.bbox.is_none());
        assert_eq!(q.limit.get(), 20);
    }
}
