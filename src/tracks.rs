//! Track tools: `list_tracks` and `get_track`.
//!
//! Listings follow the recency rule in [`crate::router`]: recent or
//! unbounded windows go to the REST API, older years to the database.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{QueryError, QueryResult};
use crate::filters::{Limit, LimitBounds, TrackQuery};
use crate::models::{envelope, single_envelope};
use crate::params::{opt_i64, opt_i64_in, opt_str, req_str};
use crate::router::{Operation, RouteRequest};
use crate::traits::{Tool, ToolContext};

pub const TRACK_LIST_LIMIT: LimitBounds = LimitBounds::new(1, 100, 20);
pub const TRACK_MEASUREMENT_LIMIT: LimitBounds = LimitBounds::new(1, 10_000, 1000);

/// Earliest upload year in the dataset.
pub const MIN_YEAR: i64 = 1990;

/// Parse `list_tracks` parameters against a given current year.
pub fn parse_track_query(params: &Value, this_year: i32) -> QueryResult<TrackQuery> {
    let year = opt_i64_in(params, "year", MIN_YEAR, this_year as i64 + 1)?;
    let month = opt_i64_in(params, "month", 1, 12)?;
    if month.is_some() && year.is_none() {
        return Err(QueryError::invalid("month", "requires year"));
    }
    Ok(TrackQuery {
        year: year.map(|y| y as i32),
        month: month.map(|m| m as u32),
        uploader: opt_str(params, "uploader"),
        detector: opt_str(params, "detector"),
        limit: Limit::clamped(opt_i64(params, "limit"), TRACK_LIST_LIMIT),
    })
}

/// Recent uploads, or uploads from a given year and month.
pub struct ListTracksTool;

#[async_trait]
impl Tool for ListTracksTool {
    fn name(&self) -> &str {
        "list_tracks"
    }

    fn description(&self) -> &str {
        "List uploaded measurement tracks, optionally by year, month, uploader or detector"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "year": { "type": "integer", "minimum": MIN_YEAR, "description": "Upload year" },
                "month": { "type": "integer", "minimum": 1, "maximum": 12, "description": "Upload month (requires year)" },
                "uploader": { "type": "string", "description": "Case-insensitive uploader name or email substring" },
                "detector": { "type": "string", "description": "Case-insensitive detector substring" },
                "limit": {
                    "type": "integer",
                    "minimum": TRACK_LIST_LIMIT.min,
                    "maximum": TRACK_LIST_LIMIT.max,
                    "default": TRACK_LIST_LIMIT.default
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_track_query(&params, ctx.backends().router.current_year())?;
        let filters = q.filters();
        let req = RouteRequest::new(Operation::ListTracks, &filters).with_year(q.year);
        let (source, backend) = ctx.select(&req)?;
        let page = backend.tracks(ctx.query(), &q).await?;
        envelope(source, "tracks", page)
    }
}

/// One track with its measurements in capture order.
pub struct GetTrackTool;

#[async_trait]
impl Tool for GetTrackTool {
    fn name(&self) -> &str {
        "get_track"
    }

    fn description(&self) -> &str {
        "Fetch one track with summary statistics and its measurements"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "track_id": { "type": "string", "description": "Track (import) identifier" },
                "limit": {
                    "type": "integer",
                    "minimum": TRACK_MEASUREMENT_LIMIT.min,
                    "maximum": TRACK_MEASUREMENT_LIMIT.max,
                    "default": TRACK_MEASUREMENT_LIMIT.default,
                    "description": "Maximum measurements returned"
                }
            },
            "required": ["track_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let track_id = req_str(&params, "track_id")?;
        let limit = Limit::clamped(opt_i64(&params, "limit"), TRACK_MEASUREMENT_LIMIT);
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::GetTrack, &[]))?;
        let track = backend.track(ctx.query(), &track_id, limit).await?;
        single_envelope(source, "track", &track)
    }
}
