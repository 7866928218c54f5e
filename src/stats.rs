//! Analytics tools and backend status.
//!
//! `radiation_stats`, `extreme_readings` and `query_usage` run on the
//! analytics store (see [`crate::analytics`]). `db_info` and `radq status`
//! report which backends came up, without touching any of them.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::analytics::{Exclusions, ExtremeOrder, GroupBy};
use crate::backend::Backends;
use crate::error::QueryResult;
use crate::filters::{Limit, LimitBounds};
use crate::params::{box_list, box_list_schema, opt_i64, opt_str, string_list};
use crate::traits::{Tool, ToolContext};

pub const EXTREME_LIMIT: LimitBounds = LimitBounds::new(1, 100, 10);
pub const USAGE_LIMIT: LimitBounds = LimitBounds::new(1, 100, 20);
pub const USAGE_DAYS: LimitBounds = LimitBounds::new(1, 365, 7);

const ANALYTICS_SOURCE: &str = "analytics";

pub fn parse_exclusions(params: &Value) -> QueryResult<Exclusions> {
    Ok(Exclusions {
        device_ids: string_list(params, "exclude_device_ids"),
        boxes: box_list(params, "exclude_boxes")?,
    })
}

fn exclusion_properties() -> Value {
    json!({
        "exclude_device_ids": {
            "type": "array",
            "items": { "type": "string" },
            "description": "Devices to leave out"
        },
        "exclude_boxes": box_list_schema()
    })
}

fn schema_with_exclusions(mut props: Value) -> Value {
    if let (Some(p), Value::Object(ex)) = (props.as_object_mut(), exclusion_properties()) {
        p.extend(ex);
    }
    json!({ "type": "object", "properties": props })
}

// ============ radiation_stats ============

pub struct RadiationStatsTool;

#[async_trait]
impl Tool for RadiationStatsTool {
    fn name(&self) -> &str {
        "radiation_stats"
    }

    fn description(&self) -> &str {
        "Count, mean, min and max dose rate grouped by year, month or detector"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        schema_with_exclusions(json!({
            "group_by": {
                "type": "string",
                "enum": ["year", "month", "detector"],
                "default": "year"
            }
        }))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let group_by: GroupBy = opt_str(&params, "group_by")
            .as_deref()
            .unwrap_or("year")
            .parse()?;
        let exclusions = parse_exclusions(&params)?;
        let buckets = ctx
            .analytics()?
            .grouped_stats(ctx.query(), group_by, &exclusions)
            .await?;
        Ok(json!({
            "count": buckets.len(),
            "source": ANALYTICS_SOURCE,
            "buckets": buckets,
        }))
    }
}

// ============ extreme_readings ============

pub struct ExtremeReadingsTool;

#[async_trait]
impl Tool for ExtremeReadingsTool {
    fn name(&self) -> &str {
        "extreme_readings"
    }

    fn description(&self) -> &str {
        "Highest or lowest readings, excluding given devices and areas"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        schema_with_exclusions(json!({
            "order": { "type": "string", "enum": ["max", "min"], "default": "max" },
            "limit": {
                "type": "integer",
                "minimum": EXTREME_LIMIT.min,
                "maximum": EXTREME_LIMIT.max,
                "default": EXTREME_LIMIT.default
            }
        }))
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let order: ExtremeOrder = opt_str(&params, "order")
            .as_deref()
            .unwrap_or("max")
            .parse()?;
        let limit = Limit::clamped(opt_i64(&params, "limit"), EXTREME_LIMIT);
        let exclusions = parse_exclusions(&params)?;
        let measurements = ctx
            .analytics()?
            .extremes(ctx.query(), order, limit, &exclusions)
            .await?;
        Ok(json!({
            "count": measurements.len(),
            "source": ANALYTICS_SOURCE,
            "measurements": measurements,
        }))
    }
}

// ============ query_usage ============

pub struct QueryUsageTool;

#[async_trait]
impl Tool for QueryUsageTool {
    fn name(&self) -> &str {
        "query_usage"
    }

    fn description(&self) -> &str {
        "Per-tool call counts and latency over the last N days"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "days": {
                    "type": "integer",
                    "minimum": USAGE_DAYS.min,
                    "maximum": USAGE_DAYS.max,
                    "default": USAGE_DAYS.default
                },
                "limit": {
                    "type": "integer",
                    "minimum": USAGE_LIMIT.min,
                    "maximum": USAGE_LIMIT.max,
                    "default": USAGE_LIMIT.default
                }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let days = Limit::clamped(opt_i64(&params, "days"), USAGE_DAYS);
        let limit = Limit::clamped(opt_i64(&params, "limit"), USAGE_LIMIT);
        let tools = ctx
            .analytics()?
            .usage_summary(ctx.query(), days.get(), limit)
            .await?;
        Ok(json!({
            "count": tools.len(),
            "source": ANALYTICS_SOURCE,
            "days": days.get(),
            "tools": tools,
        }))
    }
}

// ============ db_info / status ============

/// Availability of one backend as seen at startup.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: &'static str,
    pub available: bool,
    pub detail: String,
}

pub fn backend_status(backends: &Backends) -> Vec<BackendStatus> {
    let config = &backends.config;
    let database = BackendStatus {
        name: "database",
        available: backends.database.is_some(),
        detail: match (&config.db.url, backends.database.is_some()) {
            (None, _) => "not configured".to_string(),
            (Some(_), true) => "PostGIS".to_string(),
            (Some(_), false) => "connection failed at startup".to_string(),
        },
    };
    let api = BackendStatus {
        name: "api",
        available: backends.api.is_some(),
        detail: if config.api.enabled {
            config.api.base_url.clone()
        } else {
            "disabled".to_string()
        },
    };
    let analytics = BackendStatus {
        name: "analytics",
        available: backends.analytics.is_some(),
        detail: match &backends.analytics {
            Some(engine) if engine.has_replica() => {
                format!("replica attached as {}", config.analytics.attach_schema)
            }
            Some(_) => "audit logs only, no replica attached".to_string(),
            None if config.analytics.path.is_none() => "not configured".to_string(),
            None => "open failed at startup".to_string(),
        },
    };
    vec![database, api, analytics]
}

pub struct DbInfoTool;

#[async_trait]
impl Tool for DbInfoTool {
    fn name(&self) -> &str {
        "db_info"
    }

    fn description(&self) -> &str {
        "Report which data backends are available and how queries are routed"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let backends = backend_status(ctx.backends());
        Ok(json!({
            "count": backends.len(),
            "backends": backends,
            "telemetry": ctx.backends().telemetry.is_enabled(),
            "recent_track_cutoff_year": ctx.backends().router.recency_cutoff(),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

/// Print backend availability for `radq status`.
pub fn print_status(backends: &Backends) {
    println!("radquery {} backend status", env!("CARGO_PKG_VERSION"));
    println!("================================");
    println!();
    println!("  {:<12} {:<10} DETAIL", "BACKEND", "STATE");
    println!("  {}", "-".repeat(60));
    for s in backend_status(backends) {
        println!(
            "  {:<12} {:<10} {}",
            s.name,
            if s.available { "up" } else { "down" },
            s.detail
        );
    }
    println!();
    println!(
        "  Telemetry:   {}",
        if backends.telemetry.is_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );
    println!(
        "  Recent tracks (REST preferred): {} and later",
        backends.router.recency_cutoff()
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    #[test]
    fn test_exclusions_parsed() {
        let ex = parse_exclusions(&json!({
            "exclude_device_ids": ["a", "b"],
            "exclude_boxes": [{"min_lat": 37, "max_lat": 38, "min_lon": 140, "max_lon": 141}]
        }))
        .unwrap();
        assert_eq!(ex.device_ids, vec!["a", "b"]);
        assert_eq!(ex.boxes.len(), 1);
    }

    #[test]
    fn test_bad_exclusion_box_rejected() {
        let err = parse_exclusions(&json!({
            "exclude_boxes": [{"min_lat": 37, "max_lat": 38}]
        }))
        .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_status_without_backends() {
        let mut config = Config::minimal();
        config.api.enabled = false;
        let status = backend_status(&Backends::empty(Arc::new(config)));
        assert!(status.iter().all(|s| !s.available));
        assert_eq!(status[0].detail, "not configured");
        assert_eq!(status[1].detail, "disabled");
    }

    #[test]
    fn test_schemas_carry_exclusions() {
        for schema in [
            RadiationStatsTool.parameters_schema(),
            ExtremeReadingsTool.parameters_schema(),
        ] {
            assert_eq!(schema["properties"]["exclude_boxes"]["type"], "array");
            assert_eq!(
                schema["properties"]["exclude_device_ids"]["items"]["type"],
                "string"
            );
        }
    }
}
