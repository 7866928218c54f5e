//! Fixed-sensor tools: `list_sensors`, `sensor_current`, `sensor_history`.
//!
//! A sensor is not stored anywhere. It is materialized from the newest
//! measurement of each device whose readings carry no track.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::QueryResult;
use crate::filters::{HistoryQuery, Limit, LimitBounds, SensorQuery};
use crate::models::envelope;
use crate::params::{box_properties, opt_bbox, opt_i64, req_str, string_list, time_window};
use crate::radiation::{window_properties, with_window};
use crate::router::{Operation, RouteRequest};
use crate::traits::{Tool, ToolContext};

pub const SENSOR_LIMIT: LimitBounds = LimitBounds::new(1, 500, 50);
pub const HISTORY_LIMIT: LimitBounds = LimitBounds::new(1, 5000, 500);

pub fn parse_sensor_query(params: &Value) -> QueryResult<SensorQuery> {
    Ok(SensorQuery {
        bbox: opt_bbox(params)?,
        device_ids: string_list(params, "device_ids"),
        limit: Limit::clamped(opt_i64(params, "limit"), SENSOR_LIMIT),
    })
}

pub fn parse_history_query(params: &Value) -> QueryResult<HistoryQuery> {
    Ok(HistoryQuery {
        device_id: req_str(params, "device_id")?,
        window: time_window(params)?,
        limit: Limit::clamped(opt_i64(params, "limit"), HISTORY_LIMIT),
    })
}

fn limit_schema(bounds: LimitBounds) -> Value {
    json!({
        "type": "integer",
        "minimum": bounds.min,
        "maximum": bounds.max,
        "default": bounds.default
    })
}

/// Fixed devices with their last reading.
pub struct ListSensorsTool;

#[async_trait]
impl Tool for ListSensorsTool {
    fn name(&self) -> &str {
        "list_sensors"
    }

    fn description(&self) -> &str {
        "List fixed-location sensors with their most recent reading"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = box_properties("Optional area");
        props.insert("limit".into(), limit_schema(SENSOR_LIMIT));
        json!({ "type": "object", "properties": props })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        // device_ids is not part of this tool's surface.
        let q = SensorQuery {
            device_ids: Vec::new(),
            ..parse_sensor_query(&params)?
        };
        let filters = q.filters();
        let (source, backend) = ctx.select(&RouteRequest::new(Operation::ListSensors, &filters))?;
        let page = backend.sensors(ctx.query(), &q).await?;
        envelope(source, "sensors", page)
    }
}

/// Latest measurement per fixed device.
pub struct SensorCurrentTool;

#[async_trait]
impl Tool for SensorCurrentTool {
    fn name(&self) -> &str {
        "sensor_current"
    }

    fn description(&self) -> &str {
        "Latest reading of each fixed sensor, optionally by device id or area"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = box_properties("Optional area");
        props.insert(
            "device_ids".into(),
            json!({
                "type": "array",
                "items": { "type": "string" },
                "description": "Restrict to these devices"
            }),
        );
        props.insert("limit".into(), limit_schema(SENSOR_LIMIT));
        json!({ "type": "object", "properties": props })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_sensor_query(&params)?;
        let filters = q.filters();
        let (source, backend) =
            ctx.select(&RouteRequest::new(Operation::SensorCurrent, &filters))?;
        let page = backend.sensor_current(ctx.query(), &q).await?;
        envelope(source, "measurements", page)
    }
}

/// One device's readings, newest first.
pub struct SensorHistoryTool;

#[async_trait]
impl Tool for SensorHistoryTool {
    fn name(&self) -> &str {
        "sensor_history"
    }

    fn description(&self) -> &str {
        "Reading history of one fixed sensor, newest first"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        let mut props = serde_json::Map::new();
        props.insert(
            "device_id".into(),
            json!({ "type": "string", "description": "Device identifier" }),
        );
        props.insert("limit".into(), limit_schema(HISTORY_LIMIT));
        if let Value::Object(w) = window_properties() {
            props.extend(w);
        }
        json!({ "type": "object", "properties": props, "required": ["device_id"] })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let q = parse_history_query(&params)?;
        let filters = with_window(Vec::new(), &q.window);
        let (source, backend) =
            ctx.select(&RouteRequest::new(Operation::SensorHistory, &filters))?;
        let page = backend.sensor_history(ctx.query(), &q).await?;
        envelope(source, "measurements", page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Filter;

    #[test]
    fn test_sensor_query_filters() {
        let q = parse_sensor_query(&json!({
            "device_ids": ["geigiecast:62", "pointcast:10"],
            "min_lat": 35, "max_lat": 36, "min_lon": 139, "max_lon": 140
        }))
        .unwrap();
        assert_eq!(q.device_ids.len(), 2);
        assert_eq!(q.filters(), vec![Filter::BoundingBox, Filter::DeviceId]);
        assert_eq!(q.limit.get(), 50);
    }

    #[test]
    fn test_history_requires_device() {
        assert!(parse_history_query(&json!({})).is_err());
        let q = parse_history_query(&json!({"device_id": "x", "limit": 9000})).unwrap();
        assert_eq!(q.limit.get(), HISTORY_LIMIT.max);
    }

    #[test]
    fn test_list_sensors_schema_has_no_device_ids() {
        let schema = ListSensorsTool.parameters_schema();
        assert!(schema["properties"].get("device_ids").is_none());
        assert!(SensorCurrentTool.parameters_schema()["properties"]
            .get("device_ids")
            .is_some());
    }
}
