//! Tool parameter handling.
//!
//! Every tool declares a JSON Schema. [`validate_params`] checks a call
//! against it (required fields, types, enums) and injects defaults; the
//! typed accessors below then read the validated object. REST query
//! strings are first turned into JSON by [`coerce_query`] using the same
//! schema, so both surfaces share one validation path.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{QueryError, QueryResult};
use crate::filters::{parse_instant, TimeWindow};
use crate::geo::BoundingBox;

const BOX_FIELDS: [&str; 4] = ["min_lat", "max_lat", "min_lon", "max_lon"];

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Validate `params` against `schema` and fill in defaults.
///
/// `null` counts as absent. Unknown keys are kept.
pub fn validate_params(schema: &Value, params: &Value) -> QueryResult<Value> {
    let params_obj: Map<String, Value> = match params {
        Value::Object(m) => m
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::Null => Map::new(),
        other => {
            return Err(QueryError::invalid(
                "params",
                format!("must be an object, got {}", json_type_name(other)),
            ))
        }
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for req_field in &required {
        if !params_obj.contains_key(*req_field) {
            return Err(QueryError::invalid(*req_field, "missing required parameter"));
        }
    }

    let mut result = params_obj.clone();
    for (prop_name, prop_schema) in &properties {
        let Some(value) = params_obj.get(prop_name) else {
            if let Some(default) = prop_schema.get("default") {
                result.insert(prop_name.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
            if !type_matches(expected, value) {
                return Err(QueryError::invalid(
                    prop_name.as_str(),
                    format!("must be of type '{}', got {}", expected, json_type_name(value)),
                ));
            }
            if expected == "array" {
                let item_type = prop_schema
                    .get("items")
                    .and_then(|i| i.get("type"))
                    .and_then(|t| t.as_str());
                if let (Some(item_type), Some(items)) = (item_type, value.as_array()) {
                    if let Some(bad) = items.iter().find(|v| !type_matches(item_type, v)) {
                        return Err(QueryError::invalid(
                            prop_name.as_str(),
                            format!("items must be of type '{}', got {}", item_type, json_type_name(bad)),
                        ));
                    }
                }
            }
        }

        if let Some(enum_values) = prop_schema.get("enum").and_then(|e| e.as_array()) {
            if !enum_values.contains(value) {
                let allowed: Vec<String> = enum_values.iter().map(|v| v.to_string()).collect();
                return Err(QueryError::invalid(
                    prop_name.as_str(),
                    format!("must be one of [{}], got {}", allowed.join(", "), value),
                ));
            }
        }
    }

    Ok(Value::Object(result))
}

/// Convert REST query-string pairs into a JSON object typed by `schema`.
///
/// Integers and numbers are parsed, arrays are comma separated, and arrays
/// of objects are `;`-separated groups of comma-separated numbers assigned
/// in the item schema's `required` order.
pub fn coerce_query(schema: &Value, query: &HashMap<String, String>) -> QueryResult<Value> {
    let properties = schema.get("properties").and_then(|p| p.as_object());
    let mut out = Map::new();
    for (key, raw) in query {
        let prop = properties.and_then(|p| p.get(key));
        let ty = prop.and_then(|p| p.get("type")).and_then(|t| t.as_str());
        let value = match ty {
            Some("array") => {
                let items = prop.and_then(|p| p.get("items"));
                coerce_array(key, raw, items)?
            }
            Some(t) => coerce_scalar(key, raw, t)?,
            None => Value::String(raw.clone()),
        };
        out.insert(key.clone(), value);
    }
    Ok(Value::Object(out))
}

fn coerce_scalar(name: &str, raw: &str, ty: &str) -> QueryResult<Value> {
    let raw = raw.trim();
    match ty {
        "integer" => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| QueryError::invalid(name, format!("expected an integer, got '{}'", raw))),
        "number" => raw
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::from)
            .ok_or_else(|| QueryError::invalid(name, format!("expected a number, got '{}'", raw))),
        "boolean" => match raw {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(QueryError::invalid(name, format!("expected a boolean, got '{}'", raw))),
        },
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn coerce_array(name: &str, raw: &str, items: Option<&Value>) -> QueryResult<Value> {
    let item_type = items
        .and_then(|i| i.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("string");

    if item_type == "object" {
        let fields: Vec<String> = items
            .and_then(|i| i.get("required"))
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let mut groups = Vec::new();
        for group in raw.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let parts: Vec<&str> = group.split(',').map(str::trim).collect();
            if parts.len() != fields.len() {
                return Err(QueryError::invalid(
                    name,
                    format!("each group needs {} values ({})", fields.len(), fields.join(",")),
                ));
            }
            let mut obj = Map::new();
            for (field, part) in fields.iter().zip(parts) {
                obj.insert(field.clone(), coerce_scalar(name, part, "number")?);
            }
            groups.push(Value::Object(obj));
        }
        return Ok(Value::Array(groups));
    }

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| coerce_scalar(name, s, item_type))
        .collect::<QueryResult<Vec<_>>>()
        .map(Value::Array)
}

// ============ Typed accessors over validated params ============

pub fn opt_str(params: &Value, name: &str) -> Option<String> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn req_str(params: &Value, name: &str) -> QueryResult<String> {
    opt_str(params, name).ok_or_else(|| QueryError::invalid(name, "must not be empty"))
}

pub fn opt_i64(params: &Value, name: &str) -> Option<i64> {
    params.get(name).and_then(|v| v.as_i64())
}

pub fn opt_f64(params: &Value, name: &str) -> Option<f64> {
    params.get(name).and_then(|v| v.as_f64())
}

pub fn req_f64(params: &Value, name: &str) -> QueryResult<f64> {
    opt_f64(params, name).ok_or_else(|| QueryError::invalid(name, "missing required parameter"))
}

/// Integer within `[min, max]`, rejected otherwise.
pub fn opt_i64_in(params: &Value, name: &str, min: i64, max: i64) -> QueryResult<Option<i64>> {
    match opt_i64(params, name) {
        Some(v) if v < min || v > max => Err(QueryError::invalid(
            name,
            format!("must be within [{}, {}]", min, max),
        )),
        other => Ok(other),
    }
}

pub fn opt_time(params: &Value, name: &str) -> QueryResult<Option<DateTime<Utc>>> {
    opt_str(params, name)
        .map(|raw| parse_instant(name, &raw))
        .transpose()
}

/// `since` / `until` as a half-open window.
pub fn time_window(params: &Value) -> QueryResult<TimeWindow> {
    TimeWindow::new(opt_time(params, "since")?, opt_time(params, "until")?)
}

/// A box given as four top-level parameters: all four or none.
pub fn opt_bbox(params: &Value) -> QueryResult<Option<BoundingBox>> {
    let values: Vec<Option<f64>> = BOX_FIELDS.iter().map(|f| opt_f64(params, f)).collect();
    match values.as_slice() {
        [Some(a), Some(b), Some(c), Some(d)] => BoundingBox::new(*a, *b, *c, *d).map(Some),
        [None, None, None, None] => Ok(None),
        _ => Err(QueryError::invalid(
            "min_lat",
            "bounding box needs all of min_lat, max_lat, min_lon, max_lon",
        )),
    }
}

pub fn req_bbox(params: &Value) -> QueryResult<BoundingBox> {
    opt_bbox(params)?.ok_or_else(|| {
        QueryError::invalid("min_lat", "min_lat, max_lat, min_lon, max_lon are required")
    })
}

pub fn string_list(params: &Value, name: &str) -> Vec<String> {
    params
        .get(name)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// An array of `{min_lat, max_lat, min_lon, max_lon}` objects.
pub fn box_list(params: &Value, name: &str) -> QueryResult<Vec<BoundingBox>> {
    let Some(items) = params.get(name).and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .map(|item| {
            let field = |f: &str| {
                item.get(f)
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| QueryError::invalid(name, format!("each box needs a numeric {}", f)))
            };
            BoundingBox::new(
                field("min_lat")?,
                field("max_lat")?,
                field("min_lon")?,
                field("max_lon")?,
            )
        })
        .collect()
}

/// JSON Schema fragment for the four box parameters.
pub fn box_properties(description: &str) -> Map<String, Value> {
    let mut props = Map::new();
    for (field, lo, hi) in [
        ("min_lat", -90, 90),
        ("max_lat", -90, 90),
        ("min_lon", -180, 180),
        ("max_lon", -180, 180),
    ] {
        props.insert(
            field.to_string(),
            serde_json::json!({
                "type": "number",
                "minimum": lo,
                "maximum": hi,
                "description": format!("{} ({})", description, field),
            }),
        );
    }
    props
}

/// Schema for an `exclude_boxes` style parameter.
pub fn box_list_schema() -> Value {
    serde_json::json!({
        "type": "array",
        "description": "Areas to exclude",
        "items": {
            "type": "object",
            "properties": {
                "min_lat": { "type": "number" },
                "max_lat": { "type": "number" },
                "min_lon": { "type": "number" },
                "max_lon": { "type": "number" }
            },
            "required": BOX_FIELDS
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "lat": { "type": "number" },
                "limit": { "type": "integer", "default": 25 },
                "order": { "type": "string", "enum": ["max", "min"], "default": "max" },
                "device_ids": { "type": "array", "items": { "type": "string" } },
                "exclude_boxes": box_list_schema()
            },
            "required": ["lat"]
        })
    }

    #[test]
    fn test_missing_required() {
        let err = validate_params(&schema(), &json!({})).unwrap_err();
        assert!(matches!(err, QueryError::InvalidParam { ref name, .. } if name == "lat"));
    }

    #[test]
    fn test_null_counts_as_absent() {
        let v = validate_params(&schema(), &json!({"lat": 1.0, "limit": null})).unwrap();
        assert_eq!(v["limit"], 25);
    }

    #[test]
    fn test_defaults_injected() {
        let v = validate_params(&schema(), &json!({"lat": 35})).unwrap();
        assert_eq!(v["limit"], 25);
        assert_eq!(v["order"], "max");
    }

    #[test]
    fn test_type_and_enum_checked() {
        assert!(validate_params(&schema(), &json!({"lat": "north"})).is_err());
        assert!(validate_params(&schema(), &json!({"lat": 1, "order": "median"})).is_err());
        assert!(validate_params(&schema(), &json!({"lat": 1, "device_ids": [1, 2]})).is_err());
        assert!(validate_params(&schema(), &json!({"lat": 1, "limit": 2.5})).is_err());
    }

    #[test]
    fn test_query_string_coercion() {
        let q: HashMap<String, String> = [
            ("lat", "35.5"),
            ("limit", "10"),
            ("device_ids", "a, b,,c"),
            ("exclude_boxes", "37,38,140.5,141.5; 35,36,139,140"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let v = coerce_query(&schema(), &q).unwrap();
        assert_eq!(v["lat"], 35.5);
        assert_eq!(v["limit"], 10);
        assert_eq!(v["device_ids"], json!(["a", "b", "c"]));
        assert_eq!(v["exclude_boxes"][1]["max_lon"], 140.0);
        let boxes = box_list(&v, "exclude_boxes").unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].min_lon, 140.5);
    }

    #[test]
    fn test_bad_query_number() {
        let q: HashMap<String, String> = [("limit".to_string(), "ten".to_string())].into();
        let err = coerce_query(&schema(), &q).unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_partial_box_rejected() {
        assert!(opt_bbox(&json!({"min_lat": 1.0, "max_lat": 2.0})).is_err());
        assert!(opt_bbox(&json!({})).unwrap().is_none());
        let b = opt_bbox(&json!({"min_lat": 35, "max_lat": 36, "min_lon": 139, "max_lon": 140}))
            .unwrap()
            .unwrap();
        assert_eq!(b.max_lon, 140.0);
    }

    #[test]
    fn test_window_from_params() {
        let w = time_window(&json!({"since": "2020-01-01", "until": "2021-01-01"})).unwrap();
        assert!(w.start.is_some() && w.end.is_some());
        assert!(time_window(&json!({"since": "2021-01-01", "until": "2020-01-01"})).is_err());
    }
}
