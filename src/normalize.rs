//! Result normalization.
//!
//! Database rows and REST JSON objects are both converted into a
//! [`RawRecord`] first, then mapped to the canonical models by the
//! `*_from_record` functions. The mapping:
//!
//! - tolerates missing optional fields (they become `None`);
//! - coalesces historical aliases for the same concept (`value`/`doserate`,
//!   `lat`/`latitude`, `trackid`/`measurement_import_id`, ...);
//! - decodes byte-array text that some drivers return for text columns;
//! - rewrites counts-per-second unit labels to counts-per-minute.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::models::{Measurement, Sensor, Spectrum, TrackSummary};

/// A single column / field value before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    Json(Value),
}

impl From<Value> for RawValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => RawValue::Null,
            Value::Bool(b) => RawValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Int(i),
                None => n.as_f64().map(RawValue::Float).unwrap_or(RawValue::Null),
            },
            Value::String(s) => RawValue::Text(s),
            other => RawValue::Json(other),
        }
    }
}

/// A row or object keyed by column / field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: HashMap<String, RawValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: RawValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn with(mut self, key: &str, value: RawValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Convert a JSON object; non-objects yield `None`.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self {
                fields: map.into_iter().map(|(k, v)| (k, RawValue::from(v))).collect(),
            }),
            _ => None,
        }
    }

    /// First non-null value among `keys`.
    fn first(&self, keys: &[&str]) -> Option<&RawValue> {
        keys.iter()
            .filter_map(|k| self.fields.get(*k))
            .find(|v| !matches!(v, RawValue::Null))
    }

    /// Text value, decoding bytes and stringifying numbers. Empty strings
    /// count as missing so that a later alias can win.
    pub fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| {
            let s = match self.fields.get(*k)? {
                RawValue::Text(s) => s.clone(),
                RawValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                RawValue::Int(i) => i.to_string(),
                RawValue::Float(f) => f.to_string(),
                RawValue::Bool(b) => b.to_string(),
                RawValue::Time(t) => t.to_rfc3339(),
                RawValue::Json(v) => v.to_string(),
                RawValue::Null => return None,
            };
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn float(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|k| match self.fields.get(*k)? {
            RawValue::Float(f) if f.is_finite() => Some(*f),
            RawValue::Int(i) => Some(*i as f64),
            RawValue::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            RawValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn int(&self, keys: &[&str]) -> Option<i64> {
        keys.iter().find_map(|k| match self.fields.get(*k)? {
            RawValue::Int(i) => Some(*i),
            RawValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            RawValue::Text(s) => s.trim().parse().ok(),
            RawValue::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn boolean(&self, keys: &[&str]) -> Option<bool> {
        keys.iter().find_map(|k| match self.fields.get(*k)? {
            RawValue::Bool(b) => Some(*b),
            RawValue::Int(i) => Some(*i != 0),
            RawValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(true),
                "false" | "f" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }

    /// Timestamp from a native time, RFC 3339 text, naive `YYYY-MM-DD HH:MM:SS`
    /// text (assumed UTC), or Unix seconds.
    pub fn time(&self, keys: &[&str]) -> Option<DateTime<Utc>> {
        keys.iter().find_map(|k| match self.fields.get(*k)? {
            RawValue::Time(t) => Some(*t),
            RawValue::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            RawValue::Float(secs) => Utc.timestamp_opt(*secs as i64, 0).single(),
            RawValue::Text(s) => parse_time_text(s),
            RawValue::Bytes(b) => parse_time_text(&String::from_utf8_lossy(b)),
            _ => None,
        })
    }

    pub fn json(&self, keys: &[&str]) -> Option<Value> {
        match self.first(keys)? {
            RawValue::Json(v) => Some(v.clone()),
            RawValue::Text(s) => serde_json::from_str(s).ok(),
            RawValue::Bytes(b) => serde_json::from_slice(b).ok(),
            _ => None,
        }
    }

    /// Integer array from a JSON array or a Postgres `{1,2,3}` literal.
    pub fn int_array(&self, keys: &[&str]) -> Option<Vec<i64>> {
        match self.first(keys)? {
            RawValue::Json(Value::Array(items)) => {
                items.iter().map(|v| v.as_i64()).collect::<Option<Vec<_>>>()
            }
            RawValue::Text(s) => parse_int_list(s),
            RawValue::Bytes(b) => parse_int_list(&String::from_utf8_lossy(b)),
            _ => None,
        }
    }
}

fn parse_time_text(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn parse_int_list(raw: &str) -> Option<Vec<i64>> {
    let inner = raw.trim().trim_start_matches(['{', '[']).trim_end_matches(['}', ']']);
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner.split(',').map(|p| p.trim().parse().ok()).collect()
}

// ============ Field aliases ============

const ID: &[&str] = &["id", "measurement_id", "marker_id"];
const VALUE: &[&str] = &["value", "doserate", "cpm"];
const UNIT: &[&str] = &["unit", "units"];
const CAPTURED_AT: &[&str] = &["captured_at", "date", "timestamp", "time"];
const LATITUDE: &[&str] = &["latitude", "lat"];
const LONGITUDE: &[&str] = &["longitude", "lon", "lng"];
const DEVICE_ID: &[&str] = &["device_id", "sensor_id", "device"];
const HEIGHT: &[&str] = &["height", "altitude"];
const DETECTOR: &[&str] = &["detector", "detector_type", "sensor"];
const TRACK_ID: &[&str] = &[
    "track_id",
    "trackid",
    "measurement_import_id",
    "bgeigie_import_id",
];

// ============ Units ============

/// Rewrite counts-per-second labels to counts-per-minute.
///
/// Upstream feeds mislabel CPM readings as CPS; leaving the label would make
/// consumers apply per-second calibration factors to per-minute counts. The
/// rewrite preserves case style and is idempotent.
pub fn normalize_unit(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
    match compact.as_str() {
        "cps" | "counts/s" | "counts/sec" | "count/s" => {
            if trimmed.chars().any(|c| c.is_ascii_lowercase()) {
                "cpm".to_string()
            } else {
                "CPM".to_string()
            }
        }
        "countspersecond" | "countpersecond" => "counts per minute".to_string(),
        _ => trimmed.to_string(),
    }
}

// ============ Attribution ============

/// Pick the uploader label: linked account username, then linked account
/// email, then the externally supplied free-text name.
pub fn attribute_uploader(
    account_username: Option<&str>,
    account_email: Option<&str>,
    external_name: Option<&str>,
) -> Option<String> {
    [account_username, account_email, external_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

// ============ Entities ============

/// Map a raw record to a [`Measurement`].
///
/// Returns `None` when an identity, value, timestamp, or location cannot be
/// resolved; such rows are skipped rather than failing the whole query.
pub fn measurement_from_record(r: &RawRecord) -> Option<Measurement> {
    let unit = r.text(UNIT).map(|u| normalize_unit(&u)).unwrap_or_else(|| "cpm".to_string());
    Some(Measurement {
        id: r.int(ID)?,
        value: r.float(VALUE)?,
        unit,
        captured_at: r.time(CAPTURED_AT)?,
        latitude: r.float(LATITUDE)?,
        longitude: r.float(LONGITUDE)?,
        device_id: r.text(DEVICE_ID),
        height: r.float(HEIGHT),
        detector: r.text(DETECTOR),
        track_id: r.text(TRACK_ID),
        has_spectrum: r.boolean(&["has_spectrum"]).unwrap_or(false),
        distance_m: r.float(&["distance_m"]),
    })
}

/// Map a track row (database) or upload object (API) to a [`TrackSummary`].
pub fn track_summary_from_record(r: &RawRecord) -> Option<TrackSummary> {
    let uploader = attribute_uploader(
        r.text(&["user_username", "username"]).as_deref(),
        r.text(&["user_email", "email"]).as_deref(),
        r.text(&["uploader", "user_name", "credits"]).as_deref(),
    );
    Some(TrackSummary {
        track_id: r.text(&["track_id", "trackid", "id"])?,
        name: r.text(&["name", "filename", "source"]),
        uploader,
        detector: r.text(DETECTOR),
        uploaded_at: r.time(&["uploaded_at", "created_at"]),
        measurement_count: r.int(&["measurement_count", "measurements_count", "lines_count"]),
        min_lat: r.float(&["min_lat"]),
        max_lat: r.float(&["max_lat"]),
        min_lon: r.float(&["min_lon"]),
        max_lon: r.float(&["max_lon"]),
        started_at: r.time(&["started_at"]),
        ended_at: r.time(&["ended_at"]),
        avg_value: r.float(&["avg_value"]),
    })
}

/// Map a latest-reading row (database) or device object (API) to a [`Sensor`].
pub fn sensor_from_record(r: &RawRecord) -> Option<Sensor> {
    let model = match (r.text(&["manufacturer"]), r.text(&["model"])) {
        (Some(make), Some(model)) => Some(format!("{} {}", make, model)),
        (None, Some(model)) => Some(model),
        (Some(make), None) => Some(make),
        (None, None) => None,
    };
    Some(Sensor {
        device_id: r.text(&["device_id", "sensor_id", "id"])?,
        latitude: r.float(LATITUDE),
        longitude: r.float(LONGITUDE),
        last_reading_at: r.time(&["last_reading_at", "captured_at"]),
        last_value: r.float(&["last_value", "value"]),
        unit: r.text(UNIT).map(|u| normalize_unit(&u)),
        detector: r.text(DETECTOR),
        model,
    })
}

/// Map a spectrum row to a [`Spectrum`]. Channels are read only when the
/// row carries them (single-record fetches).
pub fn spectrum_from_record(r: &RawRecord) -> Option<Spectrum> {
    Some(Spectrum {
        measurement_id: r.int(&["measurement_id", "marker_id", "id"])?,
        channel_count: r.int(&["channel_count", "channels_count"]),
        energy_min_kev: r.float(&["energy_min_kev", "energy_min"]),
        energy_max_kev: r.float(&["energy_max_kev", "energy_max"]),
        device_model: r.text(&["device_model", "model"]),
        calibration: r.json(&["calibration"]),
        captured_at: r.time(CAPTURED_AT),
        latitude: r.float(LATITUDE),
        longitude: r.float(LONGITUDE),
        channels: r.int_array(&["channels"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cps_becomes_cpm() {
        assert_eq!(normalize_unit("cps"), "cpm");
        assert_eq!(normalize_unit("CPS"), "CPM");
        assert_eq!(normalize_unit(" CPS "), "CPM");
        assert_eq!(normalize_unit("Cps"), "cpm");
        assert_eq!(normalize_unit("counts per second"), "counts per minute");
    }

    #[test]
    fn test_unit_normalization_is_idempotent() {
        for raw in ["cps", "CPS", "cpm", "CPM", "counts per second", "usv", "µSv/h"] {
            let once = normalize_unit(raw);
            assert_eq!(normalize_unit(&once), once, "not idempotent for {}", raw);
        }
        assert_eq!(normalize_unit("CPM"), "CPM");
        assert_eq!(normalize_unit("usv"), "usv");
    }

    #[test]
    fn test_db_row_and_api_object_agree() {
        let row = RawRecord::new()
            .with("id", RawValue::Int(42))
            .with("value", RawValue::Float(35.0))
            .with("unit", RawValue::Text("cpm".into()))
            .with(
                "captured_at",
                RawValue::Time(Utc.with_ymd_and_hms(2021, 3, 11, 5, 46, 0).unwrap()),
            )
            .with("lat", RawValue::Float(37.42))
            .with("lon", RawValue::Float(141.03));
        let api = RawRecord::from_json(json!({
            "id": 42,
            "value": 35,
            "unit": "cpm",
            "captured_at": "2021-03-11T05:46:00.000Z",
            "latitude": 37.42,
            "longitude": 141.03,
            "device_id": null,
            "measurement_import_id": 77
        }))
        .unwrap();

        let a = measurement_from_record(&row).unwrap();
        let b = measurement_from_record(&api).unwrap();
        assert_eq!(
            (a.value, a.unit.as_str(), a.latitude, a.longitude),
            (b.value, b.unit.as_str(), b.latitude, b.longitude)
        );
        assert_eq!(a.captured_at, b.captured_at);
        assert_eq!(b.track_id.as_deref(), Some("77"));
        assert_eq!(b.device_id, None);
    }

    #[test]
    fn test_cps_row_is_reported_as_cpm() {
        let row = RawRecord::new()
            .with("id", RawValue::Int(1))
            .with("doserate", RawValue::Float(12.0))
            .with("unit", RawValue::Text("CPS".into()))
            .with("date", RawValue::Int(1_600_000_000))
            .with("latitude", RawValue::Float(35.1))
            .with("longitude", RawValue::Float(139.2));
        let m = measurement_from_record(&row).unwrap();
        assert_eq!(m.unit, "CPM");
        assert_eq!(m.value, 12.0);
    }

    #[test]
    fn test_bytes_are_decoded_to_text() {
        let row = RawRecord::new()
            .with("id", RawValue::Int(1))
            .with("value", RawValue::Float(20.0))
            .with("unit", RawValue::Bytes(b"cps".to_vec()))
            .with("captured_at", RawValue::Bytes(b"2020-05-01 10:00:00".to_vec()))
            .with("latitude", RawValue::Float(35.0))
            .with("longitude", RawValue::Float(139.0))
            .with("detector", RawValue::Bytes(b"LND 7317".to_vec()));
        let m = measurement_from_record(&row).unwrap();
        assert_eq!(m.unit, "cpm");
        assert_eq!(m.detector.as_deref(), Some("LND 7317"));
        assert_eq!(m.captured_at, Utc.with_ymd_and_hms(2020, 5, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_optionals_are_none() {
        let row = RawRecord::new()
            .with("id", RawValue::Int(5))
            .with("value", RawValue::Float(1.0))
            .with("captured_at", RawValue::Text("2020-01-01T00:00:00Z".into()))
            .with("lat", RawValue::Float(0.0))
            .with("lon", RawValue::Float(0.0));
        let m = measurement_from_record(&row).unwrap();
        assert_eq!(m.unit, "cpm");
        assert!(m.height.is_none() && m.detector.is_none() && m.track_id.is_none());
        assert!(!m.has_spectrum);
    }

    #[test]
    fn test_missing_location_is_skipped() {
        let row = RawRecord::new()
            .with("id", RawValue::Int(5))
            .with("value", RawValue::Float(1.0))
            .with("captured_at", RawValue::Text("2020-01-01T00:00:00Z".into()))
            .with("lat", RawValue::Float(0.0));
        assert!(measurement_from_record(&row).is_none());
    }

    #[test]
    fn test_linked_account_wins_attribution() {
        assert_eq!(
            attribute_uploader(Some("alice"), Some("a@example.org"), Some("Al")),
            Some("alice".into())
        );
        assert_eq!(
            attribute_uploader(Some("  "), Some("a@example.org"), Some("Al")),
            Some("a@example.org".into())
        );
        assert_eq!(attribute_uploader(None, None, Some("Al")), Some("Al".into()));
        assert_eq!(attribute_uploader(None, Some(""), None), None);
    }

    #[test]
    fn test_track_from_api_upload() {
        let r = RawRecord::from_json(json!({
            "id": 1234,
            "name": "drive-2025-04.log",
            "user_id": 9,
            "credits": "Team Fukushima",
            "measurements_count": 812,
            "created_at": "2025-04-02T09:00:00Z"
        }))
        .unwrap();
        let t = track_summary_from_record(&r).unwrap();
        assert_eq!(t.track_id, "1234");
        assert_eq!(t.measurement_count, Some(812));
        assert_eq!(t.uploader.as_deref(), Some("Team Fukushima"));
        assert!(t.min_lat.is_none());
    }

    #[test]
    fn test_spectrum_channels_from_pg_literal() {
        let r = RawRecord::new()
            .with("measurement_id", RawValue::Int(3))
            .with("channels", RawValue::Text("{0,4,9,2}".into()))
            .with("calibration", RawValue::Text(r#"{"a":0.0,"b":2.93}"#.into()));
        let s = spectrum_from_record(&r).unwrap();
        assert_eq!(s.channels, Some(vec![0, 4, 9, 2]));
        assert_eq!(s.calibration.unwrap()["b"], 2.93);
    }

    #[test]
    fn test_device_object_to_sensor() {
        let r = RawRecord::from_json(json!({
            "id": 17,
            "manufacturer": "Safecast",
            "model": "bGeigie Nano",
            "sensor": "LND 7317"
        }))
        .unwrap();
        let s = sensor_from_record(&r).unwrap();
        assert_eq!(s.device_id, "17");
        assert_eq!(s.model.as_deref(), Some("Safecast bGeigie Nano"));
        assert_eq!(s.detector.as_deref(), Some("LND 7317"));
        assert!(s.latitude.is_none());
    }
}
