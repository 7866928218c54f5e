//! Canonical data models shared by both backends.
//!
//! Every record returned to a caller has one of these shapes regardless of
//! whether it came from the database or the REST API. Construction from raw
//! rows and JSON lives in [`crate::normalize`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::router::Source;

/// One radiation reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub id: i64,
    pub value: f64,
    pub unit: String,
    pub captured_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub device_id: Option<String>,
    pub height: Option<f64>,
    pub detector: Option<String>,
    pub track_id: Option<String>,
    pub has_spectrum: bool,
    /// Distance from the query center; only set by radius searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

/// Track metadata plus derived aggregates.
///
/// Aggregates are optional: the REST API lists uploads without their
/// geometry, so only the database path fills the bounding box in listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub track_id: String,
    pub name: Option<String>,
    pub uploader: Option<String>,
    pub detector: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub measurement_count: Option<i64>,
    pub min_lat: Option<f64>,
    pub max_lat: Option<f64>,
    pub min_lon: Option<f64>,
    pub max_lon: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub avg_value: Option<f64>,
}

impl TrackSummary {
    /// Fill aggregates from a set of measurements of this track.
    pub fn with_aggregates(mut self, measurements: &[Measurement]) -> Self {
        if measurements.is_empty() {
            return self;
        }
        let n = measurements.len() as f64;
        let fold = |f: fn(&Measurement) -> f64, pick: fn(f64, f64) -> f64, init: f64| {
            measurements.iter().map(f).fold(init, pick)
        };
        self.min_lat = Some(fold(|m| m.latitude, f64::min, f64::INFINITY));
        self.max_lat = Some(fold(|m| m.latitude, f64::max, f64::NEG_INFINITY));
        self.min_lon = Some(fold(|m| m.longitude, f64::min, f64::INFINITY));
        self.max_lon = Some(fold(|m| m.longitude, f64::max, f64::NEG_INFINITY));
        self.started_at = measurements.iter().map(|m| m.captured_at).min();
        self.ended_at = measurements.iter().map(|m| m.captured_at).max();
        self.avg_value = Some(measurements.iter().map(|m| m.value).sum::<f64>() / n);
        if self.measurement_count.is_none() {
            self.measurement_count = Some(measurements.len() as i64);
        }
        self
    }
}

/// A track with its (possibly truncated) measurement list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    #[serde(flatten)]
    pub summary: TrackSummary,
    pub measurements: Vec<Measurement>,
}

/// A fixed-location device, materialized from its most recent reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub device_id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    pub unit: Option<String>,
    pub detector: Option<String>,
    pub model: Option<String>,
}

/// Gamma spectrum attached to a measurement.
///
/// `channels` is only populated by single-record fetches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    pub measurement_id: i64,
    pub channel_count: Option<i64>,
    pub energy_min_kev: Option<f64>,
    pub energy_max_kev: Option<f64>,
    pub device_model: Option<String>,
    pub calibration: Option<Value>,
    pub captured_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<i64>>,
}

/// Append-only audit record, one per tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogEntry {
    pub tool_name: String,
    pub params: Value,
    pub result_count: i64,
    pub duration_ms: i64,
    pub client_info: String,
    pub created_at: DateTime<Utc>,
}

/// Structured per-session log for agent clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiSessionLog {
    pub session_id: String,
    pub tool_name: String,
    pub sanitized_query: String,
    pub duration_ms: i64,
    pub commit_hash: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One page of results plus the total matched by the same predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPage<T> {
    pub items: Vec<T>,
    /// Only the database path can report this.
    pub total_available: Option<i64>,
}

impl<T> ResultPage<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            total_available: None,
        }
    }

    pub fn with_total(items: Vec<T>, total: i64) -> Self {
        Self {
            items,
            total_available: Some(total),
        }
    }
}

/// Build the tool-result envelope:
/// `{count, source, <key>: [...], total_available?}`.
pub fn envelope<T: Serialize>(
    source: Source,
    key: &str,
    page: ResultPage<T>,
) -> anyhow::Result<Value> {
    let mut obj = serde_json::Map::new();
    obj.insert("count".into(), Value::from(page.items.len()));
    obj.insert("source".into(), Value::from(source.as_str()));
    obj.insert(key.into(), serde_json::to_value(&page.items)?);
    if let Some(total) = page.total_available {
        obj.insert("total_available".into(), Value::from(total));
    }
    Ok(Value::Object(obj))
}

/// Envelope for a single record (`get_track`, `get_spectrum`).
pub fn single_envelope<T: Serialize>(source: Source, key: &str, item: &T) -> anyhow::Result<Value> {
    let mut obj = serde_json::Map::new();
    obj.insert("count".into(), Value::from(1));
    obj.insert("source".into(), Value::from(source.as_str()));
    obj.insert(key.into(), serde_json::to_value(item)?);
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn m(id: i64, lat: f64, lon: f64, value: f64, hour: u32) -> Measurement {
        Measurement {
            id,
            value,
            unit: "cpm".into(),
            captured_at: Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0).unwrap(),
            latitude: lat,
            longitude: lon,
            device_id: None,
            height: None,
            detector: None,
            track_id: Some("t1".into()),
            has_spectrum: false,
            distance_m: None,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let page = ResultPage::with_total(vec![m(1, 35.0, 139.0, 30.0, 0)], 7);
        let v = envelope(Source::Database, "measurements", page).unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["source"], "database");
        assert_eq!(v["total_available"], 7);
        assert!(v["measurements"][0].get("distance_m").is_none());
    }

    #[test]
    fn test_api_envelope_omits_total() {
        let v = envelope(Source::RestApi, "measurements", ResultPage::<Measurement>::new(vec![]))
            .unwrap();
        assert_eq!(v["source"], "api");
        assert!(v.get("total_available").is_none());
    }

    #[test]
    fn test_track_aggregates() {
        let summary = TrackSummary {
            track_id: "t1".into(),
            name: None,
            uploader: None,
            detector: None,
            uploaded_at: None,
            measurement_count: None,
            min_lat: None,
            max_lat: None,
            min_lon: None,
            max_lon: None,
            started_at: None,
            ended_at: None,
            avg_value: None,
        };
        let ms = vec![m(1, 35.0, 139.5, 30.0, 3), m(2, 35.5, 139.0, 50.0, 1)];
        let s = summary.with_aggregates(&ms);
        assert_eq!(s.measurement_count, Some(2));
        assert_eq!(s.min_lat, Some(35.0));
        assert_eq!(s.max_lon, Some(139.5));
        assert_eq!(s.avg_value, Some(40.0));
        assert_eq!(s.started_at, Some(ms[1].captured_at));
        assert_eq!(s.ended_at, Some(ms[0].captured_at));
    }

    #[test]
    fn test_spectrum_list_view_hides_channels() {
        let s = Spectrum {
            measurement_id: 9,
            channel_count: Some(1024),
            energy_min_kev: Some(0.0),
            energy_max_kev: Some(3000.0),
            device_model: Some("RadiaCode-102".into()),
            calibration: None,
            captured_at: None,
            latitude: None,
            longitude: None,
            channels: None,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert!(v.get("channels").is_none());
    }
}
