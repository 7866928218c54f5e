//! Validated query inputs.
//!
//! Tool handlers parse raw parameters into these types before routing, so
//! nothing past this module ever sees an unclamped limit or an unvalidated
//! coordinate.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use crate::error::{QueryError, QueryResult};
use crate::geo::{BoundingBox, GeoPoint};
use crate::router::Filter;

/// Documented `[min, max]` range and default for a row limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitBounds {
    pub min: i64,
    pub max: i64,
    pub default: i64,
}

impl LimitBounds {
    pub const fn new(min: i64, max: i64, default: i64) -> Self {
        Self { min, max, default }
    }
}

/// A row limit that has been clamped into its bounds.
///
/// The only constructor is [`Limit::clamped`], so a `Limit` reaching the
/// SQL builder is always a validated integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(i64);

impl Limit {
    pub fn clamped(requested: Option<i64>, bounds: LimitBounds) -> Self {
        Self(requested.unwrap_or(bounds.default).clamp(bounds.min, bounds.max))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Half-open time window `[start, end)`. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> QueryResult<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Err(QueryError::invalid("since", "must be earlier than until"));
            }
        }
        Ok(Self { start, end })
    }

    /// Calendar window for a year, or for one month of that year.
    pub fn calendar(year: i32, month: Option<u32>) -> QueryResult<Self> {
        let (start, end) = match month {
            None => (ymd(year, 1)?, ymd(year + 1, 1)?),
            Some(m) if (1..=12).contains(&m) => {
                let next = if m == 12 { ymd(year + 1, 1)? } else { ymd(year, m + 1)? };
                (ymd(year, m)?, next)
            }
            Some(_) => return Err(QueryError::invalid("month", "must be within [1, 12]")),
        };
        Ok(Self {
            start: Some(start),
            end: Some(end),
        })
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }
}

fn ymd(year: i32, month: u32) -> QueryResult<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| QueryError::invalid("year", format!("{} is not a valid year", year)))
}

/// Parse `YYYY-MM-DD` or an RFC 3339 timestamp.
pub fn parse_instant(name: &str, raw: &str) -> QueryResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| {
            QueryError::invalid(name, "expected YYYY-MM-DD or an RFC 3339 timestamp")
        })
}

/// Radius search around a point.
#[derive(Debug, Clone)]
pub struct RadiusQuery {
    pub center: GeoPoint,
    pub radius_m: f64,
    pub window: TimeWindow,
    pub limit: Limit,
}

/// Bounding-box search.
#[derive(Debug, Clone)]
pub struct AreaQuery {
    pub bbox: BoundingBox,
    pub window: TimeWindow,
    pub limit: Limit,
}

/// Track listing filters.
#[derive(Debug, Clone)]
pub struct TrackQuery {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub uploader: Option<String>,
    pub detector: Option<String>,
    pub limit: Limit,
}

impl TrackQuery {
    /// Upload-date window implied by `year`/`month`.
    pub fn window(&self) -> QueryResult<TimeWindow> {
        match self.year {
            Some(y) => TimeWindow::calendar(y, self.month),
            None => Ok(TimeWindow::default()),
        }
    }

    pub fn filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if self.year.is_some() {
            filters.push(Filter::YearMonth);
        }
        if self.uploader.is_some() {
            filters.push(Filter::Uploader);
        }
        if self.detector.is_some() {
            filters.push(Filter::Detector);
        }
        filters
    }
}

/// Sensor listing / latest-reading filters.
#[derive(Debug, Clone)]
pub struct SensorQuery {
    pub bbox: Option<BoundingBox>,
    pub device_ids: Vec<String>,
    pub limit: Limit,
}

impl SensorQuery {
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if self.bbox.is_some() {
            filters.push(Filter::BoundingBox);
        }
        if !self.device_ids.is_empty() {
            filters.push(Filter::DeviceId);
        }
        filters
    }
}

/// One device's reading history.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_id: String,
    pub window: TimeWindow,
    pub limit: Limit,
}

/// Spectrum listing filters.
#[derive(Debug, Clone)]
pub struct SpectrumQuery {
    pub bbox: Option<BoundingBox>,
    pub limit: Limit,
}

/// Current calendar year, used by the recency heuristic.
pub fn current_year() -> i32 {
    Utc::now().year()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: LimitBounds = LimitBounds::new(1, 200, 25);

    #[test]
    fn test_limit_clamps_both_ends() {
        assert_eq!(Limit::clamped(Some(0), BOUNDS).get(), 1);
        assert_eq!(Limit::clamped(Some(-5), BOUNDS).get(), 1);
        assert_eq!(Limit::clamped(Some(10_000), BOUNDS).get(), 200);
        assert_eq!(Limit::clamped(None, BOUNDS).get(), 25);
        assert_eq!(Limit::clamped(Some(10), BOUNDS).get(), 10);
    }

    #[test]
    fn test_window_is_half_open() {
        let w = TimeWindow::calendar(2020, Some(3)).unwrap();
        let start = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 4, 1, 0, 0, 0).unwrap();
        assert!(w.contains(start));
        assert!(!w.contains(end));
        assert!(w.contains(end - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_december_rolls_into_next_year() {
        let w = TimeWindow::calendar(2019, Some(12)).unwrap();
        assert_eq!(w.end, Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_bad_month_rejected() {
        assert!(TimeWindow::calendar(2019, Some(13)).is_err());
        assert!(TimeWindow::calendar(2019, Some(0)).is_err());
    }

    #[test]
    fn test_parse_instant_accepts_both_forms() {
        let d = parse_instant("since", "2021-06-01").unwrap();
        assert_eq!(d, Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap());
        let t = parse_instant("since", "2021-06-01T12:30:00+09:00").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2021, 6, 1, 3, 30, 0).unwrap());
        assert!(parse_instant("since", "June 1st").is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let a = Utc.with_ymd_and_hms(2021, 6, 2, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
        assert!(TimeWindow::new(Some(a), Some(b)).is_err());
    }

    #[test]
    fn test_track_filters_listed() {
        let q = TrackQuery {
            year: Some(2015),
            month: None,
            uploader: Some("alice".into()),
            detector: None,
            limit: Limit::clamped(None, BOUNDS),
        };
        assert_eq!(q.filters(), vec![Filter::YearMonth, Filter::Uploader]);
    }
}
