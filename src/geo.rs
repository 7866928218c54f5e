//! Geographic primitives shared by the SQL and API paths.
//!
//! Both backends must agree on boundary semantics, so containment lives
//! here rather than in either backend:
//!
//! - bounding boxes are inclusive on every edge;
//! - radius checks use the haversine great-circle distance on a sphere of
//!   radius [`EARTH_RADIUS_M`].

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Relative widening of [`BoundingBox::around`] so points exactly on the
/// circle survive floating-point rounding in the envelope test.
const ENVELOPE_PAD: f64 = 1e-7;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Validate and build a point.
    pub fn new(latitude: f64, longitude: f64) -> QueryResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(QueryError::invalid("lat", "must be within [-90, 90]"));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(QueryError::invalid("lon", "must be within [-180, 180]"));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance in meters.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_m(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Haversine distance between two coordinates, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// A `(min_lat, max_lat, min_lon, max_lon)` rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Validate and build a box. Boxes crossing the antimeridian are rejected.
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> QueryResult<Self> {
        for (name, v, lo, hi) in [
            ("min_lat", min_lat, -90.0, 90.0),
            ("max_lat", max_lat, -90.0, 90.0),
            ("min_lon", min_lon, -180.0, 180.0),
            ("max_lon", max_lon, -180.0, 180.0),
        ] {
            if !v.is_finite() || v < lo || v > hi {
                return Err(QueryError::invalid(
                    name,
                    format!("must be within [{}, {}]", lo, hi),
                ));
            }
        }
        if min_lat > max_lat {
            return Err(QueryError::invalid("min_lat", "must not exceed max_lat"));
        }
        if min_lon > max_lon {
            return Err(QueryError::invalid("min_lon", "must not exceed max_lon"));
        }
        Ok(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    /// Smallest box enclosing a circle of `radius_m` around `center`, on
    /// the same sphere as [`haversine_m`].
    ///
    /// The longitude half-width is the tangent extent
    /// `asin(sin δ / cos φ)`. When the circle reaches a pole, or the box
    /// would cross the antimeridian, the longitude span widens to the
    /// full range.
    pub fn around(center: GeoPoint, radius_m: f64) -> Self {
        let delta = radius_m.max(0.0) / EARTH_RADIUS_M * (1.0 + ENVELOPE_PAD);
        let d_lat = delta.to_degrees();
        let min_lat = (center.latitude - d_lat).max(-90.0);
        let max_lat = (center.latitude + d_lat).min(90.0);

        let full = Self {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
        if min_lat <= -90.0 || max_lat >= 90.0 {
            return full;
        }
        let ratio = delta.sin() / center.latitude.to_radians().cos();
        if ratio >= 1.0 {
            return full;
        }
        let d_lon = ratio.asin().to_degrees();
        let (min_lon, max_lon) = (center.longitude - d_lon, center.longitude + d_lon);
        if min_lon < -180.0 || max_lon > 180.0 {
            return full;
        }
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Inclusive containment on every edge.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lon
            && longitude <= self.max_lon
    }

    pub fn centroid(&self) -> GeoPoint {
        GeoPoint {
            latitude: (self.min_lat + self.max_lat) / 2.0,
            longitude: (self.min_lon + self.max_lon) / 2.0,
        }
    }

    /// Distance from the centroid to the farthest corner.
    pub fn covering_radius_m(&self) -> f64 {
        let c = self.centroid();
        [
            (self.min_lat, self.min_lon),
            (self.min_lat, self.max_lon),
            (self.max_lat, self.min_lon),
            (self.max_lat, self.max_lon),
        ]
        .iter()
        .map(|(lat, lon)| haversine_m(c.latitude, c.longitude, *lat, *lon))
        .fold(0.0, f64::max)
    }

    /// Centroid plus covering radius capped at `max_radius_m`.
    ///
    /// When the cap bites, corners of the box fall outside the returned
    /// circle; callers must treat the box itself as the authoritative filter.
    pub fn fetch_circle(&self, max_radius_m: f64) -> (GeoPoint, f64) {
        (self.centroid(), self.covering_radius_m().min(max_radius_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Tokyo Station -> Shinjuku Station, roughly 6.2 km.
        let d = haversine_m(35.6812, 139.7671, 35.6896, 139.7006);
        assert!((d - 6_100.0).abs() < 300.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        assert!(haversine_m(35.0, 139.0, 35.0, 139.0).abs() < 1e-9);
    }

    #[test]
    fn test_box_contains_is_inclusive() {
        let b = BoundingBox::new(35.0, 36.0, 139.0, 140.0).unwrap();
        assert!(b.contains(35.0, 139.0));
        assert!(b.contains(36.0, 140.0));
        assert!(!b.contains(36.000001, 139.5));
        assert!(!b.contains(35.5, 138.999999));
    }

    #[test]
    fn test_box_rejects_inverted_bounds() {
        assert!(BoundingBox::new(36.0, 35.0, 139.0, 140.0).is_err());
        assert!(BoundingBox::new(35.0, 36.0, 140.0, 139.0).is_err());
        assert!(BoundingBox::new(-91.0, 36.0, 139.0, 140.0).is_err());
    }

    /// Point at `distance_m` from `(lat, lon)` along `bearing_deg`.
    fn destination(lat: f64, lon: f64, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
        let (phi, lambda) = (lat.to_radians(), lon.to_radians());
        let theta = bearing_deg.to_radians();
        let delta = distance_m / EARTH_RADIUS_M;
        let phi2 = (phi.sin() * delta.cos() + phi.cos() * delta.sin() * theta.cos()).asin();
        let lambda2 = lambda
            + (theta.sin() * delta.sin() * phi.cos()).atan2(delta.cos() - phi.sin() * phi2.sin());
        (phi2.to_degrees(), lambda2.to_degrees())
    }

    #[test]
    fn test_around_encloses_circle() {
        for lat in [0.0, 35.0, 70.0, -55.0] {
            for radius in [25.0, 1500.0, 50_000.0] {
                let b = BoundingBox::around(GeoPoint::new(lat, 139.0).unwrap(), radius);
                for step in 0..8 {
                    let bearing = step as f64 * 45.0;
                    let (p_lat, p_lon) = destination(lat, 139.0, bearing, radius);
                    let d = haversine_m(lat, 139.0, p_lat, p_lon);
                    assert!((d - radius).abs() < 1e-3, "destination drifted to {} m", d);
                    assert!(
                        b.contains(p_lat, p_lon),
                        "point {} m away at bearing {} from lat {} outside {:?}",
                        d,
                        bearing,
                        lat,
                        b
                    );
                }
            }
        }
    }

    #[test]
    fn test_around_point_just_inside_radius() {
        let b = BoundingBox::around(GeoPoint::new(35.0, 139.0).unwrap(), 1500.0);
        let north = 35.0 + (1499.0 / EARTH_RADIUS_M).to_degrees();
        assert!(haversine_m(35.0, 139.0, north, 139.0) <= 1500.0);
        assert!(b.contains(north, 139.0));
    }

    #[test]
    fn test_around_is_tight() {
        let b = BoundingBox::around(GeoPoint::new(35.0, 139.0).unwrap(), 1500.0);
        let north = haversine_m(35.0, 139.0, b.max_lat, 139.0);
        assert!((north - 1500.0).abs() < 0.01, "north edge {} m away", north);
        let beyond = 35.0 + (1510.0 / EARTH_RADIUS_M).to_degrees();
        assert!(!b.contains(beyond, 139.0));
    }

    #[test]
    fn test_around_widens_at_pole_and_antimeridian() {
        let polar = BoundingBox::around(GeoPoint::new(89.99, 0.0).unwrap(), 5_000.0);
        assert_eq!((polar.min_lon, polar.max_lon), (-180.0, 180.0));
        assert_eq!(polar.max_lat, 90.0);

        let dateline = BoundingBox::around(GeoPoint::new(10.0, 179.999).unwrap(), 1_000.0);
        assert_eq!((dateline.min_lon, dateline.max_lon), (-180.0, 180.0));
        let (lat, lon) = destination(10.0, 179.999, 90.0, 900.0);
        let wrapped = if lon > 180.0 { lon - 360.0 } else { lon };
        assert!(dateline.contains(lat, wrapped));
    }

    #[test]
    fn test_covering_radius_reaches_corners() {
        let b = BoundingBox::new(35.0, 36.0, 139.0, 140.0).unwrap();
        let r = b.covering_radius_m();
        let c = b.centroid();
        for (lat, lon) in [(35.0, 139.0), (36.0, 140.0), (35.0, 140.0), (36.0, 139.0)] {
            assert!(haversine_m(c.latitude, c.longitude, lat, lon) <= r + 1e-6);
        }
    }

    #[test]
    fn test_fetch_circle_is_capped() {
        let b = BoundingBox::new(30.0, 40.0, 130.0, 145.0).unwrap();
        let (_, r) = b.fetch_circle(50_000.0);
        assert_eq!(r, 50_000.0);
    }

    #[test]
    fn test_point_validation() {
        assert!(GeoPoint::new(91.0, 0.0).is_err());
        assert!(GeoPoint::new(0.0, 181.0).is_err());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
    }
}
