//! Geodesy helpers shared by the geofence engine and tests.

use crate::LatLon;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 points.
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Ray-casting point-in-polygon test. The polygon is implicitly closed; a
/// list with fewer than three vertices contains nothing.
pub fn point_in_polygon(point: LatLon, vertices: &[LatLon]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let a = vertices[i];
        let b = vertices[j];
        let crosses = (a.lon > point.lon) != (b.lon > point.lon);
        if crosses {
            let slope_lat = (b.lat - a.lat) * (point.lon - a.lon) / (b.lon - a.lon) + a.lat;
            if point.lat < slope_lat {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(lat: f64, lon: f64) -> LatLon {
        LatLon { lat, lon }
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Belo Horizonte centro to Praca da Liberdade, roughly 1.7 km.
        let d = haversine_m(p(-19.9245, -43.9352), p(-19.9325, -43.9378));
        assert!((800.0..1200.0).contains(&d), "got {d}");

        // One degree of latitude is ~111.19 km.
        let d = haversine_m(p(0.0, 0.0), p(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn haversine_is_zero_for_identical_points() {
        assert_eq!(haversine_m(p(10.0, 20.0), p(10.0, 20.0)), 0.0);
    }

    #[test]
    fn square_polygon_contains_center_not_outside() {
        let square = [p(0.0, 0.0), p(0.0, 1.0), p(1.0, 1.0), p(1.0, 0.0)];
        assert!(point_in_polygon(p(0.5, 0.5), &square));
        assert!(!point_in_polygon(p(1.5, 0.5), &square));
        assert!(!point_in_polygon(p(-0.1, -0.1), &square));
    }

    #[test]
    fn concave_polygon_excludes_the_notch() {
        // A "C" shape: the notch at (0.5, 0.9) is outside.
        let shape = [
            p(0.0, 0.0),
            p(1.0, 0.0),
            p(1.0, 1.0),
            p(0.6, 1.0),
            p(0.6, 0.2),
            p(0.4, 0.2),
            p(0.4, 1.0),
            p(0.0, 1.0),
        ];
        assert!(!point_in_polygon(p(0.5, 0.9), &shape));
        assert!(point_in_polygon(p(0.2, 0.5), &shape));
    }

    #[test]
    fn degenerate_polygon_contains_nothing() {
        assert!(!point_in_polygon(p(0.0, 0.0), &[]));
        assert!(!point_in_polygon(p(0.0, 0.0), &[p(0.0, 0.0), p(1.0, 1.0)]));
    }
}
