//! Great-circle and planar geometry helpers.
//!
//! All distances are great-circle (haversine) unless noted. Polygon
//! operations project onto a local tangent plane around the query point,
//! which is accurate to well under a meter at zone scale (hundreds of
//! meters to a few kilometers).

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Great-circle distance between two points in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    haversine_m(lat1, lon1, lat2, lon2) / 1000.0
}

/// Whether a coordinate pair is a plausible WGS-84 position.
pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// An axis-aligned latitude/longitude bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Closed containment: points on the edge are inside.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Project a point onto the local tangent plane centered at `(ref_lat, ref_lon)`.
/// Returns (x east, y north) in meters.
fn project_m(ref_lat: f64, ref_lon: f64, lat: f64, lon: f64) -> (f64, f64) {
    let x = (lon - ref_lon).to_radians() * ref_lat.to_radians().cos() * EARTH_RADIUS_M;
    let y = (lat - ref_lat).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

/// Ray-cast point-in-polygon over `[lat, lon]` vertices.
///
/// The polygon is treated as closed (last vertex connects to the first) and
/// containment is closed: a point on an edge counts as inside.
pub fn point_in_polygon(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    // Project everything onto the plane around the query point
    let pts: Vec<(f64, f64)> = vertices
        .iter()
        .map(|&(vlat, vlon)| project_m(lat, lon, vlat, vlon))
        .collect();

    // On-boundary check first so edge points classify as inside
    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        if point_segment_distance_m((0.0, 0.0), a, b) < 1e-6 {
            return true;
        }
    }

    let mut inside = false;
    let mut j = pts.len() - 1;
    for i in 0..pts.len() {
        let (xi, yi) = pts[i];
        let (xj, yj) = pts[j];
        if (yi > 0.0) != (yj > 0.0) {
            let x_cross = xi + (0.0 - yi) / (yj - yi) * (xj - xi);
            if x_cross > 0.0 {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Minimum distance in meters from a point to a polygon's boundary.
pub fn polygon_boundary_distance_m(lat: f64, lon: f64, vertices: &[(f64, f64)]) -> f64 {
    if vertices.len() < 3 {
        return f64::INFINITY;
    }
    let pts: Vec<(f64, f64)> = vertices
        .iter()
        .map(|&(vlat, vlon)| project_m(lat, lon, vlat, vlon))
        .collect();

    let mut min = f64::INFINITY;
    for i in 0..pts.len() {
        let a = pts[i];
        let b = pts[(i + 1) % pts.len()];
        min = min.min(point_segment_distance_m((0.0, 0.0), a, b));
    }
    min
}

/// Planar distance from point `p` to segment `ab`, all in meters.
fn point_segment_distance_m(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (px, py) = p;
    let (ax, ay) = a;
    let (bx, by) = b;
    let (dx, dy) = (bx - ax, by - ay);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }
    let t = (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0);
    let (cx, cy) = (ax + t * dx, ay + t * dy);
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Coarsen a coordinate to a ~100 m grid for anonymized public feeds.
pub fn coarsen_coordinate(value: f64) -> f64 {
    (value * 1000.0).floor() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // New Delhi to Mumbai, roughly 1150 km
        let d = haversine_km(28.6139, 77.2090, 19.0760, 72.8777);
        assert!((1100.0..1200.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_haversine_zero() {
        assert!(haversine_m(28.6139, 77.2090, 28.6139, 77.2090) < 1e-9);
    }

    #[test]
    fn test_haversine_small_distance() {
        // ~11 m per 0.0001 degrees of latitude
        let d = haversine_m(40.7589, -73.9851, 40.7590, -73.9851);
        assert!((10.0..13.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(valid_coordinates(0.0, 0.0));
        assert!(valid_coordinates(90.0, 180.0));
        assert!(valid_coordinates(-90.0, -180.0));
        assert!(!valid_coordinates(90.1, 0.0));
        assert!(!valid_coordinates(0.0, 180.1));
        assert!(!valid_coordinates(f64::NAN, 0.0));
    }

    #[test]
    fn test_bounding_box_closed() {
        let bbox = BoundingBox {
            min_lat: 10.0,
            max_lat: 20.0,
            min_lon: 70.0,
            max_lon: 80.0,
        };
        assert!(bbox.contains(15.0, 75.0));
        assert!(bbox.contains(10.0, 70.0)); // edge is inside
        assert!(bbox.contains(20.0, 80.0));
        assert!(!bbox.contains(9.999, 75.0));
        assert!(!bbox.contains(15.0, 80.001));
    }

    #[test]
    fn test_point_in_polygon_square() {
        // ~1km square around the origin point
        let square = vec![
            (28.609, 77.204),
            (28.609, 77.214),
            (28.619, 77.214),
            (28.619, 77.204),
        ];
        assert!(point_in_polygon(28.614, 77.209, &square));
        assert!(!point_in_polygon(28.630, 77.209, &square));
        assert!(!point_in_polygon(28.614, 77.230, &square));
    }

    #[test]
    fn test_point_on_polygon_edge_is_inside() {
        let square = vec![
            (28.609, 77.204),
            (28.609, 77.214),
            (28.619, 77.214),
            (28.619, 77.204),
        ];
        assert!(point_in_polygon(28.609, 77.209, &square));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        assert!(!point_in_polygon(0.0, 0.0, &[(1.0, 1.0), (2.0, 2.0)]));
    }

    #[test]
    fn test_polygon_boundary_distance() {
        let square = vec![
            (28.609, 77.204),
            (28.609, 77.214),
            (28.619, 77.214),
            (28.619, 77.204),
        ];
        // Point at the center: roughly 550m from the nearest edge
        let d = polygon_boundary_distance_m(28.614, 77.209, &square);
        assert!((400.0..700.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_coarsen_coordinate() {
        assert_eq!(coarsen_coordinate(28.61397), 28.613);
        assert_eq!(coarsen_coordinate(-73.98512), -73.986);
    }
}
