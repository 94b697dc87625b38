/// Planar convex hull, buffering and GeoJSON helpers for crop boundaries
use crate::constants::BUFFER_SMOOTH_DISTANCE;
use log::warn;
use serde_json::{Value, json};

/// Planar point as `[x, y]`, matching GeoJSON coordinate order.
pub type Point = [f64; 2];

/// Segments used to approximate round joins.
const ROUND_JOIN_SEGMENTS: usize = 64;

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
}

/// Counter-clockwise convex hull (monotone chain), without a closing point.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    let mut pts: Vec<Point> = points
        .iter()
        .copied()
        .filter(|p| p[0].is_finite() && p[1].is_finite())
        .collect();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<Point> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<Point> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Unsigned shoelace area of a ring (open or closed).
pub fn polygon_area(ring: &[Point]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let twice: f64 = ring
        .iter()
        .zip(ring.iter().cycle().skip(1))
        .map(|(a, b)| a[0] * b[1] - b[0] * a[1])
        .sum();
    twice.abs() / 2.0
}

/// Shrink a counter-clockwise convex polygon by `distance`.
/// Each edge's half-plane is moved inward and the polygon clipped against it.
pub fn buffer_inward(hull: &[Point], distance: f64) -> Vec<Point> {
    if hull.len() < 3 {
        return Vec::new();
    }
    let mut result = hull.to_vec();
    for i in 0..hull.len() {
        let a = hull[i];
        let b = hull[(i + 1) % hull.len()];
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let len = (dx * dx + dy * dy).sqrt();
        if len == 0.0 {
            continue;
        }
        // inward normal of a CCW edge points left
        let (nx, ny) = (-dy / len, dx / len);
        let offset = nx * a[0] + ny * a[1] + distance;
        result = clip_half_plane(&result, nx, ny, offset);
        if result.is_empty() {
            break;
        }
    }
    result
}

/// Keep the part of `poly` where `nx*x + ny*y >= offset`.
fn clip_half_plane(poly: &[Point], nx: f64, ny: f64, offset: f64) -> Vec<Point> {
    let side = |p: Point| nx * p[0] + ny * p[1] - offset;
    let mut out = Vec::with_capacity(poly.len() + 1);
    for i in 0..poly.len() {
        let cur = poly[i];
        let next = poly[(i + 1) % poly.len()];
        let (sc, sn) = (side(cur), side(next));
        if sc >= 0.0 {
            out.push(cur);
        }
        if (sc >= 0.0) != (sn >= 0.0) {
            let t = sc / (sc - sn);
            out.push([cur[0] + t * (next[0] - cur[0]), cur[1] + t * (next[1] - cur[1])]);
        }
    }
    if polygon_area(&out) > 0.0 { out } else { Vec::new() }
}

/// Grow a convex polygon by `distance` with round joins.
pub fn buffer_outward(hull: &[Point], distance: f64) -> Vec<Point> {
    let mut samples = Vec::with_capacity(hull.len() * ROUND_JOIN_SEGMENTS);
    for v in hull {
        for k in 0..ROUND_JOIN_SEGMENTS {
            let theta = k as f64 * std::f64::consts::TAU / ROUND_JOIN_SEGMENTS as f64;
            samples.push([v[0] + distance * theta.cos(), v[1] + distance * theta.sin()]);
        }
    }
    convex_hull(&samples)
}

/// Inward buffer by `buffer + 3` then outward by 3, rounding the corners.
/// Falls back to the hull when the result collapses.
pub fn smooth_buffer(hull: &[Point], buffer_distance: f64) -> Vec<Point> {
    if buffer_distance <= 0.0 {
        return hull.to_vec();
    }
    let shrunk = buffer_inward(hull, buffer_distance + BUFFER_SMOOTH_DISTANCE);
    let smoothed = if shrunk.is_empty() {
        Vec::new()
    } else {
        buffer_outward(&shrunk, BUFFER_SMOOTH_DISTANCE)
    };
    if polygon_area(&smoothed) > 0.0 {
        smoothed
    } else {
        warn!("Very small crop area detected, it will not be smoothed");
        hull.to_vec()
    }
}

/// Collect every `[x, y, ...]` coordinate nested anywhere in a GeoJSON value.
pub fn collect_coordinates(value: &Value, out: &mut Vec<Point>) {
    match value {
        Value::Array(items) => {
            let numeric: Option<Vec<f64>> = items.iter().map(Value::as_f64).collect();
            match numeric {
                Some(coords) if coords.len() >= 2 => out.push([coords[0], coords[1]]),
                _ => items.iter().for_each(|item| collect_coordinates(item, out)),
            }
        }
        Value::Object(map) => {
            if let Some(coords) = map.get("coordinates") {
                collect_coordinates(coords, out);
            } else if let Some(geometry) = map.get("geometry") {
                collect_coordinates(geometry, out);
            } else if let Some(features) = map.get("features") {
                collect_coordinates(features, out);
            } else if let Some(geometries) = map.get("geometries") {
                collect_coordinates(geometries, out);
            }
        }
        _ => {}
    }
}

/// Single-polygon FeatureCollection with a closed exterior ring.
pub fn polygon_feature_collection(ring: &[Point]) -> Value {
    let mut closed: Vec<Point> = ring.to_vec();
    if let (Some(first), Some(last)) = (ring.first(), ring.last()) {
        if first != last {
            closed.push(*first);
        }
    }
    json!({
        "type": "FeatureCollection",
        "name": "convexhull",
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "Polygon",
                "coordinates": [closed],
            }
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square(side: f64) -> Vec<Point> {
        vec![[0.0, 0.0], [side, 0.0], [side, side], [0.0, side]]
    }

    #[test]
    fn hull_drops_interior_points() {
        let mut pts = square(10.0);
        pts.push([5.0, 5.0]);
        pts.push([2.0, 8.0]);
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert_abs_diff_eq!(polygon_area(&hull), 100.0);
    }

    #[test]
    fn inward_buffer_shrinks_square() {
        let shrunk = buffer_inward(&square(10.0), 2.0);
        assert_abs_diff_eq!(polygon_area(&shrunk), 36.0, epsilon = 1e-9);
        assert!(buffer_inward(&square(10.0), 6.0).is_empty());
    }

    #[test]
    fn outward_buffer_adds_rounded_margin() {
        let grown = buffer_outward(&square(10.0), 1.0);
        // square + 4 edge strips + approximately one unit disc
        let expected = 100.0 + 40.0 + std::f64::consts::PI;
        assert_abs_diff_eq!(polygon_area(&grown), expected, epsilon = 0.05);
    }

    #[test]
    fn smooth_buffer_falls_back_on_tiny_area() {
        let tiny = square(4.0);
        assert_eq!(smooth_buffer(&tiny, 3.0), tiny);

        let big = square(100.0);
        let smoothed = smooth_buffer(&big, 5.0);
        assert!(polygon_area(&smoothed) < polygon_area(&big));
        assert!(polygon_area(&smoothed) > 80.0 * 80.0);
    }

    #[test]
    fn coordinates_collected_from_nested_geojson() {
        let geojson = json!({
            "type": "MultiPolygon",
            "coordinates": [[[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]],
                            [[[5.0, 5.0, 2.0], [6.0, 5.0, 2.0], [5.0, 6.0, 2.0]]]]
        });
        let mut pts = Vec::new();
        collect_coordinates(&geojson, &mut pts);
        assert_eq!(pts.len(), 7);
        assert_eq!(pts[4], [5.0, 5.0]);
    }

    #[test]
    fn feature_collection_closes_ring() {
        let fc = polygon_feature_collection(&square(1.0));
        let ring = fc["features"][0]["geometry"]["coordinates"][0].as_array().unwrap();
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.first(), ring.last());
    }
}
