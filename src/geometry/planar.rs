use std::cmp::Ordering;

use geo::{
    line_intersection::{line_intersection, LineIntersection},
    BooleanOps, Coord, Line, LineString, MultiPolygon, Polygon,
};

use super::GeometryOps;

/// Planar operations on lon/lat degrees backed by `geo`'s boolean ops.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlanarOps;

impl GeometryOps for PlanarOps {
    fn validate(&self, geometry: &MultiPolygon<f64>) -> Result<(), String> {
        if geometry.0.is_empty() {
            return Err("geometry is empty".to_string());
        }
        for (i, polygon) in geometry.0.iter().enumerate() {
            let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
            for (j, ring) in rings.enumerate() {
                validate_ring(ring).map_err(|e| format!("polygon {i} ring {j}: {e}"))?;
            }
        }
        Ok(())
    }

    fn repair(&self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        // the overlay rebuilds rings from the filled area
        canonicalize(geometry.union(&MultiPolygon::new(vec![])))
    }

    fn union(&self, geometries: &[MultiPolygon<f64>]) -> MultiPolygon<f64> {
        let mut layer = geometries.to_vec();
        while layer.len() > 1 {
            layer = layer
                .chunks(2)
                .map(|x| x[1..].iter().fold(x[0].clone(), |a, b| a.union(b)))
                .collect();
        }
        canonicalize(layer.pop().unwrap_or_else(|| MultiPolygon::new(vec![])))
    }
}

fn signed_area(coords: &[Coord<f64>]) -> f64 {
    coords
        .iter()
        .zip(coords.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum::<f64>()
        / 2.0
}

fn validate_ring(ring: &LineString<f64>) -> Result<(), String> {
    let coords = &ring.0;
    if coords.len() < 4 {
        return Err(format!("ring has {} positions", coords.len()));
    }
    if !ring.is_closed() {
        return Err("ring is not closed".to_string());
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return Err("ring has non-finite coordinates".to_string());
    }
    if signed_area(&coords[1..]) == 0.0 {
        return Err("ring has zero area".to_string());
    }
    if let Some((a, b)) = self_intersection(ring) {
        return Err(format!("ring self-intersects between segments {a} and {b}"));
    }
    Ok(())
}

fn self_intersection(ring: &LineString<f64>) -> Option<(usize, usize)> {
    let lines: Vec<Line<f64>> = ring.lines().collect();
    let n = lines.len();
    let min_x = |l: &Line<f64>| l.start.x.min(l.end.x);
    let max_x = |l: &Line<f64>| l.start.x.max(l.end.x);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| min_x(&lines[a]).total_cmp(&min_x(&lines[b])));

    for (k, &i) in order.iter().enumerate() {
        for &j in &order[k + 1..] {
            if min_x(&lines[j]) > max_x(&lines[i]) {
                break;
            }
            let adjacent = i.abs_diff(j) == 1 || i.abs_diff(j) == n - 1;
            let crosses = match line_intersection(lines[i], lines[j]) {
                None => false,
                Some(LineIntersection::SinglePoint { is_proper, .. }) => is_proper && !adjacent,
                Some(LineIntersection::Collinear { intersection }) => {
                    !adjacent || intersection.start != intersection.end
                }
            };
            if crosses {
                return Some((i.min(j), i.max(j)));
            }
        }
    }
    None
}

fn collinear(a: Coord<f64>, b: Coord<f64>, c: Coord<f64>) -> bool {
    let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    let scale = ((b.x - a.x).hypot(b.y - a.y)) * ((c.x - a.x).hypot(c.y - a.y));
    cross.abs() <= 1e-12 * scale
}

/// Open ring without repeated or collinear vertices, wound counter-clockwise
/// when `ccw`, starting at its lexicographically smallest vertex, then closed.
fn canonical_ring(ring: &LineString<f64>, ccw: bool) -> LineString<f64> {
    let mut coords = ring.0.clone();
    if ring.is_closed() {
        coords.pop();
    }
    coords.dedup();

    while coords.len() > 3 {
        let n = coords.len();
        match (0..n).find(|&i| collinear(coords[(i + n - 1) % n], coords[i], coords[(i + 1) % n])) {
            Some(i) => coords.remove(i),
            None => break,
        };
    }

    if (signed_area(&coords) > 0.0) != ccw {
        coords.reverse();
    }
    if let Some(start) = (0..coords.len()).min_by(|&a, &b| lexicographic(coords[a], coords[b])) {
        coords.rotate_left(start);
        coords.push(coords[0]);
    }
    LineString::new(coords)
}

fn lexicographic(a: Coord<f64>, b: Coord<f64>) -> Ordering {
    a.x.total_cmp(&b.x).then(a.y.total_cmp(&b.y))
}

/// Deterministic form of an overlay result: exteriors counter-clockwise,
/// holes clockwise, polygons ordered by their first vertex.
pub(super) fn canonicalize(geometry: MultiPolygon<f64>) -> MultiPolygon<f64> {
    let mut polygons: Vec<Polygon<f64>> = geometry
        .0
        .iter()
        .map(|x| {
            let mut interiors: Vec<LineString<f64>> = x
                .interiors()
                .iter()
                .map(|r| canonical_ring(r, false))
                .filter(|r| r.0.len() >= 4)
                .collect();
            interiors.sort_by(|a, b| lexicographic(a.0[0], b.0[0]));
            Polygon::new(canonical_ring(x.exterior(), true), interiors)
        })
        .filter(|x| x.exterior().0.len() >= 4)
        .collect();
    polygons.sort_by(|a, b| lexicographic(a.exterior().0[0], b.exterior().0[0]));
    MultiPolygon::new(polygons)
}
