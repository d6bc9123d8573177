//! Polygon parsing, repair and union for zone geometries. Coordinates are
//! WGS84 longitude/latitude and are never reprojected.

use geo::{Area, Coord, Geometry, LineString, MultiPolygon, Polygon};
use serde_json::Value;

use crate::{error::ZoneError, model::RawGeometry};

mod planar;

pub use planar::PlanarOps;

// relative area change above which a repair is reported
const MATERIAL_CHANGE: f64 = 1e-6;

/// The computational-geometry capability the pipeline depends on.
pub trait GeometryOps: Send + Sync {
    /// `Err` carries a human readable description of the first defect.
    fn validate(&self, geometry: &MultiPolygon<f64>) -> Result<(), String>;

    /// Rebuilds a valid geometry covering the same area where possible.
    fn repair(&self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64>;

    fn union(&self, geometries: &[MultiPolygon<f64>]) -> MultiPolygon<f64>;
}

#[derive(Debug)]
pub struct Resolution {
    pub geometry: MultiPolygon<f64>,
    pub warnings: Vec<String>,
}

/// Parses stored GeoJSON text. The text may itself be a JSON string holding
/// the geometry, as happens when a geometry column is encoded twice.
pub fn parse_geojson(raw: &RawGeometry) -> Result<geojson::Geometry, String> {
    let mut value: Value =
        serde_json::from_str(raw.as_str()).map_err(|e| format!("not JSON: {e}"))?;
    if let Value::String(inner) = value {
        value = serde_json::from_str(&inner).map_err(|e| format!("not JSON: {e}"))?;
    }
    serde_json::from_value(value).map_err(|e| format!("not a GeoJSON geometry: {e}"))
}

pub fn parse(raw: &RawGeometry) -> Result<MultiPolygon<f64>, String> {
    let geometry: Geometry<f64> = parse_geojson(raw)?
        .value
        .try_into()
        .map_err(|e: geojson::Error| e.to_string())?;
    areal(geometry)
}

fn areal(geometry: Geometry<f64>) -> Result<MultiPolygon<f64>, String> {
    match geometry {
        Geometry::Polygon(x) => Ok(MultiPolygon::new(vec![x])),
        Geometry::MultiPolygon(x) => Ok(x),
        Geometry::GeometryCollection(x) => {
            let mut polygons = Vec::new();
            for part in x {
                polygons.extend(areal(part)?.0);
            }
            Ok(MultiPolygon::new(polygons))
        }
        _ => Err("expected a Polygon or MultiPolygon".to_string()),
    }
}

/// One part becomes a GeoJSON `Polygon`, anything else a `MultiPolygon`.
pub fn to_geojson(geometry: &MultiPolygon<f64>) -> geojson::Geometry {
    let value = match geometry.0.as_slice() {
        [single] => geojson::Value::from(single),
        _ => geojson::Value::from(geometry),
    };
    geojson::Geometry::new(value)
}

pub fn to_raw(geometry: &MultiPolygon<f64>) -> Result<RawGeometry, serde_json::Error> {
    Ok(RawGeometry::new(serde_json::to_string(&to_geojson(geometry))?))
}

/// Drops repeated consecutive vertices and closes rings.
pub fn normalize(geometry: MultiPolygon<f64>) -> MultiPolygon<f64> {
    fn ring(x: &LineString<f64>) -> LineString<f64> {
        let mut coords: Vec<Coord<f64>> = x.0.clone();
        coords.dedup();
        LineString::new(coords)
    }

    MultiPolygon::new(
        geometry
            .0
            .iter()
            .map(|x| {
                // Polygon::new closes open rings
                Polygon::new(ring(x.exterior()), x.interiors().iter().map(ring).collect())
            })
            .collect(),
    )
}

/// Union of the members' geometries. A single member is passed through
/// unchanged apart from normalization.
pub fn resolve<'a>(
    ops: &dyn GeometryOps,
    members: impl IntoIterator<Item = (&'a str, &'a RawGeometry)>,
) -> Result<Resolution, ZoneError> {
    let mut warnings = Vec::new();
    let mut parts = Vec::new();

    for (code, raw) in members {
        let invalid = |reason: String| ZoneError::InvalidGeometry {
            code: code.to_string(),
            reason,
        };
        let geometry = normalize(parse(raw).map_err(invalid)?);
        let geometry = match ops.validate(&geometry) {
            Ok(()) => geometry,
            Err(defect) => {
                let repaired = ops.repair(&geometry);
                if let Err(e) = ops.validate(&repaired) {
                    return Err(invalid(format!("{defect}; repair failed: {e}")));
                }
                let (before, after) = (geometry.unsigned_area(), repaired.unsigned_area());
                if (before - after).abs() > MATERIAL_CHANGE * before.max(after) {
                    warnings.push(format!(
                        "{code}: repaired geometry ({defect}) changed area from {before} to {after}"
                    ));
                }
                repaired
            }
        };
        parts.push(geometry);
    }

    let geometry = match parts.len() {
        0 => return Err(ZoneError::NoGeometryAvailable),
        1 => parts.remove(0),
        _ => ops.union(&parts),
    };
    Ok(Resolution { geometry, warnings })
}
