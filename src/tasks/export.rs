//! Stored zone geometries as GeoJSON, optionally tiled with tippecanoe.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Result};
use geojson::{Feature, FeatureCollection, JsonObject};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    geometry,
    model::{Level, RawGeometry, CODE, GEOMETRY, NAME},
    staging::staging_dir,
    store::{with_retry, Query, RecordStore, RetryPolicy},
};

pub const PVC_LEVEL: &str = "PVC Level";
pub const VCM_LEVEL: &str = "VCM Level";

/// Exported tables and their tile layer names.
pub const LAYERS: [(Level, &str); 2] = [
    (Level::Country, "data_countries"),
    (Level::DistributionZone, "data_distribution_zones"),
];

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub features: usize,
    pub without_geometry: usize,
    pub invalid: usize,
}

pub fn geojson(
    store: &dyn RecordStore,
    level: Level,
    output_dir: &Path,
    retry: &RetryPolicy,
) -> Result<(PathBuf, ExportStats)> {
    let table = level.name();
    let query = Query::new().fields([CODE, NAME, GEOMETRY, PVC_LEVEL, VCM_LEVEL]);
    let records = with_retry(retry, &format!("list {table}"), || store.list(table, &query))
        .with_context(|| format!("reading {table}"))?;
    info!("loaded {} records from {table}", records.len());

    let mut stats = ExportStats::default();
    let mut features = Vec::new();
    for x in &records {
        let Some(raw) = RawGeometry::from_value(x.fields.get(GEOMETRY)) else {
            stats.without_geometry += 1;
            continue;
        };
        let geometry = match geometry::parse_geojson(&raw) {
            Ok(g) => g,
            Err(e) => {
                warn!("{table} {}: {e}", x.id);
                stats.invalid += 1;
                continue;
            }
        };

        let mut properties = JsonObject::new();
        let cell = |key: &str| x.fields.get(key).cloned().unwrap_or(Value::Null);
        properties.insert("code".into(), cell(CODE));
        properties.insert("name".into(), cell(NAME));
        properties.insert("pvc_level".into(), cell(PVC_LEVEL));
        properties.insert("vcm_level".into(), cell(VCM_LEVEL));
        features.push(Feature {
            bbox: None,
            geometry: Some(geometry),
            id: None,
            properties: Some(properties),
            foreign_members: None,
        });
    }
    if stats.without_geometry > 0 {
        warn!("skipped {} {table} records without geometry", stats.without_geometry);
    }
    stats.features = features.len();

    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    };
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join(format!("{table}_tile_data.geojson"));
    fs::write(&path, serde_json::to_string(&collection)?)
        .with_context(|| format!("writing {}", path.display()))?;
    info!("wrote {} features to {}", stats.features, path.display());
    Ok((path, stats))
}

pub fn tippecanoe(input: &Path, output: &Path, layer: &str) -> Command {
    let mut command = Command::new("tippecanoe");
    command
        .arg("-zg")
        .arg("--force")
        .arg("-o")
        .arg(output)
        .arg("--layer")
        .arg(layer)
        .arg("--coalesce-densest-as-needed")
        .arg("--extend-zooms-if-still-dropping")
        .arg(input);
    command
}

/// `task export-tiles`
pub fn run(
    store: &dyn RecordStore,
    data_dir: &Path,
    tiles: bool,
    retry: &RetryPolicy,
) -> Result<()> {
    let export_dir = data_dir.join("export");
    for (level, layer) in LAYERS {
        let (path, _) = geojson(store, level, &staging_dir(data_dir), retry)?;
        if !tiles {
            continue;
        }
        fs::create_dir_all(&export_dir)?;
        let output = export_dir.join(format!("{layer}.pmtiles"));
        let mut command = tippecanoe(&path, &output, layer);
        info!("running {command:?}");
        let status = command.status().context("running tippecanoe")?;
        if !status.success() {
            bail!("tippecanoe failed for {layer}: {status}");
        }
        info!("created {}", output.display());
    }
    Ok(())
}
