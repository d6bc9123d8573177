//! Administrative boundaries from raw GeoJSON into staging records.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufReader,
    path::Path,
};

use anyhow::{anyhow, bail, Context, Result};
use geojson::{Feature, GeoJson};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    model::{Level, RawGeometry},
    staging::{raw_dir, staging_dir, write_ndjson, StagedArea},
};

pub mod wasserportal;

pub const EUROPEAN_COUNTRIES: [&str; 12] = [
    "AT", "DK", "FR", "DE", "IT", "NL", "NO", "PL", "PT", "ES", "SE", "GB",
];

/// Where a level's properties live in the raw files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelConfig {
    pub file_suffix: &'static str,
    pub name: &'static str,
    pub code: &'static str,
    pub parent: Option<&'static str>,
}

impl LevelConfig {
    pub fn for_level(level: Level) -> Option<Self> {
        match level {
            Level::Country => Some(Self {
                file_suffix: "countries.geojson",
                name: "name",
                code: "ISO3166-1-Alpha-2",
                parent: None,
            }),
            Level::Municipality => Some(Self {
                file_suffix: "municipalities.geojson",
                name: "COMM_NAME",
                code: "COMM_ID",
                parent: Some("CNTR_CODE"),
            }),
            Level::DistributionZone => None,
        }
    }
}

fn property(feature: &Feature, key: &str) -> Option<String> {
    match feature.property(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn country(code: String) -> String {
    match code.as_str() {
        "UK" => "GB".to_string(),
        _ => code,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub written: usize,
    pub incomplete: usize,
    pub duplicates: usize,
    pub outside: usize,
}

/// Turns features into staging records: features without code or geometry,
/// outside the configured countries, or repeating an earlier code are
/// counted and dropped.
pub fn stage_features(
    config: &LevelConfig,
    features: impl IntoIterator<Item = Feature>,
    stats: &mut ExtractStats,
    seen: &mut HashSet<String>,
) -> Result<Vec<StagedArea>> {
    let mut rows = Vec::new();
    for feature in features {
        let (Some(code), Some(geometry)) = (property(&feature, config.code), &feature.geometry)
        else {
            stats.incomplete += 1;
            continue;
        };

        let (code, parent) = match config.parent {
            None => (country(code), None),
            Some(key) => (code, property(&feature, key).map(country)),
        };
        let country_code = parent.as_deref().unwrap_or(&code);
        if !EUROPEAN_COUNTRIES.contains(&country_code) {
            stats.outside += 1;
            continue;
        }
        if !seen.insert(code.clone()) {
            stats.duplicates += 1;
            continue;
        }

        rows.push(StagedArea {
            name: property(&feature, config.name).unwrap_or_else(|| code.clone()),
            geometry: Some(RawGeometry::new(serde_json::to_string(geometry)?)),
            country_code: parent.clone(),
            parent_code: parent,
            code,
            ..Default::default()
        });
    }
    Ok(rows)
}

/// `extract geojson <level>`: every `*<suffix>` file in `<data>/raw` into
/// `<data>/staging/<Level>.ndjson`.
pub fn geojson(level: Level, data_dir: &Path) -> Result<ExtractStats> {
    let Some(config) = LevelConfig::for_level(level) else {
        bail!("{level} has no GeoJSON source; use `transform distribution-zones`");
    };

    let raw = raw_dir(data_dir);
    let mut paths = Vec::new();
    for entry in fs::read_dir(&raw).with_context(|| format!("listing {}", raw.display()))? {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|x| x.to_str())
            .is_some_and(|x| x.ends_with(config.file_suffix))
        {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        warn!("no *{} files in {}", config.file_suffix, raw.display());
    }

    let mut stats = ExtractStats::default();
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for path in paths {
        info!("reading {}", path.display());
        let reader = BufReader::new(File::open(&path)?);
        let collection = match GeoJson::from_reader(reader)
            .with_context(|| format!("parsing {}", path.display()))?
        {
            GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(anyhow!("{} is not a FeatureCollection", path.display())),
        };
        rows.extend(stage_features(
            &config,
            collection.features,
            &mut stats,
            &mut seen,
        )?);
    }

    stats.written = rows.len();
    let output = staging_dir(data_dir).join(format!("{}.ndjson", level.name()));
    write_ndjson(&output, &rows)?;
    info!(
        "{} {level} records written to {} ({} incomplete, {} duplicate, {} outside Europe)",
        stats.written,
        output.display(),
        stats.incomplete,
        stats.duplicates,
        stats.outside
    );
    Ok(stats)
}
