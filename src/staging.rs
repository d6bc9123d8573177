//! Newline-delimited JSON staging files under `<data>/staging`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::model::{GeographicArea, Level, RawGeometry};

pub fn staging_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("staging")
}

pub fn raw_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("raw")
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StagedArea {
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serialize_always]
    #[serde(default)]
    pub geometry: Option<RawGeometry>,
    pub parent_code: Option<String>,
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub municipalities: Vec<String>,
    #[serde(rename = "Type")]
    pub kind: Option<String>,
}

impl StagedArea {
    pub fn into_area(self, level: Level) -> GeographicArea {
        GeographicArea {
            id: None,
            level,
            code: self.code.trim().to_string(),
            name: self.name.trim().to_string(),
            geometry: self.geometry.filter(|x| !x.as_str().trim().is_empty()),
            parent_code: self.parent_code.or(self.country_code),
        }
    }
}

/// Water company found for a set of municipalities.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaterCompany {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    pub country_code: Option<String>,
    #[serde(default)]
    pub municipalities: Vec<String>,
}

pub fn read_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        rows.push(
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}", path.display(), i + 1))?,
        );
    }
    Ok(rows)
}

pub fn write_ndjson<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut contents = String::new();
    for x in rows {
        contents.push_str(&serde_json::to_string(x)?);
        contents.push('\n');
    }
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// `*.ndjson` files in `dir` whose name starts with `prefix`, sorted.
pub fn files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|x| x.to_str())
            .is_some_and(|x| x.starts_with(prefix) && x.ends_with(".ndjson"));
        if matches {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn read_all<T: DeserializeOwned>(dir: &Path, prefix: &str) -> Result<Vec<T>> {
    let mut rows = Vec::new();
    for path in files(dir, prefix)? {
        rows.extend(read_ndjson(&path)?);
    }
    Ok(rows)
}
