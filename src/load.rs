//! `load zones <level>`: staged areas into the record store.

use std::{
    collections::{HashMap, HashSet},
    fmt::Write,
    path::Path,
};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    model::{Level, CODE, COUNTRY_CODE, COUNTRY_ID, GEOMETRY, MUNICIPALITIES, NAME, TYPE},
    staging::{read_all, staging_dir, StagedArea},
    store::{with_retry, Fields, Query, RecordId, RecordStore, RetryPolicy},
    utils::normalize_code,
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub staged: usize,
    pub existing: usize,
    pub inserted: usize,
    pub linked: usize,
    /// Codes whose parent is not in the store.
    pub missing_parent: Vec<String>,
    /// (zone code, member code) pairs that matched no municipality.
    pub unresolved_members: Vec<(String, String)>,
}

impl LoadReport {
    pub fn to_markdown(&self) -> Result<String, std::fmt::Error> {
        let mut md = String::new();
        writeln!(md, "## Statistics\n")?;
        writeln!(md, "- {} staged, {} already loaded", self.staged, self.existing)?;
        writeln!(md, "- {} inserted", self.inserted)?;
        writeln!(md, "- {} linked", self.linked)?;
        writeln!(md)?;
        if !self.missing_parent.is_empty() || !self.unresolved_members.is_empty() {
            writeln!(md, "## Todo\n")?;
            for x in &self.missing_parent {
                writeln!(md, "- {x:?} has no parent in the store")?;
            }
            for (zone, member) in &self.unresolved_members {
                writeln!(md, "- {zone:?} links unknown municipality {member:?}")?;
            }
        }
        Ok(md)
    }
}

/// Normalized code -> record id for every record of `level`.
pub fn code_ids(
    store: &dyn RecordStore,
    level: Level,
    retry: &RetryPolicy,
) -> Result<HashMap<String, RecordId>> {
    let table = level.name();
    let query = Query::new().fields([CODE]);
    let records = with_retry(retry, &format!("list {table}"), || store.list(table, &query))
        .with_context(|| format!("reading {table}"))?;
    let mut ids = HashMap::new();
    for x in records {
        if let Some(code) = x.text(CODE) {
            ids.entry(normalize_code(&code)).or_insert(x.id);
        }
    }
    Ok(ids)
}

fn fields(area: &StagedArea, parent: Option<RecordId>) -> Fields {
    let mut fields = Fields::new();
    fields.insert(CODE.into(), area.code.trim().into());
    fields.insert(NAME.into(), area.name.trim().into());
    fields.insert(
        GEOMETRY.into(),
        area.geometry
            .as_ref()
            .map_or(Value::Null, |x| x.as_str().into()),
    );
    if let Some(x) = area.country_code.as_ref().or(area.parent_code.as_ref()) {
        fields.insert(COUNTRY_CODE.into(), x.as_str().into());
    }
    if let Some(x) = &area.kind {
        fields.insert(TYPE.into(), x.as_str().into());
    }
    if let Some(id) = parent {
        fields.insert(COUNTRY_ID.into(), id.into());
    }
    fields
}

pub fn zones(
    store: &dyn RecordStore,
    level: Level,
    data_dir: &Path,
    retry: &RetryPolicy,
) -> Result<LoadReport> {
    let table = level.name();
    let staged: Vec<StagedArea> = read_all(&staging_dir(data_dir), table)?;
    let mut report = LoadReport {
        staged: staged.len(),
        ..Default::default()
    };

    let existing = code_ids(store, level, retry)?;
    let parents = match level.parent() {
        Some(parent) => Some(code_ids(store, parent, retry)?),
        None => None,
    };

    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    for area in staged {
        let code = normalize_code(&area.code);
        if code.is_empty() || !seen.insert(code.clone()) {
            continue;
        }
        if existing.contains_key(&code) {
            report.existing += 1;
            continue;
        }
        let parent = match &parents {
            None => None,
            Some(parents) => {
                let parent_code = area.parent_code.as_ref().or(area.country_code.as_ref());
                match parent_code.and_then(|x| parents.get(&normalize_code(x))) {
                    Some(id) => Some(*id),
                    None => {
                        report.missing_parent.push(area.code.clone());
                        continue;
                    }
                }
            }
        };
        pending.push((fields(&area, parent), area));
    }

    if !report.missing_parent.is_empty() {
        warn!("{} {table} records have no parent", report.missing_parent.len());
    }
    info!("inserting {} {table} records", pending.len());
    let rows = pending.iter().map(|(x, _)| x.clone()).collect();
    let ids = store
        .insert(table, rows)
        .with_context(|| format!("inserting into {table}"))?;
    report.inserted = ids.len();

    if level == Level::DistributionZone {
        let municipalities = code_ids(store, Level::Municipality, retry)?;
        for (id, (_, area)) in ids.iter().zip(&pending) {
            let mut targets = Vec::new();
            for member in &area.municipalities {
                match municipalities.get(&normalize_code(member)) {
                    Some(x) => targets.push(*x),
                    None => report
                        .unresolved_members
                        .push((area.code.clone(), member.clone())),
                }
            }
            if targets.is_empty() {
                continue;
            }
            with_retry(retry, &format!("link {}", area.code), || {
                store.link(table, MUNICIPALITIES, *id, &targets)
            })
            .with_context(|| format!("linking {}", area.code))?;
            report.linked += 1;
        }
    }

    info!(
        "{} inserted, {} already loaded, {} linked",
        report.inserted, report.existing, report.linked
    );
    Ok(report)
}
