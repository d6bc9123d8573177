//! Resolves missing distribution zone geometries from their municipalities
//! and writes them back to the record store.

use anyhow::{Context, Result};
use geo::MultiPolygon;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{StoreReadFailure, ZoneError},
    geometry::{self, GeometryOps},
    matcher::{match_zones, MunicipalityIndex, ZoneMatch},
    model::{
        DistributionZone, GeographicArea, Level, CODE, COUNTRY_CODE, GEOMETRY, MUNICIPALITY_CODES,
        NAME,
    },
    report::{RunReport, ZoneOutcome, ZoneResult},
    store::{with_retry, Fields, Query, Record, RecordId, RecordStore, RetryPolicy},
    tasks::CancelToken,
    utils::progress_bar,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZoneState {
    Unresolved,
    Matching,
    Resolved,
    /// No members, or their geometries could not be resolved.
    MatchFailed,
    Writing,
    Written,
    WriteFailed,
}

impl ZoneState {
    pub fn can_advance_to(self, next: ZoneState) -> bool {
        use ZoneState::*;
        matches!(
            (self, next),
            (Unresolved, Matching)
                | (Matching, Resolved)
                | (Matching, MatchFailed)
                | (Resolved, Writing)
                | (Writing, Written)
                | (Writing, WriteFailed)
        )
    }

    pub fn advance(&mut self, next: ZoneState) {
        debug_assert!(self.can_advance_to(next), "{self:?} -> {next:?}");
        *self = next;
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::MatchFailed | Self::Written | Self::WriteFailed)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    pub retry: RetryPolicy,
    pub cancel: CancelToken,
}

fn read(
    store: &dyn RecordStore,
    level: Level,
    fields: &[&str],
    retry: &RetryPolicy,
) -> Result<Vec<Record>, StoreReadFailure> {
    let table = level.name();
    let query = Query::new().fields(fields.iter().copied());
    with_retry(retry, &format!("list {table}"), || store.list(table, &query)).map_err(|e| {
        StoreReadFailure {
            table: table.to_string(),
            source: e.error,
        }
    })
}

pub fn run(
    store: &dyn RecordStore,
    ops: &dyn GeometryOps,
    options: &Options,
) -> Result<RunReport> {
    let zones: Vec<DistributionZone> = read(
        store,
        Level::DistributionZone,
        &[CODE, NAME, GEOMETRY, COUNTRY_CODE, MUNICIPALITY_CODES],
        &options.retry,
    )?
    .iter()
    .filter_map(DistributionZone::from_record)
    .collect();
    let municipalities: Vec<GeographicArea> = read(
        store,
        Level::Municipality,
        &[CODE, NAME, GEOMETRY, COUNTRY_CODE],
        &options.retry,
    )?
    .iter()
    .filter_map(|x| GeographicArea::from_record(Level::Municipality, x))
    .collect();

    let index = MunicipalityIndex::new(&municipalities);
    if index.is_empty() {
        warn!("no municipalities with a code in the store");
    }
    info!(
        "{} zones, {} municipalities",
        zones.len(),
        index.len()
    );

    let (matches, conflicts) = match_zones(&zones, &index);
    for x in &conflicts {
        warn!("conflict: {x}");
    }
    let mut report = RunReport {
        conflicts,
        ..Default::default()
    };

    let mut pending = Vec::new();
    for m in matches {
        match m.zone.area.id {
            Some(id) if m.zone.area.geometry.is_none() => pending.push((id, m)),
            _ => report.record(ZoneResult {
                code: m.zone.code().to_string(),
                outcome: ZoneOutcome::Skipped,
                warnings: Vec::new(),
            }),
        }
    }
    info!("{} zones need a geometry", pending.len());

    let pb = progress_bar(pending.len() as u64);
    let results = pending
        .par_iter()
        .progress_with(pb)
        .map(|(id, m)| process_zone(store, ops, *id, m, options))
        .collect::<Result<Vec<_>, _>>()
        .context("zone resolution aborted")?;
    for result in results {
        report.record(result);
    }

    let unmatched = report.failed_codes(ZoneError::NoMatchFound.kind());
    if !unmatched.is_empty() {
        warn!("{} zones match no municipality", unmatched.len());
    }
    info!(
        "{} resolved, {} skipped, {} failed",
        report.resolved_count(),
        report.skipped,
        report.failed_count()
    );
    Ok(report)
}

/// Only `NoGeometryAvailable` is returned as an error; every other failure
/// ends up in the zone's outcome.
fn process_zone(
    store: &dyn RecordStore,
    ops: &dyn GeometryOps,
    id: RecordId,
    m: &ZoneMatch,
    options: &Options,
) -> Result<ZoneResult, ZoneError> {
    let code = m.zone.code().to_string();
    if options.cancel.is_cancelled() {
        return Ok(ZoneResult {
            code,
            outcome: ZoneOutcome::Cancelled,
            warnings: Vec::new(),
        });
    }

    let mut state = ZoneState::Unresolved;
    state.advance(ZoneState::Matching);
    let mut warnings = m.warnings();

    let outcome = match m.check().and_then(|()| geometry::resolve(ops, m.geometries())) {
        Err(ZoneError::NoGeometryAvailable) => return Err(ZoneError::NoGeometryAvailable),
        Err(e) => {
            state.advance(ZoneState::MatchFailed);
            debug!("{code}: {e}");
            ZoneOutcome::Failed(e)
        }
        Ok(resolution) => {
            state.advance(ZoneState::Resolved);
            warnings.extend(resolution.warnings);
            state.advance(ZoneState::Writing);
            match write(store, id, &code, &resolution.geometry, &options.retry) {
                Ok(()) => {
                    state.advance(ZoneState::Written);
                    ZoneOutcome::Written
                }
                Err(e) => {
                    state.advance(ZoneState::WriteFailed);
                    warn!("{code}: {e}");
                    ZoneOutcome::Failed(e)
                }
            }
        }
    };
    debug_assert!(state.is_terminal());

    Ok(ZoneResult {
        code,
        outcome,
        warnings,
    })
}

fn write(
    store: &dyn RecordStore,
    id: RecordId,
    code: &str,
    geometry: &MultiPolygon<f64>,
    retry: &RetryPolicy,
) -> Result<(), ZoneError> {
    let raw = geometry::to_raw(geometry).map_err(|e| ZoneError::InvalidGeometry {
        code: code.to_string(),
        reason: e.to_string(),
    })?;
    let mut fields = Fields::new();
    fields.insert(GEOMETRY.to_string(), Value::String(raw.into_string()));

    let table = Level::DistributionZone.name();
    with_retry(retry, &format!("update {code}"), || {
        store.update(table, id, fields.clone())
    })
    .map_err(|e| ZoneError::StoreWriteFailure {
        attempts: e.attempts,
        source: e.error,
    })
}
