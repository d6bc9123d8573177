//! `transform distribution-zones`: one staged zone per water company.

use std::{collections::HashSet, path::Path};

use anyhow::Result;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    error::ZoneError,
    geometry::{self, GeometryOps},
    matcher::{match_zones, MunicipalityIndex, ZoneMatch},
    model::{DistributionZone, GeographicArea, Level, DISTRIBUTION_TYPE},
    report::{RunReport, ZoneOutcome, ZoneResult},
    staging::{read_all, read_ndjson, staging_dir, write_ndjson, StagedArea, WaterCompany},
    utils::progress_bar,
};

pub const OUTPUT: &str = "DistributionZone_from_water_companies.ndjson";

fn zone_for(company: &WaterCompany) -> DistributionZone {
    DistributionZone {
        area: GeographicArea {
            id: None,
            level: Level::DistributionZone,
            code: company.name.trim().to_string(),
            name: company.name.trim().to_string(),
            geometry: None,
            parent_code: company.country_code.clone(),
        },
        members: company.municipalities.clone(),
    }
}

/// `m` is `None` for companies without municipalities, which get no name or
/// prefix fallback.
fn stage(
    ops: &dyn GeometryOps,
    zone: &DistributionZone,
    m: Option<&ZoneMatch>,
) -> Result<(StagedArea, ZoneResult), ZoneError> {
    let mut staged = StagedArea {
        code: zone.code().to_string(),
        name: zone.area.name.clone(),
        geometry: None,
        parent_code: zone.area.parent_code.clone(),
        country_code: zone.area.parent_code.clone(),
        municipalities: zone.members.clone(),
        kind: Some(DISTRIBUTION_TYPE.to_string()),
    };

    let mut warnings = m.map(|x| x.warnings()).unwrap_or_default();
    let resolved = m
        .ok_or(ZoneError::NoMatchFound)
        .and_then(|x| x.check().map(|()| x))
        .and_then(|x| geometry::resolve(ops, x.geometries()));

    let outcome = match resolved {
        Err(ZoneError::NoGeometryAvailable) => return Err(ZoneError::NoGeometryAvailable),
        Err(e) => ZoneOutcome::Failed(e),
        Ok(resolution) => match geometry::to_raw(&resolution.geometry) {
            Ok(raw) => {
                warnings.extend(resolution.warnings);
                staged.geometry = Some(raw);
                ZoneOutcome::Written
            }
            Err(e) => ZoneOutcome::Failed(ZoneError::InvalidGeometry {
                code: zone.code().to_string(),
                reason: e.to_string(),
            }),
        },
    };

    let result = ZoneResult {
        code: staged.code.clone(),
        outcome,
        warnings,
    };
    Ok((staged, result))
}

pub fn distribution_zones(data_dir: &Path, ops: &dyn GeometryOps) -> Result<RunReport> {
    let staging = staging_dir(data_dir);
    let companies: Vec<WaterCompany> = read_all(&staging, "WaterCompany")?;
    let municipalities: Vec<GeographicArea> =
        read_ndjson::<StagedArea>(&staging.join("Municipality.ndjson"))?
            .into_iter()
            .map(|x| x.into_area(Level::Municipality))
            .collect();
    let index = MunicipalityIndex::new(&municipalities);

    let mut seen = HashSet::new();
    let mut zones: Vec<DistributionZone> = Vec::new();
    for x in &companies {
        let zone = zone_for(x);
        if zone.code().is_empty() {
            warn!("skipping a water company without name");
        } else if !seen.insert(zone.code().to_string()) {
            warn!("{}: duplicate water company, keeping the first", zone.code());
        } else {
            zones.push(zone);
        }
    }
    info!(
        "{} water companies, {} municipalities",
        zones.len(),
        index.len()
    );

    let (linked, unlinked): (Vec<_>, Vec<_>) =
        zones.into_iter().partition(|x| !x.members.is_empty());
    let (matches, conflicts) = match_zones(&linked, &index);
    for x in &conflicts {
        warn!("conflict: {x}");
    }

    let pb = progress_bar((matches.len() + unlinked.len()) as u64);
    let staged = matches
        .par_iter()
        .map(|m| (m.zone, Some(m)))
        .chain(unlinked.par_iter().map(|x| (x, None::<&ZoneMatch>)))
        .progress_with(pb)
        .map(|(zone, m)| stage(ops, zone, m))
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = RunReport {
        conflicts,
        ..Default::default()
    };
    let mut rows = Vec::new();
    for (row, result) in staged {
        rows.push(row);
        report.record(result);
    }

    let output = staging.join(OUTPUT);
    write_ndjson(&output, &rows)?;
    info!(
        "{} zones written to {} ({} without geometry)",
        rows.len(),
        output.display(),
        report.failed_count()
    );
    Ok(report)
}
