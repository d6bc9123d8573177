//! Zone -> municipality membership.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use itertools::Itertools;

use crate::{
    error::ZoneError,
    model::{DistributionZone, GeographicArea, RawGeometry},
    utils::normalize_code,
};

/// Municipalities keyed by normalized code and name. The first record wins
/// when a code occurs twice.
pub struct MunicipalityIndex<'a> {
    by_code: HashMap<String, &'a GeographicArea>,
    sorted: Vec<(String, &'a GeographicArea)>,
    by_name: HashMap<String, Vec<&'a GeographicArea>>,
}

impl<'a> MunicipalityIndex<'a> {
    pub fn new(municipalities: &'a [GeographicArea]) -> Self {
        let mut by_code = HashMap::new();
        let mut by_name: HashMap<String, Vec<&GeographicArea>> = HashMap::new();
        for x in municipalities {
            by_code.entry(normalize_code(&x.code)).or_insert(x);
            let name = normalize_code(&x.name);
            if !name.is_empty() {
                by_name.entry(name).or_default().push(x);
            }
        }
        let sorted = by_code
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect();
        Self {
            by_code,
            sorted,
            by_name,
        }
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    pub fn get(&self, code: &str) -> Option<&'a GeographicArea> {
        self.by_code.get(&normalize_code(code)).copied()
    }

    /// Ascending by code.
    fn with_prefix(&self, prefix: &str) -> impl Iterator<Item = &'a GeographicArea> + '_ {
        let start = self.sorted.partition_point(|(code, _)| code.as_str() < prefix);
        let prefix = prefix.to_string();
        self.sorted[start..]
            .iter()
            .take_while(move |(code, _)| code.starts_with(&prefix))
            .map(|(_, x)| *x)
    }

    fn named(&self, name: &str) -> Vec<&'a GeographicArea> {
        let mut found = self
            .by_name
            .get(&normalize_code(name))
            .cloned()
            .unwrap_or_default();
        found.sort_by_key(|x| normalize_code(&x.code));
        found
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchSource {
    /// Linked member codes.
    Explicit,
    /// A municipality carrying the zone's own code.
    Exact,
    Prefix,
    Name,
}

#[derive(Debug)]
pub struct ZoneMatch<'a> {
    pub zone: &'a DistributionZone,
    pub source: MatchSource,
    /// Members carrying a geometry, in result order.
    pub members: Vec<&'a GeographicArea>,
    /// Explicit codes with no municipality in the zone's country.
    pub unresolved: Vec<String>,
    pub without_geometry: Vec<String>,
}

impl<'a> ZoneMatch<'a> {
    pub fn geometries(&self) -> impl Iterator<Item = (&'a str, &'a RawGeometry)> + '_ {
        self.members
            .iter()
            .copied()
            .filter_map(|x| Some((x.code.as_str(), x.geometry.as_ref()?)))
    }

    /// `NoMatchFound` when nothing usable matched.
    pub fn check(&self) -> Result<(), ZoneError> {
        match self.members.is_empty() {
            true => Err(ZoneError::NoMatchFound),
            false => Ok(()),
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        let code = self.zone.code();
        let mut warnings = Vec::new();
        if !self.unresolved.is_empty() {
            warnings.push(format!(
                "{code}: unknown municipalities {}",
                self.unresolved.join(", ")
            ));
        }
        if !self.without_geometry.is_empty() {
            warnings.push(format!(
                "{code}: municipalities without geometry {}",
                self.without_geometry.join(", ")
            ));
        }
        warnings
    }
}

fn same_country(zone: &DistributionZone, municipality: &GeographicArea) -> bool {
    match (&zone.area.parent_code, &municipality.parent_code) {
        (Some(a), Some(b)) => normalize_code(a) == normalize_code(b),
        _ => true,
    }
}

/// Members of one zone: explicit codes when the zone has any, otherwise the
/// municipality with the zone's code, otherwise municipalities whose code
/// starts with the zone code, otherwise those sharing the zone's name.
pub fn match_zone<'a>(zone: &'a DistributionZone, index: &MunicipalityIndex<'a>) -> ZoneMatch<'a> {
    let mut unresolved = Vec::new();
    let (source, candidates) = if !zone.members.is_empty() {
        let mut found: Vec<&GeographicArea> = Vec::new();
        for code in &zone.members {
            match index.get(code).filter(|x| same_country(zone, x)) {
                Some(x) if !found.iter().any(|y| std::ptr::eq(*y, x)) => found.push(x),
                Some(_) => {}
                None => unresolved.push(code.clone()),
            }
        }
        (MatchSource::Explicit, found)
    } else if let Some(x) = index
        .get(zone.code())
        .filter(|x| !zone.code().ends_with('*') && same_country(zone, x))
    {
        (MatchSource::Exact, vec![x])
    } else {
        let prefix = normalize_code(zone.code().trim_end_matches('*'));
        let by_prefix: Vec<_> = match prefix.is_empty() {
            true => Vec::new(),
            false => index
                .with_prefix(&prefix)
                .filter(|x| same_country(zone, x))
                .collect(),
        };
        if by_prefix.is_empty() {
            let by_name = index
                .named(&zone.area.name)
                .into_iter()
                .filter(|x| same_country(zone, x))
                .collect();
            (MatchSource::Name, by_name)
        } else {
            (MatchSource::Prefix, by_prefix)
        }
    };

    let (members, without): (Vec<_>, Vec<_>) =
        candidates.into_iter().partition(|x| x.geometry.is_some());
    ZoneMatch {
        zone,
        source,
        members,
        unresolved,
        without_geometry: without.into_iter().map(|x| x.code.clone()).collect(),
    }
}

/// A municipality claimed by more than one zone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub municipality: String,
    pub zones: Vec<String>,
    /// Lower priority claims that were removed.
    pub dropped_from: Vec<String>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} claimed by {}", self.municipality, self.zones.join(", "))?;
        if !self.dropped_from.is_empty() {
            write!(f, " (dropped from {})", self.dropped_from.join(", "))?;
        }
        Ok(())
    }
}

/// Matches every zone, then settles double claims: explicit links and exact
/// code matches win over prefix and name matches, equal claims are kept and
/// reported.
pub fn match_zones<'a>(
    zones: &'a [DistributionZone],
    index: &MunicipalityIndex<'a>,
) -> (Vec<ZoneMatch<'a>>, Vec<Conflict>) {
    let mut matches: Vec<ZoneMatch> = zones.iter().map(|x| match_zone(x, index)).collect();

    let mut claims: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, m) in matches.iter().enumerate() {
        for x in &m.members {
            claims.entry(normalize_code(&x.code)).or_default().push(i);
        }
    }

    let mut conflicts = Vec::new();
    for (code, claimants) in claims {
        if claimants.len() < 2 {
            continue;
        }
        let municipality = matches[claimants[0]]
            .members
            .iter()
            .find(|x| normalize_code(&x.code) == code)
            .map(|x| x.code.clone())
            .unwrap_or_else(|| code.clone());
        let zones = claimants
            .iter()
            .map(|&i| matches[i].zone.code().to_string())
            .collect();

        let best = claimants
            .iter()
            .map(|&i| matches[i].source)
            .min()
            .unwrap_or(MatchSource::Explicit);
        let mut dropped_from = Vec::new();
        if best <= MatchSource::Exact {
            for &i in &claimants {
                if matches[i].source > MatchSource::Exact {
                    matches[i].members.retain(|x| normalize_code(&x.code) != code);
                    dropped_from.push(matches[i].zone.code().to_string());
                }
            }
        }
        conflicts.push(Conflict {
            municipality,
            zones,
            dropped_from,
        });
    }
    (matches, conflicts)
}
