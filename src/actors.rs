//! Water company actors and their zones.

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::{
    load::code_ids,
    model::{
        Actor, Level, ACTOR_TABLE, CODE, COUNTRY_CODE, COUNTRY_ID, DISTRIBUTION_TYPE, NAME, TYPE,
        WATER_COMPANY_TYPE, ZONES,
    },
    store::{with_retry, Fields, Query, RecordStore, RetryPolicy},
    utils::normalize_code,
};

pub fn read_csv(path: &Path) -> Result<Vec<Actor>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    for required in [NAME, "Country"] {
        if !headers.iter().any(|x| x == required) {
            bail!("{} has no {required} column", path.display());
        }
    }

    let mut actors = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut name = String::new();
        let mut country = String::new();
        let mut extra = BTreeMap::new();
        for (key, value) in headers.iter().zip(row.iter()) {
            let value = value.trim();
            match key {
                NAME => name = value.to_string(),
                "Country" => country = value.to_uppercase(),
                _ if !value.is_empty() => {
                    extra.insert(key.to_string(), value.to_string());
                }
                _ => {}
            }
        }
        if !name.is_empty() {
            actors.push(Actor {
                name,
                country,
                extra,
            });
        }
    }
    Ok(actors)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ActorReport {
    pub read: usize,
    pub existing: usize,
    pub inserted: usize,
    pub zones_created: usize,
    pub linked: usize,
}

/// Inserts actors that are not in the store yet and links each one to the
/// zone named after it, creating missing zones in the actor's country.
pub fn load_water_companies(
    store: &dyn RecordStore,
    path: &Path,
    retry: &RetryPolicy,
) -> Result<ActorReport> {
    let actors = read_csv(path)?;
    let mut report = ActorReport {
        read: actors.len(),
        ..Default::default()
    };

    let query = Query::new().fields([NAME]).eq(TYPE, WATER_COMPANY_TYPE);
    let existing: HashSet<String> = with_retry(retry, "list Actor", || {
        store.list(ACTOR_TABLE, &query)
    })
    .context("reading Actor")?
    .iter()
    .filter_map(|x| x.text(NAME))
    .map(|x| normalize_code(&x))
    .collect();
    let countries = code_ids(store, Level::Country, retry)?;
    let mut zones = code_ids(store, Level::DistributionZone, retry)?;

    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    for actor in actors {
        let key = normalize_code(&actor.name);
        if existing.contains(&key) {
            report.existing += 1;
        } else if seen.insert(key) {
            pending.push(actor);
        }
    }

    let missing: Vec<&Actor> = pending
        .iter()
        .filter(|x| !zones.contains_key(&normalize_code(&x.name)))
        .collect();
    if !missing.is_empty() {
        let rows = missing
            .iter()
            .map(|x| {
                let mut fields = Fields::new();
                fields.insert(CODE.into(), x.name.as_str().into());
                fields.insert(NAME.into(), x.name.as_str().into());
                fields.insert(TYPE.into(), DISTRIBUTION_TYPE.into());
                fields.insert(COUNTRY_CODE.into(), x.country.as_str().into());
                if let Some(id) = countries.get(&normalize_code(&x.country)) {
                    fields.insert(COUNTRY_ID.into(), (*id).into());
                }
                fields
            })
            .collect();
        let ids = store
            .insert(Level::DistributionZone.name(), rows)
            .context("creating zones")?;
        report.zones_created = ids.len();
        for (x, id) in missing.iter().zip(ids) {
            zones.insert(normalize_code(&x.name), id);
        }
    }

    let rows = pending
        .iter()
        .map(|x| {
            let mut fields = Fields::new();
            for (k, v) in &x.extra {
                fields.insert(k.clone(), v.as_str().into());
            }
            fields.insert(NAME.into(), x.name.as_str().into());
            fields.insert(TYPE.into(), WATER_COMPANY_TYPE.into());
            if let Some(id) = countries.get(&normalize_code(&x.country)) {
                fields.insert(COUNTRY_ID.into(), (*id).into());
            }
            fields
        })
        .collect();
    let ids = store
        .insert(ACTOR_TABLE, rows)
        .context("inserting actors")?;
    report.inserted = ids.len();

    for (actor, id) in pending.iter().zip(ids) {
        let Some(zone) = zones.get(&normalize_code(&actor.name)) else {
            continue;
        };
        with_retry(retry, &format!("link {}", actor.name), || {
            store.link(ACTOR_TABLE, ZONES, id, &[*zone])
        })
        .with_context(|| format!("linking {}", actor.name))?;
        report.linked += 1;
    }

    info!(
        "{} actors read, {} already loaded, {} inserted, {} zones created",
        report.read, report.existing, report.inserted, report.zones_created
    );
    Ok(report)
}

/// Deletes actors without a name and returns how many were removed.
pub fn clean_blank_actors(store: &dyn RecordStore, retry: &RetryPolicy) -> Result<usize> {
    let query = Query::new().fields([NAME]).blank(NAME);
    let blank = with_retry(retry, "list Actor", || store.list(ACTOR_TABLE, &query))
        .context("reading Actor")?;
    let ids: Vec<_> = blank.iter().map(|x| x.id).collect();
    if !ids.is_empty() {
        with_retry(retry, "delete Actor", || store.delete(ACTOR_TABLE, &ids))
            .context("deleting blank actors")?;
    }
    info!("{} blank actors deleted", ids.len());
    Ok(ids.len())
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.csv");
        fs::write(
            &path,
            "Name,Country,Website,Phone\nStadtwerke Ulm,de,https://www.swu.de,\n ,DE,x,y\n",
        )
        .unwrap();
        let actors = read_csv(&path).unwrap();
        assert_eq!(
            actors,
            vec![Actor {
                name: "Stadtwerke Ulm".into(),
                country: "DE".into(),
                extra: BTreeMap::from([("Website".into(), "https://www.swu.de".into())]),
            }]
        );

        fs::write(&path, "Title,Country\nx,DE\n").unwrap();
        assert!(read_csv(&path).is_err());
    }

    #[test]
    fn actors_are_linked_to_zones() {
        let store = MemoryStore::new();
        let countries = store.seed("Country", vec![json!({"Code": "DE"})]);
        let zones = store.seed("DistributionZone", vec![json!({"Code": "SWM"})]);
        store.seed(
            "Actor",
            vec![
                json!({"Name": "Old Company", "Type": "Water Company"}),
                json!({"Name": "New Wasser", "Type": "Regulator"}),
            ],
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.csv");
        fs::write(
            &path,
            "Name,Country,Email\nSWM,DE,info@swm.de\nNew Wasser,DE,\nold company,DE,\nSWM,DE,\n",
        )
        .unwrap();

        let report = load_water_companies(&store, &path, &retry()).unwrap();
        assert_eq!(
            report,
            ActorReport {
                read: 4,
                existing: 1,
                inserted: 2,
                zones_created: 1,
                linked: 2,
            }
        );

        let created = &store.records("DistributionZone")[1];
        assert_eq!(created.text("Code").as_deref(), Some("New Wasser"));
        assert_eq!(created.fields["Country_id"], json!(countries[0]));

        let swm = store
            .records("Actor")
            .into_iter()
            .find(|x| x.text("Name").as_deref() == Some("SWM"))
            .unwrap();
        assert_eq!(swm.text("Email").as_deref(), Some("info@swm.de"));
        assert_eq!(swm.text("Type").as_deref(), Some("Water Company"));

        let links = store.links();
        assert_eq!(links[0], ("Actor".into(), "Zones".into(), swm.id, zones.clone()));
        assert_eq!(links[1].3, vec![created.id]);
    }

    #[test]
    fn blank_actors_are_deleted() {
        let store = MemoryStore::new();
        store.seed(
            "Actor",
            vec![
                json!({"Name": "Kept"}),
                json!({"Name": "  "}),
                json!({"Name": null}),
                json!({}),
            ],
        );
        assert_eq!(clean_blank_actors(&store, &retry()).unwrap(), 3);
        assert_eq!(store.records("Actor").len(), 1);
        assert_eq!(clean_blank_actors(&store, &retry()).unwrap(), 0);
    }
}
