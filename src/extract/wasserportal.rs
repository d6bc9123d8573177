//! Water companies of German municipalities, looked up by centroid on the
//! WasserPortal API.

use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read_to_string, write},
    path::Path,
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use geo::Centroid;
use indicatif::ProgressIterator;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ureq::{Agent, AgentBuilder};

use crate::{
    geometry,
    staging::{raw_dir, read_ndjson, staging_dir, write_ndjson, StagedArea, WaterCompany},
    utils::progress_style,
};

pub const API_URL: &str = "https://api.wasserportal.info";
pub const SOURCE: &str = "WasserPortal";
const COUNTRY: &str = "DE";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versorger {
    pub bezeichnung: String,
    pub telefon_buero: Option<String>,
    pub email: Option<String>,
    pub www: Option<String>,
    pub beschreibung: Option<String>,
}

#[derive(Deserialize)]
struct FindGebiet {
    versorger: Option<Versorger>,
}

/// `None` when no company supplies the location.
pub fn find(agent: &Agent, base_url: &str, lat: f64, lon: f64) -> Result<Option<Versorger>> {
    let response = agent
        .get(&format!("{base_url}/api/public/findgebiet"))
        .query("latitude", &format!("{lat:.6}"))
        .query("longitude", &format!("{lon:.6}"))
        .call()?;
    if response.status() == 204 {
        return Ok(None);
    }
    let body: FindGebiet = response.into_json()?;
    Ok(body.versorger)
}

pub fn run(data_dir: &Path, delay: Duration) -> Result<Vec<WaterCompany>> {
    let agent = AgentBuilder::new()
        .user_agent(concat!("zones/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build();
    run_with(&agent, API_URL, data_dir, delay)
}

pub fn run_with(
    agent: &Agent,
    base_url: &str,
    data_dir: &Path,
    delay: Duration,
) -> Result<Vec<WaterCompany>> {
    let municipalities: Vec<StagedArea> =
        read_ndjson::<StagedArea>(&staging_dir(data_dir).join("Municipality.ndjson"))?
            .into_iter()
            .filter(|x| {
                x.parent_code.as_deref().or(x.country_code.as_deref()) == Some(COUNTRY)
            })
            .collect();

    let raw_path = raw_dir(data_dir).join("wasserportal.json");
    let mut raw: BTreeMap<String, Option<Versorger>> = if raw_path.exists() {
        serde_json::from_str(&read_to_string(&raw_path)?)?
    } else {
        BTreeMap::new()
    };

    let missing: Vec<&StagedArea> = municipalities
        .iter()
        .filter(|x| !raw.contains_key(&x.code))
        .collect();
    if !missing.is_empty() {
        info!("fetching water companies for {} municipalities", missing.len());
        for (i, x) in missing.iter().progress_with_style(progress_style()).enumerate() {
            let Some(centroid) = x
                .geometry
                .as_ref()
                .and_then(|g| geometry::parse(g).ok())
                .and_then(|g| g.centroid())
            else {
                warn!("{}: no usable geometry", x.code);
                continue;
            };
            if i > 0 {
                thread::sleep(delay);
            }
            match find(agent, base_url, centroid.y(), centroid.x()) {
                Ok(company) => {
                    raw.insert(x.code.clone(), company);
                }
                Err(e) => {
                    // keep what was fetched so far
                    if let Some(parent) = raw_path.parent() {
                        create_dir_all(parent)?;
                    }
                    write(&raw_path, serde_json::to_string_pretty(&raw)?)?;
                    return Err(e).with_context(|| format!("looking up {}", x.code));
                }
            }
        }

        if let Some(parent) = raw_path.parent() {
            create_dir_all(parent)?;
        }
        write(&raw_path, serde_json::to_string_pretty(&raw)?)?;
    }

    let mut companies: BTreeMap<String, WaterCompany> = BTreeMap::new();
    for x in &municipalities {
        let Some(Some(v)) = raw.get(&x.code) else {
            continue;
        };
        companies
            .entry(v.bezeichnung.clone())
            .or_insert_with(|| WaterCompany {
                name: v.bezeichnung.clone(),
                phone: v.telefon_buero.clone(),
                email: v.email.clone(),
                website: v.www.clone(),
                description: v.beschreibung.clone(),
                source: Some(SOURCE.to_string()),
                country_code: Some(COUNTRY.to_string()),
                municipalities: Vec::new(),
            })
            .municipalities
            .push(x.code.clone());
    }

    let companies: Vec<WaterCompany> = companies.into_values().collect();
    let output = staging_dir(data_dir).join("WaterCompany_de_wasserportal.ndjson");
    write_ndjson(&output, &companies)?;
    info!("{} water companies written to {}", companies.len(), output.display());
    Ok(companies)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn area(code: &str, country: &str, x: f64) -> StagedArea {
        StagedArea {
            code: code.into(),
            name: code.into(),
            geometry: Some(crate::model::RawGeometry::new(
                json!({
                    "type": "Polygon",
                    "coordinates": [[[x, 48.0], [x + 2.0, 48.0], [x + 2.0, 50.0], [x, 50.0], [x, 48.0]]]
                })
                .to_string(),
            )),
            parent_code: Some(country.into()),
            ..Default::default()
        }
    }

    #[test]
    fn groups_municipalities_by_company() {
        let server = MockServer::start();
        let ulm = server.mock(|when, then| {
            when.method(GET)
                .path("/api/public/findgebiet")
                .query_param("latitude", "49.000000")
                .query_param("longitude", "10.000000");
            then.status(200).json_body(json!({
                "versorger": {
                    "bezeichnung": "Stadtwerke Ulm",
                    "telefonBuero": "0731 1660",
                    "email": null,
                    "www": "https://www.swu.de",
                    "beschreibung": null
                }
            }));
        });
        let none = server.mock(|when, then| {
            when.method(GET)
                .path("/api/public/findgebiet")
                .query_param("longitude", "20.000000");
            then.status(204);
        });

        let dir = tempfile::tempdir().unwrap();
        write_ndjson(
            &dir.path().join("staging/Municipality.ndjson"),
            &[
                area("DE_1", "DE", 9.0),
                area("DE_2", "DE", 9.0),
                area("DE_3", "DE", 19.0),
                area("AT_1", "AT", 9.0),
            ],
        )
        .unwrap();

        let agent = Agent::new();
        let companies = run_with(&agent, &server.base_url(), dir.path(), Duration::ZERO).unwrap();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].name, "Stadtwerke Ulm");
        assert_eq!(companies[0].municipalities, vec!["DE_1", "DE_2"]);
        assert_eq!(companies[0].source.as_deref(), Some("WasserPortal"));
        assert_eq!(companies[0].phone.as_deref(), Some("0731 1660"));
        ulm.assert_calls(2);
        none.assert_calls(1);

        let staged: Vec<WaterCompany> =
            read_ndjson(&dir.path().join("staging/WaterCompany_de_wasserportal.ndjson")).unwrap();
        assert_eq!(staged, companies);

        // answers are cached, including "no company"
        let again = run_with(&agent, &server.base_url(), dir.path(), Duration::ZERO).unwrap();
        assert_eq!(again, companies);
        ulm.assert_calls(2);
        none.assert_calls(1);
    }
}
