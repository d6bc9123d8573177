use std::{collections::HashMap, io, time::Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use ureq::{Agent, AgentBuilder, Request};

use crate::config::StoreConfig;

use super::{Fields, Record, RecordId, RecordStore, StoreError, TableCache, TableSchema};

// NocoDB caps pages at 1000 records
const PAGE_SIZE: usize = 1000;
const BATCH_SIZE: usize = 10;

/// Client for the NocoDB v3 data API.
pub struct NocoDb {
    agent: Agent,
    base_url: String,
    base_id: String,
    token: String,
    cache: TableCache,
}

impl NocoDb {
    pub fn new(config: &StoreConfig, cache: TableCache) -> Self {
        let agent = AgentBuilder::new()
            .user_agent(concat!("zones/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build();
        debug!(
            "NocoDB client for base {} at {} (schema ttl {:?})",
            config.base_id,
            config.base_url,
            cache.ttl()
        );
        Self {
            agent,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            base_id: config.base_id.clone(),
            token: config.api_token.clone(),
            cache,
        }
    }

    fn schema(&self, table: &str) -> Result<TableSchema, StoreError> {
        self.cache
            .get(table, Instant::now(), || self.fetch_schema())
    }

    fn fetch_schema(&self) -> Result<HashMap<String, TableSchema>, StoreError> {
        let url = format!("{}/api/v3/meta/bases/{}/tables", self.base_url, self.base_id);
        let tables: TableList = decode(self.send(self.agent.get(&url), None)?)?;
        if tables.list.is_empty() {
            return Err(StoreError::Decode(format!(
                "no tables found for base {}; check the base id and token access",
                self.base_id
            )));
        }

        let mut output = HashMap::new();
        for table in tables.list {
            let url = format!(
                "{}/api/v3/meta/bases/{}/tables/{}",
                self.base_url, self.base_id, table.id
            );
            let detail: TableDetail = decode(self.send(self.agent.get(&url), None)?)?;
            let link_fields = detail
                .fields
                .into_iter()
                .filter(|x| x.kind.as_deref() == Some("Links"))
                .map(|x| (x.title, x.id))
                .collect();
            output.insert(
                table.title,
                TableSchema {
                    id: table.id,
                    link_fields,
                },
            );
        }
        debug!("fetched schema of {} tables", output.len());
        Ok(output)
    }

    fn records_url(&self, schema: &TableSchema) -> String {
        format!(
            "{}/api/v3/data/{}/{}/records",
            self.base_url, self.base_id, schema.id
        )
    }

    fn send(&self, request: Request, body: Option<&Value>) -> Result<Value, StoreError> {
        let request = request.set("xc-token", &self.token);
        let result = match body {
            Some(x) => request.send_json(x),
            None => request.call(),
        };
        match result {
            Ok(response) => {
                let text = response
                    .into_string()
                    .map_err(|e| StoreError::Transport(e.to_string()))?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
            }
            Err(ureq::Error::Status(status, response)) => {
                let message = response.into_string().unwrap_or_default();
                // table ids change when a table is recreated
                if status == 404 {
                    self.cache.invalidate();
                }
                Err(match status {
                    422 => StoreError::Rejected(message),
                    _ => StoreError::Http { status, message },
                })
            }
            Err(ureq::Error::Transport(x)) => Err(transport_error(x)),
        }
    }
}

fn transport_error(x: ureq::Transport) -> StoreError {
    let timed_out = std::error::Error::source(&x)
        .and_then(|e| e.downcast_ref::<io::Error>())
        .is_some_and(|e| matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock));
    if timed_out {
        StoreError::Timeout(x.to_string())
    } else {
        StoreError::Transport(x.to_string())
    }
}

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

fn record_id(value: &Value) -> Result<RecordId, StoreError> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| StoreError::Decode(format!("invalid record id: {value}")))
}

impl RecordStore for NocoDb {
    fn list(&self, table: &str, query: &super::Query) -> Result<Vec<Record>, StoreError> {
        let schema = self.schema(table)?;
        let url = self.records_url(&schema);
        let where_clause = query.where_clause();
        let fields = query.fields.join(",");

        let mut output = Vec::new();
        let mut page = 1;
        loop {
            let mut request = self
                .agent
                .get(&url)
                .query("pageSize", &PAGE_SIZE.to_string());
            if page > 1 {
                request = request.query("page", &page.to_string());
            }
            if !fields.is_empty() {
                request = request.query("fields", &fields);
            }
            if let Some(x) = &where_clause {
                request = request.query("where", x);
            }

            let response: RecordPage = decode(self.send(request, None)?)?;
            let count = response.records.len();
            for x in response.records {
                output.push(Record {
                    id: record_id(&x.id)?,
                    fields: x.fields,
                });
            }
            debug!("{table}: page {page} returned {count} records");

            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        Ok(output)
    }

    fn insert(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<RecordId>, StoreError> {
        let schema = self.schema(table)?;
        let url = self.records_url(&schema);

        let mut ids = Vec::with_capacity(rows.len());
        for batch in rows.chunks(BATCH_SIZE) {
            let body = Value::Array(batch.iter().map(|x| json!({ "fields": x })).collect());
            let response: RecordPage = decode(self.send(self.agent.post(&url), Some(&body))?)?;
            if response.records.len() != batch.len() {
                return Err(StoreError::Decode(format!(
                    "inserted {} records but got {} ids back",
                    batch.len(),
                    response.records.len()
                )));
            }
            for x in &response.records {
                ids.push(record_id(&x.id)?);
            }
        }
        Ok(ids)
    }

    fn update(&self, table: &str, id: RecordId, fields: Fields) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        let body = json!([{ "id": id.to_string(), "fields": fields }]);
        self.send(self.agent.patch(&self.records_url(&schema)), Some(&body))?;
        Ok(())
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        let url = self.records_url(&schema);
        for batch in ids.chunks(BATCH_SIZE) {
            let body = Value::Array(
                batch
                    .iter()
                    .map(|x| json!({ "id": x.to_string() }))
                    .collect(),
            );
            self.send(self.agent.delete(&url), Some(&body))?;
        }
        Ok(())
    }

    fn link(
        &self,
        table: &str,
        link_field: &str,
        id: RecordId,
        targets: &[RecordId],
    ) -> Result<(), StoreError> {
        if targets.is_empty() {
            return Ok(());
        }
        let schema = self.schema(table)?;
        let field_id =
            schema
                .link_fields
                .get(link_field)
                .ok_or_else(|| StoreError::UnknownLinkField {
                    table: table.to_string(),
                    field: link_field.to_string(),
                })?;
        let url = format!(
            "{}/api/v3/data/{}/{}/links/{}/{}",
            self.base_url, self.base_id, schema.id, field_id, id
        );
        let body = Value::Array(
            targets
                .iter()
                .map(|x| json!({ "id": x.to_string() }))
                .collect(),
        );
        self.send(self.agent.post(&url), Some(&body))?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct TableList {
    #[serde(default)]
    list: Vec<TableEntry>,
}

#[derive(Deserialize)]
struct TableEntry {
    id: String,
    title: String,
}

#[derive(Deserialize)]
struct TableDetail {
    #[serde(default)]
    fields: Vec<FieldEntry>,
}

#[derive(Deserialize)]
struct FieldEntry {
    id: String,
    title: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct RecordPage {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct RawRecord {
    id: Value,
    #[serde(default)]
    fields: Fields,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;

    use super::*;
    use crate::store::Query;

    fn client(server: &MockServer, ttl: Duration) -> NocoDb {
        let config = StoreConfig {
            base_url: server.base_url(),
            api_token: "secret".into(),
            base_id: "base1".into(),
            timeout: Duration::from_secs(5),
            schema_ttl: ttl,
            retry: Default::default(),
        };
        NocoDb::new(&config, TableCache::new(ttl))
    }

    fn mock_schema(server: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
        let tables = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v3/meta/bases/base1/tables")
                .header("xc-token", "secret");
            then.status(200).json_body(json!({
                "list": [{"id": "tz", "title": "DistributionZone"}]
            }));
        });
        let detail = server.mock(|when, then| {
            when.method(GET).path("/api/v3/meta/bases/base1/tables/tz");
            then.status(200).json_body(json!({
                "fields": [
                    {"id": "f1", "title": "Code", "type": "SingleLineText"},
                    {"id": "l1", "title": "Municipalities", "type": "Links"}
                ]
            }));
        });
        (tables, detail)
    }

    #[test]
    fn list_sends_filters_and_flattens_records() {
        let server = MockServer::start();
        let (tables, _) = mock_schema(&server);
        let records = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v3/data/base1/tz/records")
                .query_param("pageSize", "1000")
                .query_param("fields", "Code,Geometry")
                .query_param("where", "(Geometry,blank)")
                .query_param_missing("page");
            then.status(200).json_body(json!({
                "records": [
                    {"id": 1, "fields": {"Code": "A"}},
                    {"id": "2", "fields": {"Code": "B"}}
                ]
            }));
        });

        let store = client(&server, Duration::from_secs(60));
        let query = Query::new().fields(["Code", "Geometry"]).blank("Geometry");
        let first = store.list("DistributionZone", &query).unwrap();
        let second = store.list("DistributionZone", &query).unwrap();

        records.assert_calls(2);
        tables.assert_calls(1);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].id, 2);
        assert_eq!(first[0].text("Code").as_deref(), Some("A"));
    }

    #[test]
    fn not_found_refetches_schema() {
        let server = MockServer::start();
        let (tables, detail) = mock_schema(&server);
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/data/base1/tz/records");
            then.status(404).body("table not found");
        });

        let store = client(&server, Duration::from_secs(3600));
        let err = store.list("DistributionZone", &Query::new()).unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 404, .. }));
        store.list("DistributionZone", &Query::new()).unwrap_err();

        tables.assert_calls(2);
        detail.assert_calls(2);
    }

    #[test]
    fn update_patches_one_record() {
        let server = MockServer::start();
        mock_schema(&server);
        let patch = server.mock(|when, then| {
            when.method(PATCH)
                .path("/api/v3/data/base1/tz/records")
                .json_body(json!([{"id": "5", "fields": {"Geometry": "{}"}}]));
            then.status(200)
                .json_body(json!({ "records": [{"id": 5}] }));
        });

        let store = client(&server, Duration::from_secs(60));
        let mut fields = Fields::new();
        fields.insert("Geometry".into(), json!("{}"));
        store.update("DistributionZone", 5, fields).unwrap();
        patch.assert();
    }

    #[test]
    fn insert_batches_and_returns_ids() {
        let server = MockServer::start();
        mock_schema(&server);
        let insert = server.mock(|when, then| {
            when.method(POST).path("/api/v3/data/base1/tz/records");
            then.status(200).json_body(json!({
                "records": [{"id": 10}, {"id": 11}]
            }));
        });

        let store = client(&server, Duration::from_secs(60));
        let rows = (0..2)
            .map(|x| {
                let mut fields = Fields::new();
                fields.insert("Code".into(), json!(format!("Z{x}")));
                fields
            })
            .collect();
        assert_eq!(store.insert("DistributionZone", rows).unwrap(), vec![10, 11]);
        insert.assert_calls(1);
    }

    #[test]
    fn link_uses_link_field_id() {
        let server = MockServer::start();
        mock_schema(&server);
        let link = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v3/data/base1/tz/links/l1/3")
                .json_body(json!([{"id": "7"}, {"id": "8"}]));
            then.status(200).json_body(json!(true));
        });

        let store = client(&server, Duration::from_secs(60));
        store.link("DistributionZone", "Municipalities", 3, &[7, 8]).unwrap();
        link.assert();

        let err = store
            .link("DistributionZone", "Actors", 3, &[1])
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownLinkField { .. }));
    }

    #[test]
    fn status_codes_are_classified() {
        let server = MockServer::start();
        mock_schema(&server);
        server.mock(|when, then| {
            when.method(PATCH).path("/api/v3/data/base1/tz/records");
            then.status(422).body("field Geometry does not exist");
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v3/data/base1/tz/records");
            then.status(503).body("maintenance");
        });

        let store = client(&server, Duration::from_secs(60));
        let err = store
            .update("DistributionZone", 1, Fields::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(ref m) if m.contains("Geometry")));
        assert!(!err.is_transient());

        let err = store
            .list("DistributionZone", &Query::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Http { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn unknown_table() {
        let server = MockServer::start();
        mock_schema(&server);
        let store = client(&server, Duration::from_secs(60));
        let err = store.list("Region", &Query::new()).unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable { .. }));
    }
}
