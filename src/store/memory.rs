use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use serde_json::Value;

use super::{Fields, Filter, Query, Record, RecordId, RecordStore, StoreError};

/// Record store kept in memory, with switches to make reads or individual
/// updates fail.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Vec<Record>>>,
    links: Mutex<Vec<(String, String, RecordId, Vec<RecordId>)>>,
    next_id: AtomicU64,
    unreachable: AtomicBool,
    update_failures: Mutex<HashMap<RecordId, (u32, bool)>>,
    updates: AtomicUsize,
    on_update: Mutex<Option<Box<dyn Fn(RecordId) + Send>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn seed(&self, table: &str, rows: Vec<Value>) -> Vec<RecordId> {
        let rows = rows
            .into_iter()
            .map(|x| x.as_object().cloned().unwrap_or_default())
            .collect();
        self.insert(table, rows).expect("memory insert")
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// The next `times` updates of `id` fail, transiently or permanently.
    pub fn fail_updates(&self, id: RecordId, times: u32, transient: bool) {
        self.update_failures
            .lock()
            .unwrap()
            .insert(id, (times, transient));
    }

    /// Runs `hook` after every successful update.
    pub fn on_update(&self, hook: impl Fn(RecordId) + Send + 'static) {
        *self.on_update.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn records(&self, table: &str) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, table: &str, id: RecordId) -> Option<Record> {
        self.records(table).into_iter().find(|x| x.id == id)
    }

    pub fn links(&self) -> Vec<(String, String, RecordId, Vec<RecordId>)> {
        self.links.lock().unwrap().clone()
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

fn matches(record: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::Eq(field, value) => record.text(field).as_deref() == Some(value.as_str()),
        Filter::Blank(field) => record.text(field).is_none(),
    }
}

impl RecordStore for MemoryStore {
    fn list(&self, table: &str, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.check_reachable()?;
        Ok(self
            .records(table)
            .into_iter()
            .filter(|x| query.filters.iter().all(|f| matches(x, f)))
            .map(|mut x| {
                if !query.fields.is_empty() {
                    x.fields.retain(|k, _| query.fields.contains(k));
                }
                x
            })
            .collect())
    }

    fn insert(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<RecordId>, StoreError> {
        self.check_reachable()?;
        let mut tables = self.tables.lock().unwrap();
        let records = tables.entry(table.to_string()).or_default();
        let mut ids = Vec::new();
        for fields in rows {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            records.push(Record { id, fields });
            ids.push(id);
        }
        Ok(ids)
    }

    fn update(&self, table: &str, id: RecordId, fields: Fields) -> Result<(), StoreError> {
        self.check_reachable()?;
        if let Some((left, transient)) = self.update_failures.lock().unwrap().get_mut(&id) {
            if *left > 0 {
                *left -= 1;
                return Err(if *transient {
                    StoreError::Http {
                        status: 503,
                        message: "unavailable".into(),
                    }
                } else {
                    StoreError::Rejected("invalid value".into())
                });
            }
        }

        {
            let mut tables = self.tables.lock().unwrap();
            let record = tables
                .get_mut(table)
                .and_then(|x| x.iter_mut().find(|x| x.id == id))
                .ok_or_else(|| StoreError::Http {
                    status: 404,
                    message: format!("{table} record {id} not found"),
                })?;
            record.fields.extend(fields);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &*self.on_update.lock().unwrap() {
            hook(id);
        }
        Ok(())
    }

    fn delete(&self, table: &str, ids: &[RecordId]) -> Result<(), StoreError> {
        self.check_reachable()?;
        if let Some(records) = self.tables.lock().unwrap().get_mut(table) {
            records.retain(|x| !ids.contains(&x.id));
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
        self.check_reachable()?;
        self.links.lock().unwrap().push((
            table.to_string(),
            link_field.to_string(),
            id,
            targets.to_vec(),
        ));
        Ok(())
    }
}
