use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use itertools::Itertools;

use super::StoreError;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub id: String,
    /// Link field title -> link field id.
    pub link_fields: HashMap<String, String>,
}

struct Snapshot {
    fetched_at: Instant,
    tables: HashMap<String, TableSchema>,
}

/// Table-title -> schema mapping owned by one store client. Entries expire
/// after `ttl`; `invalidate` forces the next lookup to refetch.
pub struct TableCache {
    ttl: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl TableCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            snapshot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn invalidate(&self) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Looks `table` up, calling `fetch` for a full schema when the cached
    /// one is missing or older than the ttl at `now`.
    pub fn get(
        &self,
        table: &str,
        now: Instant,
        fetch: impl FnOnce() -> Result<HashMap<String, TableSchema>, StoreError>,
    ) -> Result<TableSchema, StoreError> {
        let mut guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = guard
            .as_ref()
            .is_some_and(|x| now.saturating_duration_since(x.fetched_at) < self.ttl);
        let snapshot = match &mut *guard {
            Some(x) if fresh => x,
            slot => slot.insert(Snapshot {
                fetched_at: now,
                tables: fetch()?,
            }),
        };

        let tables = &snapshot.tables;
        tables
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable {
                table: table.to_string(),
                available: tables.keys().sorted().join(", "),
            })
    }
}
