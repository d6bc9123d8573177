//! Record store contract: a remote table store keyed by numeric record id,
//! queryable by field filters and updatable in place.

use std::{thread, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

mod cache;
#[cfg(test)]
pub mod memory;
mod nocodb;

pub use cache::{TableCache, TableSchema};
pub use nocodb::NocoDb;

pub type RecordId = u64;
pub type Fields = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub fields: Fields,
}

impl Record {
    /// Trimmed, non-blank text of a cell. Numbers are rendered as text.
    pub fn text(&self, field: &str) -> Option<String> {
        cell_text(self.fields.get(field)?)
    }

    /// Cell holding several values: a JSON array (of scalars, or of linked
    /// records carrying a `Code`), or comma separated text.
    pub fn list(&self, field: &str) -> Vec<String> {
        match self.fields.get(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|x| match x {
                    Value::Object(o) => o
                        .get("Code")
                        .or_else(|| o.get("fields").and_then(|f| f.get("Code")))
                        .and_then(cell_text),
                    x => cell_text(x),
                })
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|x| !x.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Eq(String, String),
    Blank(String),
}

/// Field selection plus AND-ed filters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub fields: Vec<String>,
    pub filters: Vec<Filter>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<'a>(mut self, fields: impl IntoIterator<Item = &'a str>) -> Self {
        self.fields.extend(fields.into_iter().map(String::from));
        self
    }

    pub fn eq(mut self, field: &str, value: &str) -> Self {
        self.filters
            .push(Filter::Eq(field.to_string(), value.to_string()));
        self
    }

    pub fn blank(mut self, field: &str) -> Self {
        self.filters.push(Filter::Blank(field.to_string()));
        self
    }

    /// NocoDB `where` syntax, e.g. `(Type,eq,Distribution)~and(Geometry,blank)`.
    pub fn where_clause(&self) -> Option<String> {
        if self.filters.is_empty() {
            return None;
        }
        Some(
            self.filters
                .iter()
                .map(|x| match x {
                    Filter::Eq(field, value) => format!("({field},eq,{value})"),
                    Filter::Blank(field) => format!("({field},blank)"),
                })
                .collect::<Vec<_>>()
                .join("~and"),
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("unknown table {table} (available: {available})")]
    UnknownTable { table: String, available: String },
    #[error("table {table} has no link field {field}")]
    UnknownLinkField { table: String, field: String },
}

impl StoreError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub trait RecordStore: Sync {
    /// Every record matching the query, across all pages.
    fn list(&self, table: &str, query: &Query) -> Result<Vec<Record>, StoreError>;

    /// Inserts rows and returns their ids, in input order.
    fn insert(&self, table: &str, rows: Vec<Fields>) -> Result<Vec<RecordId>, StoreError>;

    fn update(&self, table: &str, id: RecordId, fields: Fields) -> Result<(), StoreError>;

    fn delete(&self, table: &str, ids: &[RecordId]) -> Result<(), StoreError>;

    fn link(
        &self,
        table: &str,
        link_field: &str,
        id: RecordId,
        targets: &[RecordId],
    ) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct Exhausted {
    pub attempts: u32,
    #[source]
    pub error: StoreError,
}

/// Runs `op` until it succeeds, fails permanently, or the policy's attempts
/// are used up. Backoff doubles after every transient failure.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, Exhausted> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(x) => return Ok(x),
            Err(error) if error.is_transient() && attempt < max_attempts => {
                warn!("{what}: attempt {attempt}/{max_attempts} failed: {error}");
                thread::sleep(backoff);
                backoff *= 2;
                attempt += 1;
            }
            Err(error) => {
                return Err(Exhausted {
                    attempts: attempt,
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use serde_json::json;

    use super::*;

    fn record(fields: Value) -> Record {
        Record {
            id: 1,
            fields: fields.as_object().unwrap().clone(),
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn where_clause() {
        assert_eq!(Query::new().where_clause(), None);
        assert_eq!(
            Query::new()
                .fields(["Code", "Id"])
                .eq("Type", "Distribution")
                .blank("Geometry")
                .where_clause()
                .as_deref(),
            Some("(Type,eq,Distribution)~and(Geometry,blank)")
        );
    }

    #[test]
    fn record_cells() {
        let x = record(json!({
            "Code": "  AT ",
            "Blank": " ",
            "Number": 12,
            "Codes": ["a", 2, {"Code": "c"}, {"fields": {"Code": "d"}}, null],
            "Joined": "x, y,,z",
        }));
        assert_eq!(x.text("Code").as_deref(), Some("AT"));
        assert_eq!(x.text("Number").as_deref(), Some("12"));
        assert_eq!(x.text("Blank"), None);
        assert_eq!(x.text("Missing"), None);
        assert_eq!(x.list("Codes"), vec!["a", "2", "c", "d"]);
        assert_eq!(x.list("Joined"), vec!["x", "y", "z"]);
        assert!(x.list("Missing").is_empty());
    }

    #[test]
    fn transient_errors() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(StoreError::Http {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(StoreError::Http {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!StoreError::Http {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!StoreError::Rejected("bad field".into()).is_transient());
    }

    #[test]
    fn retry_until_success() {
        let calls = Cell::new(0);
        let result = with_retry(&quick(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Transport("reset".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retry_gives_up() {
        let calls = Cell::new(0);
        let err = with_retry(&quick(), "test", || -> Result<(), _> {
            calls.set(calls.get() + 1);
            Err(StoreError::Timeout("slow".into()))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.error, StoreError::Timeout(_)));
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let err = with_retry(&quick(), "test", || -> Result<(), _> {
            calls.set(calls.get() + 1);
            Err(StoreError::Rejected("no".into()))
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.attempts, 1);
    }
}
