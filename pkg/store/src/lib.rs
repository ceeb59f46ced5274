mod filter;
mod memory;
mod pool;

use async_trait::async_trait;
use schema::{INTERNAL_FIELDS, QueryFilter, Record};

pub use filter::matches;
pub use memory::{LoadStats, MemoryStore};
pub use pool::{StorePool, StoreSession};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("cursor failed: {0}")]
    Cursor(String),
    #[error("store pool is closed")]
    PoolClosed,
    #[error("io error: {0}")]
    Io(String),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Server-side iterator over a filtered result set.
#[async_trait]
pub trait Cursor: Send {
    async fn next(&mut self) -> Result<Option<Record>, StoreError>;

    /// Releases the cursor. Further `next` calls fail.
    async fn close(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find(
        &self,
        filter: &QueryFilter,
        projection: &Projection,
    ) -> Result<Box<dyn Cursor>, StoreError>;
}

/// Fields removed from each document before it leaves the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    excluded: Vec<String>,
}

impl Projection {
    pub fn internal_fields() -> Self {
        Self::excluding(INTERNAL_FIELDS)
    }

    pub fn excluding<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn excludes(&self, field: &str) -> bool {
        self.excluded.iter().any(|excluded| excluded == field)
    }

    pub fn apply(&self, record: &mut Record) {
        for field in &self.excluded {
            record.shift_remove(field.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::FieldValue;

    #[test]
    fn internal_projection_strips_bookkeeping_and_keeps_order() {
        let mut record = Record::new();
        record.insert("_id".into(), FieldValue::from("abc"));
        record.insert("type".into(), FieldValue::from("smbg"));
        record.insert("_groupId".into(), FieldValue::from("g"));
        record.insert("value".into(), FieldValue::from(5.5));
        record.insert("_active".into(), FieldValue::from(true));
        record.insert("createdTime".into(), FieldValue::from("2015-01-01"));
        record.insert("time".into(), FieldValue::from("2015-10-01T00:00:00.000Z"));

        Projection::internal_fields().apply(&mut record);

        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["type", "value", "time"]);
    }

    #[test]
    fn projection_reports_exclusions() {
        let projection = Projection::internal_fields();
        for field in INTERNAL_FIELDS {
            assert!(projection.excludes(field));
        }
        assert!(!projection.excludes("deviceId"));
    }
}
