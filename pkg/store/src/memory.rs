use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use schema::{GROUP_ID_FIELD, QueryFilter, Record, record_from_json};

use crate::{Cursor, DocumentStore, Projection, StoreError, filter};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    documents: Vec<Record>,
    by_group: HashMap<String, Vec<usize>>,
}

impl Snapshot {
    fn push(&mut self, record: Record) {
        let position = self.documents.len();
        if let Some(group_id) = record.get(GROUP_ID_FIELD).and_then(|value| value.as_str()) {
            self.by_group
                .entry(group_id.to_string())
                .or_default()
                .push(position);
        }
        self.documents.push(record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStats {
    pub documents: usize,
    pub groups: usize,
    pub ungrouped: usize,
}

/// Document store over an immutable, group-indexed snapshot. Writers swap in
/// a new snapshot; open cursors keep reading the one they started on.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(documents: impl IntoIterator<Item = Record>) -> Self {
        let mut snapshot = Snapshot::default();
        for record in documents {
            snapshot.push(record);
        }
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Loads one JSON object per line. Blank lines are skipped.
    pub fn load_jsonl(path: impl AsRef<Path>) -> Result<(Self, LoadStats), StoreError> {
        let contents = std::fs::read_to_string(path)?;
        let mut documents = Vec::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).map_err(|err| StoreError::Parse {
                    line: idx + 1,
                    message: err.to_string(),
                })?;
            let record = record_from_json(value).ok_or_else(|| StoreError::Parse {
                line: idx + 1,
                message: "expected a JSON object".to_string(),
            })?;
            documents.push(record);
        }

        let store = Self::with_documents(documents);
        let stats = store.stats();
        Ok((store, stats))
    }

    pub fn insert(&self, record: Record) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut *guard).push(record);
    }

    pub fn len(&self) -> usize {
        self.current().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> LoadStats {
        let snapshot = self.current();
        let grouped: usize = snapshot.by_group.values().map(Vec::len).sum();
        LoadStats {
            documents: snapshot.documents.len(),
            groups: snapshot.by_group.len(),
            ungrouped: snapshot.documents.len() - grouped,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find(
        &self,
        filter: &QueryFilter,
        projection: &Projection,
    ) -> Result<Box<dyn Cursor>, StoreError> {
        let snapshot = self.current();
        let positions = snapshot
            .by_group
            .get(filter.group_id().as_str())
            .cloned()
            .unwrap_or_default();
        tracing::debug!(
            group_id = %filter.group_id(),
            candidates = positions.len(),
            "memory store cursor opened"
        );
        Ok(Box::new(MemoryCursor {
            snapshot,
            positions,
            next_idx: 0,
            filter: filter.clone(),
            projection: projection.clone(),
            closed: false,
        }))
    }
}

/// Walks the group's index positions and evaluates the filter one document
/// at a time.
struct MemoryCursor {
    snapshot: Arc<Snapshot>,
    positions: Vec<usize>,
    next_idx: usize,
    filter: QueryFilter,
    projection: Projection,
    closed: bool,
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn next(&mut self) -> Result<Option<Record>, StoreError> {
        if self.closed {
            return Err(StoreError::Cursor("cursor already closed".to_string()));
        }
        while let Some(&position) = self.positions.get(self.next_idx) {
            self.next_idx += 1;
            let Some(document) = self.snapshot.documents.get(position) else {
                continue;
            };
            if filter::matches(&self.filter, document) {
                let mut record = document.clone();
                self.projection.apply(&mut record);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.positions.clear();
        Ok(())
    }
}
