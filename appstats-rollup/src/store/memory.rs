use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::document::{CollectionName, DocumentKey, RollupDocument, Scope};
use crate::encoder::WriteRequest;
use crate::logs::LogRecord;
use crate::store::ScanFilter;

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<CollectionName, BTreeMap<DocumentKey, RollupDocument>>,
    indexed: BTreeSet<CollectionName>,
    logs: Vec<LogRecord>,
}

/// Keeps all documents in memory.
///
/// Documents are ordered by their key, which already starts with the date and app, so
/// [`ensure_index`](Self::ensure_index) only records that the collection is being queried.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(super) fn upsert(&self, request: &WriteRequest) {
        let mut inner = self.inner.write();
        inner
            .collections
            .entry(request.collection.clone())
            .or_default()
            .entry(request.key.clone())
            .or_insert_with(|| RollupDocument::new(request.key.clone()))
            .apply(&request.increments);
    }

    pub(super) fn ensure_index(&self, collection: &CollectionName, _scope: Scope) {
        let mut inner = self.inner.write();
        if !inner.indexed.contains(collection) {
            appstats_log::debug!(%collection, "indexing collection");
            inner.indexed.insert(collection.clone());
        }
    }

    pub(super) fn collection_exists(&self, collection: &CollectionName) -> bool {
        self.inner.read().collections.contains_key(collection)
    }

    pub(super) fn scan(&self, filter: &ScanFilter) -> Vec<RollupDocument> {
        let inner = self.inner.read();
        let Some(documents) = inner.collections.get(&filter.collection) else {
            return Vec::new();
        };

        let mut matching: Vec<_> = documents
            .values()
            .filter(|document| filter.matches(document))
            .cloned()
            .collect();

        // `sort_by` is stable, ties keep their key order.
        matching.sort_by(|a, b| {
            a.key.date.cmp(&b.key.date).then_with(|| {
                filter
                    .sort
                    .iter()
                    .map(|name| a.key.group_value(name).cmp(&b.key.group_value(name)))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

        matching
    }

    pub(super) fn insert_log(&self, record: &LogRecord) {
        self.inner.write().logs.push(record.clone());
    }

    pub(super) fn recent_logs(&self, limit: usize) -> Vec<LogRecord> {
        let inner = self.inner.read();
        let mut logs: Vec<_> = inner.logs.iter().rev().collect();
        // Equal timestamps keep reverse insertion order.
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.into_iter().take(limit).cloned().collect()
    }

    /// Returns `true` if [`ensure_index`](Self::ensure_index) was called for the collection.
    pub fn is_indexed(&self, collection: &CollectionName) -> bool {
        self.inner.read().indexed.contains(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_index_is_recorded() {
        let store = MemoryStore::new();
        let collection = CollectionName::for_process("route", Scope::Global);

        assert!(!store.is_indexed(&collection));
        store.ensure_index(&collection, Scope::Global);
        store.ensure_index(&collection, Scope::Global);
        assert!(store.is_indexed(&collection));
    }

    #[test]
    fn test_scan_unknown_collection_is_empty() {
        let store = MemoryStore::new();
        let filter = ScanFilter {
            collection: CollectionName::for_process("nope", Scope::Global),
            since: chrono::NaiveDate::MIN,
            app: None,
            fields: Default::default(),
            sort: vec![],
        };
        assert!(store.scan(&filter).is_empty());
    }
}
