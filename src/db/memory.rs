// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory document store.
//!
//! Used by tests and by the agent when `STORE_BACKEND=memory`. Writes to a
//! collection are serialized by that collection's map entry, so `update_if`
//! is atomic and watchers observe changes in write order.

use crate::db::{
    matches_all, merge_fields, DocChange, DocWatch, DocumentStore, Filter, StoreError,
    StoreErrorCode,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

type Collection = BTreeMap<String, Value>;

struct Watcher {
    collection: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Result<Vec<DocChange>, StoreError>>,
}

/// Thread-safe in-memory document store.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<DashMap<String, Collection>>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
    /// Errors to return from the next operations, oldest first.
    faults: Arc<Mutex<VecDeque<StoreErrorCode>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` operations fail with `code`.
    pub fn fail_next(&self, code: StoreErrorCode, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.extend(std::iter::repeat(code).take(times));
    }

    /// Number of documents currently stored in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Number of live watches.
    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|w| !w.tx.is_closed());
        watchers.len()
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.pop_front() {
            Some(code) => Err(StoreError::new(code, "injected fault")),
            None => Ok(()),
        }
    }

    /// Write `new` (or delete when `None`) and notify matching watchers.
    fn apply(&self, collection: &str, id: &str, new: Option<Value>, docs: &mut Collection) {
        let old = match &new {
            Some(value) => docs.insert(id.to_string(), value.clone()),
            None => docs.remove(id),
        };
        self.notify(collection, id, old.as_ref(), new.as_ref());
    }

    fn notify(&self, collection: &str, id: &str, old: Option<&Value>, new: Option<&Value>) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        watchers.retain(|w| {
            if w.collection != collection {
                return !w.tx.is_closed();
            }
            let was = old.is_some_and(|v| matches_all(&w.filters, v));
            let change = match new {
                Some(v) if matches_all(&w.filters, v) => Some(DocChange::Upserted {
                    id: id.to_string(),
                    data: v.clone(),
                }),
                _ if was => Some(DocChange::Removed { id: id.to_string() }),
                _ => None,
            };
            match change {
                Some(change) => w.tx.send(Ok(vec![change])).is_ok(),
                None => !w.tx.is_closed(),
            }
        });
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.check_fault()?;
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id).cloned()))
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::new(
                StoreErrorCode::AlreadyExists,
                format!("{}/{} already exists", collection, id),
            ));
        }
        self.apply(collection, id, Some(data), docs.value_mut());
        Ok(())
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        self.apply(collection, id, Some(data), docs.value_mut());
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        let mut current = docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(format!("{}/{}", collection, id)))?;
        merge_fields(&mut current, &patch);
        self.apply(collection, id, Some(current), docs.value_mut());
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            self.apply(collection, id, None, docs.value_mut());
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, Value)>, StoreError> {
        self.check_fault()?;
        Ok(self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, v)| matches_all(filters, v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[Filter],
        patch: Value,
    ) -> Result<bool, StoreError> {
        self.check_fault()?;
        let mut docs = self.collections.entry(collection.to_string()).or_default();
        let Some(mut current) = docs.get(id).cloned() else {
            return Err(StoreError::not_found(format!("{}/{}", collection, id)));
        };
        if !matches_all(preconditions, &current) {
            return Ok(false);
        }
        merge_fields(&mut current, &patch);
        self.apply(collection, id, Some(current), docs.value_mut());
        Ok(true)
    }

    fn watch(&self, collection: &str, filters: Vec<Filter>) -> DocWatch {
        let (tx, rx) = mpsc::unbounded_channel();

        // Hold the collection entry so no write lands between the snapshot
        // and the watcher registration.
        let docs = self.collections.entry(collection.to_string()).or_default();
        let snapshot: Vec<DocChange> = docs
            .iter()
            .filter(|(_, v)| matches_all(&filters, v))
            .map(|(id, data)| DocChange::Upserted {
                id: id.clone(),
                data: data.clone(),
            })
            .collect();
        let _ = tx.send(Ok(snapshot));

        self.watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Watcher {
                collection: collection.to_string(),
                filters,
                tx,
            });
        drop(docs);

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_rejects_existing_document() {
        let store = MemoryDocumentStore::new();
        store.create("c", "a", json!({ "n": 1 })).await.unwrap();
        let err = store.create("c", "a", json!({ "n": 2 })).await.unwrap_err();
        assert_eq!(err.code, StoreErrorCode::AlreadyExists);
        assert_eq!(store.get("c", "a").await.unwrap(), Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn update_if_applies_only_when_preconditions_hold() {
        let store = MemoryDocumentStore::new();
        store.set("c", "a", json!({ "used": false })).await.unwrap();

        let first = store
            .update_if("c", "a", &[Filter::eq("used", false)], json!({ "used": true }))
            .await
            .unwrap();
        let second = store
            .update_if("c", "a", &[Filter::eq("used", false)], json!({ "used": true }))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn watch_sends_snapshot_then_changes() {
        let store = MemoryDocumentStore::new();
        store.set("c", "a", json!({ "p": "x" })).await.unwrap();
        store.set("c", "b", json!({ "p": "y" })).await.unwrap();

        let mut rx = store.watch("c", vec![Filter::eq("p", "x")]);
        let snapshot = rx.recv().await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 1);

        store.set("c", "b", json!({ "p": "x" })).await.unwrap();
        let change = rx.recv().await.unwrap().unwrap();
        assert!(matches!(&change[0], DocChange::Upserted { id, .. } if id == "b"));

        store.set("c", "a", json!({ "p": "z" })).await.unwrap();
        let change = rx.recv().await.unwrap().unwrap();
        assert_eq!(change[0], DocChange::Removed { id: "a".to_string() });
    }

    #[tokio::test]
    async fn dropped_watch_is_pruned() {
        let store = MemoryDocumentStore::new();
        let rx = store.watch("c", vec![]);
        assert_eq!(store.watcher_count(), 1);
        drop(rx);
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = MemoryDocumentStore::new();
        store.fail_next(StoreErrorCode::Unavailable, 1);
        assert!(store.get("c", "a").await.is_err());
        assert!(store.get("c", "a").await.is_ok());
    }
}
