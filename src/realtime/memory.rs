// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory realtime tree with subscriptions and a connectivity switch.

use crate::db::{StoreError, StoreErrorCode};
use crate::realtime::{segments, RealtimeStore, RealtimeWatch};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

struct Subscriber {
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

/// Thread-safe in-memory realtime tree.
#[derive(Clone)]
pub struct MemoryRealtimeStore {
    root: Arc<Mutex<Value>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    connected: Arc<watch::Sender<bool>>,
    faults: Arc<Mutex<VecDeque<StoreErrorCode>>>,
}

impl Default for MemoryRealtimeStore {
    fn default() -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            root: Arc::new(Mutex::new(Value::Object(Map::new()))),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(connected),
            faults: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl MemoryRealtimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the connection. While disconnected every
    /// operation fails with `unavailable`.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// Make the next `times` operations fail with `code`.
    pub fn fail_next(&self, code: StoreErrorCode, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.extend(std::iter::repeat(code).take(times));
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if !*self.connected.borrow() {
            return Err(StoreError::new(
                StoreErrorCode::Unavailable,
                "realtime tree disconnected",
            ));
        }
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.pop_front() {
            Some(code) => Err(StoreError::new(code, "injected fault")),
            None => Ok(()),
        }
    }

    /// Apply `mutate` to the tree and notify subscribers whose value changed.
    fn write(&self, path: &str, mutate: impl FnOnce(&mut Value)) {
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());

        let written: Vec<String> = segments(path).into_iter().map(String::from).collect();
        let related: Vec<usize> = subs
            .iter()
            .enumerate()
            .filter(|(_, s)| is_related(&s.path, &written))
            .map(|(i, _)| i)
            .collect();
        let before: Vec<Option<Value>> = related
            .iter()
            .map(|&i| value_at(&root, &subs[i].path).cloned())
            .collect();

        mutate(&mut root);

        for (&i, old) in related.iter().zip(before) {
            let new = value_at(&root, &subs[i].path).cloned();
            if new != old {
                let _ = subs[i].tx.send(new);
            }
        }
        subs.retain(|s| !s.tx.is_closed());
    }
}

fn is_related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn value_at<'a, S: AsRef<str>>(root: &'a Value, path: &[S]) -> Option<&'a Value> {
    let mut node = root;
    for seg in path {
        node = node.as_object()?.get(seg.as_ref())?;
    }
    Some(node)
}

/// Write `value` at `path`, creating parents. `None` or `null` removes the
/// node and prunes parents left empty.
fn put_at(root: &mut Value, path: &[&str], value: Option<Value>) {
    match value.filter(|v| !v.is_null()) {
        Some(value) => insert_at(root, path, value),
        None if path.is_empty() => *root = Value::Object(Map::new()),
        None => {
            remove_at(root, path);
        }
    }
}

fn insert_at(node: &mut Value, path: &[&str], value: Value) {
    match path.split_first() {
        None => *node = value,
        Some((first, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(first.to_string()).or_insert(Value::Null);
                insert_at(child, rest, value);
            }
        }
    }
}

/// Remove the node at `path`. Returns true if the parent became empty.
fn remove_at(node: &mut Value, path: &[&str]) -> bool {
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    match path {
        [] => false,
        [last] => {
            map.remove(*last);
            map.is_empty()
        }
        [first, rest @ ..] => {
            let emptied = map
                .get_mut(*first)
                .map(|child| remove_at(child, rest))
                .unwrap_or(false);
            if emptied {
                map.remove(*first);
            }
            map.is_empty()
        }
    }
}

#[async_trait]
impl RealtimeStore for MemoryRealtimeStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.check()?;
        let root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        Ok(value_at(&root, &segments(path)).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.check()?;
        self.write(path, |root| put_at(root, &segments(path), Some(value)));
        Ok(())
    }

    async fn update(&self, path: &str, children: Value) -> Result<(), StoreError> {
        self.check()?;
        let Value::Object(children) = children else {
            return Err(StoreError::new(
                StoreErrorCode::InvalidArgument,
                "update expects an object",
            ));
        };
        self.write(path, |root| {
            let base = segments(path);
            for (key, value) in children {
                let mut child: Vec<&str> = base.clone();
                child.push(key.as_str());
                put_at(root, &child, Some(value));
            }
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.check()?;
        self.write(path, |root| put_at(root, &segments(path), None));
        Ok(())
    }

    fn subscribe(&self, path: &str) -> RealtimeWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let path: Vec<String> = segments(path).into_iter().map(String::from).collect();

        let root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send(value_at(&root, &path).cloned());
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { path, tx });
        drop(root);

        rx
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_and_get_nested_values() {
        let store = MemoryRealtimeStore::new();
        store.set("users/U1/devices/D1", json!(true)).await.unwrap();
        assert_eq!(
            store.get("users/U1/devices").await.unwrap(),
            Some(json!({ "D1": true }))
        );
    }

    #[tokio::test]
    async fn remove_prunes_empty_parents() {
        let store = MemoryRealtimeStore::new();
        store.set("users/U1/devices/D1", json!(true)).await.unwrap();
        store.remove("users/U1/devices/D1").await.unwrap();
        assert_eq!(store.get("users/U1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscription_sees_descendant_and_ancestor_writes() {
        let store = MemoryRealtimeStore::new();
        let mut rx = store.subscribe("devices/D1/state");
        assert_eq!(rx.recv().await.unwrap(), None);

        store
            .set("devices/D1/state/is_online", json!(true))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Some(json!({ "is_online": true })));

        store.remove("devices/D1").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_notify() {
        let store = MemoryRealtimeStore::new();
        let mut rx = store.subscribe("devices/D1");
        rx.recv().await.unwrap();

        store.set("devices/D2/state", json!({ "a": 1 })).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_merges_children() {
        let store = MemoryRealtimeStore::new();
        store
            .set("devices/D1/state", json!({ "is_online": true, "battery_level": 80 }))
            .await
            .unwrap();
        store
            .update("devices/D1/state", json!({ "battery_level": 15 }))
            .await
            .unwrap();
        assert_eq!(
            store.get("devices/D1/state").await.unwrap(),
            Some(json!({ "is_online": true, "battery_level": 15 }))
        );
    }

    #[tokio::test]
    async fn disconnected_store_rejects_operations() {
        let store = MemoryRealtimeStore::new();
        let mut conn = store.connection();
        store.set_connected(false);
        conn.changed().await.unwrap();
        assert!(!*conn.borrow());

        let err = store.get("devices").await.unwrap_err();
        assert_eq!(err.code, StoreErrorCode::Unavailable);
    }
}
