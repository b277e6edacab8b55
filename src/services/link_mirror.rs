// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Mirror of realtime link entries into the `deviceLinks` collection.
//!
//! Runs as an independent job. On start it reconciles the collection with
//! the realtime tree, then applies every later change.

use crate::db::{collections, DocumentStore, DocumentStoreExt, Filter};
use crate::models::{DeviceLink, LinkStatus, Role, UserProfile};
use crate::realtime::{paths, RealtimeStore};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// A `(userId, deviceId)` pair.
pub type LinkPair = (String, String);

/// Linked pairs in a snapshot of the realtime `users` node.
pub fn extract_link_pairs(users: Option<&Value>) -> BTreeSet<LinkPair> {
    let mut pairs = BTreeSet::new();
    let Some(users) = users.and_then(Value::as_object) else {
        return pairs;
    };
    for (uid, user) in users {
        let Some(devices) = user.get("devices").and_then(Value::as_object) else {
            continue;
        };
        for (device_id, linked) in devices {
            if linked.as_bool() == Some(true) {
                pairs.insert((uid.clone(), device_id.clone()));
            }
        }
    }
    pairs
}

/// Pairs to add and pairs to remove to go from `previous` to `current`.
pub fn diff_link_pairs(
    previous: &BTreeSet<LinkPair>,
    current: &BTreeSet<LinkPair>,
) -> (Vec<LinkPair>, Vec<LinkPair>) {
    let added = current.difference(previous).cloned().collect();
    let removed = previous.difference(current).cloned().collect();
    (added, removed)
}

pub struct LinkMirror {
    realtime: Arc<dyn RealtimeStore>,
    docs: Arc<dyn DocumentStore>,
    running: Mutex<Option<CancellationToken>>,
}

impl LinkMirror {
    pub fn new(realtime: Arc<dyn RealtimeStore>, docs: Arc<dyn DocumentStore>) -> Self {
        Self {
            realtime,
            docs,
            running: Mutex::new(None),
        }
    }

    /// Start mirroring. Restarting replaces the running job.
    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let mirror = Arc::clone(self);
        let mut updates = self.realtime.subscribe(paths::USERS);
        tokio::spawn(async move {
            tracing::info!("Link mirror started");
            let mut known: Option<BTreeSet<LinkPair>> = None;

            loop {
                let value = tokio::select! {
                    _ = token.cancelled() => break,
                    value = updates.recv() => value,
                };
                let Some(value) = value else { break };

                let previous = match known.take() {
                    Some(previous) => previous,
                    None => mirror.mirrored_pairs().await,
                };
                let current = extract_link_pairs(value.as_ref());
                known = Some(mirror.apply(&previous, &current).await);
            }
            tracing::info!("Link mirror stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    /// Active pairs currently recorded in the collection.
    async fn mirrored_pairs(&self) -> BTreeSet<LinkPair> {
        match self
            .docs
            .query_as::<DeviceLink>(collections::DEVICE_LINKS, &[Filter::eq("status", "active")])
            .await
        {
            Ok(links) => links
                .into_iter()
                .map(|l| (l.user_id, l.device_id))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read mirrored links, assuming none");
                BTreeSet::new()
            }
        }
    }

    /// Apply the difference and return the pairs that are now mirrored.
    /// Pairs whose write failed are left out so the next change retries them.
    async fn apply(
        &self,
        previous: &BTreeSet<LinkPair>,
        current: &BTreeSet<LinkPair>,
    ) -> BTreeSet<LinkPair> {
        let (added, removed) = diff_link_pairs(previous, current);
        let mut mirrored = previous.clone();

        for (uid, device_id) in added {
            match self.upsert(&uid, &device_id).await {
                Ok(()) => {
                    mirrored.insert((uid, device_id));
                }
                Err(e) => {
                    tracing::warn!(user_id = %uid, device_id = %device_id, error = %e, "Link mirror upsert failed");
                }
            }
        }

        for (uid, device_id) in removed {
            match self.deactivate(&uid, &device_id).await {
                Ok(()) => {
                    mirrored.remove(&(uid, device_id));
                }
                Err(e) => {
                    tracing::warn!(user_id = %uid, device_id = %device_id, error = %e, "Link mirror deactivate failed");
                }
            }
        }

        mirrored
    }

    async fn upsert(&self, uid: &str, device_id: &str) -> Result<(), crate::db::StoreError> {
        let role = self
            .docs
            .get_as::<UserProfile>(collections::USERS, uid)
            .await
            .ok()
            .flatten()
            .map(|p| p.role)
            .unwrap_or(Role::Caregiver);

        let id = DeviceLink::document_id(device_id, uid);
        let link = DeviceLink {
            id: id.clone(),
            device_id: device_id.to_string(),
            user_id: uid.to_string(),
            role,
            status: LinkStatus::Active,
            linked_at: Utc::now(),
            linked_by: uid.to_string(),
        };
        self.docs
            .set_as(collections::DEVICE_LINKS, &id, &link)
            .await?;

        tracing::info!(user_id = %uid, device_id = %device_id, role = ?role, "Mirrored device link");
        Ok(())
    }

    async fn deactivate(&self, uid: &str, device_id: &str) -> Result<(), crate::db::StoreError> {
        let id = DeviceLink::document_id(device_id, uid);
        match self
            .docs
            .merge(collections::DEVICE_LINKS, &id, json!({ "status": "inactive" }))
            .await
        {
            Ok(()) => {}
            // Never mirrored; nothing to deactivate
            Err(e) if e.code == crate::db::StoreErrorCode::NotFound => {}
            Err(e) => return Err(e),
        }
        tracing::info!(user_id = %uid, device_id = %device_id, "Deactivated device link");
        Ok(())
    }
}
