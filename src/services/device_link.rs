// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Device linking.
//!
//! The realtime entry `users/{uid}/devices/{deviceId} = true` is the single
//! source of truth for a link. The `deviceLinks` collection is a mirror kept
//! up to date by [`LinkMirror`](crate::services::LinkMirror); reads from it
//! may lag a fresh link or unlink.

use crate::auth::{ensure_caller, AuthProvider};
use crate::db::{collections, DocChange, DocumentStore, DocumentStoreExt, Filter};
use crate::error::{AppError, Result};
use crate::models::device_link::validate_device_id;
use crate::models::{DeviceLink, Role, UserProfile};
use crate::realtime::{paths, RealtimeStore};
use crate::services::retry::RetryPolicy;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Live view of a device's active links.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkSnapshot {
    pub links: Vec<DeviceLink>,
    pub caregiver_count: usize,
    pub patient_id: Option<String>,
    /// False until the first snapshot has been read.
    pub loaded: bool,
}

impl LinkSnapshot {
    fn from_links(links: Vec<DeviceLink>) -> Self {
        let caregiver_count = links.iter().filter(|l| l.role == Role::Caregiver).count();
        let patient_id = links
            .iter()
            .find(|l| l.role == Role::Patient)
            .map(|l| l.user_id.clone());
        Self {
            links,
            caregiver_count,
            patient_id,
            loaded: true,
        }
    }

    pub fn has_caregivers(&self) -> bool {
        self.caregiver_count > 0
    }
}

/// Handle to a running link watch. Dropping it stops the watch.
pub struct DeviceLinkWatch {
    pub updates: watch::Receiver<LinkSnapshot>,
    token: CancellationToken,
}

impl DeviceLinkWatch {
    pub fn current(&self) -> LinkSnapshot {
        self.updates.borrow().clone()
    }

    pub fn unsubscribe(self) {
        self.token.cancel();
    }
}

impl Drop for DeviceLinkWatch {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub struct DeviceLinkService {
    realtime: Arc<dyn RealtimeStore>,
    docs: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    retry: RetryPolicy,
}

impl DeviceLinkService {
    pub fn new(
        realtime: Arc<dyn RealtimeStore>,
        docs: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        base_delay: Duration,
    ) -> Self {
        Self {
            realtime,
            docs,
            auth,
            retry: RetryPolicy::linear(3, base_delay),
        }
    }

    /// Link the caller to a device by writing the realtime link entry.
    pub async fn link_device_to_user(&self, user_id: &str, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;
        ensure_caller(self.auth.as_ref(), user_id).await?;

        let profile = self
            .retry
            .run_transient("load_profile", || async {
                Ok(self
                    .docs
                    .get_as::<UserProfile>(collections::USERS, user_id)
                    .await?)
            })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

        if profile.role == Role::Patient {
            let owner = self
                .active_links(device_id)
                .await?
                .into_iter()
                .find(|l| l.role == Role::Patient && l.user_id != user_id);
            if owner.is_some() {
                return Err(AppError::AlreadyExists(format!(
                    "device {} already belongs to another patient",
                    device_id
                )));
            }
        }

        let path = paths::user_device(user_id, device_id);
        self.retry
            .run_transient("write_link", || async {
                Ok(self.realtime.set(&path, Value::Bool(true)).await?)
            })
            .await?;

        tracing::info!(user_id = %user_id, device_id = %device_id, role = ?profile.role, "Device linked");
        Ok(())
    }

    /// Remove the caller's realtime link entry. Unlinking an absent link is
    /// not an error.
    pub async fn unlink_device_from_user(&self, user_id: &str, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;
        ensure_caller(self.auth.as_ref(), user_id).await?;

        let path = paths::user_device(user_id, device_id);
        self.retry
            .run_transient("remove_link", || async {
                Ok(self.realtime.remove(&path).await?)
            })
            .await?;

        tracing::info!(user_id = %user_id, device_id = %device_id, "Device unlinked");
        Ok(())
    }

    /// Devices linked to the caller, from the realtime tree.
    pub async fn linked_devices(&self, user_id: &str) -> Result<Vec<String>> {
        ensure_caller(self.auth.as_ref(), user_id).await?;

        let path = paths::user_devices(user_id);
        let value = self
            .retry
            .run_transient("read_links", || async { Ok(self.realtime.get(&path).await?) })
            .await?;

        Ok(value
            .as_ref()
            .and_then(Value::as_object)
            .map(|devices| {
                devices
                    .iter()
                    .filter(|(_, linked)| linked.as_bool() == Some(true))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether `user_id` is linked to `device_id` in the realtime tree.
    pub async fn is_linked(&self, user_id: &str, device_id: &str) -> Result<bool> {
        let path = paths::user_device(user_id, device_id);
        let value = self
            .retry
            .run_transient("read_link", || async { Ok(self.realtime.get(&path).await?) })
            .await?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Active links of a device, from the mirror.
    pub async fn active_links(&self, device_id: &str) -> Result<Vec<DeviceLink>> {
        let filters = [
            Filter::eq("deviceId", device_id),
            Filter::eq("status", "active"),
        ];
        self.retry
            .run_transient("query_links", || async {
                Ok(self
                    .docs
                    .query_as::<DeviceLink>(collections::DEVICE_LINKS, &filters)
                    .await?)
            })
            .await
    }

    /// Active caregiver links of a device, from the mirror.
    pub async fn active_caregivers(&self, device_id: &str) -> Result<Vec<DeviceLink>> {
        let mut links = self.active_links(device_id).await?;
        links.retain(|l| l.role == Role::Caregiver);
        Ok(links)
    }

    /// Watch the active links of a device. The receiver starts with an
    /// unloaded snapshot and updates after every mirror change.
    pub fn watch_device_links(&self, device_id: &str) -> DeviceLinkWatch {
        let (tx, rx) = watch::channel(LinkSnapshot::default());
        let token = CancellationToken::new();
        let mut changes = self.docs.watch(
            collections::DEVICE_LINKS,
            vec![
                Filter::eq("deviceId", device_id),
                Filter::eq("status", "active"),
            ],
        );

        let device_id = device_id.to_string();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut links: BTreeMap<String, DeviceLink> = BTreeMap::new();
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = changes.recv() => batch,
                };
                let Some(batch) = batch else { break };

                match batch {
                    Ok(batch) => {
                        for change in batch {
                            match change {
                                DocChange::Upserted { id, data } => {
                                    match serde_json::from_value::<DeviceLink>(data) {
                                        Ok(link) => {
                                            links.insert(id, link);
                                        }
                                        Err(e) => {
                                            tracing::warn!(id = %id, error = %e, "Skipping malformed device link");
                                        }
                                    }
                                }
                                DocChange::Removed { id } => {
                                    links.remove(&id);
                                }
                            }
                        }
                        let snapshot = LinkSnapshot::from_links(links.values().cloned().collect());
                        tracing::debug!(
                            device_id = %device_id,
                            caregivers = snapshot.caregiver_count,
                            "Device links changed"
                        );
                        if tx.send(snapshot).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(device_id = %device_id, error = %e, "Device link watch error");
                    }
                }
            }
            tracing::debug!(device_id = %device_id, "Device link watch stopped");
        });

        DeviceLinkWatch { updates: rx, token }
    }
}
