// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Realtime tree layer.
//!
//! The realtime tree is the single source of truth for device links and the
//! only channel to the dispensing device. Services use the [`RealtimeStore`]
//! trait; [`RestRealtimeDb`] talks to the hosted tree and
//! [`MemoryRealtimeStore`] backs tests.

pub mod memory;
pub mod rest;

pub use memory::MemoryRealtimeStore;
pub use rest::RestRealtimeDb;

use crate::db::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

/// Receiver side of a realtime subscription. Emits the current value first,
/// then the new value after every change at, above, or below the path.
/// Dropping the receiver ends the subscription.
pub type RealtimeWatch = mpsc::UnboundedReceiver<Option<Value>>;

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path`. Writing `null` removes it.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Merge the given children into the object at `path`.
    async fn update(&self, path: &str, children: Value) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    fn subscribe(&self, path: &str) -> RealtimeWatch;

    /// Connectivity to the hosted tree.
    fn connection(&self) -> watch::Receiver<bool>;
}

/// Realtime tree paths.
pub mod paths {
    pub const USERS: &str = "users";

    pub fn user_devices(user_id: &str) -> String {
        format!("users/{}/devices", user_id)
    }

    pub fn user_device(user_id: &str, device_id: &str) -> String {
        format!("users/{}/devices/{}", user_id, device_id)
    }

    pub fn device_state(device_id: &str) -> String {
        format!("devices/{}/state", device_id)
    }

    pub fn device_actions(device_id: &str) -> String {
        format!("devices/{}/actions", device_id)
    }

    pub fn device_action(device_id: &str, action_id: &str) -> String {
        format!("devices/{}/actions/{}", device_id, action_id)
    }

    /// Alarm-armed flag read by the firmware.
    pub fn device_alarm_flag(device_id: &str) -> String {
        format!("devices/{}/commands/topo", device_id)
    }

    pub fn device_medication(device_id: &str, medication_id: &str) -> String {
        format!("devices/{}/medications/{}", device_id, medication_id)
    }

    pub fn device_events(device_id: &str) -> String {
        format!("devices/{}/events", device_id)
    }

    pub fn device_event_synced(device_id: &str, event_id: &str) -> String {
        format!("devices/{}/events/{}/synced", device_id, event_id)
    }

    pub fn device_event_sync_failed(device_id: &str, event_id: &str) -> String {
        format!("devices/{}/events/{}/syncFailed", device_id, event_id)
    }
}

/// Split a slash-separated path into its non-empty segments.
pub(crate) fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_ignore_extra_slashes() {
        assert_eq!(segments("/devices//D1/state/"), vec!["devices", "D1", "state"]);
        assert!(segments("").is_empty());
    }

    #[test]
    fn alarm_flag_path() {
        assert_eq!(paths::device_alarm_flag("D1"), "devices/D1/commands/topo");
    }
}
