// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Medication change events and the schedule format pushed to the device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicationEventType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSyncStatus {
    Pending,
    Delivered,
    Failed,
}

/// Audit record of one medication mutation, stored in `medicationEvents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationEvent {
    pub id: String,
    pub event_type: MedicationEventType,
    pub medication_id: String,
    pub medication_name: String,
    /// Medication document as it was after the change (before, for deletes)
    pub medication_data: Value,
    pub patient_id: String,
    #[serde(default)]
    pub caregiver_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sync_status: EventSyncStatus,
    /// Names of top-level fields that changed
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Top-level fields whose values differ between two medication documents.
pub fn changed_fields(before: &Value, after: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut fields: Vec<String> = after
        .iter()
        .filter(|(k, v)| before.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .chain(before.keys().filter(|k| !after.contains_key(*k)).cloned())
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

/// Compact schedule written to `devices/{id}/medications/{medicationId}`.
///
/// The firmware only needs what it dispenses and when.
pub fn device_schedule(medication: &Value) -> Value {
    json!({
        "name": medication.get("name").cloned().unwrap_or(Value::Null),
        "dosage": medication.get("dosage").cloned().unwrap_or(Value::Null),
        "times": medication.get("times").cloned().unwrap_or_else(|| json!([])),
        "compartment": medication.get("compartment").cloned().unwrap_or(Value::Null),
        "active": medication.get("active").and_then(Value::as_bool).unwrap_or(true),
        "updatedAt": Utc::now().timestamp_millis(),
    })
}
