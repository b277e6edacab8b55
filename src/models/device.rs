// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Device-side records living in the realtime tree.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Commands a caregiver can send to the dispenser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    TestAlarm,
    ManualDose,
    TimeSync,
    StatusCheck,
    ClearAlarm,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::TestAlarm => "test_alarm",
            ActionType::ManualDose => "manual_dose",
            ActionType::TimeSync => "time_sync",
            ActionType::StatusCheck => "status_check",
            ActionType::ClearAlarm => "clear_alarm",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_alarm" => Ok(ActionType::TestAlarm),
            "manual_dose" => Ok(ActionType::ManualDose),
            "time_sync" => Ok(ActionType::TimeSync),
            "status_check" => Ok(ActionType::StatusCheck),
            "clear_alarm" => Ok(ActionType::ClearAlarm),
            other => Err(AppError::Validation(format!(
                "Unknown device action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

/// Command record at `devices/{deviceId}/actions/{actionId}`. The firmware
/// executes it and reports `completed` or `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceActionRequest {
    pub action_type: ActionType,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Firmware-reported state at `devices/{deviceId}/state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub current_status: Option<String>,
    #[serde(default)]
    pub pills_remaining: Option<i64>,
}

impl DeviceState {
    pub fn has_error(&self) -> bool {
        self.current_status.as_deref() == Some("error")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventType {
    DoseTaken,
    DoseMissed,
    AlarmTriggered,
    AlarmDismissed,
    RefillNeeded,
    Error,
    #[serde(other)]
    Unknown,
}

/// Event reported by the firmware under `devices/{deviceId}/events/{id}`.
///
/// Times are epoch milliseconds as written by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: DeviceEventType,
    #[serde(default)]
    pub medication_id: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub synced: bool,
    /// Set when ingestion gave up on the event; it is not retried.
    #[serde(default)]
    pub sync_failed: bool,
    #[serde(default)]
    pub details: Option<Value>,
}
