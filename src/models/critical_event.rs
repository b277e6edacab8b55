// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalEventType {
    MissedDose,
    DeviceOffline,
    LowBattery,
    LowInventory,
    DeviceError,
}

impl CriticalEventType {
    pub fn default_severity(&self) -> Severity {
        match self {
            CriticalEventType::MissedDose => Severity::High,
            CriticalEventType::DeviceOffline => Severity::High,
            CriticalEventType::LowBattery => Severity::Medium,
            CriticalEventType::LowInventory => Severity::Medium,
            CriticalEventType::DeviceError => Severity::Critical,
        }
    }

    /// Push notification title.
    pub fn title(&self) -> &'static str {
        match self {
            CriticalEventType::MissedDose => "Missed dose",
            CriticalEventType::DeviceOffline => "Pillbox offline",
            CriticalEventType::LowBattery => "Pillbox battery low",
            CriticalEventType::LowInventory => "Pillbox running low",
            CriticalEventType::DeviceError => "Pillbox error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Caregiver-facing alert stored in `criticalEvents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalEventNotification {
    pub id: String,
    pub event_type: CriticalEventType,
    pub patient_id: String,
    pub caregiver_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medication_id: Option<String>,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub notification_sent: bool,
}

/// Input for creating a critical event. Severity defaults per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCriticalEvent {
    pub event_type: CriticalEventType,
    pub patient_id: String,
    pub caregiver_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub medication_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub severity: Option<Severity>,
}

impl NewCriticalEvent {
    pub fn into_notification(self, id: String, now: DateTime<Utc>) -> CriticalEventNotification {
        CriticalEventNotification {
            id,
            severity: self
                .severity
                .unwrap_or_else(|| self.event_type.default_severity()),
            event_type: self.event_type,
            patient_id: self.patient_id,
            caregiver_id: self.caregiver_id,
            device_id: self.device_id,
            medication_id: self.medication_id,
            message: self.message,
            timestamp: now,
            read: false,
            notification_sent: false,
        }
    }
}
