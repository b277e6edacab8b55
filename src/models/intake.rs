// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Intake (dose) record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeStatus {
    Pending,
    Taken,
    Missed,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntakeStatus::Pending => "pending",
            IntakeStatus::Taken => "taken",
            IntakeStatus::Missed => "missed",
        }
    }
}

/// Where a dose record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    Manual,
    Pillbox,
}

/// Dose record stored in `intakeRecords`.
///
/// `scheduledTime` is stored as epoch milliseconds so it can be range-queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeRecord {
    pub id: String,
    pub medication_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_time: DateTime<Utc>,
    pub status: IntakeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
    pub completion_token: String,
    pub device_source: DeviceSource,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub caregiver_id: Option<String>,
}

/// Idempotency key of a dose: `{medicationId}-{scheduledTime epoch ms}`.
pub fn completion_token(medication_id: &str, scheduled_time: DateTime<Utc>) -> String {
    format!("{}-{}", medication_id, scheduled_time.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn completion_token_uses_epoch_millis() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        assert_eq!(completion_token("med1", t), "med1-1705305600000");
    }

    #[test]
    fn scheduled_time_serializes_as_millis() {
        let t = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        let record = IntakeRecord {
            id: "r1".to_string(),
            medication_id: "med1".to_string(),
            scheduled_time: t,
            status: IntakeStatus::Taken,
            taken_at: Some(t),
            completion_token: completion_token("med1", t),
            device_source: DeviceSource::Pillbox,
            patient_id: None,
            caregiver_id: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["scheduledTime"], 1_705_305_600_000_i64);
        assert_eq!(value["status"], "taken");
        assert_eq!(value["deviceSource"], "pillbox");
    }
}
