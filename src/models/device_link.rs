// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Device link model (document-store mirror of the realtime link tree).

use crate::error::AppError;
use crate::models::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Inactive,
}

/// Link record stored at `deviceLinks/{deviceId}_{userId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLink {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub role: Role,
    pub status: LinkStatus,
    pub linked_at: DateTime<Utc>,
    pub linked_by: String,
}

impl DeviceLink {
    pub fn document_id(device_id: &str, user_id: &str) -> String {
        format!("{}_{}", device_id, user_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == LinkStatus::Active
    }
}

/// Device ids are 3-100 characters of `[A-Za-z0-9_-]`.
pub fn validate_device_id(device_id: &str) -> Result<(), AppError> {
    let len_ok = (3..=100).contains(&device_id.len());
    let chars_ok = device_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(AppError::Validation(
            "Device ID must be 3-100 letters, digits, '-' or '_'".to_string(),
        ))
    }
}
