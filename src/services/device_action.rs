// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Caregiver commands to the dispenser.
//!
//! Commands are written as `pending` records under the device's realtime
//! actions subtree; the firmware executes them and reports the result in
//! place.

use crate::auth::{ensure_caller, require_user, AuthProvider};
use crate::error::{AppError, Result};
use crate::models::device_link::validate_device_id;
use crate::models::{ActionStatus, ActionType, DeviceActionRequest, DeviceState};
use crate::realtime::{paths, RealtimeStore};
use crate::services::device_link::DeviceLinkService;
use crate::services::retry::RetryPolicy;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Result of [`DeviceActionService::trigger_action`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retryable: bool,
}

impl ActionOutcome {
    fn sent(action_id: String) -> Self {
        Self {
            success: true,
            action_id: Some(action_id),
            error: None,
            retryable: false,
        }
    }

    fn rejected(error: AppError) -> Self {
        Self {
            success: false,
            action_id: None,
            retryable: error.is_retryable(),
            error: Some(error.user_message()),
        }
    }
}

pub struct DeviceActionService {
    realtime: Arc<dyn RealtimeStore>,
    auth: Arc<dyn AuthProvider>,
    links: Arc<DeviceLinkService>,
    retry: RetryPolicy,
}

impl DeviceActionService {
    pub fn new(
        realtime: Arc<dyn RealtimeStore>,
        auth: Arc<dyn AuthProvider>,
        links: Arc<DeviceLinkService>,
        base_delay: Duration,
    ) -> Self {
        Self {
            realtime,
            auth,
            links,
            retry: RetryPolicy::exponential(3, base_delay, base_delay * 8),
        }
    }

    /// Send a command to a device the caller is linked to.
    ///
    /// An absent or offline device is reported as an unsuccessful outcome and
    /// nothing is written.
    pub async fn trigger_action(
        &self,
        device_id: &str,
        action_type: ActionType,
        user_id: &str,
    ) -> Result<ActionOutcome> {
        validate_device_id(device_id)?;
        ensure_caller(self.auth.as_ref(), user_id).await?;
        self.require_link(user_id, device_id).await?;

        match self.device_state(device_id).await? {
            None => {
                tracing::info!(device_id = %device_id, action = %action_type, "Action rejected: device not registered");
                return Ok(ActionOutcome::rejected(AppError::DeviceOffline(
                    format!("device {} has no state", device_id),
                )));
            }
            Some(state) if !state.is_online => {
                tracing::info!(device_id = %device_id, action = %action_type, "Action rejected: device offline");
                return Ok(ActionOutcome::rejected(AppError::DeviceOffline(
                    format!("device {} is offline", device_id),
                )));
            }
            Some(_) => {}
        }

        let action_id = uuid::Uuid::new_v4().to_string();
        let request = DeviceActionRequest {
            action_type,
            requested_by: user_id.to_string(),
            requested_at: Utc::now(),
            status: ActionStatus::Pending,
            completed_at: None,
            error: None,
        };
        let data =
            serde_json::to_value(&request).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let path = paths::device_action(device_id, &action_id);
        self.retry
            .run_transient("write_action", || async {
                Ok(self.realtime.set(&path, data.clone()).await?)
            })
            .await?;

        if action_type == ActionType::ClearAlarm {
            self.write_alarm_flag(device_id, false).await?;
        }

        tracing::info!(
            device_id = %device_id,
            action_id = %action_id,
            action = %action_type,
            requested_by = %user_id,
            "Device action queued"
        );
        Ok(ActionOutcome::sent(action_id))
    }

    /// Current record of an action, if it exists.
    pub async fn get_action_status(
        &self,
        device_id: &str,
        action_id: &str,
    ) -> Result<Option<DeviceActionRequest>> {
        validate_device_id(device_id)?;
        let uid = require_user(self.auth.as_ref()).await?;
        self.require_link(&uid, device_id).await?;

        let path = paths::device_action(device_id, action_id);
        let value = self
            .retry
            .run_transient("read_action", || async { Ok(self.realtime.get(&path).await?) })
            .await?;

        value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AppError::Unknown(format!("malformed action record: {}", e)))
    }

    /// Arm or disarm the device alarm.
    pub async fn set_alarm_armed(&self, device_id: &str, user_id: &str, armed: bool) -> Result<()> {
        validate_device_id(device_id)?;
        ensure_caller(self.auth.as_ref(), user_id).await?;
        self.require_link(user_id, device_id).await?;
        self.write_alarm_flag(device_id, armed).await
    }

    /// Firmware-reported state, or `None` if the device never reported.
    pub async fn device_state(&self, device_id: &str) -> Result<Option<DeviceState>> {
        let path = paths::device_state(device_id);
        let value = self
            .retry
            .run_transient("read_device_state", || async {
                Ok(self.realtime.get(&path).await?)
            })
            .await?;

        match value {
            Some(value) => match serde_json::from_value::<DeviceState>(value) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    tracing::warn!(device_id = %device_id, error = %e, "Malformed device state, treating as offline");
                    Ok(Some(DeviceState::default()))
                }
            },
            None => Ok(None),
        }
    }

    async fn write_alarm_flag(&self, device_id: &str, armed: bool) -> Result<()> {
        let path = paths::device_alarm_flag(device_id);
        self.retry
            .run_transient("write_alarm_flag", || async {
                Ok(self.realtime.set(&path, Value::Bool(armed)).await?)
            })
            .await?;
        tracing::debug!(device_id = %device_id, armed, "Alarm flag written");
        Ok(())
    }

    async fn require_link(&self, user_id: &str, device_id: &str) -> Result<()> {
        if self.links.is_linked(user_id, device_id).await? {
            Ok(())
        } else {
            Err(AppError::Permission(format!(
                "not linked to device {}",
                device_id
            )))
        }
    }
}
