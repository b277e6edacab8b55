// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Critical events: creation, caregiver monitoring with push delivery, and
//! device health detection.
//!
//! Push delivery is at-least-once: the notification is sent first and the
//! persisted `notificationSent` flag is set afterwards, so a crash between the
//! two can repeat a push but never lose one.

use crate::auth::{ensure_caller, require_user, AuthProvider};
use crate::db::{collections, DocChange, DocumentStore, DocumentStoreExt, Filter, StoreErrorCode};
use crate::error::{AppError, Result};
use crate::models::{
    CriticalEventNotification, CriticalEventType, DeviceState, NewCriticalEvent, Severity,
    UserProfile,
};
use crate::realtime::{paths, RealtimeStore};
use crate::services::device_link::DeviceLinkService;
use crate::services::push::{PushMessage, PushSender};
use crate::services::retry::RetryPolicy;
use crate::services::subscriptions::{SubscriptionKey, SubscriptionRegistry};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Battery percentage below which the device is reported.
pub const LOW_BATTERY_PERCENT: f64 = 20.0;
/// Pill count below which the device is reported.
pub const LOW_INVENTORY_PILLS: i64 = 5;

/// Events created in parallel when fanning out to caregivers.
const MAX_CONCURRENT_NOTIFICATIONS: usize = 8;

const MONITOR_FLOW: &str = "critical_events";
const HEALTH_FLOW: &str = "device_health";

/// A condition to report to every caregiver of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CriticalAlert {
    pub event_type: CriticalEventType,
    pub patient_id: String,
    pub medication_id: Option<String>,
    pub message: String,
    pub severity: Option<Severity>,
    /// When set, each caregiver's event is stored as `{key}_{caregiverId}`
    /// and re-sending the alert does not duplicate it.
    pub dedup_key: Option<String>,
}

impl CriticalAlert {
    pub fn new(event_type: CriticalEventType, patient_id: &str, message: impl Into<String>) -> Self {
        Self {
            event_type,
            patient_id: patient_id.to_string(),
            medication_id: None,
            message: message.into(),
            severity: None,
            dedup_key: None,
        }
    }

    pub fn with_medication(mut self, medication_id: &str) -> Self {
        self.medication_id = Some(medication_id.to_string());
        self
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Conditions that newly hold in `current` compared to `previous`.
///
/// The first observation of a device only sets the baseline.
pub fn detect_state_transitions(
    previous: Option<&DeviceState>,
    current: &DeviceState,
) -> Vec<(CriticalEventType, String)> {
    let Some(previous) = previous else {
        return Vec::new();
    };
    let mut events = Vec::new();

    if previous.is_online && !current.is_online {
        events.push((
            CriticalEventType::DeviceOffline,
            "The pillbox has gone offline".to_string(),
        ));
    }

    let low_battery = |s: &DeviceState| s.battery_level.is_some_and(|b| b < LOW_BATTERY_PERCENT);
    if low_battery(current) && !low_battery(previous) {
        events.push((
            CriticalEventType::LowBattery,
            format!(
                "Pillbox battery is at {:.0}%",
                current.battery_level.unwrap_or_default()
            ),
        ));
    }

    let low_inventory = |s: &DeviceState| s.pills_remaining.is_some_and(|n| n < LOW_INVENTORY_PILLS);
    if low_inventory(current) && !low_inventory(previous) {
        events.push((
            CriticalEventType::LowInventory,
            format!(
                "Only {} pills left in the pillbox",
                current.pills_remaining.unwrap_or_default()
            ),
        ));
    }

    if current.has_error() && !previous.has_error() {
        events.push((
            CriticalEventType::DeviceError,
            "The pillbox reported an error".to_string(),
        ));
    }

    events
}

pub struct CriticalEventService {
    docs: Arc<dyn DocumentStore>,
    realtime: Arc<dyn RealtimeStore>,
    auth: Arc<dyn AuthProvider>,
    links: Arc<DeviceLinkService>,
    push: Arc<dyn PushSender>,
    registry: SubscriptionRegistry,
    retry: RetryPolicy,
}

impl CriticalEventService {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        realtime: Arc<dyn RealtimeStore>,
        auth: Arc<dyn AuthProvider>,
        links: Arc<DeviceLinkService>,
        push: Arc<dyn PushSender>,
        base_delay: Duration,
    ) -> Self {
        Self {
            docs,
            realtime,
            auth,
            links,
            push,
            registry: SubscriptionRegistry::new(),
            retry: RetryPolicy::exponential(2, base_delay, base_delay * 4),
        }
    }

    /// Store a new unread event. Monitoring sessions pick it up and notify.
    pub async fn create_critical_event(
        &self,
        event: NewCriticalEvent,
    ) -> Result<CriticalEventNotification> {
        if event.message.trim().is_empty() {
            return Err(AppError::Validation("Event message is required".to_string()));
        }
        let notification = event.into_notification(uuid::Uuid::new_v4().to_string(), Utc::now());

        self.retry
            .run("create_critical_event", || async {
                Ok(self
                    .docs
                    .set_as(collections::CRITICAL_EVENTS, &notification.id, &notification)
                    .await?)
            })
            .await?;

        self.log_created(&notification);
        Ok(notification)
    }

    /// Store an event under a fixed id. If it already exists the stored
    /// event is returned unchanged.
    async fn create_critical_event_once(
        &self,
        id: String,
        event: NewCriticalEvent,
    ) -> Result<CriticalEventNotification> {
        let notification = event.into_notification(id, Utc::now());
        let data = serde_json::to_value(&notification)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let created = self
            .retry
            .run("create_critical_event", || async {
                match self
                    .docs
                    .create(collections::CRITICAL_EVENTS, &notification.id, data.clone())
                    .await
                {
                    Ok(()) => Ok(true),
                    Err(e) if e.code == StoreErrorCode::AlreadyExists => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if !created {
            tracing::debug!(event_id = %notification.id, "Critical event already stored");
            let existing = self
                .docs
                .get_as::<CriticalEventNotification>(collections::CRITICAL_EVENTS, &notification.id)
                .await?;
            return Ok(existing.unwrap_or(notification));
        }

        self.log_created(&notification);
        Ok(notification)
    }

    fn log_created(&self, notification: &CriticalEventNotification) {
        tracing::info!(
            event_id = %notification.id,
            event_type = ?notification.event_type,
            caregiver_id = %notification.caregiver_id,
            severity = ?notification.severity,
            "Critical event created"
        );
    }

    /// Create one event per active caregiver of `device_id`.
    pub async fn notify_caregivers(
        &self,
        device_id: &str,
        alert: CriticalAlert,
    ) -> Result<Vec<CriticalEventNotification>> {
        let caregivers = self.links.active_caregivers(device_id).await?;
        if caregivers.is_empty() {
            tracing::warn!(
                device_id = %device_id,
                event_type = ?alert.event_type,
                "Device has no caregivers to notify"
            );
        }

        let alert = &alert;
        stream::iter(caregivers)
            .map(|link| async move {
                let event = NewCriticalEvent {
                    event_type: alert.event_type,
                    patient_id: alert.patient_id.clone(),
                    caregiver_id: link.user_id,
                    device_id: Some(device_id.to_string()),
                    medication_id: alert.medication_id.clone(),
                    message: alert.message.clone(),
                    severity: alert.severity,
                };
                match &alert.dedup_key {
                    Some(key) => {
                        let id = format!("{}_{}", key, event.caregiver_id);
                        self.create_critical_event_once(id, event).await
                    }
                    None => self.create_critical_event(event).await,
                }
            })
            .buffer_unordered(MAX_CONCURRENT_NOTIFICATIONS)
            .collect::<Vec<Result<CriticalEventNotification>>>()
            .await
            .into_iter()
            .collect()
    }

    /// Watch the caller's unread events. Each newly seen event is pushed once
    /// (if not already sent) and passed to `on_event`. Restarting replaces
    /// the previous session.
    pub async fn start_monitoring<F>(self: &Arc<Self>, caregiver_id: &str, on_event: F) -> Result<()>
    where
        F: Fn(CriticalEventNotification) + Send + Sync + 'static,
    {
        ensure_caller(self.auth.as_ref(), caregiver_id).await?;

        let key = SubscriptionKey::new(caregiver_id, MONITOR_FLOW);
        let sub = self.registry.replace(key.clone());
        let mut changes = self.docs.watch(
            collections::CRITICAL_EVENTS,
            vec![
                Filter::eq("caregiverId", caregiver_id),
                Filter::eq("read", false),
            ],
        );

        let service = Arc::clone(self);
        let caregiver_id = caregiver_id.to_string();
        tokio::spawn(async move {
            tracing::info!(caregiver_id = %caregiver_id, "Critical event monitoring started");
            let mut seen: HashSet<String> = HashSet::new();

            loop {
                let batch = tokio::select! {
                    _ = sub.token.cancelled() => break,
                    batch = changes.recv() => batch,
                };
                let Some(batch) = batch else {
                    service.registry.release(&key, sub.id);
                    break;
                };

                let batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(caregiver_id = %caregiver_id, error = %e, "Critical event watch error");
                        continue;
                    }
                };

                for change in batch {
                    let DocChange::Upserted { id, data } = change else {
                        continue;
                    };
                    if seen.contains(&id) {
                        continue;
                    }
                    let event: CriticalEventNotification = match serde_json::from_value(data) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::warn!(event_id = %id, error = %e, "Skipping malformed critical event");
                            continue;
                        }
                    };
                    seen.insert(id);

                    if !event.notification_sent {
                        service.deliver_push(&event).await;
                    }
                    on_event(event);
                }
            }
            tracing::info!(caregiver_id = %caregiver_id, "Critical event monitoring stopped");
        });

        Ok(())
    }

    /// Stop a monitoring session. Safe to call when none is running.
    pub fn stop_monitoring(&self, caregiver_id: &str) -> bool {
        self.registry
            .cancel(&SubscriptionKey::new(caregiver_id, MONITOR_FLOW))
    }

    pub fn is_monitoring(&self, caregiver_id: &str) -> bool {
        self.registry
            .contains(&SubscriptionKey::new(caregiver_id, MONITOR_FLOW))
    }

    /// Send the push for `event` and record that it was sent.
    async fn deliver_push(&self, event: &CriticalEventNotification) {
        let token = match self
            .docs
            .get_as::<UserProfile>(collections::USERS, &event.caregiver_id)
            .await
        {
            Ok(profile) => profile.and_then(|p| p.push_token),
            Err(e) => {
                tracing::warn!(caregiver_id = %event.caregiver_id, error = %e, "Could not load caregiver profile");
                return;
            }
        };

        match token {
            Some(token) => {
                let message = PushMessage::high_priority(
                    &token,
                    event.event_type.title(),
                    &event.message,
                    json!({
                        "eventId": event.id,
                        "type": event.event_type,
                        "deviceId": event.device_id,
                    }),
                );
                let sent = self
                    .retry
                    .run("send_push", || async { self.push.send(&message).await })
                    .await;
                if let Err(e) = sent {
                    tracing::warn!(event_id = %event.id, error = %e, "Push notification failed");
                    return;
                }
            }
            None => {
                tracing::info!(caregiver_id = %event.caregiver_id, "Caregiver has no push token");
            }
        }

        match self
            .docs
            .update_if(
                collections::CRITICAL_EVENTS,
                &event.id,
                &[Filter::eq("notificationSent", false)],
                json!({ "notificationSent": true }),
            )
            .await
        {
            Ok(true) => tracing::debug!(event_id = %event.id, "Critical event notified"),
            Ok(false) => tracing::debug!(event_id = %event.id, "Critical event already notified"),
            Err(e) => tracing::warn!(event_id = %event.id, error = %e, "Could not record notification"),
        }
    }

    /// Mark one of the caller's events as read. The caller adjusts its own
    /// unread counter.
    pub async fn mark_as_read(&self, event_id: &str) -> Result<()> {
        let uid = require_user(self.auth.as_ref()).await?;

        let event = self
            .retry
            .run_transient("load_critical_event", || async {
                Ok(self
                    .docs
                    .get_as::<CriticalEventNotification>(collections::CRITICAL_EVENTS, event_id)
                    .await?)
            })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("critical event {}", event_id)))?;

        if event.caregiver_id != uid {
            return Err(AppError::Permission(
                "Event belongs to another caregiver".to_string(),
            ));
        }

        self.retry
            .run_transient("mark_read", || async {
                Ok(self
                    .docs
                    .merge(collections::CRITICAL_EVENTS, event_id, json!({ "read": true }))
                    .await?)
            })
            .await
    }

    /// The caller's unread events, newest first.
    pub async fn unread_events(&self, caregiver_id: &str) -> Result<Vec<CriticalEventNotification>> {
        ensure_caller(self.auth.as_ref(), caregiver_id).await?;
        let filters = [
            Filter::eq("caregiverId", caregiver_id),
            Filter::eq("read", false),
        ];
        let mut events = self
            .retry
            .run_transient("query_unread", || async {
                Ok(self
                    .docs
                    .query_as::<CriticalEventNotification>(collections::CRITICAL_EVENTS, &filters)
                    .await?)
            })
            .await?;
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(events)
    }

    pub async fn unread_count(&self, caregiver_id: &str) -> Result<usize> {
        Ok(self.unread_events(caregiver_id).await?.len())
    }

    /// Watch a device's state and raise events on health transitions.
    pub fn watch_device_health(self: &Arc<Self>, device_id: &str, patient_id: &str) {
        let key = SubscriptionKey::new(device_id, HEALTH_FLOW);
        let sub = self.registry.replace(key.clone());
        let mut updates = self.realtime.subscribe(&paths::device_state(device_id));

        let service = Arc::clone(self);
        let device_id = device_id.to_string();
        let patient_id = patient_id.to_string();
        tokio::spawn(async move {
            let mut previous: Option<DeviceState> = None;
            loop {
                let value = tokio::select! {
                    _ = sub.token.cancelled() => break,
                    value = updates.recv() => value,
                };
                let Some(value) = value else {
                    service.registry.release(&key, sub.id);
                    break;
                };
                let Some(value) = value else { continue };

                let state: DeviceState = match serde_json::from_value(value) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!(device_id = %device_id, error = %e, "Malformed device state");
                        continue;
                    }
                };

                for (event_type, message) in detect_state_transitions(previous.as_ref(), &state) {
                    let alert = CriticalAlert::new(event_type, &patient_id, message);
                    if let Err(e) = service.notify_caregivers(&device_id, alert).await {
                        tracing::error!(device_id = %device_id, error = %e, "Failed to raise device health event");
                    }
                }
                previous = Some(state);
            }
            tracing::debug!(device_id = %device_id, "Device health watch stopped");
        });
    }

    pub fn stop_device_health(&self, device_id: &str) -> bool {
        self.registry
            .cancel(&SubscriptionKey::new(device_id, HEALTH_FLOW))
    }

    /// Stop every monitoring session and health watch.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
    }
}
