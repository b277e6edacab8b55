// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Delivery of queued operations to the stores.
//!
//! Every write here is idempotent so an entry can be redelivered after a
//! crash between delivery and dequeue.

use crate::db::{collections, DocumentStore, DocumentStoreExt, StoreErrorCode};
use crate::error::{AppError, Result};
use crate::models::intake::completion_token;
use crate::models::{
    CriticalEventType, DeviceEvent, DeviceEventType, DeviceSource, EventSyncStatus, IntakeRecord,
    IntakeStatus, MedicationEvent,
};
use crate::realtime::{paths, RealtimeStore};
use crate::services::critical_event::{CriticalAlert, CriticalEventService};
use crate::services::event_queue::{OperationSink, QueuedOperation};
use crate::services::idempotency::DoseCompletionTracker;
use crate::services::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub struct StoreDelivery {
    docs: Arc<dyn DocumentStore>,
    realtime: Arc<dyn RealtimeStore>,
    tracker: Arc<DoseCompletionTracker>,
    critical: Arc<CriticalEventService>,
    retry: RetryPolicy,
}

impl StoreDelivery {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        realtime: Arc<dyn RealtimeStore>,
        tracker: Arc<DoseCompletionTracker>,
        critical: Arc<CriticalEventService>,
        base_delay: Duration,
    ) -> Self {
        Self {
            docs,
            realtime,
            tracker,
            critical,
            retry: RetryPolicy::exponential(3, base_delay, base_delay * 8),
        }
    }

    async fn push_medication(
        &self,
        device_id: &str,
        medication_id: &str,
        schedule: Option<&Value>,
    ) -> Result<()> {
        let path = paths::device_medication(device_id, medication_id);
        self.retry
            .run_transient("push_medication", || async {
                match schedule {
                    Some(schedule) => Ok(self.realtime.set(&path, schedule.clone()).await?),
                    None => Ok(self.realtime.remove(&path).await?),
                }
            })
            .await?;
        tracing::debug!(device_id = %device_id, medication_id = %medication_id, "Schedule pushed to device");
        Ok(())
    }

    async fn record_medication_event(&self, event: &MedicationEvent) -> Result<()> {
        self.write_medication_event(event, EventSyncStatus::Delivered)
            .await
    }

    async fn write_medication_event(
        &self,
        event: &MedicationEvent,
        status: EventSyncStatus,
    ) -> Result<()> {
        let mut event = event.clone();
        event.sync_status = status;
        self.retry
            .run_transient("record_medication_event", || async {
                Ok(self
                    .docs
                    .set_as(collections::MEDICATION_EVENTS, &event.id, &event)
                    .await?)
            })
            .await
    }

    async fn ingest_device_event(
        &self,
        device_id: &str,
        patient_id: &str,
        event: &DeviceEvent,
    ) -> Result<()> {
        match event.event_type {
            DeviceEventType::DoseTaken => self.record_dose_taken(patient_id, event).await?,
            DeviceEventType::DoseMissed => {
                self.record_dose_missed(device_id, patient_id, event)
                    .await?
            }
            _ => self.record_other_event(device_id, patient_id, event).await?,
        }

        let synced = paths::device_event_synced(device_id, &event.id);
        self.retry
            .run_transient("mark_event_synced", || async {
                Ok(self.realtime.set(&synced, Value::Bool(true)).await?)
            })
            .await?;

        tracing::info!(
            device_id = %device_id,
            event_id = %event.id,
            event_type = ?event.event_type,
            "Device event ingested"
        );
        Ok(())
    }

    async fn record_dose_taken(&self, patient_id: &str, event: &DeviceEvent) -> Result<()> {
        let (medication_id, scheduled_time) = dose_fields(event)?;

        let check = self.tracker.can_take_dose(medication_id, scheduled_time).await;
        if !check.can_take {
            tracing::info!(
                medication_id = %medication_id,
                existing_intake_id = ?check.existing_intake_id,
                "Skipping duplicate dose from device"
            );
            return Ok(());
        }

        let token = completion_token(medication_id, scheduled_time);
        let record = IntakeRecord {
            id: token.clone(),
            medication_id: medication_id.to_string(),
            scheduled_time,
            status: IntakeStatus::Taken,
            taken_at: Some(event.timestamp),
            completion_token: token,
            device_source: DeviceSource::Pillbox,
            patient_id: Some(patient_id.to_string()),
            caregiver_id: None,
        };
        // Overwrites a `missed` record for the same dose
        self.retry
            .run_transient("record_dose_taken", || async {
                Ok(self
                    .docs
                    .set_as(collections::INTAKE_RECORDS, &record.id, &record)
                    .await?)
            })
            .await
    }

    async fn record_dose_missed(
        &self,
        device_id: &str,
        patient_id: &str,
        event: &DeviceEvent,
    ) -> Result<()> {
        let (medication_id, scheduled_time) = dose_fields(event)?;

        let token = completion_token(medication_id, scheduled_time);
        let record = IntakeRecord {
            id: token.clone(),
            medication_id: medication_id.to_string(),
            scheduled_time,
            status: IntakeStatus::Missed,
            taken_at: None,
            completion_token: token,
            device_source: DeviceSource::Pillbox,
            patient_id: Some(patient_id.to_string()),
            caregiver_id: None,
        };
        let data =
            serde_json::to_value(&record).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        // A taken record for the same dose wins
        let created = self
            .retry
            .run_transient("record_dose_missed", || async {
                match self
                    .docs
                    .create(collections::INTAKE_RECORDS, &record.id, data.clone())
                    .await
                {
                    Ok(()) => Ok(true),
                    Err(e) if e.code == StoreErrorCode::AlreadyExists => Ok(false),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        if !created {
            let existing = self
                .retry
                .run_transient("load_intake_record", || async {
                    Ok(self
                        .docs
                        .get_as::<IntakeRecord>(collections::INTAKE_RECORDS, &record.id)
                        .await?)
                })
                .await?;
            if existing.is_some_and(|r| r.status != IntakeStatus::Missed) {
                tracing::debug!(medication_id = %medication_id, "Dose already recorded, ignoring miss");
                return Ok(());
            }
        }

        // Alert ids derive from the dose, so a redelivered miss re-sends
        // without duplicating events already stored.
        let name = self.medication_name(medication_id).await;
        let alert = CriticalAlert::new(
            CriticalEventType::MissedDose,
            patient_id,
            format!("Missed dose of {} scheduled for {}", name, scheduled_time.format("%H:%M UTC")),
        )
        .with_medication(medication_id)
        .with_dedup_key(format!("missed_{}", record.completion_token));
        self.critical.notify_caregivers(device_id, alert).await?;
        Ok(())
    }

    async fn record_other_event(
        &self,
        device_id: &str,
        patient_id: &str,
        event: &DeviceEvent,
    ) -> Result<()> {
        let id = format!("{}_{}", device_id, event.id);
        let data = json!({
            "id": id,
            "deviceId": device_id,
            "patientId": patient_id,
            "type": event.event_type,
            "medicationId": event.medication_id,
            "timestamp": event.timestamp,
            "details": event.details,
            "receivedAt": Utc::now(),
        });
        self.retry
            .run_transient("record_device_event", || async {
                Ok(self
                    .docs
                    .set(collections::DEVICE_EVENTS, &id, data.clone())
                    .await?)
            })
            .await
    }

    async fn medication_name(&self, medication_id: &str) -> String {
        self.docs
            .get(collections::MEDICATIONS, medication_id)
            .await
            .ok()
            .flatten()
            .and_then(|m| m.get("name").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| "a medication".to_string())
    }
}

/// Medication id and scheduled time of a dose event.
fn dose_fields(event: &DeviceEvent) -> Result<(&str, DateTime<Utc>)> {
    match (event.medication_id.as_deref(), event.scheduled_time) {
        (Some(medication_id), Some(scheduled_time)) => Ok((medication_id, scheduled_time)),
        _ => Err(AppError::Validation(format!(
            "dose event {} lacks medicationId or scheduledTime",
            event.id
        ))),
    }
}

#[async_trait]
impl OperationSink for StoreDelivery {
    async fn deliver(&self, operation: &QueuedOperation) -> Result<()> {
        match operation {
            QueuedOperation::PushMedication {
                device_id,
                medication_id,
                schedule,
            } => {
                self.push_medication(device_id, medication_id, schedule.as_ref())
                    .await
            }
            QueuedOperation::RecordMedicationEvent { event } => {
                self.record_medication_event(event).await
            }
            QueuedOperation::IngestDeviceEvent {
                device_id,
                patient_id,
                event,
            } => self.ingest_device_event(device_id, patient_id, event).await,
        }
    }

    async fn mark_failed(&self, operation: &QueuedOperation, error: &AppError) {
        match operation {
            QueuedOperation::RecordMedicationEvent { event } => {
                if let Err(e) = self
                    .write_medication_event(event, EventSyncStatus::Failed)
                    .await
                {
                    tracing::warn!(event_id = %event.id, error = %e, "Could not record failed medication event");
                }
            }
            QueuedOperation::PushMedication {
                device_id,
                medication_id,
                ..
            } => {
                tracing::error!(
                    device_id = %device_id,
                    medication_id = %medication_id,
                    error = %error,
                    "Schedule could not be pushed to device"
                );
            }
            QueuedOperation::IngestDeviceEvent {
                device_id, event, ..
            } => {
                tracing::error!(
                    device_id = %device_id,
                    event_id = %event.id,
                    error = %error,
                    "Device event could not be ingested"
                );
                let failed = paths::device_event_sync_failed(device_id, &event.id);
                if let Err(e) = self
                    .retry
                    .run_transient("mark_event_sync_failed", || async {
                        Ok(self.realtime.set(&failed, Value::Bool(true)).await?)
                    })
                    .await
                {
                    tracing::warn!(device_id = %device_id, event_id = %event.id, error = %e, "Could not mark device event as failed");
                }
            }
        }
    }
}
