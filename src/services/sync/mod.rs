// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data synchronization engine.
//!
//! Two independent flows run per patient/device pair:
//!
//! - medication (app to device): watches the patient's medications and
//!   pushes schedules to `devices/{id}/medications`, recording a
//!   `MedicationEvent` for every change after the initial snapshot;
//! - device events (device to app): watches `devices/{id}/events` and ingests
//!   every unsynced event into the document store.
//!
//! Both flows go through the durable [`EventQueue`], so work observed while
//! offline is delivered after reconnect or restart. There is no ordering
//! between the flows.

mod delivery;
mod status;

pub use delivery::StoreDelivery;
pub use status::{overall_status, FlowKind, FlowStatus, SyncSnapshot, SyncStatus, SyncStatusTracker};

use crate::db::{collections, DocChange, DocumentStore, Filter};
use crate::error::Result;
use crate::models::device_link::validate_device_id;
use crate::models::medication::{changed_fields, device_schedule};
use crate::models::{DeviceEvent, EventSyncStatus, MedicationEvent, MedicationEventType};
use crate::realtime::{paths, RealtimeStore};
use crate::services::event_queue::{BatchReport, EventQueue, OperationSink, QueuedOperation};
use crate::services::subscriptions::{SubscriptionKey, SubscriptionRegistry};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct SyncEngine {
    docs: Arc<dyn DocumentStore>,
    realtime: Arc<dyn RealtimeStore>,
    queue: Arc<EventQueue>,
    sink: Arc<dyn OperationSink>,
    status: SyncStatusTracker,
    registry: SubscriptionRegistry,
    /// Interval of the background retry sweep.
    retry_interval: Duration,
    monitor: Mutex<Option<CancellationToken>>,
}

impl SyncEngine {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        realtime: Arc<dyn RealtimeStore>,
        queue: Arc<EventQueue>,
        sink: Arc<dyn OperationSink>,
        retry_interval: Duration,
    ) -> Self {
        let engine = Self {
            docs,
            realtime,
            queue,
            sink,
            status: SyncStatusTracker::new(),
            registry: SubscriptionRegistry::new(),
            retry_interval,
            monitor: Mutex::new(None),
        };
        // Entries restored from disk are pending work
        for flow in FlowKind::ALL {
            let pending = engine.queue.pending_count_for(flow);
            if pending > 0 {
                engine.status.work_queued(flow, pending);
            }
        }
        engine
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn status(&self) -> SyncSnapshot {
        self.status.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncSnapshot> {
        self.status.subscribe()
    }

    fn online(&self) -> bool {
        self.status.snapshot().online
    }

    // ─── Connectivity ───────────────────────────────────────────

    /// Start the connectivity monitor and the periodic retry sweep.
    pub fn start(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let engine = Arc::clone(self);
        let mut connection = self.realtime.connection();
        tokio::spawn(async move {
            let initial = *connection.borrow_and_update();
            if !initial {
                engine.status.set_online(false);
            }

            let mut ticker = tokio::time::interval(engine.retry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = connection.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *connection.borrow_and_update();
                        if online == engine.online() {
                            continue;
                        }
                        engine.status.set_online(online);
                        if online {
                            engine.force_sync_all().await;
                        }
                    }
                    _ = ticker.tick() => {
                        if engine.online() && engine.queue.pending_count() > 0 {
                            engine.force_sync_all().await;
                        }
                    }
                }
            }
            tracing::debug!("Sync connectivity monitor stopped");
        });
    }

    /// Stop every flow and the monitor. Pending entries stay queued.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
        if let Some(token) = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        tracing::info!(pending = self.queue.pending_count(), "Sync engine stopped");
    }

    // ─── Flushing ───────────────────────────────────────────────

    async fn flush(&self, flow: FlowKind) -> BatchReport {
        if !self.online() {
            tracing::debug!(flow = %flow, "Offline, deferring flush");
            return BatchReport {
                remaining: self.queue.pending_count_for(flow),
                ..Default::default()
            };
        }
        if self.queue.pending_count_for(flow) == 0 {
            // Nothing left after a reconnect
            if self.status.snapshot().flow(flow).status == SyncStatus::Pending {
                self.status.sync_finished(flow, 0, None);
            }
            return BatchReport::default();
        }

        self.status.sync_started(flow);
        let report = self.queue.flush_flow(flow, self.sink.as_ref()).await;
        self.status
            .sync_finished(flow, report.remaining, report.error());
        report
    }

    /// Flush both flows concurrently and wait for both to settle.
    pub async fn force_sync_all(&self) -> BatchReport {
        let (medication, device_events) =
            tokio::join!(self.flush(FlowKind::Medication), self.flush(FlowKind::DeviceEvents));
        medication.merge(device_events)
    }

    fn enqueue(&self, operation: QueuedOperation) {
        let flow = operation.flow();
        self.queue.enqueue(operation);
        self.status
            .work_queued(flow, self.queue.pending_count_for(flow));
    }

    // ─── Medication flow ────────────────────────────────────────

    /// Start pushing a patient's medication schedules to their device.
    /// Restarting replaces the previous subscription.
    pub fn start_medication_sync(self: &Arc<Self>, patient_id: &str, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;

        let key = SubscriptionKey::new(patient_id, FlowKind::Medication.as_str());
        let sub = self.registry.replace(key.clone());
        let mut changes = self.docs.watch(
            collections::MEDICATIONS,
            vec![Filter::eq("patientId", patient_id)],
        );

        let engine = Arc::clone(self);
        let patient_id = patient_id.to_string();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            tracing::info!(patient_id = %patient_id, device_id = %device_id, "Medication sync started");
            let mut known: Option<HashMap<String, Value>> = None;

            loop {
                let batch = tokio::select! {
                    _ = sub.token.cancelled() => break,
                    batch = changes.recv() => batch,
                };
                let Some(batch) = batch else {
                    engine.registry.release(&key, sub.id);
                    break;
                };
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(patient_id = %patient_id, error = %e, "Medication watch error");
                        engine.status.set_status(FlowKind::Medication, SyncStatus::Error);
                        continue;
                    }
                };

                let operations = match known.as_mut() {
                    None => {
                        let snapshot = initial_medication_push(&device_id, &batch);
                        known = Some(
                            batch
                                .into_iter()
                                .filter_map(|c| match c {
                                    DocChange::Upserted { id, data } => Some((id, data)),
                                    DocChange::Removed { .. } => None,
                                })
                                .collect(),
                        );
                        snapshot
                    }
                    Some(known) => medication_changes(&patient_id, &device_id, known, batch),
                };

                if operations.is_empty() {
                    continue;
                }
                for operation in operations {
                    engine.enqueue(operation);
                }
                if sub.token.is_cancelled() {
                    break;
                }
                engine.flush(FlowKind::Medication).await;
            }
            tracing::info!(patient_id = %patient_id, "Medication sync stopped");
        });

        Ok(())
    }

    /// Stop the medication flow for a patient. Safe without a prior start.
    /// Writes already dispatched are not aborted.
    pub fn stop_medication_sync(&self, patient_id: &str) {
        if self
            .registry
            .cancel(&SubscriptionKey::new(patient_id, FlowKind::Medication.as_str()))
        {
            tracing::info!(patient_id = %patient_id, "Stopping medication sync");
        }
    }

    pub fn is_medication_sync_active(&self, patient_id: &str) -> bool {
        self.registry
            .contains(&SubscriptionKey::new(patient_id, FlowKind::Medication.as_str()))
    }

    // ─── Device event flow ──────────────────────────────────────

    /// Start ingesting a device's events. Restarting replaces the previous
    /// subscription.
    pub fn start_device_event_sync(self: &Arc<Self>, device_id: &str, patient_id: &str) -> Result<()> {
        validate_device_id(device_id)?;

        let key = SubscriptionKey::new(device_id, FlowKind::DeviceEvents.as_str());
        let sub = self.registry.replace(key.clone());
        let mut updates = self.realtime.subscribe(&paths::device_events(device_id));

        let engine = Arc::clone(self);
        let device_id = device_id.to_string();
        let patient_id = patient_id.to_string();
        tokio::spawn(async move {
            tracing::info!(device_id = %device_id, patient_id = %patient_id, "Device event sync started");

            loop {
                let value = tokio::select! {
                    _ = sub.token.cancelled() => break,
                    value = updates.recv() => value,
                };
                let Some(value) = value else {
                    engine.registry.release(&key, sub.id);
                    break;
                };

                let mut queued = 0;
                for event in unsynced_events(&device_id, value.as_ref()) {
                    if engine.queue.contains_device_event(&device_id, &event.id) {
                        continue;
                    }
                    engine.enqueue(QueuedOperation::IngestDeviceEvent {
                        device_id: device_id.clone(),
                        patient_id: patient_id.clone(),
                        event,
                    });
                    queued += 1;
                }

                if queued == 0 || sub.token.is_cancelled() {
                    continue;
                }
                tracing::debug!(device_id = %device_id, queued, "Device events queued");
                engine.flush(FlowKind::DeviceEvents).await;
            }
            tracing::info!(device_id = %device_id, "Device event sync stopped");
        });

        Ok(())
    }

    /// Stop the device event flow. Safe without a prior start.
    pub fn stop_device_event_sync(&self, device_id: &str) {
        if self
            .registry
            .cancel(&SubscriptionKey::new(device_id, FlowKind::DeviceEvents.as_str()))
        {
            tracing::info!(device_id = %device_id, "Stopping device event sync");
        }
    }

    pub fn is_device_event_sync_active(&self, device_id: &str) -> bool {
        self.registry
            .contains(&SubscriptionKey::new(device_id, FlowKind::DeviceEvents.as_str()))
    }
}

/// Schedule pushes for the first snapshot of a medication watch.
fn initial_medication_push(device_id: &str, batch: &[DocChange]) -> Vec<QueuedOperation> {
    batch
        .iter()
        .filter_map(|change| match change {
            DocChange::Upserted { id, data } => Some(QueuedOperation::PushMedication {
                device_id: device_id.to_string(),
                medication_id: id.clone(),
                schedule: Some(device_schedule(data)),
            }),
            DocChange::Removed { .. } => None,
        })
        .collect()
}

/// Operations for incremental medication changes, updating `known`.
fn medication_changes(
    patient_id: &str,
    device_id: &str,
    known: &mut HashMap<String, Value>,
    batch: Vec<DocChange>,
) -> Vec<QueuedOperation> {
    let mut operations = Vec::new();

    for change in batch {
        let (event_type, medication_id, data, changes, schedule) = match change {
            DocChange::Upserted { id, data } => match known.insert(id.clone(), data.clone()) {
                Some(before) => {
                    let changes = changed_fields(&before, &data);
                    if changes.is_empty() {
                        continue;
                    }
                    let schedule = Some(device_schedule(&data));
                    (MedicationEventType::Updated, id, data, changes, schedule)
                }
                None => {
                    let changes = changed_fields(&Value::Null, &data);
                    let schedule = Some(device_schedule(&data));
                    (MedicationEventType::Created, id, data, changes, schedule)
                }
            },
            DocChange::Removed { id } => {
                let data = known.remove(&id).unwrap_or(Value::Null);
                (MedicationEventType::Deleted, id, data, Vec::new(), None)
            }
        };

        let event = MedicationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            medication_id: medication_id.clone(),
            medication_name: data
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            caregiver_id: data
                .get("updatedBy")
                .and_then(Value::as_str)
                .filter(|uid| *uid != patient_id)
                .map(String::from),
            medication_data: data,
            patient_id: patient_id.to_string(),
            timestamp: Utc::now(),
            sync_status: EventSyncStatus::Pending,
            changes,
        };

        operations.push(QueuedOperation::PushMedication {
            device_id: device_id.to_string(),
            medication_id,
            schedule,
        });
        operations.push(QueuedOperation::RecordMedicationEvent { event });
    }

    operations
}

/// Device events in a snapshot of `devices/{id}/events` not yet synced,
/// oldest first.
fn unsynced_events(device_id: &str, value: Option<&Value>) -> Vec<DeviceEvent> {
    let Some(events) = value.and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut pending: Vec<DeviceEvent> = events
        .iter()
        .filter_map(|(id, raw)| match serde_json::from_value::<DeviceEvent>(raw.clone()) {
            Ok(mut event) => {
                event.id = id.clone();
                Some(event)
            }
            Err(e) => {
                tracing::warn!(device_id = %device_id, event_id = %id, error = %e, "Skipping malformed device event");
                None
            }
        })
        .filter(|event| !event.synced && !event.sync_failed)
        .collect();
    pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    pending
}
