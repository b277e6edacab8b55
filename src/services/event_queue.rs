// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable local queue of operations waiting to reach a store.
//!
//! Entries are persisted as JSON (temp file + rename) on every change so that
//! pending work survives a restart. Entries are delivered FIFO per flow; a
//! retryable failure blocks the rest of its flow until the next batch, and an
//! entry is moved to the failed list after `max_attempts` batches or on the
//! first non-retryable error.

use crate::error::{AppError, Result};
use crate::models::{DeviceEvent, MedicationEvent};
use crate::services::sync::FlowKind;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Failed entries kept for inspection; older ones are dropped.
const MAX_FAILED_ENTRIES: usize = 100;

/// Work to propagate from one store to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedOperation {
    /// Write (or remove, when `schedule` is `None`) a device schedule entry.
    PushMedication {
        device_id: String,
        medication_id: String,
        schedule: Option<Value>,
    },
    /// Store a medication audit event.
    RecordMedicationEvent { event: MedicationEvent },
    /// Ingest a device-reported event into the document store.
    IngestDeviceEvent {
        device_id: String,
        patient_id: String,
        event: DeviceEvent,
    },
}

impl QueuedOperation {
    pub fn flow(&self) -> FlowKind {
        match self {
            QueuedOperation::PushMedication { .. } | QueuedOperation::RecordMedicationEvent { .. } => {
                FlowKind::Medication
            }
            QueuedOperation::IngestDeviceEvent { .. } => FlowKind::DeviceEvents,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub operation: QueuedOperation,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Delivers queued operations.
#[async_trait]
pub trait OperationSink: Send + Sync {
    async fn deliver(&self, operation: &QueuedOperation) -> Result<()>;

    /// Called once when an entry is given up on.
    async fn mark_failed(&self, operation: &QueuedOperation, error: &AppError);
}

/// Summary of one flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Entries still pending for the flushed flows.
    pub remaining: usize,
    /// Set when a retryable failure stopped the batch.
    pub blocked_by: Option<String>,
}

impl BatchReport {
    pub fn merge(mut self, other: BatchReport) -> Self {
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.remaining += other.remaining;
        self.blocked_by = self.blocked_by.or(other.blocked_by);
        self
    }

    /// Error summary for status reporting.
    pub fn error(&self) -> Option<String> {
        match (&self.blocked_by, self.failed) {
            (Some(e), _) => Some(e.clone()),
            (None, 0) => None,
            (None, n) => Some(format!("{} operation(s) failed", n)),
        }
    }
}

type Listener = Arc<dyn Fn(&BatchReport) + Send + Sync>;
type Listeners = Mutex<Vec<(u64, Listener)>>;

/// Handle returned by [`EventQueue::on_sync_complete`].
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<Listeners>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueState {
    pending: VecDeque<QueueEntry>,
    #[serde(default)]
    failed: VecDeque<QueueEntry>,
}

enum Outcome {
    Delivered,
    Failed(AppError),
    Blocked(AppError),
}

pub struct EventQueue {
    state: Mutex<QueueState>,
    path: Option<PathBuf>,
    max_attempts: u32,
    medication_lock: tokio::sync::Mutex<()>,
    device_events_lock: tokio::sync::Mutex<()>,
    in_progress: AtomicUsize,
    last_sync_attempt: Mutex<Option<DateTime<Utc>>>,
    listeners: Arc<Listeners>,
    next_listener: AtomicU64,
}

impl EventQueue {
    /// Queue kept in memory only.
    pub fn in_memory(max_attempts: u32) -> Self {
        Self::with_state(QueueState::default(), None, max_attempts)
    }

    /// Open the queue persisted at `path`, restoring pending entries.
    pub fn open(path: PathBuf, max_attempts: u32) -> Self {
        let state = if path.exists() {
            match load(&path) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        pending = state.pending.len(),
                        failed = state.failed.len(),
                        "Restored sync queue"
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to load sync queue, starting fresh");
                    QueueState::default()
                }
            }
        } else {
            QueueState::default()
        };
        Self::with_state(state, Some(path), max_attempts)
    }

    fn with_state(state: QueueState, path: Option<PathBuf>, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(state),
            path,
            max_attempts: max_attempts.max(1),
            medication_lock: tokio::sync::Mutex::new(()),
            device_events_lock: tokio::sync::Mutex::new(()),
            in_progress: AtomicUsize::new(0),
            last_sync_attempt: Mutex::new(None),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Append an operation and persist it. Returns the new entry.
    pub fn enqueue(&self, operation: QueuedOperation) -> QueueEntry {
        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            attempts: 0,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        let mut state = self.lock_state();
        state.pending.push_back(entry.clone());
        self.persist(&state);
        tracing::debug!(id = %entry.id, flow = %entry.operation.flow(), "Queued operation");
        entry
    }

    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    pub fn pending_count_for(&self, flow: FlowKind) -> usize {
        self.lock_state()
            .pending
            .iter()
            .filter(|e| e.operation.flow() == flow)
            .count()
    }

    pub fn pending_entries(&self) -> Vec<QueueEntry> {
        self.lock_state().pending.iter().cloned().collect()
    }

    pub fn failed_entries(&self) -> Vec<QueueEntry> {
        self.lock_state().failed.iter().cloned().collect()
    }

    /// Whether a device event is waiting in the queue or has already failed.
    pub fn contains_device_event(&self, device_id: &str, event_id: &str) -> bool {
        let state = self.lock_state();
        state.pending.iter().chain(state.failed.iter()).any(|e| {
            matches!(
                &e.operation,
                QueuedOperation::IngestDeviceEvent { device_id: d, event, .. }
                    if d == device_id && event.id == event_id
            )
        })
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst) > 0
    }

    pub fn last_sync_attempt(&self) -> Option<DateTime<Utc>> {
        *self
            .last_sync_attempt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Register a callback fired once after every batch that had work.
    pub fn on_sync_complete<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&BatchReport) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Flush every flow as one batch.
    pub async fn sync_pending_events(&self, sink: &dyn OperationSink) -> BatchReport {
        let (medication, device_events) = tokio::join!(
            self.flush_inner(FlowKind::Medication, sink),
            self.flush_inner(FlowKind::DeviceEvents, sink),
        );
        let report = medication.merge(device_events);
        self.notify(&report);
        report
    }

    /// Flush one flow as one batch.
    pub async fn flush_flow(&self, flow: FlowKind, sink: &dyn OperationSink) -> BatchReport {
        let report = self.flush_inner(flow, sink).await;
        self.notify(&report);
        report
    }

    async fn flush_inner(&self, flow: FlowKind, sink: &dyn OperationSink) -> BatchReport {
        let _guard = match flow {
            FlowKind::Medication => self.medication_lock.lock().await,
            FlowKind::DeviceEvents => self.device_events_lock.lock().await,
        };

        let batch: Vec<QueueEntry> = self
            .lock_state()
            .pending
            .iter()
            .filter(|e| e.operation.flow() == flow)
            .cloned()
            .collect();

        let mut report = BatchReport::default();
        if batch.is_empty() {
            return report;
        }

        self.in_progress.fetch_add(1, Ordering::SeqCst);
        *self
            .last_sync_attempt
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        tracing::debug!(flow = %flow, entries = batch.len(), "Flushing sync queue");

        for entry in batch {
            report.attempted += 1;
            let outcome = match sink.deliver(&entry.operation).await {
                Ok(()) => Outcome::Delivered,
                Err(e) if !e.is_retryable() => Outcome::Failed(e),
                Err(e) if entry.attempts + 1 >= self.max_attempts => Outcome::Failed(e),
                Err(e) => Outcome::Blocked(e),
            };

            match outcome {
                Outcome::Delivered => {
                    self.remove_pending(&entry.id);
                    report.delivered += 1;
                }
                Outcome::Failed(e) => {
                    tracing::error!(
                        id = %entry.id,
                        flow = %flow,
                        attempts = entry.attempts + 1,
                        error = %e,
                        "Giving up on queued operation"
                    );
                    self.fail_pending(&entry.id, &e);
                    sink.mark_failed(&entry.operation, &e).await;
                    report.failed += 1;
                }
                Outcome::Blocked(e) => {
                    tracing::warn!(
                        id = %entry.id,
                        flow = %flow,
                        attempts = entry.attempts + 1,
                        error = %e,
                        "Queued operation failed, will retry"
                    );
                    self.record_attempt(&entry.id, &e);
                    report.blocked_by = Some(e.to_string());
                    break;
                }
            }
        }

        report.remaining = self.pending_count_for(flow);
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        tracing::info!(
            flow = %flow,
            delivered = report.delivered,
            failed = report.failed,
            remaining = report.remaining,
            "Sync batch finished"
        );
        report
    }

    fn notify(&self, report: &BatchReport) {
        if report.attempted == 0 {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(report);
        }
    }

    fn remove_pending(&self, id: &str) {
        let mut state = self.lock_state();
        state.pending.retain(|e| e.id != id);
        self.persist(&state);
    }

    fn record_attempt(&self, id: &str, error: &AppError) {
        let mut state = self.lock_state();
        if let Some(entry) = state.pending.iter_mut().find(|e| e.id == id) {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
        }
        self.persist(&state);
    }

    fn fail_pending(&self, id: &str, error: &AppError) {
        let mut state = self.lock_state();
        if let Some(pos) = state.pending.iter().position(|e| e.id == id) {
            if let Some(mut entry) = state.pending.remove(pos) {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
                state.failed.push_back(entry);
                while state.failed.len() > MAX_FAILED_ENTRIES {
                    state.failed.pop_front();
                }
            }
        }
        self.persist(&state);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the queue to disk. Failures are logged; the in-memory queue
    /// stays authoritative for this process.
    fn persist(&self, state: &QueueState) {
        if let Some(path) = &self.path {
            if let Err(e) = save(path, state) {
                tracing::error!(path = %path.display(), error = %e, "Failed to persist sync queue");
            }
        }
    }
}

fn save(path: &Path, state: &QueueState) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec(state).context("Failed to serialize queue")?;

    // Write atomically using temp file
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(&json).context("Failed to write queue data")?;
    file.sync_all().context("Failed to sync queue file")?;

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
    Ok(())
}

fn load(path: &Path) -> anyhow::Result<QueueState> {
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read queue file {:?}", path))?;
    serde_json::from_slice(&data).context("Failed to deserialize queue file")
}
