// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Durable event queue tests.
//!
//! These tests verify that:
//! 1. Entries are delivered FIFO per flow, and flows do not block each other
//! 2. Retryable failures block a flow; terminal failures move entries aside
//! 3. Completion callbacks fire once per batch
//! 4. Pending work survives reopening the queue file

use async_trait::async_trait;
use chrono::Utc;
use pillbox_sync::error::{AppError, Result};
use pillbox_sync::models::{DeviceEvent, DeviceEventType};
use pillbox_sync::services::sync::FlowKind;
use pillbox_sync::services::{EventQueue, OperationSink, QueuedOperation};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Sink that delivers everything except scripted failures.
#[derive(Default)]
struct ScriptedSink {
    script: Mutex<VecDeque<Option<AppError>>>,
    delivered: Mutex<Vec<QueuedOperation>>,
    failed: Mutex<Vec<QueuedOperation>>,
}

impl ScriptedSink {
    /// Outcomes of the next calls: `None` succeeds, `Some(e)` fails.
    fn script(&self, outcomes: Vec<Option<AppError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    fn delivered_ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(op_id)
            .collect()
    }
}

#[async_trait]
impl OperationSink for ScriptedSink {
    async fn deliver(&self, operation: &QueuedOperation) -> Result<()> {
        if let Some(Some(err)) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.delivered.lock().unwrap().push(operation.clone());
        Ok(())
    }

    async fn mark_failed(&self, operation: &QueuedOperation, _error: &AppError) {
        self.failed.lock().unwrap().push(operation.clone());
    }
}

fn op_id(op: &QueuedOperation) -> String {
    match op {
        QueuedOperation::PushMedication { medication_id, .. } => medication_id.clone(),
        QueuedOperation::RecordMedicationEvent { event } => event.id.clone(),
        QueuedOperation::IngestDeviceEvent { event, .. } => event.id.clone(),
    }
}

fn push(medication_id: &str) -> QueuedOperation {
    QueuedOperation::PushMedication {
        device_id: "PBX-001".to_string(),
        medication_id: medication_id.to_string(),
        schedule: Some(json!({ "name": medication_id })),
    }
}

fn device_event(id: &str) -> QueuedOperation {
    QueuedOperation::IngestDeviceEvent {
        device_id: "PBX-001".to_string(),
        patient_id: "P1".to_string(),
        event: DeviceEvent {
            id: id.to_string(),
            event_type: DeviceEventType::AlarmTriggered,
            medication_id: None,
            scheduled_time: None,
            timestamp: Utc::now(),
            synced: false,
            sync_failed: false,
            details: None,
        },
    }
}

fn unavailable() -> Option<AppError> {
    Some(AppError::Unavailable("store down".to_string()))
}

#[tokio::test]
async fn test_flush_delivers_fifo() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    for id in ["m1", "m2", "m3"] {
        queue.enqueue(push(id));
    }

    let report = queue.flush_flow(FlowKind::Medication, &sink).await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 3);
    assert_eq!(report.remaining, 0);
    assert_eq!(sink.delivered_ids(), vec!["m1", "m2", "m3"]);
    assert_eq!(queue.pending_count(), 0);
    assert!(queue.last_sync_attempt().is_some());
}

#[tokio::test]
async fn test_retryable_failure_blocks_only_its_flow() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    queue.enqueue(push("m1"));
    queue.enqueue(push("m2"));
    queue.enqueue(device_event("e1"));

    // The first delivery attempted fails; which flow goes first is not
    // defined, so fail by flow instead of by call order.
    struct FailMedication(ScriptedSink);
    #[async_trait]
    impl OperationSink for FailMedication {
        async fn deliver(&self, operation: &QueuedOperation) -> Result<()> {
            if operation.flow() == FlowKind::Medication {
                return Err(AppError::Unavailable("store down".to_string()));
            }
            self.0.deliver(operation).await
        }
        async fn mark_failed(&self, operation: &QueuedOperation, error: &AppError) {
            self.0.mark_failed(operation, error).await
        }
    }
    let failing = FailMedication(sink);

    let report = queue.sync_pending_events(&failing).await;
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 2);
    assert!(report.blocked_by.is_some());
    // m2 was not attempted behind the blocked m1
    assert_eq!(report.attempted, 2);
    assert_eq!(failing.0.delivered_ids(), vec!["e1"]);

    let pending = queue.pending_entries();
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());
    assert_eq!(pending[1].attempts, 0);
}

#[tokio::test]
async fn test_blocked_entry_is_retried_next_batch() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    queue.enqueue(push("m1"));
    queue.enqueue(push("m2"));

    sink.script(vec![unavailable()]);
    let first = queue.flush_flow(FlowKind::Medication, &sink).await;
    assert_eq!(first.delivered, 0);

    let second = queue.flush_flow(FlowKind::Medication, &sink).await;
    assert_eq!(second.delivered, 2);
    assert_eq!(sink.delivered_ids(), vec!["m1", "m2"]);
}

#[tokio::test]
async fn test_terminal_failure_moves_entry_aside() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    queue.enqueue(push("m1"));
    queue.enqueue(push("m2"));

    sink.script(vec![Some(AppError::Permission("denied".to_string()))]);
    let report = queue.flush_flow(FlowKind::Medication, &sink).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(sink.delivered_ids(), vec!["m2"]);
    assert_eq!(sink.failed.lock().unwrap().len(), 1);

    let failed = queue.failed_entries();
    assert_eq!(failed.len(), 1);
    assert_eq!(op_id(&failed[0].operation), "m1");
    assert_eq!(failed[0].attempts, 1);
}

#[tokio::test]
async fn test_entry_fails_after_max_attempts() {
    let queue = EventQueue::in_memory(2);
    let sink = ScriptedSink::default();
    queue.enqueue(push("m1"));

    sink.script(vec![unavailable(), unavailable()]);
    let first = queue.flush_flow(FlowKind::Medication, &sink).await;
    assert_eq!(first.remaining, 1);
    assert_eq!(first.failed, 0);

    let second = queue.flush_flow(FlowKind::Medication, &sink).await;
    assert_eq!(second.failed, 1);
    assert_eq!(second.remaining, 0);
    assert_eq!(queue.failed_entries()[0].attempts, 2);
    assert_eq!(sink.failed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_sync_complete_fires_once_per_batch() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = queue.on_sync_complete(move |report| {
        assert!(report.attempted > 0);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Empty batch: no callback
    queue.sync_pending_events(&sink).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    queue.enqueue(push("m1"));
    queue.enqueue(push("m2"));
    queue.enqueue(device_event("e1"));
    queue.sync_pending_events(&sink).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handle.unsubscribe();
    queue.enqueue(push("m3"));
    queue.sync_pending_events(&sink).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_contains_device_event() {
    let queue = EventQueue::in_memory(3);
    queue.enqueue(device_event("e1"));

    assert!(queue.contains_device_event("PBX-001", "e1"));
    assert!(!queue.contains_device_event("PBX-001", "e2"));
    assert!(!queue.contains_device_event("PBX-002", "e1"));
}

#[tokio::test]
async fn test_contains_device_event_includes_failed_entries() {
    let queue = EventQueue::in_memory(3);
    let sink = ScriptedSink::default();
    queue.enqueue(device_event("e1"));

    sink.script(vec![Some(AppError::Validation("missing medicationId".to_string()))]);
    let report = queue.flush_flow(FlowKind::DeviceEvents, &sink).await;
    assert_eq!(report.failed, 1);

    assert_eq!(queue.pending_count(), 0);
    assert!(queue.contains_device_event("PBX-001", "e1"));
}

#[tokio::test]
async fn test_pending_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("queue.json");

    let ids: Vec<String> = {
        let queue = EventQueue::open(path.clone(), 3);
        vec![
            queue.enqueue(push("m1")).id,
            queue.enqueue(device_event("e1")).id,
        ]
    };
    assert!(path.exists());

    let reopened = EventQueue::open(path.clone(), 3);
    let pending: Vec<String> = reopened
        .pending_entries()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(pending, ids);

    let sink = ScriptedSink::default();
    let report = reopened.sync_pending_events(&sink).await;
    assert_eq!(report.delivered, 2);
    drop(reopened);

    let again = EventQueue::open(path, 3);
    assert_eq!(again.pending_count(), 0);
}

#[tokio::test]
async fn test_failed_entries_and_attempts_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");

    {
        let queue = EventQueue::open(path.clone(), 5);
        queue.enqueue(push("m1"));
        queue.enqueue(push("m2"));
        let sink = ScriptedSink::default();
        sink.script(vec![Some(AppError::Validation("bad".to_string())), unavailable()]);
        queue.flush_flow(FlowKind::Medication, &sink).await;
    }

    let reopened = EventQueue::open(path, 5);
    assert_eq!(reopened.failed_entries().len(), 1);
    let pending = reopened.pending_entries();
    assert_eq!(pending.len(), 1);
    assert_eq!(op_id(&pending[0].operation), "m2");
    assert_eq!(pending[0].attempts, 1);
}

#[tokio::test]
async fn test_corrupt_queue_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let queue = EventQueue::open(path.clone(), 3);
    assert_eq!(queue.pending_count(), 0);

    queue.enqueue(push("m1"));
    let reopened = EventQueue::open(path, 3);
    assert_eq!(reopened.pending_count(), 1);
}
