// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Critical event tests: creation, caregiver fan-out, monitoring with push,
//! read tracking and device health detection.

use pillbox_sync::db::{collections, DocumentStoreExt};
use pillbox_sync::error::AppError;
use pillbox_sync::models::{
    CriticalEventNotification, CriticalEventType, NewCriticalEvent, Role, Severity,
};
use pillbox_sync::realtime::{paths, RealtimeStore};
use pillbox_sync::services::CriticalAlert;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;
use common::{eventually, TestEnv, CAREGIVER, DEVICE, OTHER_CAREGIVER, PATIENT};

fn new_event(caregiver: &str, message: &str) -> NewCriticalEvent {
    NewCriticalEvent {
        event_type: CriticalEventType::MissedDose,
        patient_id: PATIENT.to_string(),
        caregiver_id: caregiver.to_string(),
        device_id: Some(DEVICE.to_string()),
        medication_id: Some("med1".to_string()),
        message: message.to_string(),
        severity: None,
    }
}

async fn stored(env: &TestEnv, id: &str) -> CriticalEventNotification {
    env.docs
        .get_as::<CriticalEventNotification>(collections::CRITICAL_EVENTS, id)
        .await
        .unwrap()
        .unwrap()
}

async fn all_events(env: &TestEnv) -> Vec<CriticalEventNotification> {
    env.docs
        .query_as::<CriticalEventNotification>(collections::CRITICAL_EVENTS, &[])
        .await
        .unwrap()
}

#[tokio::test]
async fn test_create_event_defaults_severity_and_flags() {
    let env = TestEnv::new().await;
    let event = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Missed dose of Aspirin"))
        .await
        .unwrap();

    assert_eq!(event.severity, Severity::High);
    assert!(!event.read);
    assert!(!event.notification_sent);
    assert_eq!(stored(&env, &event.id).await, event);
}

#[tokio::test]
async fn test_create_event_requires_message() {
    let env = TestEnv::new().await;
    let err = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(env.docs.count(collections::CRITICAL_EVENTS), 0);
}

#[tokio::test]
async fn test_notify_caregivers_fans_out_to_active_caregivers() {
    let env = TestEnv::new().await;
    env.seed_link(DEVICE, PATIENT, Role::Patient).await;
    env.seed_link(DEVICE, CAREGIVER, Role::Caregiver).await;
    env.seed_link(DEVICE, OTHER_CAREGIVER, Role::Caregiver).await;

    let alert = CriticalAlert::new(CriticalEventType::DeviceError, PATIENT, "Motor jam")
        .with_medication("med1");
    let created = env
        .state
        .critical
        .notify_caregivers(DEVICE, alert)
        .await
        .unwrap();

    let mut caregivers: Vec<String> = created.iter().map(|e| e.caregiver_id.clone()).collect();
    caregivers.sort();
    assert_eq!(caregivers, vec![CAREGIVER, OTHER_CAREGIVER]);
    assert!(created.iter().all(|e| e.severity == Severity::Critical));
    assert!(created.iter().all(|e| e.device_id.as_deref() == Some(DEVICE)));
}

#[tokio::test]
async fn test_notify_caregivers_with_dedup_key_is_repeatable() {
    let env = TestEnv::new().await;
    env.seed_link(DEVICE, PATIENT, Role::Patient).await;
    env.seed_link(DEVICE, CAREGIVER, Role::Caregiver).await;
    env.seed_link(DEVICE, OTHER_CAREGIVER, Role::Caregiver).await;

    let alert = CriticalAlert::new(CriticalEventType::MissedDose, PATIENT, "Missed Aspirin")
        .with_dedup_key("missed_med1_1710057600000");

    // Two caregivers, two attempts each
    env.faults.fail_writes(collections::CRITICAL_EVENTS, 4);
    assert!(env
        .state
        .critical
        .notify_caregivers(DEVICE, alert.clone())
        .await
        .is_err());

    let created = env
        .state
        .critical
        .notify_caregivers(DEVICE, alert.clone())
        .await
        .unwrap();
    assert_eq!(created.len(), 2);
    env.state
        .critical
        .notify_caregivers(DEVICE, alert)
        .await
        .unwrap();

    assert_eq!(env.docs.count(collections::CRITICAL_EVENTS), 2);
    let stored = env
        .docs
        .get_as::<CriticalEventNotification>(
            collections::CRITICAL_EVENTS,
            &format!("missed_med1_1710057600000_{}", CAREGIVER),
        )
        .await
        .unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_notify_caregivers_without_caregivers_creates_nothing() {
    let env = TestEnv::new().await;
    env.seed_link(DEVICE, PATIENT, Role::Patient).await;

    let created = env
        .state
        .critical
        .notify_caregivers(
            DEVICE,
            CriticalAlert::new(CriticalEventType::LowBattery, PATIENT, "Battery low"),
        )
        .await
        .unwrap();
    assert!(created.is_empty());
}

#[tokio::test]
async fn test_monitoring_pushes_once_and_records_delivery() {
    let env = TestEnv::new().await;
    env.sign_in(CAREGIVER);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    env.state
        .critical
        .start_monitoring(CAREGIVER, move |event| {
            sink.lock().unwrap().push(event.id);
        })
        .await
        .unwrap();
    assert!(env.state.critical.is_monitoring(CAREGIVER));

    let event = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Missed dose of Aspirin"))
        .await
        .unwrap();

    let e = &env;
    let id = event.id.clone();
    assert!(
        eventually(move || {
            let id = id.clone();
            async move { stored(e, &id).await.notification_sent }
        })
        .await
    );

    let sent = env.push.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "push-token-c1");
    assert_eq!(sent[0].body, "Missed dose of Aspirin");
    assert_eq!(sent[0].data["eventId"], event.id.as_str());
    assert_eq!(*received.lock().unwrap(), vec![event.id.clone()]);

    // Later unrelated writes do not repeat the push
    env.state.critical.mark_as_read(&event.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(env.push.sent().len(), 1);
}

#[tokio::test]
async fn test_monitoring_skips_already_notified_events() {
    let env = TestEnv::new().await;
    env.sign_in(CAREGIVER);

    let mut notified = new_event(CAREGIVER, "Already sent")
        .into_notification("old".to_string(), chrono::Utc::now());
    notified.notification_sent = true;
    env.docs
        .set_as(collections::CRITICAL_EVENTS, "old", &notified)
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(0usize));
    let counter = received.clone();
    env.state
        .critical
        .start_monitoring(CAREGIVER, move |_| *counter.lock().unwrap() += 1)
        .await
        .unwrap();

    let r = &received;
    assert!(eventually(move || async move { *r.lock().unwrap() == 1 }).await);
    assert!(env.push.sent().is_empty());
}

#[tokio::test]
async fn test_missing_push_token_still_marks_event() {
    let env = TestEnv::new().await;
    env.sign_in(OTHER_CAREGIVER);
    env.state
        .critical
        .start_monitoring(OTHER_CAREGIVER, |_| {})
        .await
        .unwrap();

    let event = env
        .state
        .critical
        .create_critical_event(new_event(OTHER_CAREGIVER, "Missed dose"))
        .await
        .unwrap();

    let e = &env;
    let id = event.id.clone();
    assert!(
        eventually(move || {
            let id = id.clone();
            async move { stored(e, &id).await.notification_sent }
        })
        .await
    );
    assert!(env.push.sent().is_empty());
}

#[tokio::test]
async fn test_push_failure_leaves_event_unsent() {
    let env = TestEnv::new().await;
    env.sign_in(CAREGIVER);
    env.push.fail_next(10);

    let received = Arc::new(Mutex::new(0usize));
    let counter = received.clone();
    env.state
        .critical
        .start_monitoring(CAREGIVER, move |_| *counter.lock().unwrap() += 1)
        .await
        .unwrap();

    let event = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Missed dose"))
        .await
        .unwrap();

    let r = &received;
    assert!(eventually(move || async move { *r.lock().unwrap() == 1 }).await);
    assert!(!stored(&env, &event.id).await.notification_sent);
    assert!(env.push.sent().is_empty());
}

#[tokio::test]
async fn test_monitoring_requires_matching_caller() {
    let env = TestEnv::new().await;
    env.sign_in(OTHER_CAREGIVER);
    let err = env
        .state
        .critical
        .start_monitoring(CAREGIVER, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
    assert!(!env.state.critical.is_monitoring(CAREGIVER));
}

#[tokio::test]
async fn test_stop_monitoring_ends_session() {
    let env = TestEnv::new().await;
    env.sign_in(CAREGIVER);

    assert!(!env.state.critical.stop_monitoring(CAREGIVER));

    env.state
        .critical
        .start_monitoring(CAREGIVER, |_| {})
        .await
        .unwrap();
    assert!(env.state.critical.stop_monitoring(CAREGIVER));
    assert!(!env.state.critical.is_monitoring(CAREGIVER));

    let e = &env;
    assert!(eventually(move || async move { e.docs.watcher_count() == 0 }).await);

    env.state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Missed dose"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(env.push.sent().is_empty());
}

#[tokio::test]
async fn test_mark_as_read_checks_owner() {
    let env = TestEnv::new().await;
    let event = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Missed dose"))
        .await
        .unwrap();

    env.sign_in(OTHER_CAREGIVER);
    let err = env.state.critical.mark_as_read(&event.id).await.unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
    assert!(!stored(&env, &event.id).await.read);

    env.sign_in(CAREGIVER);
    env.state.critical.mark_as_read(&event.id).await.unwrap();
    assert!(stored(&env, &event.id).await.read);

    let err = env.state.critical.mark_as_read("missing").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_unread_events_newest_first() {
    let env = TestEnv::new().await;
    env.sign_in(CAREGIVER);

    let first = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "First"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = env
        .state
        .critical
        .create_critical_event(new_event(CAREGIVER, "Second"))
        .await
        .unwrap();
    env.state
        .critical
        .create_critical_event(new_event(OTHER_CAREGIVER, "Not mine"))
        .await
        .unwrap();

    let unread = env.state.critical.unread_events(CAREGIVER).await.unwrap();
    let ids: Vec<&str> = unread.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);

    env.state.critical.mark_as_read(&second.id).await.unwrap();
    assert_eq!(env.state.critical.unread_count(CAREGIVER).await.unwrap(), 1);

    let err = env
        .state
        .critical
        .unread_events(OTHER_CAREGIVER)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
}

#[tokio::test]
async fn test_device_health_transitions_raise_events() {
    let env = TestEnv::new().await;
    env.seed_link(DEVICE, PATIENT, Role::Patient).await;
    env.seed_link(DEVICE, CAREGIVER, Role::Caregiver).await;
    env.device_online(DEVICE).await;

    env.state.critical.watch_device_health(DEVICE, PATIENT);
    let e = &env;
    assert!(eventually(move || async move { e.realtime.subscriber_count() == 1 }).await);
    // Baseline only
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(all_events(&env).await.is_empty());

    env.realtime
        .set(
            &paths::device_state(DEVICE),
            json!({
                "is_online": true,
                "battery_level": 12.0,
                "current_status": "idle",
                "pills_remaining": 20,
            }),
        )
        .await
        .unwrap();
    assert!(eventually(move || async move { all_events(e).await.len() == 1 }).await);
    let events = all_events(&env).await;
    assert_eq!(events[0].event_type, CriticalEventType::LowBattery);
    assert_eq!(events[0].caregiver_id, CAREGIVER);
    assert!(events[0].message.contains("12%"));

    // Still low: no repeat. Offline: new event.
    env.realtime
        .set(
            &paths::device_state(DEVICE),
            json!({
                "is_online": false,
                "battery_level": 11.0,
                "current_status": "idle",
                "pills_remaining": 20,
            }),
        )
        .await
        .unwrap();
    assert!(eventually(move || async move { all_events(e).await.len() == 2 }).await);
    assert!(all_events(&env)
        .await
        .iter()
        .any(|ev| ev.event_type == CriticalEventType::DeviceOffline));

    assert!(env.state.critical.stop_device_health(DEVICE));
    assert!(eventually(move || async move { e.realtime.subscriber_count() == 0 }).await);
}
