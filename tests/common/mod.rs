// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use async_trait::async_trait;
use pillbox_sync::auth::{create_jwt, SessionAuth};
use pillbox_sync::config::Config;
use pillbox_sync::db::{
    collections, DocWatch, DocumentStore, DocumentStoreExt, Filter, FirestoreDb,
    MemoryDocumentStore, StoreError, StoreErrorCode,
};
use pillbox_sync::error::{AppError, Result};
use pillbox_sync::models::{DeviceLink, LinkStatus, Role, UserProfile};
use pillbox_sync::realtime::{paths, MemoryRealtimeStore, RealtimeStore};
use pillbox_sync::routes::create_router;
use pillbox_sync::services::{CodeSource, EventQueue, PushMessage, PushSender};
use pillbox_sync::AppState;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[allow(dead_code)]
pub const PATIENT: &str = "P1";
#[allow(dead_code)]
pub const CAREGIVER: &str = "C1";
#[allow(dead_code)]
pub const OTHER_CAREGIVER: &str = "C2";
#[allow(dead_code)]
pub const DEVICE: &str = "PBX-001";

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// Create a test database connection.
#[allow(dead_code)]
pub async fn test_db() -> FirestoreDb {
    FirestoreDb::new("test-project")
        .await
        .expect("Failed to connect to Firestore emulator")
        .with_poll_interval(Duration::from_millis(50))
}

/// Codes handed out in a fixed order; the last one repeats once exhausted.
pub struct SequenceCodeSource {
    codes: Mutex<VecDeque<String>>,
    last: Mutex<String>,
}

impl SequenceCodeSource {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().map(|c| c.to_string()).collect()),
            last: Mutex::new(codes.last().copied().unwrap_or("AAAAAA").to_string()),
        }
    }

    /// Replace the remaining codes.
    #[allow(dead_code)]
    pub fn set(&self, codes: &[&str]) {
        let mut queue = self.codes.lock().unwrap();
        *queue = codes.iter().map(|c| c.to_string()).collect();
        if let Some(last) = codes.last() {
            *self.last.lock().unwrap() = last.to_string();
        }
    }
}

impl CodeSource for SequenceCodeSource {
    fn next_code(&self) -> Result<String> {
        match self.codes.lock().unwrap().pop_front() {
            Some(code) => Ok(code),
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

/// Push sender that records messages and can be told to fail.
#[derive(Default)]
pub struct RecordingPush {
    pub sent: Mutex<Vec<PushMessage>>,
    failures: Mutex<usize>,
}

impl RecordingPush {
    #[allow(dead_code)]
    pub fn fail_next(&self, times: usize) {
        *self.failures.lock().unwrap() = times;
    }

    #[allow(dead_code)]
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send(&self, message: &PushMessage) -> std::result::Result<(), AppError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::Unavailable("push gateway down".to_string()));
            }
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Document store over the in-memory one that can fail writes to a single
/// collection, or land a competing write just before a compare-and-set.
pub struct FaultyDocumentStore {
    inner: Arc<MemoryDocumentStore>,
    write_failures: Mutex<HashMap<String, usize>>,
    racing_writes: Mutex<HashMap<String, Value>>,
}

#[allow(dead_code)]
impl FaultyDocumentStore {
    pub fn new(inner: Arc<MemoryDocumentStore>) -> Self {
        Self {
            inner,
            write_failures: Mutex::new(HashMap::new()),
            racing_writes: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` creates, sets and merges in `collection`.
    pub fn fail_writes(&self, collection: &str, times: usize) {
        self.write_failures
            .lock()
            .unwrap()
            .insert(collection.to_string(), times);
    }

    /// Merge `patch` into the target document right before the next
    /// `update_if` in `collection` evaluates its preconditions.
    pub fn race_next_update(&self, collection: &str, patch: Value) {
        self.racing_writes
            .lock()
            .unwrap()
            .insert(collection.to_string(), patch);
    }

    fn check_write(&self, collection: &str) -> std::result::Result<(), StoreError> {
        let mut failures = self.write_failures.lock().unwrap();
        match failures.get_mut(collection) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(StoreError::new(
                    StoreErrorCode::Unavailable,
                    format!("write to {} unavailable", collection),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for FaultyDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> std::result::Result<Option<Value>, StoreError> {
        self.inner.get(collection, id).await
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> std::result::Result<(), StoreError> {
        self.check_write(collection)?;
        self.inner.create(collection, id, data).await
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> std::result::Result<(), StoreError> {
        self.check_write(collection)?;
        self.inner.set(collection, id, data).await
    }

    async fn merge(&self, collection: &str, id: &str, patch: Value) -> std::result::Result<(), StoreError> {
        self.check_write(collection)?;
        self.inner.merge(collection, id, patch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> std::result::Result<(), StoreError> {
        self.inner.delete(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> std::result::Result<Vec<(String, Value)>, StoreError> {
        self.inner.query(collection, filters).await
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[Filter],
        patch: Value,
    ) -> std::result::Result<bool, StoreError> {
        let racing = self.racing_writes.lock().unwrap().remove(collection);
        if let Some(racing) = racing {
            self.inner.merge(collection, id, racing).await?;
        }
        self.inner
            .update_if(collection, id, preconditions, patch)
            .await
    }

    fn watch(&self, collection: &str, filters: Vec<Filter>) -> DocWatch {
        self.inner.watch(collection, filters)
    }
}

/// Services wired on in-memory stores, with a patient and two caregivers.
pub struct TestEnv {
    pub docs: Arc<MemoryDocumentStore>,
    pub faults: Arc<FaultyDocumentStore>,
    pub realtime: Arc<MemoryRealtimeStore>,
    pub session: Arc<SessionAuth>,
    pub push: Arc<RecordingPush>,
    pub codes: Arc<SequenceCodeSource>,
    pub state: Arc<AppState>,
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new() -> Self {
        let config = Config::test_default();
        let queue = EventQueue::in_memory(config.queue_max_attempts);
        Self::build(config, queue).await
    }

    pub async fn with_queue(queue: EventQueue) -> Self {
        Self::build(Config::test_default(), queue).await
    }

    pub async fn with_config(config: Config) -> Self {
        let queue = EventQueue::in_memory(config.queue_max_attempts);
        Self::build(config, queue).await
    }

    async fn build(config: Config, queue: EventQueue) -> Self {
        let docs = Arc::new(MemoryDocumentStore::new());
        let faults = Arc::new(FaultyDocumentStore::new(docs.clone()));
        let realtime = Arc::new(MemoryRealtimeStore::new());
        let session = Arc::new(SessionAuth::new());
        let push = Arc::new(RecordingPush::default());
        let codes = Arc::new(SequenceCodeSource::new(&["ABC234", "XYZ789", "KMN456"]));

        let state = Arc::new(AppState::new(
            config,
            faults.clone(),
            realtime.clone(),
            session.clone(),
            push.clone(),
            codes.clone(),
            Arc::new(queue),
        ));

        let env = Self {
            docs,
            faults,
            realtime,
            session,
            push,
            codes,
            state,
        };
        env.add_profile(PATIENT, "Pat Patient", Role::Patient, None).await;
        env.add_profile(CAREGIVER, "Cara Giver", Role::Caregiver, Some("push-token-c1"))
            .await;
        env.add_profile(OTHER_CAREGIVER, "Carl Giver", Role::Caregiver, None)
            .await;
        env
    }

    pub async fn add_profile(&self, uid: &str, name: &str, role: Role, push_token: Option<&str>) {
        let profile = UserProfile {
            id: uid.to_string(),
            name: name.to_string(),
            role,
            push_token: push_token.map(String::from),
        };
        self.docs
            .set_as(collections::USERS, uid, &profile)
            .await
            .unwrap();
    }

    pub fn sign_in(&self, uid: &str) {
        self.session.sign_in(uid);
    }

    /// Link a user to a device in both stores, as the mirror job would.
    pub async fn seed_link(&self, device_id: &str, user_id: &str, role: Role) {
        self.realtime
            .set(&paths::user_device(user_id, device_id), serde_json::json!(true))
            .await
            .unwrap();
        let link = DeviceLink {
            id: DeviceLink::document_id(device_id, user_id),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            role,
            status: LinkStatus::Active,
            linked_at: chrono::Utc::now(),
            linked_by: user_id.to_string(),
        };
        self.docs
            .set_as(collections::DEVICE_LINKS, &link.id, &link)
            .await
            .unwrap();
    }

    /// Write an online device state.
    pub async fn device_online(&self, device_id: &str) {
        self.realtime
            .set(
                &paths::device_state(device_id),
                serde_json::json!({
                    "is_online": true,
                    "battery_level": 90.0,
                    "current_status": "idle",
                    "pills_remaining": 20,
                }),
            )
            .await
            .unwrap();
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Session JWT for `uid` signed with the test key.
    pub fn token(&self, uid: &str) -> String {
        create_jwt(uid, &self.state.config.jwt_signing_key).unwrap()
    }

    pub fn docs_dyn(&self) -> Arc<dyn DocumentStore> {
        self.docs.clone()
    }
}

/// Poll `check` until it holds or about two seconds pass.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
