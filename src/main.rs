// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Pillbox-Sync Agent
//!
//! Runs the sync flows for the signed-in account: medication schedules and
//! device events for a patient, critical-event monitoring for a caregiver.
//! Exposes a small local API for status and control.

use pillbox_sync::{
    auth::SessionAuth,
    config::{Config, StoreBackend},
    db::{collections, DocumentStore, DocumentStoreExt, FirestoreDb, MemoryDocumentStore},
    models::{Role, UserProfile},
    realtime::{MemoryRealtimeStore, RealtimeStore, RestRealtimeDb},
    services::{EventQueue, ExpoPushSender, LogPushSender, PushSender, RandomCodeSource},
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, backend = ?config.store_backend, "Starting Pillbox-Sync agent");

    let session_token = config
        .session_token
        .clone()
        .expect("SESSION_TOKEN is required");
    let session = Arc::new(
        SessionAuth::from_token(&session_token, &config.jwt_signing_key)
            .expect("Invalid session token"),
    );
    let uid = session.uid().expect("Session has no subject");
    tracing::info!(uid = %uid, "Session verified");

    // Initialize stores
    let (docs, realtime): (Arc<dyn DocumentStore>, Arc<dyn RealtimeStore>) =
        match config.store_backend {
            StoreBackend::Firestore => {
                let db = FirestoreDb::new(&config.gcp_project_id)
                    .await
                    .expect("Failed to connect to Firestore")
                    .with_poll_interval(config.poll_interval);
                let url = config
                    .realtime_db_url
                    .as_deref()
                    .expect("REALTIME_DB_URL is required");
                let rtdb = RestRealtimeDb::new(
                    url,
                    config.realtime_auth_token.clone(),
                    config.poll_interval,
                );
                (Arc::new(db), Arc::new(rtdb))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory stores; data is not shared or persisted");
                (
                    Arc::new(MemoryDocumentStore::new()),
                    Arc::new(MemoryRealtimeStore::new()),
                )
            }
        };

    let push: Arc<dyn PushSender> = match &config.push_endpoint {
        Some(endpoint) => Arc::new(ExpoPushSender::new(endpoint)),
        None => {
            tracing::info!("No PUSH_ENDPOINT configured; notifications are logged only");
            Arc::new(LogPushSender)
        }
    };

    // Restore the durable queue
    let queue = Arc::new(match &config.queue_path {
        Some(path) => EventQueue::open(path.clone(), config.queue_max_attempts),
        None => EventQueue::in_memory(config.queue_max_attempts),
    });
    tracing::info!(pending = queue.pending_count(), "Sync queue restored");

    let state = Arc::new(AppState::new(
        config.clone(),
        docs,
        realtime,
        session,
        push,
        Arc::new(RandomCodeSource::new()),
        queue,
    ));

    state.sync.start();
    if config.run_link_mirror {
        state.mirror.start();
    }
    start_flows(&state, &uid).await;

    // Build router
    let app = pillbox_sync::routes::create_router(state.clone());

    // Start server
    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Local API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    state.shutdown();
    Ok(())
}

/// Start the flows that apply to the signed-in account's role.
async fn start_flows(state: &Arc<AppState>, uid: &str) {
    let profile = match state
        .docs
        .get_as::<UserProfile>(collections::USERS, uid)
        .await
    {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            tracing::warn!(uid = %uid, "No profile for signed-in account; no flows started");
            return;
        }
        Err(e) => {
            tracing::error!(uid = %uid, error = %e, "Failed to load profile; no flows started");
            return;
        }
    };

    match profile.role {
        Role::Patient => {
            let devices = match state.links.linked_devices(uid).await {
                Ok(devices) => devices,
                Err(e) => {
                    tracing::error!(uid = %uid, error = %e, "Failed to list linked devices");
                    return;
                }
            };
            if devices.len() > 1 {
                tracing::warn!(uid = %uid, count = devices.len(), "Multiple devices linked; schedules go to the first");
            }
            if let Some(device_id) = devices.first() {
                if let Err(e) = state.sync.start_medication_sync(uid, device_id) {
                    tracing::error!(device_id = %device_id, error = %e, "Medication sync not started");
                }
            }
            for device_id in &devices {
                if let Err(e) = state.sync.start_device_event_sync(device_id, uid) {
                    tracing::error!(device_id = %device_id, error = %e, "Device event sync not started");
                    continue;
                }
                state.critical.watch_device_health(device_id, uid);
            }
            tracing::info!(uid = %uid, devices = devices.len(), "Patient flows started");
        }
        Role::Caregiver => {
            let result = state
                .critical
                .start_monitoring(uid, |event| {
                    tracing::info!(
                        event_id = %event.id,
                        event_type = ?event.event_type,
                        severity = ?event.severity,
                        "Critical event received"
                    );
                })
                .await;
            match result {
                Ok(()) => tracing::info!(uid = %uid, "Critical event monitoring started"),
                Err(e) => tracing::error!(uid = %uid, error = %e, "Monitoring not started"),
            }
        }
    }
}

/// Initialize structured JSON logging.
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pillbox_sync=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
