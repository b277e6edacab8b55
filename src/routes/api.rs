// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API routes for the signed-in account.

use crate::error::{AppError, Result};
use crate::middleware::auth::AuthUser;
use crate::models::{ActionType, ConnectionCode, CriticalEventNotification, DeviceActionRequest};
use crate::services::{ActionOutcome, BatchReport, DoseCheck, SyncSnapshot};
use crate::time_utils::format_utc_rfc3339;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_CODE_EXPIRY_HOURS: u32 = 24;

/// API routes (require authentication via JWT).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sync/status", get(get_sync_status))
        .route("/api/sync/now", post(sync_now))
        .route("/api/codes", get(list_codes).post(create_code))
        .route("/api/codes/{code}", delete(revoke_code))
        .route("/api/codes/{code}/redeem", post(redeem_code))
        .route("/api/devices/{device_id}/actions", post(trigger_action))
        .route(
            "/api/devices/{device_id}/actions/{action_id}",
            get(get_action_status),
        )
        .route("/api/events/unread", get(get_unread_events))
        .route("/api/events/{event_id}/read", post(mark_event_read))
        .route("/api/doses/{medication_id}/check", get(check_dose))
}

// ─── Sync ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SyncStatusResponse {
    #[serde(flatten)]
    pub snapshot: SyncSnapshot,
    pub pending_operations: usize,
    pub failed_operations: usize,
    pub sync_in_progress: bool,
    pub last_sync_attempt: Option<String>,
}

async fn get_sync_status(State(state): State<Arc<AppState>>) -> Json<SyncStatusResponse> {
    let queue = state.sync.queue();
    Json(SyncStatusResponse {
        snapshot: state.sync.status(),
        pending_operations: queue.pending_count(),
        failed_operations: queue.failed_entries().len(),
        sync_in_progress: queue.is_sync_in_progress(),
        last_sync_attempt: queue.last_sync_attempt().map(format_utc_rfc3339),
    })
}

/// Flush both flows now and report what happened.
async fn sync_now(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<BatchReport> {
    tracing::info!(uid = %user.uid, "Manual sync requested");
    Json(state.sync.force_sync_all().await)
}

// ─── Connection codes ────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateCodeRequest {
    pub device_id: String,
    pub expires_in_hours: Option<u32>,
}

async fn list_codes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ConnectionCode>>> {
    Ok(Json(state.codes.get_active_codes(&user.uid).await?))
}

async fn create_code(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateCodeRequest>,
) -> Result<(StatusCode, Json<ConnectionCode>)> {
    let code = state
        .codes
        .generate_code(
            &user.uid,
            &body.device_id,
            body.expires_in_hours.unwrap_or(DEFAULT_CODE_EXPIRY_HOURS),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(code)))
}

async fn revoke_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<StatusCode> {
    state.codes.revoke_code(&code).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn redeem_code(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(code): Path<String>,
) -> Result<Json<ConnectionCode>> {
    Ok(Json(state.codes.use_code(&code, &user.uid).await?))
}

// ─── Device actions ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct TriggerActionRequest {
    pub action: String,
}

async fn trigger_action(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(device_id): Path<String>,
    Json(body): Json<TriggerActionRequest>,
) -> Result<Json<ActionOutcome>> {
    let action: ActionType = body.action.parse()?;
    Ok(Json(
        state
            .actions
            .trigger_action(&device_id, action, &user.uid)
            .await?,
    ))
}

async fn get_action_status(
    State(state): State<Arc<AppState>>,
    Path((device_id, action_id)): Path<(String, String)>,
) -> Result<Json<DeviceActionRequest>> {
    state
        .actions
        .get_action_status(&device_id, &action_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Action {}", action_id)))
}

// ─── Critical events ─────────────────────────────────────────

#[derive(Serialize)]
pub struct UnreadEventsResponse {
    pub count: usize,
    pub events: Vec<CriticalEventNotification>,
}

async fn get_unread_events(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UnreadEventsResponse>> {
    let events = state.critical.unread_events(&user.uid).await?;
    Ok(Json(UnreadEventsResponse {
        count: events.len(),
        events,
    }))
}

async fn mark_event_read(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<StatusCode> {
    state.critical.mark_as_read(&event_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Doses ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct DoseQuery {
    /// Scheduled time (RFC3339)
    scheduled: String,
}

fn parse_scheduled(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|_| {
            AppError::Validation(
                "Invalid 'scheduled' parameter: must be RFC3339 datetime".to_string(),
            )
        })
}

async fn check_dose(
    State(state): State<Arc<AppState>>,
    Path(medication_id): Path<String>,
    Query(params): Query<DoseQuery>,
) -> Result<Json<DoseCheck>> {
    let scheduled = parse_scheduled(&params.scheduled)?;
    Ok(Json(
        state.tracker.can_take_dose(&medication_id, scheduled).await,
    ))
}
