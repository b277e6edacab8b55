// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent classification and API responses.
//!
//! Every store failure is classified exactly once (`From<StoreError>`), and
//! every error carries a `retryable` flag so callers can decide whether to
//! offer a retry.

use crate::db::{StoreError, StoreErrorCode};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection code has already been used")]
    AlreadyUsed,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection code has expired")]
    Expired,

    #[error("Could not generate a unique connection code")]
    CodeGenerationFailed,

    #[error("Device unavailable: {0}")]
    DeviceOffline(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse error categories used by callers to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient connectivity or capacity problem.
    Network,
    /// The user must sign in again or lacks access.
    Auth,
    /// The user must correct the input.
    Validation,
    /// Missing entity. May be eventual-consistency lag.
    NotFound,
    /// Terminal business state (used, expired, duplicate, device offline).
    BusinessState,
    Unknown,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Network(_) | AppError::Unavailable(_) | AppError::Timeout(_) => {
                ErrorKind::Network
            }
            AppError::Unauthenticated | AppError::Permission(_) => ErrorKind::Auth,
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::AlreadyUsed
            | AppError::AlreadyExists(_)
            | AppError::Expired
            | AppError::CodeGenerationFailed
            | AppError::DeviceOffline(_) => ErrorKind::BusinessState,
            AppError::Unknown(_) | AppError::Internal(_) => ErrorKind::Unknown,
        }
    }

    /// Whether repeating the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Network => true,
            ErrorKind::Unknown => matches!(self, AppError::Unknown(_)),
            _ => false,
        }
    }

    /// Short, user-safe message. Never includes store internals.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Network(_) | AppError::Unavailable(_) => {
                "Unable to reach the server. Check your connection and try again.".to_string()
            }
            AppError::Timeout(_) => "The request took too long. Please try again.".to_string(),
            AppError::Unauthenticated => "Please sign in again.".to_string(),
            AppError::Permission(_) => "You don't have permission to do that.".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::NotFound(_) => "We couldn't find what you were looking for.".to_string(),
            AppError::AlreadyUsed => "This connection code has already been used.".to_string(),
            AppError::AlreadyExists(_) => "This already exists.".to_string(),
            AppError::Expired => {
                "This connection code has expired. Ask the patient for a new one.".to_string()
            }
            AppError::CodeGenerationFailed => {
                "Could not create a connection code. Please try again.".to_string()
            }
            AppError::DeviceOffline(_) => {
                "The device is offline. Make sure it is powered on and connected.".to_string()
            }
            AppError::Unknown(_) | AppError::Internal(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let msg = err.message;
        match err.code {
            StoreErrorCode::Unavailable | StoreErrorCode::ResourceExhausted => {
                AppError::Unavailable(msg)
            }
            StoreErrorCode::DeadlineExceeded => AppError::Timeout(msg),
            StoreErrorCode::Aborted => AppError::Network(msg),
            StoreErrorCode::PermissionDenied => AppError::Permission(msg),
            StoreErrorCode::Unauthenticated => AppError::Unauthenticated,
            StoreErrorCode::NotFound => AppError::NotFound(msg),
            StoreErrorCode::AlreadyExists => AppError::AlreadyExists(msg),
            StoreErrorCode::InvalidArgument => AppError::Validation(msg),
            StoreErrorCode::Unknown => AppError::Unknown(msg),
        }
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorKind,
    message: String,
    retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Network(_) | AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Permission(_) => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AlreadyUsed | AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Expired => StatusCode::GONE,
            AppError::DeviceOffline(_) => StatusCode::CONFLICT,
            AppError::CodeGenerationFailed | AppError::Unknown(_) => {
                tracing::error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            error: self.kind(),
            message: self.user_message(),
            retryable: self.is_retryable(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for services and handlers
pub type Result<T> = std::result::Result<T, AppError>;
