// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Push notification senders.
//!
//! Only the decision of when to notify lives in the services; delivery is
//! delegated to a [`PushSender`].

use crate::error::AppError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// One push notification to one device token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub sound: &'static str,
    pub priority: &'static str,
}

impl PushMessage {
    pub fn high_priority(to: &str, title: &str, body: &str, data: Value) -> Self {
        Self {
            to: to.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            data,
            sound: "default",
            priority: "high",
        }
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), AppError>;
}

/// Sender for an Expo-compatible push gateway.
#[derive(Clone)]
pub struct ExpoPushSender {
    http: reqwest::Client,
    endpoint: String,
}

impl ExpoPushSender {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl PushSender for ExpoPushSender {
    async fn send(&self, message: &PushMessage) -> Result<(), AppError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(message)
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            tracing::warn!(status = %status, "Push gateway unavailable");
            return Err(AppError::Unavailable(format!("HTTP {}: {}", status, body)));
        }
        Err(AppError::Unknown(format!("Push rejected: HTTP {}: {}", status, body)))
    }
}

/// Sender used when no gateway is configured: logs and drops.
#[derive(Debug, Clone, Default)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, message: &PushMessage) -> Result<(), AppError> {
        tracing::info!(title = %message.title, "Push notification (no gateway configured)");
        Ok(())
    }
}
