// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! REST client for the hosted realtime tree.
//!
//! Uses the `{base}/{path}.json` protocol (GET/PUT/PATCH/DELETE). Subscriptions
//! poll the path; connectivity follows the outcome of the latest request.

use crate::db::{StoreError, StoreErrorCode};
use crate::realtime::{RealtimeStore, RealtimeWatch};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Realtime tree REST client.
#[derive(Clone)]
pub struct RestRealtimeDb {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    poll_interval: Duration,
    connected: Arc<watch::Sender<bool>>,
}

impl RestRealtimeDb {
    pub fn new(base_url: &str, auth_token: Option<String>, poll_interval: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            poll_interval,
            connected: Arc::new(connected),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.auth_token {
            Some(token) => builder.query(&[("auth", token.as_str())]),
            None => builder,
        }
    }

    /// Send a request and decode the JSON body, tracking connectivity.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, StoreError> {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let code = if e.is_timeout() {
                    StoreErrorCode::DeadlineExceeded
                } else {
                    StoreErrorCode::Unavailable
                };
                self.set_connected(false);
                return Err(StoreError::new(code, e.to_string()));
            }
        };

        self.set_connected(true);
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let code = match status.as_u16() {
                401 => StoreErrorCode::Unauthenticated,
                403 => StoreErrorCode::PermissionDenied,
                404 => StoreErrorCode::NotFound,
                400 => StoreErrorCode::InvalidArgument,
                429 => {
                    tracing::warn!("Realtime tree rate limit hit (429)");
                    StoreErrorCode::ResourceExhausted
                }
                500..=599 => StoreErrorCode::Unavailable,
                _ => StoreErrorCode::Unknown,
            };
            return Err(StoreError::new(code, format!("HTTP {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| StoreError::new(StoreErrorCode::Unknown, format!("JSON parse error: {}", e)))
    }

    fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            if *current != connected {
                tracing::info!(connected, "Realtime tree connectivity changed");
                *current = connected;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl RealtimeStore for RestRealtimeDb {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let value = self.send(self.request(reqwest::Method::GET, path)).await?;
        Ok(Some(value).filter(|v| !v.is_null()))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.send(self.request(reqwest::Method::PUT, path).json(&value))
            .await?;
        Ok(())
    }

    async fn update(&self, path: &str, children: Value) -> Result<(), StoreError> {
        self.send(self.request(reqwest::Method::PATCH, path).json(&children))
            .await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.send(self.request(reqwest::Method::DELETE, path))
            .await?;
        Ok(())
    }

    fn subscribe(&self, path: &str) -> RealtimeWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = self.clone();
        let path = path.to_string();

        tokio::spawn(async move {
            let mut last: Option<Option<Value>> = None;
            let mut ticker = tokio::time::interval(db.poll_interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                match db.get(&path).await {
                    Ok(value) => {
                        if last.as_ref() != Some(&value) {
                            if tx.send(value.clone()).is_err() {
                                break;
                            }
                            last = Some(value);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(path = %path, error = %e, "Realtime poll failed");
                    }
                }
            }

            tracing::debug!(path = %path, "Realtime subscription closed");
        });

        rx
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
