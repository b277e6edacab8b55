// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Document store layer.
//!
//! Services talk to the document store through the [`DocumentStore`] trait so
//! the Firestore backend and the in-memory backend are interchangeable.

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;
pub use memory::MemoryDocumentStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use tokio::sync::mpsc;

/// Collection names as constants.
pub mod collections {
    pub const USERS: &str = "users";
    pub const CONNECTION_CODES: &str = "connectionCodes";
    pub const DEVICE_LINKS: &str = "deviceLinks";
    pub const CRITICAL_EVENTS: &str = "criticalEvents";
    pub const MEDICATIONS: &str = "medications";
    pub const MEDICATION_EVENTS: &str = "medicationEvents";
    pub const INTAKE_RECORDS: &str = "intakeRecords";
    /// Device events that are neither dose-taken nor dose-missed.
    pub const DEVICE_EVENTS: &str = "deviceEvents";
}

// ─── Errors ─────────────────────────────────────────────────────

/// Platform error codes shared by both store kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Unknown,
}

impl StoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorCode::Unavailable => "unavailable",
            StoreErrorCode::DeadlineExceeded => "deadline-exceeded",
            StoreErrorCode::ResourceExhausted => "resource-exhausted",
            StoreErrorCode::Aborted => "aborted",
            StoreErrorCode::PermissionDenied => "permission-denied",
            StoreErrorCode::Unauthenticated => "unauthenticated",
            StoreErrorCode::NotFound => "not-found",
            StoreErrorCode::AlreadyExists => "already-exists",
            StoreErrorCode::InvalidArgument => "invalid-argument",
            StoreErrorCode::Unknown => "unknown",
        }
    }

    /// Codes worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreErrorCode::Unavailable
                | StoreErrorCode::DeadlineExceeded
                | StoreErrorCode::ResourceExhausted
                | StoreErrorCode::Aborted
        )
    }
}

impl fmt::Display for StoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a store backend.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StoreError {
    pub code: StoreErrorCode,
    pub message: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(StoreErrorCode::NotFound, format!("{} not found", what))
    }

    pub fn serialization(err: serde_json::Error) -> Self {
        Self::new(StoreErrorCode::InvalidArgument, err.to_string())
    }
}

// ─── Queries ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gte,
    Lt,
}

/// A single top-level field condition. Query filters are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Gte,
            value: value.into(),
        }
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            op: FilterOp::Lt,
            value: value.into(),
        }
    }

    /// Evaluate against a document. Missing fields never match.
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Gte => {
                matches!(
                    compare_values(actual, &self.value),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }
            FilterOp::Lt => matches!(compare_values(actual, &self.value), Some(Ordering::Less)),
        }
    }
}

/// True if the document satisfies every filter.
pub fn matches_all(filters: &[Filter], doc: &Value) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Shallow merge of `patch` fields into `target`.
pub fn merge_fields(target: &mut Value, patch: &Value) {
    if let (Value::Object(dst), Value::Object(src)) = (target, patch) {
        for (key, value) in src {
            dst.insert(key.clone(), value.clone());
        }
    }
}

// ─── Change streams ─────────────────────────────────────────────

/// One change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    /// Document now matches the watch (added or modified).
    Upserted { id: String, data: Value },
    /// Document deleted or no longer matches the watch.
    Removed { id: String },
}

/// Receiver side of a document watch. The first message is the current
/// matching snapshot; dropping the receiver ends the watch.
pub type DocWatch = mpsc::UnboundedReceiver<Result<Vec<DocChange>, StoreError>>;

// ─── Store trait ────────────────────────────────────────────────

/// Document store operations used by the services.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Create a document, failing with `already-exists` if it is present.
    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError>;

    /// Create or replace a document.
    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError>;

    /// Merge top-level fields into an existing document.
    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Compare-and-set: merge `patch` only if the document exists and every
    /// precondition holds, as one atomic step. Returns whether it applied.
    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[Filter],
        patch: Value,
    ) -> Result<bool, StoreError>;

    fn watch(&self, collection: &str, filters: Vec<Filter>) -> DocWatch;
}

/// Typed helpers over [`DocumentStore`].
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    async fn get_as<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.get(collection, id).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(StoreError::serialization),
            None => Ok(None),
        }
    }

    async fn set_as<T: Serialize + Sync>(
        &self,
        collection: &str,
        id: &str,
        data: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(data).map_err(StoreError::serialization)?;
        self.set(collection, id, value).await
    }

    /// Query and decode, skipping documents that do not decode.
    async fn query_as<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<T>, StoreError> {
        let docs = self.query(collection, filters).await?;
        Ok(docs
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value(value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    tracing::warn!(collection, id = %id, error = %e, "Skipping malformed document");
                    None
                }
            })
            .collect())
    }
}

impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}
