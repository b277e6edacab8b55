// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore backend for the document store.
//!
//! Documents are stored as plain JSON objects. Watches are implemented by
//! polling the filtered query and diffing consecutive snapshots.

use crate::db::{
    matches_all, merge_fields, DocChange, DocWatch, DocumentStore, Filter, FilterOp, StoreError,
    StoreErrorCode,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Firestore database client.
#[derive(Clone)]
pub struct FirestoreDb {
    client: Option<firestore::FirestoreDb>,
    poll_interval: Duration,
}

impl FirestoreDb {
    /// Create a new Firestore client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn new(project_id: &str) -> Result<Self, StoreError> {
        // If the emulator environment variable is set, use unauthenticated connection
        // to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id).await.map_err(|e| {
            StoreError::new(
                StoreErrorCode::Unavailable,
                format!("Failed to connect to Firestore: {}", e),
            )
        })?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            client: Some(client),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, StoreError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            StoreError::new(
                StoreErrorCode::Unavailable,
                format!("Failed to connect to Firestore Emulator: {}", e),
            )
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            client: Some(client),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Create a mock Firestore client (offline mode).
    ///
    /// All database operations return `unavailable`.
    pub fn new_mock() -> Self {
        Self {
            client: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often watches re-run their query.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Helper to get the client or return an error if offline.
    fn get_client(&self) -> Result<&firestore::FirestoreDb, StoreError> {
        self.client.as_ref().ok_or_else(|| {
            StoreError::new(
                StoreErrorCode::Unavailable,
                "Database not connected (offline mode)",
            )
        })
    }

    /// Extract the document id (last path segment) from a resource name.
    fn document_id(name: &str) -> String {
        name.rsplit('/').next().unwrap_or_default().to_string()
    }

    /// One read-check-write attempt, with the read bound to the transaction
    /// so a concurrent commit to the document aborts this one.
    async fn try_update_if(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[Filter],
        patch: &Value,
    ) -> Result<bool, StoreError> {
        let client = self.get_client()?;

        let mut transaction = client.begin_transaction().await.map_err(|e| {
            StoreError::new(
                StoreErrorCode::Aborted,
                format!("Failed to begin transaction: {}", e),
            )
        })?;

        let reader = client.clone_with_consistency_selector(
            firestore::FirestoreConsistencySelector::Transaction(
                transaction.transaction_id().clone(),
            ),
        );

        let current: Option<Value> = match reader
            .fluent()
            .select()
            .by_id_in(collection)
            .obj()
            .one(id)
            .await
        {
            Ok(current) => current,
            Err(err) => {
                let _ = transaction.rollback().await;
                let err = classify(err);
                if err.code.is_transient() {
                    return Err(StoreError::new(StoreErrorCode::Aborted, err.message));
                }
                return Err(err);
            }
        };

        let Some(mut current) = current else {
            let _ = transaction.rollback().await;
            return Err(StoreError::not_found(format!("{}/{}", collection, id)));
        };

        if !matches_all(preconditions, &current) {
            let _ = transaction.rollback().await;
            return Ok(false);
        }

        merge_fields(&mut current, patch);

        client
            .fluent()
            .update()
            .in_col(collection)
            .document_id(id)
            .object(&current)
            .add_to_transaction(&mut transaction)
            .map_err(|e| {
                StoreError::new(
                    StoreErrorCode::Aborted,
                    format!("Failed to add update to transaction: {}", e),
                )
            })?;

        transaction.commit().await.map_err(|e| {
            StoreError::new(
                StoreErrorCode::Aborted,
                format!("Transaction commit failed: {}", e),
            )
        })?;

        Ok(true)
    }
}

/// Map a Firestore client error onto the platform error codes.
fn classify(err: firestore::errors::FirestoreError) -> StoreError {
    use firestore::errors::FirestoreError as E;

    let code = match &err {
        E::DataNotFoundError(_) => StoreErrorCode::NotFound,
        E::DataConflictError(_) => StoreErrorCode::AlreadyExists,
        E::NetworkError(_) => StoreErrorCode::Unavailable,
        E::DatabaseError(db) if db.retry_possible => StoreErrorCode::Unavailable,
        E::InvalidParametersError(_) | E::SerializeError(_) | E::DeserializeError(_) => {
            StoreErrorCode::InvalidArgument
        }
        _ => StoreErrorCode::Unknown,
    };
    StoreError::new(code, err.to_string())
}

#[async_trait]
impl DocumentStore for FirestoreDb {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.get_client()?
            .fluent()
            .select()
            .by_id_in(collection)
            .obj()
            .one(id)
            .await
            .map_err(classify)
    }

    async fn create(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let _: () = self
            .get_client()?
            .fluent()
            .insert()
            .into(collection)
            .document_id(id)
            .object(&data)
            .execute()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn set(&self, collection: &str, id: &str, data: Value) -> Result<(), StoreError> {
        let _: () = self
            .get_client()?
            .fluent()
            .update()
            .in_col(collection)
            .document_id(id)
            .object(&data)
            .execute()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        let mut current = self
            .get(collection, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{}/{}", collection, id)))?;
        merge_fields(&mut current, &patch);
        self.set(collection, id, current).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.get_client()?
            .fluent()
            .delete()
            .from(collection)
            .document_id(id)
            .execute()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let filters = filters.to_vec();
        let docs = self
            .get_client()?
            .fluent()
            .select()
            .from(collection)
            .filter(move |q| {
                q.for_all(filters.iter().map(|f| {
                    let field = q.field(f.field.as_str());
                    match f.op {
                        FilterOp::Eq => field.eq(f.value.clone()),
                        FilterOp::Gte => field.greater_than_or_equal(f.value.clone()),
                        FilterOp::Lt => field.less_than(f.value.clone()),
                    }
                }))
            })
            .query()
            .await
            .map_err(classify)?;

        docs.iter()
            .map(|doc| {
                let value: Value =
                    firestore::FirestoreDb::deserialize_doc_to(doc).map_err(classify)?;
                Ok((Self::document_id(&doc.name), value))
            })
            .collect()
    }

    async fn update_if(
        &self,
        collection: &str,
        id: &str,
        preconditions: &[Filter],
        patch: Value,
    ) -> Result<bool, StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .try_update_if(collection, id, preconditions, &patch)
                .await
            {
                Err(e) if e.code == StoreErrorCode::Aborted && attempt < MAX_TRANSACTION_ATTEMPTS => {
                    tracing::debug!(collection, id, attempt, error = %e, "Transaction contended, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn watch(&self, collection: &str, filters: Vec<Filter>) -> DocWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = self.clone();
        let collection = collection.to_string();

        tokio::spawn(async move {
            let mut known: HashMap<String, Value> = HashMap::new();
            let mut first = true;
            let mut ticker = tokio::time::interval(db.poll_interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                let docs = match db.query(&collection, &filters).await {
                    Ok(docs) => docs,
                    Err(e) => {
                        tracing::warn!(collection = %collection, error = %e, "Watch poll failed");
                        if tx.send(Err(e)).is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let current: HashMap<String, Value> = docs.into_iter().collect();
                let changes = diff_snapshots(&known, &current);
                known = current;

                if (first || !changes.is_empty()) && tx.send(Ok(changes)).is_err() {
                    break;
                }
                first = false;
            }

            tracing::debug!(collection = %collection, "Watch closed");
        });

        rx
    }
}

/// Changes that turn `before` into `after`.
fn diff_snapshots(before: &HashMap<String, Value>, after: &HashMap<String, Value>) -> Vec<DocChange> {
    let mut changes: Vec<DocChange> = after
        .iter()
        .filter(|(id, data)| before.get(*id) != Some(*data))
        .map(|(id, data)| DocChange::Upserted {
            id: id.clone(),
            data: data.clone(),
        })
        .collect();

    changes.extend(
        before
            .keys()
            .filter(|id| !after.contains_key(*id))
            .map(|id| DocChange::Removed { id: id.clone() }),
    );

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_is_last_path_segment() {
        assert_eq!(
            FirestoreDb::document_id("projects/p/databases/(default)/documents/codes/ABC123"),
            "ABC123"
        );
    }

    #[test]
    fn diff_reports_upserts_and_removals() {
        let before = HashMap::from([
            ("a".to_string(), json!({ "v": 1 })),
            ("b".to_string(), json!({ "v": 1 })),
        ]);
        let after = HashMap::from([
            ("a".to_string(), json!({ "v": 1 })),
            ("c".to_string(), json!({ "v": 2 })),
        ]);

        let changes = diff_snapshots(&before, &after);

        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&DocChange::Upserted {
            id: "c".to_string(),
            data: json!({ "v": 2 })
        }));
        assert!(changes.contains(&DocChange::Removed { id: "b".to_string() }));
    }

    #[tokio::test]
    async fn offline_client_reports_unavailable() {
        let db = FirestoreDb::new_mock();
        let err = db.get("users", "u1").await.unwrap_err();
        assert_eq!(err.code, StoreErrorCode::Unavailable);
    }
}
