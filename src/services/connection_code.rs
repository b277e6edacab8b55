// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Connection codes: short-lived, single-use tokens that let a caregiver link
//! to a patient's device.
//!
//! Redemption is a compare-and-set on `used == false`, so at most one
//! redemption ever succeeds even when two caregivers race.

use crate::auth::{ensure_caller, require_user, AuthProvider};
use crate::db::{collections, DocumentStore, DocumentStoreExt, Filter, StoreErrorCode};
use crate::error::{AppError, Result};
use crate::models::connection_code::{
    is_valid_code_format, normalize_code, CODE_ALPHABET, CODE_LENGTH, MAX_EXPIRY_HOURS,
};
use crate::models::device_link::validate_device_id;
use crate::models::{ConnectionCode, UserProfile};
use crate::services::device_link::DeviceLinkService;
use crate::services::retry::RetryPolicy;
use chrono::{Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::json;
use std::sync::Arc;

/// Generation attempts before giving up on finding a free code.
pub const MAX_GENERATION_ATTEMPTS: usize = 5;

/// Source of candidate codes.
pub trait CodeSource: Send + Sync {
    fn next_code(&self) -> Result<String>;
}

/// Cryptographically random codes over [`CODE_ALPHABET`].
pub struct RandomCodeSource {
    rng: SystemRandom,
}

impl RandomCodeSource {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for RandomCodeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeSource for RandomCodeSource {
    fn next_code(&self) -> Result<String> {
        // Largest multiple of the alphabet size that fits in a byte; bytes at
        // or above it are rejected so every character is equally likely.
        let limit = (256 / CODE_ALPHABET.len() * CODE_ALPHABET.len()) as u8;
        let mut code = String::with_capacity(CODE_LENGTH);
        let mut buf = [0u8; 16];

        while code.len() < CODE_LENGTH {
            self.rng
                .fill(&mut buf)
                .map_err(|_| anyhow::anyhow!("system random source failed"))?;
            for &b in buf.iter().filter(|&&b| b < limit) {
                if code.len() == CODE_LENGTH {
                    break;
                }
                code.push(CODE_ALPHABET[b as usize % CODE_ALPHABET.len()] as char);
            }
        }
        Ok(code)
    }
}

pub struct ConnectionCodeService {
    docs: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    links: Arc<DeviceLinkService>,
    codes: Arc<dyn CodeSource>,
    retry: RetryPolicy,
}

impl ConnectionCodeService {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        auth: Arc<dyn AuthProvider>,
        links: Arc<DeviceLinkService>,
        codes: Arc<dyn CodeSource>,
        base_delay: std::time::Duration,
    ) -> Self {
        Self {
            docs,
            auth,
            links,
            codes,
            retry: RetryPolicy::linear(3, base_delay),
        }
    }

    /// Issue a new code for the caller's device.
    pub async fn generate_code(
        &self,
        patient_id: &str,
        device_id: &str,
        expires_in_hours: u32,
    ) -> Result<ConnectionCode> {
        if !(1..=MAX_EXPIRY_HOURS).contains(&expires_in_hours) {
            return Err(AppError::Validation(format!(
                "Expiry must be between 1 and {} hours",
                MAX_EXPIRY_HOURS
            )));
        }
        validate_device_id(device_id)?;
        ensure_caller(self.auth.as_ref(), patient_id).await?;

        let profile: UserProfile = self
            .retry
            .run_transient("load_patient_profile", || async {
                Ok(self
                    .docs
                    .get_as::<UserProfile>(collections::USERS, patient_id)
                    .await?)
            })
            .await?
            .ok_or_else(|| AppError::NotFound(format!("patient {}", patient_id)))?;

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let code = self.codes.next_code()?;

            let existing = self
                .retry
                .run_transient("check_code_collision", || async {
                    Ok(self.docs.get(collections::CONNECTION_CODES, &code).await?)
                })
                .await?;
            if existing.is_some() {
                tracing::debug!(attempt, "Connection code collision, regenerating");
                continue;
            }

            let now = Utc::now();
            let record = ConnectionCode {
                code: code.clone(),
                device_id: device_id.to_string(),
                patient_id: patient_id.to_string(),
                patient_name: profile.name.clone(),
                created_at: now,
                expires_at: now + Duration::hours(i64::from(expires_in_hours)),
                used: false,
                used_by: None,
                used_at: None,
            };
            let data = serde_json::to_value(&record)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

            let created = self
                .retry
                .run_transient("create_code", || async {
                    match self
                        .docs
                        .create(collections::CONNECTION_CODES, &code, data.clone())
                        .await
                    {
                        Ok(()) => Ok(true),
                        Err(e) if e.code == StoreErrorCode::AlreadyExists => Ok(false),
                        Err(e) => Err(e.into()),
                    }
                })
                .await?;
            if !created {
                tracing::debug!(attempt, "Connection code taken concurrently, regenerating");
                continue;
            }

            tracing::info!(
                patient_id = %patient_id,
                device_id = %device_id,
                expires_at = %record.expires_at,
                "Connection code issued"
            );
            tracing::debug!(code = %code, "Issued code");
            return Ok(record);
        }

        tracing::error!(
            patient_id = %patient_id,
            attempts = MAX_GENERATION_ATTEMPTS,
            "Could not find an unused connection code"
        );
        Err(AppError::CodeGenerationFailed)
    }

    /// Look up a code without changing it.
    ///
    /// Expiry is checked before `used`, so an expired code always reports
    /// `Expired`.
    pub async fn validate_code(&self, raw: &str) -> Result<ConnectionCode> {
        let code = normalize_code(raw);
        if !is_valid_code_format(&code) {
            return Err(AppError::Validation(
                "Connection codes are 6 to 8 letters and digits".to_string(),
            ));
        }

        let record = self
            .retry
            .run_transient("load_code", || async {
                Ok(self
                    .docs
                    .get_as::<ConnectionCode>(collections::CONNECTION_CODES, &code)
                    .await?)
            })
            .await?
            .ok_or_else(|| AppError::NotFound("connection code".to_string()))?;

        if record.is_expired_at(Utc::now()) {
            return Err(AppError::Expired);
        }
        if record.used {
            return Err(AppError::AlreadyUsed);
        }
        Ok(record)
    }

    /// Redeem a code and link the caregiver to the patient's device.
    ///
    /// If linking fails after the code has been consumed, the code stays
    /// consumed and the error is returned.
    pub async fn use_code(&self, raw: &str, caregiver_id: &str) -> Result<ConnectionCode> {
        ensure_caller(self.auth.as_ref(), caregiver_id).await?;
        let mut record = self.validate_code(raw).await?;

        if record.patient_id == caregiver_id {
            return Err(AppError::Validation(
                "You cannot redeem your own connection code".to_string(),
            ));
        }

        let now = Utc::now();
        let patch = json!({
            "used": true,
            "usedBy": caregiver_id,
            "usedAt": now,
        });
        let claimed = self
            .retry
            .run_transient("redeem_code", || async {
                Ok(self
                    .docs
                    .update_if(
                        collections::CONNECTION_CODES,
                        &record.code,
                        &[
                            Filter::eq("used", false),
                            Filter::gte("expiresAt", now.timestamp_millis()),
                        ],
                        patch.clone(),
                    )
                    .await?)
            })
            .await?;
        if !claimed {
            // Re-read so a code that expired between validation and redemption
            // reports Expired rather than AlreadyUsed.
            return match self.validate_code(&record.code).await {
                Err(e) => {
                    tracing::info!(device_id = %record.device_id, error = %e, "Connection code not redeemable");
                    Err(e)
                }
                Ok(_) => Err(AppError::AlreadyUsed),
            };
        }

        record.used = true;
        record.used_by = Some(caregiver_id.to_string());
        record.used_at = Some(now);

        if let Err(e) = self
            .links
            .link_device_to_user(caregiver_id, &record.device_id)
            .await
        {
            tracing::error!(
                device_id = %record.device_id,
                caregiver_id = %caregiver_id,
                error = %e,
                "Code consumed but device link failed"
            );
            return Err(e);
        }

        tracing::info!(
            device_id = %record.device_id,
            patient_id = %record.patient_id,
            caregiver_id = %caregiver_id,
            "Connection code redeemed"
        );
        Ok(record)
    }

    /// Delete an unused code owned by the caller.
    pub async fn revoke_code(&self, raw: &str) -> Result<()> {
        let uid = require_user(self.auth.as_ref()).await?;
        let code = normalize_code(raw);
        if !is_valid_code_format(&code) {
            return Err(AppError::Validation(
                "Connection codes are 6 to 8 letters and digits".to_string(),
            ));
        }

        let record = self
            .retry
            .run_transient("load_code", || async {
                Ok(self
                    .docs
                    .get_as::<ConnectionCode>(collections::CONNECTION_CODES, &code)
                    .await?)
            })
            .await?
            .ok_or_else(|| AppError::NotFound("connection code".to_string()))?;

        if record.patient_id != uid {
            return Err(AppError::Permission(
                "Only the patient who created a code can revoke it".to_string(),
            ));
        }
        if record.used {
            return Err(AppError::AlreadyUsed);
        }

        self.retry
            .run_transient("delete_code", || async {
                Ok(self
                    .docs
                    .delete(collections::CONNECTION_CODES, &code)
                    .await?)
            })
            .await?;

        tracing::info!(device_id = %record.device_id, "Connection code revoked");
        Ok(())
    }

    /// Unused, unexpired codes owned by the caller, newest first.
    pub async fn get_active_codes(&self, patient_id: &str) -> Result<Vec<ConnectionCode>> {
        ensure_caller(self.auth.as_ref(), patient_id).await?;
        let now = Utc::now();

        let mut codes = self.codes_for(patient_id).await?;
        codes.retain(|c| c.is_active_at(now));
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    /// Delete the caller's expired, unused codes. Returns how many were removed.
    pub async fn purge_expired_codes(&self, patient_id: &str) -> Result<usize> {
        ensure_caller(self.auth.as_ref(), patient_id).await?;
        let now = Utc::now();

        let expired: Vec<ConnectionCode> = self
            .codes_for(patient_id)
            .await?
            .into_iter()
            .filter(|c| !c.used && c.is_expired_at(now))
            .collect();

        for code in &expired {
            self.docs
                .delete(collections::CONNECTION_CODES, &code.code)
                .await?;
        }

        if !expired.is_empty() {
            tracing::info!(patient_id = %patient_id, count = expired.len(), "Purged expired codes");
        }
        Ok(expired.len())
    }

    async fn codes_for(&self, patient_id: &str) -> Result<Vec<ConnectionCode>> {
        let filters = [
            Filter::eq("patientId", patient_id),
            Filter::eq("used", false),
        ];
        self.retry
            .run_transient("list_codes", || async {
                Ok(self
                    .docs
                    .query_as::<ConnectionCode>(collections::CONNECTION_CODES, &filters)
                    .await?)
            })
            .await
    }
}
