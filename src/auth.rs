// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Caller identity.
//!
//! Services never trust a user id passed by the caller; they re-derive the
//! signed-in account from an [`AuthProvider`] and compare.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (account uid)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    pub iat: usize,
}

/// Source of the authenticated identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user_id(&self) -> Option<String>;
}

/// Identity of the account this agent runs for.
#[derive(Debug, Default)]
pub struct SessionAuth {
    uid: RwLock<Option<String>>,
}

impl SessionAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(uid: &str) -> Self {
        let auth = Self::new();
        auth.sign_in(uid);
        auth
    }

    /// Sign in from a session JWT.
    pub fn from_token(token: &str, signing_key: &[u8]) -> Result<Self> {
        let claims = verify_jwt(token, signing_key)?;
        Ok(Self::signed_in(&claims.sub))
    }

    pub fn sign_in(&self, uid: &str) {
        *self.uid.write().unwrap_or_else(|e| e.into_inner()) = Some(uid.to_string());
    }

    pub fn sign_out(&self) {
        *self.uid.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn uid(&self) -> Option<String> {
        self.uid.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AuthProvider for SessionAuth {
    async fn current_user_id(&self) -> Option<String> {
        self.uid()
    }
}

/// Check that the signed-in account is `claimed` and return its uid.
pub async fn ensure_caller(auth: &dyn AuthProvider, claimed: &str) -> Result<String> {
    let uid = auth
        .current_user_id()
        .await
        .ok_or(AppError::Unauthenticated)?;

    if uid != claimed {
        tracing::warn!(caller = %uid, claimed = %claimed, "Caller identity mismatch");
        return Err(AppError::Permission(
            "Signed-in account does not match the requested user".to_string(),
        ));
    }
    Ok(uid)
}

/// Signed-in uid, or `Unauthenticated`.
pub async fn require_user(auth: &dyn AuthProvider) -> Result<String> {
    auth.current_user_id()
        .await
        .ok_or(AppError::Unauthenticated)
}

/// Verify an HS256 session token.
pub fn verify_jwt(token: &str, signing_key: &[u8]) -> Result<Claims> {
    let key = DecodingKey::from_secret(signing_key);
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(error = %e, "Session token rejected");
            AppError::Unauthenticated
        })
}

/// Create a JWT for a user session.
pub fn create_jwt(uid: &str, signing_key: &[u8]) -> anyhow::Result<String> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as usize;

    let claims = Claims {
        sub: uid.to_string(),
        iat: now,
        exp: now + 30 * 24 * 60 * 60, // 30 days
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(signing_key),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test_jwt_key_32_bytes_minimum!!";

    #[tokio::test]
    async fn ensure_caller_checks_identity() {
        let auth = SessionAuth::signed_in("P1");
        assert_eq!(ensure_caller(&auth, "P1").await.unwrap(), "P1");
        assert!(matches!(
            ensure_caller(&auth, "C1").await,
            Err(AppError::Permission(_))
        ));

        auth.sign_out();
        assert!(matches!(
            ensure_caller(&auth, "P1").await,
            Err(AppError::Unauthenticated)
        ));
    }

    #[test]
    fn session_from_token_round_trip() {
        let token = create_jwt("C1", KEY).unwrap();
        let auth = SessionAuth::from_token(&token, KEY).unwrap();
        assert_eq!(auth.uid().as_deref(), Some("C1"));
    }

    #[test]
    fn token_with_wrong_key_is_rejected() {
        let token = create_jwt("C1", KEY).unwrap();
        assert!(matches!(
            SessionAuth::from_token(&token, b"another_key_of_sufficient_len!!"),
            Err(AppError::Unauthenticated)
        ));
    }
}
