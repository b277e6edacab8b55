// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Connection code model and code-format rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters used for generated codes. Excludes 0/O, 1/I and L, which are
/// easy to confuse when read aloud or typed.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Length of generated codes.
pub const CODE_LENGTH: usize = 6;

/// Accepted code lengths on input (older clients issued longer codes).
pub const MIN_CODE_LENGTH: usize = 6;
pub const MAX_CODE_LENGTH: usize = 8;

/// Longest allowed code lifetime (one week).
pub const MAX_EXPIRY_HOURS: u32 = 168;

/// Single-use pairing token stored at `connectionCodes/{code}`.
///
/// `expiresAt` is stored as epoch milliseconds so redemption can compare it
/// inside the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCode {
    pub code: String,
    pub device_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
}

impl ConnectionCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Unused and not expired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired_at(now)
    }
}

/// Trim and upper-case user input.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// 6-8 upper-case ASCII letters or digits.
pub fn is_valid_code_format(code: &str) -> bool {
    (MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&code.len())
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}
