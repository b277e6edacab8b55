//! User profile model.

use serde::{Deserialize, Serialize};

/// Account role. Also the role recorded on a device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Caregiver,
}

/// User profile stored at `users/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    pub role: Role,
    /// Push token registered by the user's phone, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}
