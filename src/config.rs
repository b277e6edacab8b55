//! Sync agent configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which document store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Firestore,
    /// In-process stores; nothing survives a restart except the queue file.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(ConfigError::Invalid("STORE_BACKEND", s.to_string())),
        }
    }
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    // --- Stores ---
    /// GCP project ID
    pub gcp_project_id: String,
    pub store_backend: StoreBackend,
    /// Base URL of the realtime tree (REST protocol)
    pub realtime_db_url: Option<String>,
    pub realtime_auth_token: Option<String>,

    // --- Session ---
    /// Session JWT identifying the signed-in account
    pub session_token: Option<String>,
    /// JWT signing key for session tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,

    // --- Agent ---
    /// Local status API port
    pub port: u16,
    /// Durable queue file. `None` keeps the queue in memory only.
    pub queue_path: Option<PathBuf>,
    /// Push gateway URL. `None` logs notifications instead of sending them.
    pub push_endpoint: Option<String>,
    pub retry_base_delay: Duration,
    pub queue_max_attempts: u32,
    pub poll_interval: Duration,
    pub run_link_mirror: bool,
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let store_backend: StoreBackend = optional("STORE_BACKEND")
            .unwrap_or_else(|| "firestore".to_string())
            .parse()?;

        let realtime_db_url = optional("REALTIME_DB_URL");
        if realtime_db_url.is_none() && store_backend != StoreBackend::Memory {
            return Err(ConfigError::Missing("REALTIME_DB_URL"));
        }

        Ok(Self {
            gcp_project_id: env::var("GCP_PROJECT_ID").unwrap_or_else(|_| "local-dev".to_string()),
            store_backend,
            realtime_db_url,
            realtime_auth_token: optional("REALTIME_AUTH_TOKEN"),
            session_token: Some(
                optional("SESSION_TOKEN").ok_or(ConfigError::Missing("SESSION_TOKEN"))?,
            ),
            jwt_signing_key: env::var("JWT_SIGNING_KEY")
                .map_err(|_| ConfigError::Missing("JWT_SIGNING_KEY"))?
                .into_bytes(),
            port: parse_or("PORT", 8787)?,
            queue_path: Some(PathBuf::from(
                optional("QUEUE_PATH").unwrap_or_else(|| "data/sync-queue.json".to_string()),
            )),
            push_endpoint: optional("PUSH_ENDPOINT"),
            retry_base_delay: Duration::from_millis(parse_or("RETRY_BASE_DELAY_MS", 500)?),
            queue_max_attempts: parse_or("QUEUE_MAX_ATTEMPTS", 5)?,
            poll_interval: Duration::from_secs(parse_or("POLL_INTERVAL_SECS", 5)?),
            run_link_mirror: parse_or("RUN_LINK_MIRROR", false)?,
        })
    }

    /// Deterministic config for tests: in-memory stores, 1 ms retry delay, no
    /// queue file.
    pub fn test_default() -> Self {
        Self {
            gcp_project_id: "test-project".to_string(),
            store_backend: StoreBackend::Memory,
            realtime_db_url: None,
            realtime_auth_token: None,
            session_token: None,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            port: 8787,
            queue_path: None,
            push_endpoint: None,
            retry_base_delay: Duration::from_millis(1),
            queue_max_attempts: 5,
            poll_interval: Duration::from_millis(20),
            run_link_mirror: false,
        }
    }
}

/// Non-empty, trimmed environment variable.
fn optional(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name, raw)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
