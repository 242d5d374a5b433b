//! API server configuration

use std::time::Duration;

use crate::error::{ApiError, ApiResult};

/// Server settings; engine settings live in `ReconcileConfig`
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres document store; in-memory when unset
    pub database_url: Option<String>,
    /// CSRF state store; in-memory when unset
    pub redis_url: Option<String>,
    pub oauth_state_ttl: Duration,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> ApiResult<Self> {
        let oauth_state_ttl = match optional("OAUTH_STATE_TTL_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                ApiError::Config(format!("OAUTH_STATE_TTL_SECS must be seconds: {}", e))
            })?,
            None => 600,
        };

        Ok(Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            oauth_state_ttl: Duration::from_secs(oauth_state_ttl),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            database_url: None,
            redis_url: None,
            oauth_state_ttl: Duration::from_secs(600),
            allowed_origins: Vec::new(),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
