//! Single-use OAuth CSRF state
//!
//! `connect` issues a random state and the callback consumes it. A state can be
//! consumed once, and only before it expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

const REDIS_KEY_PREFIX: &str = "oauth_state:";

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Random 256-bit state, hex encoded
pub fn generate_state() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[async_trait]
pub trait AuthStateStore: Send + Sync {
    /// Remember `state` for `ttl`
    async fn issue(&self, state: &str, ttl: Duration) -> Result<(), StateStoreError>;

    /// Remove `state`, returning whether it was live
    async fn consume(&self, state: &str) -> Result<bool, StateStoreError>;
}

/// Process-local store for single-instance deployments and tests
#[derive(Default)]
pub struct MemoryAuthStateStore {
    states: Mutex<HashMap<String, Instant>>,
}

impl MemoryAuthStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStateStore for MemoryAuthStateStore {
    async fn issue(&self, state: &str, ttl: Duration) -> Result<(), StateStoreError> {
        let now = Instant::now();
        let mut states = self.states.lock().await;
        states.retain(|_, expires_at| *expires_at > now);
        states.insert(state.to_string(), now + ttl);
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<bool, StateStoreError> {
        let mut states = self.states.lock().await;
        Ok(states
            .remove(state)
            .is_some_and(|expires_at| expires_at > Instant::now()))
    }
}

/// Shared store so any API instance can finish a flow another one started
#[derive(Clone)]
pub struct RedisAuthStateStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisAuthStateStore {
    pub async fn connect(url: &str) -> Result<Self, StateStoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    fn key(state: &str) -> String {
        format!("{}{}", REDIS_KEY_PREFIX, state)
    }
}

#[async_trait]
impl AuthStateStore for RedisAuthStateStore {
    async fn issue(&self, state: &str, ttl: Duration) -> Result<(), StateStoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::key(state), "1", ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn consume(&self, state: &str) -> Result<bool, StateStoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get_del(Self::key(state)).await?;
        Ok(value.is_some())
    }
}
