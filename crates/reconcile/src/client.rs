//! QuickBooks Online HTTP client
//!
//! Two seams: [`OAuthProvider`] for the token endpoint and [`AccountingApi`]
//! for entity reads. [`QuickBooksClient`] implements both over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{QuickBooksConfig, QBO_ACCOUNTING_SCOPE};
use crate::error::{ReconcileError, ReconcileResult};
use crate::records::EntityKind;
use crate::retry::Retryable;

pub const USER_AGENT: &str = concat!("ledgerlink/", env!("CARGO_PKG_VERSION"));

/// QBO API minor version pinned for entity reads
const QBO_MINOR_VERSION: &str = "65";

/// Failure of a single call to QuickBooks
#[derive(Debug, Error)]
pub enum ApiCallError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The authorization code or refresh token was rejected
    #[error("grant rejected: {0}")]
    InvalidGrant(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiCallError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiCallError::Status { status: 401, .. })
    }
}

impl Retryable for ApiCallError {
    fn is_retryable(&self) -> bool {
        match self {
            ApiCallError::Transport(_) => true,
            ApiCallError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiCallError::InvalidGrant(_) | ApiCallError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiCallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiCallError::Decode(err.to_string())
        } else {
            ApiCallError::Transport(err.to_string())
        }
    }
}

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the provider keeps the previous refresh token valid
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub x_refresh_token_expires_in: Option<i64>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// OAuth2 authorization-code flow against the accounting provider
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Consent screen URL carrying the given CSRF state
    fn authorization_url(&self, state: &str) -> ReconcileResult<String>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ApiCallError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiCallError>;
}

/// Entity reads against the accounting API
#[async_trait]
pub trait AccountingApi: Send + Sync {
    /// Current state of one entity, unwrapped from the response envelope
    async fn get_entity(
        &self,
        access_token: &str,
        tenant_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Value, ApiCallError>;
}

#[derive(Clone)]
pub struct QuickBooksClient {
    http: reqwest::Client,
    config: QuickBooksConfig,
}

impl QuickBooksClient {
    pub fn new(config: QuickBooksConfig, timeout: Duration) -> ReconcileResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ReconcileError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &QuickBooksConfig {
        &self.config
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, ApiCallError> {
        let resp = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 200 {
            return resp
                .json::<TokenGrant>()
                .await
                .map_err(|e| ApiCallError::Decode(format!("token response: {}", e)));
        }

        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let message = extract_error(&body, status);
        if status == 400 && body["error"].as_str() == Some("invalid_grant") {
            return Err(ApiCallError::InvalidGrant(message));
        }

        Err(ApiCallError::Status { status, message })
    }
}

#[async_trait]
impl OAuthProvider for QuickBooksClient {
    fn authorization_url(&self, state: &str) -> ReconcileResult<String> {
        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("scope", QBO_ACCOUNTING_SCOPE),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| ReconcileError::Config(format!("invalid authorize URL: {}", e)))?;

        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ApiCallError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiCallError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

#[async_trait]
impl AccountingApi for QuickBooksClient {
    async fn get_entity(
        &self,
        access_token: &str,
        tenant_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Value, ApiCallError> {
        let url = format!(
            "{}/v3/company/{}/{}/{}",
            self.config.api_base,
            tenant_id,
            kind.api_segment(),
            id
        );

        let resp = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .header("Accept", "application/json")
            .query(&[("minorversion", QBO_MINOR_VERSION)])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            return Err(ApiCallError::Status {
                status,
                message: extract_error(&body, status),
            });
        }

        let mut body: Value = resp.json().await?;
        match body.get_mut(kind.response_key()).map(Value::take) {
            Some(entity) if entity.is_object() => Ok(entity),
            _ => Err(ApiCallError::Decode(format!(
                "response has no {} object",
                kind.response_key()
            ))),
        }
    }
}

/// QBO errors come in a Fault structure; OAuth errors use error/error_description
fn extract_error(body: &Value, status: u16) -> String {
    body["Fault"]["Error"][0]["Detail"]
        .as_str()
        .or_else(|| body["Fault"]["Error"][0]["Message"].as_str())
        .or_else(|| body["error_description"].as_str())
        .or_else(|| body["error"].as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
