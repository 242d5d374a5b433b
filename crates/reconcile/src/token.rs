//! OAuth2 credential lifecycle for one installation
//!
//! The credential lives in the document store at `credentials/{installation_id}`.
//! It is created by [`TokenManager::complete_authorization`], replaced on every
//! refresh and never deleted here.
//!
//! Refreshes are not serialized. Two callers that both find the token near
//! expiry will both refresh, and the last write wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{ApiCallError, OAuthProvider, TokenGrant};
use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;
use crate::store::{credential_path, DocumentStore, WriteMode};

/// Refresh tokens expiring sooner than this are logged so someone reconnects
const REFRESH_TOKEN_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expiry: DateTime<Utc>,
    /// QuickBooks company (realm) the credential was granted for
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    fn from_grant(grant: TokenGrant, refresh_token: String, tenant_id: String) -> Self {
        let now = Utc::now();
        Self {
            access_token: grant.access_token,
            refresh_token,
            token_type: grant.token_type,
            expiry: now + seconds(grant.expires_in),
            tenant_id,
            refresh_token_expiry: grant
                .x_refresh_token_expires_in
                .map(|secs| now + seconds(secs)),
            updated_at: now,
        }
    }

    /// Whether the access token is expired or expires within `margin`
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match (self.expiry - now).to_std() {
            Ok(remaining) => remaining <= margin,
            Err(_) => true,
        }
    }
}

/// Provider lifetimes are clamped to ten years so expiry math cannot overflow
fn seconds(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(0, 10 * 365 * 86_400))
}

/// A usable access token and the tenant it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub tenant_id: String,
}

impl From<&CredentialRecord> for AccessToken {
    fn from(credential: &CredentialRecord) -> Self {
        Self {
            token: credential.access_token.clone(),
            tenant_id: credential.tenant_id.clone(),
        }
    }
}

pub struct TokenManager {
    provider: Arc<dyn OAuthProvider>,
    docs: Arc<dyn DocumentStore>,
    installation_id: String,
    refresh_margin: Duration,
    retry: RetryPolicy,
}

impl TokenManager {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        docs: Arc<dyn DocumentStore>,
        installation_id: impl Into<String>,
        refresh_margin: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            docs,
            installation_id: installation_id.into(),
            refresh_margin,
            retry,
        }
    }

    pub fn installation_id(&self) -> &str {
        &self.installation_id
    }

    /// Consent screen URL for the given CSRF state
    pub fn begin_authorization(&self, state: &str) -> ReconcileResult<String> {
        self.provider.authorization_url(state)
    }

    /// Exchange an authorization code and store the resulting credential
    pub async fn complete_authorization(
        &self,
        code: &str,
        tenant_id: &str,
    ) -> ReconcileResult<CredentialRecord> {
        let grant = self
            .retry
            .run("token_exchange", || self.provider.exchange_code(code))
            .await
            .map_err(|e| ReconcileError::AuthExchange(e.to_string()))?;

        let refresh_token = grant.refresh_token.clone().ok_or_else(|| {
            ReconcileError::AuthExchange("token response has no refresh token".to_string())
        })?;

        let credential = CredentialRecord::from_grant(grant, refresh_token, tenant_id.to_string());
        self.persist(&credential).await?;

        tracing::info!(
            installation_id = %self.installation_id,
            tenant_id = %tenant_id,
            expiry = %credential.expiry,
            "QuickBooks connected"
        );

        Ok(credential)
    }

    /// The stored credential, if any
    pub async fn credential(&self) -> ReconcileResult<Option<CredentialRecord>> {
        let path = credential_path(&self.installation_id)?;
        match self.docs.get(&path).await? {
            Some(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| ReconcileError::Decode {
                    path,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn is_connected(&self) -> ReconcileResult<bool> {
        Ok(self.credential().await?.is_some())
    }

    /// An access token good for at least the refresh margin
    pub async fn valid_token(&self) -> ReconcileResult<AccessToken> {
        let credential = self.require_credential().await?;

        if !credential.expires_within(Utc::now(), self.refresh_margin) {
            return Ok(AccessToken::from(&credential));
        }

        tracing::debug!(
            installation_id = %self.installation_id,
            expiry = %credential.expiry,
            "Access token near expiry, refreshing"
        );
        let refreshed = self.refresh(credential).await?;
        Ok(AccessToken::from(&refreshed))
    }

    /// Refresh regardless of expiry, e.g. after the API rejected the token
    pub async fn force_refresh(&self) -> ReconcileResult<AccessToken> {
        let credential = self.require_credential().await?;
        let refreshed = self.refresh(credential).await?;
        Ok(AccessToken::from(&refreshed))
    }

    async fn require_credential(&self) -> ReconcileResult<CredentialRecord> {
        self.credential()
            .await?
            .ok_or_else(|| ReconcileError::NotConnected(self.installation_id.clone()))
    }

    async fn refresh(&self, current: CredentialRecord) -> ReconcileResult<CredentialRecord> {
        let grant = self
            .retry
            .run("token_refresh", || {
                self.provider.refresh(&current.refresh_token)
            })
            .await
            .map_err(|e| match e {
                ApiCallError::InvalidGrant(message) => {
                    tracing::error!(
                        installation_id = %self.installation_id,
                        error = %message,
                        "Refresh token rejected, reconnect required"
                    );
                    ReconcileError::AuthRefresh(format!("refresh token revoked: {}", message))
                }
                other => ReconcileError::AuthRefresh(other.to_string()),
            })?;

        // Intuit may return the same refresh token or omit it entirely
        let refresh_token = grant
            .refresh_token
            .clone()
            .unwrap_or_else(|| current.refresh_token.clone());
        let mut credential = CredentialRecord::from_grant(grant, refresh_token, current.tenant_id);
        if credential.refresh_token_expiry.is_none() {
            credential.refresh_token_expiry = current.refresh_token_expiry;
        }

        if let Some(expiry) = credential.refresh_token_expiry {
            let days_left = (expiry - credential.updated_at).num_days();
            if days_left < REFRESH_TOKEN_WARNING_DAYS {
                tracing::warn!(
                    installation_id = %self.installation_id,
                    days_left = days_left,
                    "QuickBooks refresh token expires soon, reconnect to renew it"
                );
            }
        }

        self.persist(&credential).await?;
        tracing::info!(
            installation_id = %self.installation_id,
            expiry = %credential.expiry,
            "Access token refreshed"
        );

        Ok(credential)
    }

    async fn persist(&self, credential: &CredentialRecord) -> ReconcileResult<()> {
        let path = credential_path(&self.installation_id)?;
        let data = serde_json::to_value(credential).map_err(|e| ReconcileError::Decode {
            path: path.clone(),
            message: format!("failed to encode: {}", e),
        })?;

        self.docs.set(&path, data, WriteMode::Merge).await
    }
}
