//! Engine configuration loaded from environment variables

use std::str::FromStr;
use std::time::Duration;

use crate::error::{ReconcileError, ReconcileResult};
use crate::retry::RetryPolicy;

pub const QBO_PRODUCTION_API_BASE: &str = "https://quickbooks.api.intuit.com";
pub const QBO_SANDBOX_API_BASE: &str = "https://sandbox-quickbooks.api.intuit.com";
pub const QBO_TOKEN_URL: &str = "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer";
pub const QBO_AUTHORIZE_URL: &str = "https://appcenter.intuit.com/connect/oauth2";
pub const QBO_ACCOUNTING_SCOPE: &str = "com.intuit.quickbooks.accounting";

/// Default name of the invoice custom field carrying purchased hours
pub const DEFAULT_HOURS_FIELD: &str = "Hours Purchased";

/// Which QuickBooks environment the app is registered against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QboEnvironment {
    Sandbox,
    Production,
}

impl FromStr for QboEnvironment {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "development" => Ok(QboEnvironment::Sandbox),
            "production" | "prod" => Ok(QboEnvironment::Production),
            other => Err(ReconcileError::Config(format!(
                "QBO_ENVIRONMENT must be 'sandbox' or 'production', got '{}'",
                other
            ))),
        }
    }
}

/// OAuth app registration and endpoint URLs
#[derive(Debug, Clone)]
pub struct QuickBooksConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub environment: QboEnvironment,
    pub api_base: String,
    pub token_url: String,
    pub authorize_url: String,
}

impl QuickBooksConfig {
    pub fn from_env() -> ReconcileResult<Self> {
        let environment: QboEnvironment = env_parse("QBO_ENVIRONMENT", QboEnvironment::Sandbox)?;
        let default_base = match environment {
            QboEnvironment::Sandbox => QBO_SANDBOX_API_BASE,
            QboEnvironment::Production => QBO_PRODUCTION_API_BASE,
        };

        Ok(Self {
            client_id: env_required("QBO_CLIENT_ID")?,
            client_secret: env_required("QBO_CLIENT_SECRET")?,
            redirect_uri: env_required("QBO_REDIRECT_URI")?,
            environment,
            api_base: env_or("QBO_API_BASE", default_base),
            token_url: env_or("QBO_TOKEN_URL", QBO_TOKEN_URL),
            authorize_url: env_or("QBO_AUTHORIZE_URL", QBO_AUTHORIZE_URL),
        })
    }

    /// Config pointing every endpoint at one base URL (used with mock servers)
    pub fn with_base_url(client_id: &str, client_secret: &str, base_url: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: format!("{}/quickbooks/callback", base_url),
            environment: QboEnvironment::Sandbox,
            api_base: base_url.to_string(),
            token_url: format!("{}/oauth2/v1/tokens/bearer", base_url),
            authorize_url: format!("{}/connect/oauth2", base_url),
        }
    }
}

/// Everything the reconciliation engine needs at construction time
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub quickbooks: QuickBooksConfig,
    /// Key of the credential document for this installation
    pub installation_id: String,
    /// Tenant written by the repair pass into invoices missing one
    pub default_tenant_id: Option<String>,
    pub hours_field: String,
    pub webhook_verifier_token: Option<String>,
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub entity_timeout: Duration,
    pub refresh_margin: Duration,
}

impl ReconcileConfig {
    pub fn from_env() -> ReconcileResult<Self> {
        let retry = RetryPolicy::new(
            env_parse("RETRY_MAX_ATTEMPTS", 3u32)?,
            Duration::from_millis(env_parse("RETRY_BASE_DELAY_MS", 200u64)?),
            env_parse("RETRY_MULTIPLIER", 2u32)?,
        );

        Ok(Self {
            quickbooks: QuickBooksConfig::from_env()?,
            installation_id: env_or("LEDGERLINK_INSTALLATION_ID", "default"),
            default_tenant_id: env_optional("DEFAULT_TENANT_ID"),
            hours_field: env_or("QBO_HOURS_FIELD", DEFAULT_HOURS_FIELD),
            webhook_verifier_token: env_optional("QBO_WEBHOOK_VERIFIER_TOKEN"),
            retry,
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 30u64)?),
            entity_timeout: Duration::from_secs(env_parse("ENTITY_TIMEOUT_SECS", 20u64)?),
            refresh_margin: Duration::from_secs(env_parse("TOKEN_REFRESH_MARGIN_SECS", 300u64)?),
        })
    }

    /// Defaults around a given QuickBooks config, with no environment lookups
    pub fn new(quickbooks: QuickBooksConfig) -> Self {
        Self {
            quickbooks,
            installation_id: "default".to_string(),
            default_tenant_id: None,
            hours_field: DEFAULT_HOURS_FIELD.to_string(),
            webhook_verifier_token: None,
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
            entity_timeout: Duration::from_secs(20),
            refresh_margin: Duration::from_secs(300),
        }
    }
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

fn env_required(key: &str) -> ReconcileResult<String> {
    env_optional(key).ok_or_else(|| ReconcileError::Config(format!("{} must be set", key)))
}

fn env_parse<T>(key: &str, default: T) -> ReconcileResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| ReconcileError::Config(format!("{} is invalid ({}): {}", key, raw, e))),
        None => Ok(default),
    }
}
