//! Reconciliation error types

use thiserror::Error;

/// Errors raised by the reconciliation engine
///
/// Credential lifecycle failures (`AuthExchange`, `AuthRefresh`, `NotConnected`)
/// are fatal to the single operation that needed a token. Everything else is
/// recovered per entity by the webhook dispatcher.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Authorization code exchange failed: {0}")]
    AuthExchange(String),

    #[error("Token refresh failed: {0}")]
    AuthRefresh(String),

    #[error("QuickBooks is not connected for installation {0}")]
    NotConnected(String),

    #[error("Failed to fetch {entity} {id}: {message}")]
    Fetch {
        entity: &'static str,
        id: String,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Failed to decode document at {path}: {message}")]
    Decode { path: String, message: String },

    #[error("Aggregate recompute failed for customer {customer_ref}: {message}")]
    Recalc {
        customer_ref: String,
        message: String,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Whether the error comes from the credential lifecycle
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ReconcileError::AuthExchange(_)
                | ReconcileError::AuthRefresh(_)
                | ReconcileError::NotConnected(_)
        )
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Store(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for ReconcileError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        ReconcileError::Store(format!("migration failed: {}", err))
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
