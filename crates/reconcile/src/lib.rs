// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! LedgerLink Reconciliation Engine
//!
//! Keeps a local document store consistent with QuickBooks Online, driven by
//! QuickBooks webhooks.
//!
//! ## Components
//!
//! - **TokenManager**: OAuth2 credential for the installation, refreshed on demand
//! - **EntityFetcher**: canonical invoice, payment and credit memo reads
//! - **RecordStore**: typed snapshots scoped by customer
//! - **AggregateRecalculator**: per-customer balance and hours totals, plus the
//!   separate tenant repair pass
//! - **WebhookDispatcher**: applies change notifications and recomputes each
//!   touched customer once per delivery

pub mod aggregate;
pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod records;
pub mod retry;
pub mod store;
pub mod token;
pub mod webhooks;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use serde::Serialize;

// Aggregates
pub use aggregate::{AggregateCheck, AggregateRecalculator};

// Client
pub use client::{AccountingApi, ApiCallError, OAuthProvider, QuickBooksClient, TokenGrant};

// Config
pub use config::{QboEnvironment, QuickBooksConfig, ReconcileConfig};

// Error
pub use error::{ReconcileError, ReconcileResult};

// Fetcher
pub use fetcher::EntityFetcher;

// Records
pub use records::{
    CreditMemoRecord, CustomerAggregate, EntityKind, InvoiceRecord, LineApplication,
    PaymentRecord,
};

// Retry
pub use retry::{RetryPolicy, Retryable};

// Store
pub use store::{
    create_pool, run_migrations, DocumentStore, MemoryDocumentStore, PgDocumentStore,
    RecordStore, WriteMode,
};

// Tokens
pub use token::{AccessToken, CredentialRecord, TokenManager};

// Webhooks
pub use webhooks::{
    verify_signature, BatchReport, WebhookDispatcher, WebhookPayload, SIGNATURE_HEADER,
};

/// Result of a maintenance sweep over every stored customer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub customers: usize,
    pub invoices_repaired: usize,
    pub recomputed: usize,
    pub failures: Vec<String>,
}

/// Main reconciliation service that wires the engine together
pub struct ReconcileService {
    pub config: ReconcileConfig,
    pub tokens: Arc<TokenManager>,
    pub fetcher: Arc<EntityFetcher>,
    pub records: RecordStore,
    pub recalculator: AggregateRecalculator,
    pub dispatcher: WebhookDispatcher,
}

impl ReconcileService {
    /// Create the service from environment variables
    pub fn from_env(docs: Arc<dyn DocumentStore>) -> ReconcileResult<Self> {
        Self::new(ReconcileConfig::from_env()?, docs)
    }

    /// Create the service with explicit config, talking to QuickBooks over HTTP
    pub fn new(config: ReconcileConfig, docs: Arc<dyn DocumentStore>) -> ReconcileResult<Self> {
        let client = Arc::new(QuickBooksClient::new(
            config.quickbooks.clone(),
            config.http_timeout,
        )?);

        Ok(Self::with_clients(config, docs, client.clone(), client))
    }

    /// Create the service around any OAuth provider and accounting API
    pub fn with_clients(
        config: ReconcileConfig,
        docs: Arc<dyn DocumentStore>,
        oauth: Arc<dyn OAuthProvider>,
        api: Arc<dyn AccountingApi>,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(
            oauth,
            docs.clone(),
            config.installation_id.clone(),
            config.refresh_margin,
            config.retry,
        ));
        let fetcher = Arc::new(EntityFetcher::new(
            api,
            tokens.clone(),
            config.retry,
            config.hours_field.clone(),
        ));
        let records = RecordStore::new(docs);
        let recalculator =
            AggregateRecalculator::new(records.clone(), config.default_tenant_id.clone());
        let dispatcher = WebhookDispatcher::new(
            fetcher.clone(),
            records.clone(),
            recalculator.clone(),
            config.entity_timeout,
        );

        Self {
            config,
            tokens,
            fetcher,
            records,
            recalculator,
            dispatcher,
        }
    }

    /// Run the tenant repair pass for every stored customer
    pub async fn repair_all(&self) -> ReconcileResult<MaintenanceReport> {
        let customers = self.records.list_customers().await?;
        let mut report = MaintenanceReport {
            customers: customers.len(),
            ..Default::default()
        };

        for customer_ref in customers {
            match self.recalculator.repair_missing_tenants(&customer_ref).await {
                Ok(repaired) => report.invoices_repaired += repaired,
                Err(e) => {
                    tracing::error!(customer_ref = %customer_ref, error = %e, "Tenant repair failed");
                    report.failures.push(customer_ref);
                }
            }
        }

        tracing::info!(
            customers = report.customers,
            repaired = report.invoices_repaired,
            failures = report.failures.len(),
            "Tenant repair pass complete"
        );
        Ok(report)
    }

    /// Recompute the aggregate of every stored customer
    pub async fn recompute_all(&self) -> ReconcileResult<MaintenanceReport> {
        let customers = self.records.list_customers().await?;
        let mut report = MaintenanceReport {
            customers: customers.len(),
            ..Default::default()
        };

        for customer_ref in customers {
            match self.recalculator.recompute(&customer_ref).await {
                Ok(_) => report.recomputed += 1,
                Err(e) => {
                    tracing::error!(customer_ref = %customer_ref, error = %e, "Aggregate recompute failed");
                    report.failures.push(customer_ref);
                }
            }
        }

        tracing::info!(
            customers = report.customers,
            recomputed = report.recomputed,
            failures = report.failures.len(),
            "Aggregate sweep complete"
        );
        Ok(report)
    }
}
