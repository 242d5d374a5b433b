//! Scheduled maintenance against the reconciliation engine
//!
//! Each job logs its own failures and returns; a failed run is retried by
//! the next tick of its schedule.

use ledgerlink_reconcile::{ReconcileError, ReconcileService};
use tracing::{debug, error, info, warn};

/// Refresh the access token ahead of expiry so webhook handling rarely has to
pub async fn keep_token_alive(service: &ReconcileService) {
    match service.tokens.valid_token().await {
        Ok(token) => debug!(tenant_id = %token.tenant_id, "Access token is valid"),
        Err(ReconcileError::NotConnected(installation_id)) => {
            debug!(installation_id = %installation_id, "QuickBooks not connected, skipping token refresh")
        }
        Err(e) => error!(error = %e, "Scheduled token refresh failed"),
    }
}

/// Stamp the default tenant onto invoices stored without one
pub async fn repair_tenants(service: &ReconcileService) {
    if service.config.default_tenant_id.is_none() {
        debug!("DEFAULT_TENANT_ID not set, skipping tenant repair");
        return;
    }

    match service.repair_all().await {
        Ok(report) if report.failures.is_empty() => {
            info!(repaired = report.invoices_repaired, "Tenant repair complete")
        }
        Ok(report) => warn!(
            repaired = report.invoices_repaired,
            failures = ?report.failures,
            "Tenant repair finished with failures"
        ),
        Err(e) => error!(error = %e, "Tenant repair failed"),
    }
}

/// Rewrite every customer aggregate from its stored invoices
pub async fn sweep_aggregates(service: &ReconcileService) {
    match service.recompute_all().await {
        Ok(report) if report.failures.is_empty() => {
            info!(recomputed = report.recomputed, "Aggregate sweep complete")
        }
        Ok(report) => warn!(
            recomputed = report.recomputed,
            failures = ?report.failures,
            "Aggregate sweep finished with failures"
        ),
        Err(e) => error!(error = %e, "Aggregate sweep failed"),
    }
}

/// Compare stored aggregates with their invoices without writing anything
///
/// Returns the number of customers whose aggregate has drifted.
pub async fn audit_aggregates(service: &ReconcileService) -> usize {
    let customers = match service.records.list_customers().await {
        Ok(customers) => customers,
        Err(e) => {
            error!(error = %e, "Aggregate audit could not list customers");
            return 0;
        }
    };

    let mut drifted = 0;
    for customer_ref in &customers {
        match service.recalculator.verify(customer_ref).await {
            Ok(check) if check.is_consistent() => {}
            Ok(check) => {
                drifted += 1;
                warn!(
                    customer_ref = %customer_ref,
                    violations = ?check.violations,
                    "Aggregate drift detected"
                );
            }
            Err(e) => error!(customer_ref = %customer_ref, error = %e, "Aggregate audit failed"),
        }
    }

    info!(customers = customers.len(), drifted = drifted, "Aggregate audit complete");
    drifted
}
