//! Per-customer aggregate maintenance
//!
//! Aggregates are always derived from the full set of stored invoices and
//! written whole. Nothing here increments a running total, so a recompute can
//! be repeated or raced without drifting.

use serde::Serialize;

use crate::error::{ReconcileError, ReconcileResult};
use crate::records::CustomerAggregate;
use crate::store::RecordStore;

/// Comparison of a stored aggregate with a fresh derivation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateCheck {
    pub customer_ref: String,
    pub stored: Option<CustomerAggregate>,
    pub derived: CustomerAggregate,
    pub violations: Vec<String>,
}

impl AggregateCheck {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Clone)]
pub struct AggregateRecalculator {
    records: RecordStore,
    default_tenant_id: Option<String>,
}

impl AggregateRecalculator {
    pub fn new(records: RecordStore, default_tenant_id: Option<String>) -> Self {
        Self {
            records,
            default_tenant_id,
        }
    }

    /// Rebuild the customer's aggregate from its invoices
    ///
    /// Reads invoices, writes only the aggregate document.
    pub async fn recompute(&self, customer_ref: &str) -> ReconcileResult<CustomerAggregate> {
        let invoices = self
            .records
            .list_invoices(customer_ref)
            .await
            .map_err(|e| recalc_error(customer_ref, e))?;

        let aggregate = CustomerAggregate::from_invoices(customer_ref, &invoices);
        self.records
            .put_aggregate(&aggregate)
            .await
            .map_err(|e| recalc_error(customer_ref, e))?;

        tracing::info!(
            customer_ref = %customer_ref,
            total_balance_cents = aggregate.total_balance_cents,
            total_hours = aggregate.total_hours,
            invoice_count = aggregate.invoice_count,
            "Customer aggregate recomputed"
        );

        Ok(aggregate)
    }

    /// Backfill the default tenant into invoices stored without one
    ///
    /// Returns how many invoices were rewritten. Without a configured default
    /// tenant nothing is written.
    pub async fn repair_missing_tenants(&self, customer_ref: &str) -> ReconcileResult<usize> {
        let Some(default_tenant) = self.default_tenant_id.as_deref() else {
            tracing::debug!(
                customer_ref = %customer_ref,
                "No default tenant configured, skipping tenant repair"
            );
            return Ok(0);
        };

        let mut repaired = 0;
        for mut invoice in self.records.list_invoices(customer_ref).await? {
            if invoice.tenant_id.is_some() {
                continue;
            }
            invoice.tenant_id = Some(default_tenant.to_string());
            self.records.upsert(customer_ref, &invoice).await?;
            repaired += 1;
        }

        if repaired > 0 {
            tracing::info!(
                customer_ref = %customer_ref,
                repaired = repaired,
                tenant_id = %default_tenant,
                "Backfilled missing invoice tenants"
            );
        }

        Ok(repaired)
    }

    /// Report drift between the stored aggregate and its invoices without writing
    pub async fn verify(&self, customer_ref: &str) -> ReconcileResult<AggregateCheck> {
        let invoices = self.records.list_invoices(customer_ref).await?;
        let derived = CustomerAggregate::from_invoices(customer_ref, &invoices);
        let stored = self.records.get_aggregate(customer_ref).await?;

        let mut violations = Vec::new();
        match &stored {
            None if derived.invoice_count > 0 => {
                violations.push(format!(
                    "no aggregate stored for {} invoices",
                    derived.invoice_count
                ));
            }
            None => {}
            Some(stored) => {
                if stored.total_balance_cents != derived.total_balance_cents {
                    violations.push(format!(
                        "total_balance_cents is {} but invoices sum to {}",
                        stored.total_balance_cents, derived.total_balance_cents
                    ));
                }
                if (stored.total_hours - derived.total_hours).abs() > 1e-9 {
                    violations.push(format!(
                        "total_hours is {} but invoices sum to {}",
                        stored.total_hours, derived.total_hours
                    ));
                }
                if stored.invoice_count != derived.invoice_count {
                    violations.push(format!(
                        "invoice_count is {} but {} invoices are stored",
                        stored.invoice_count, derived.invoice_count
                    ));
                }
            }
        }

        if !violations.is_empty() {
            tracing::warn!(
                customer_ref = %customer_ref,
                violations = ?violations,
                "Customer aggregate drifted from invoices"
            );
        }

        Ok(AggregateCheck {
            customer_ref: customer_ref.to_string(),
            stored,
            derived,
            violations,
        })
    }
}

fn recalc_error(customer_ref: &str, err: ReconcileError) -> ReconcileError {
    ReconcileError::Recalc {
        customer_ref: customer_ref.to_string(),
        message: err.to_string(),
    }
}
