//! QuickBooks webhook handling
//!
//! A delivery carries change notifications for one or more companies. Each
//! entity is applied sequentially: fetch the canonical state, write it under
//! the owning customer, remember that customer. Once the batch is done every
//! touched customer's aggregate is recomputed exactly once.
//!
//! Per-entity failures are logged and counted, never returned. QuickBooks
//! retries deliveries that do not get a 200, and a retry of a batch that
//! partly failed converges because every step is an overwrite.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::aggregate::AggregateRecalculator;
use crate::error::{ReconcileError, ReconcileResult};
use crate::fetcher::EntityFetcher;
use crate::records::EntityKind;
use crate::store::RecordStore;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "intuit-signature";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub event_notifications: Vec<EventNotification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub realm_id: String,
    #[serde(default)]
    pub data_change_event: Option<DataChangeEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataChangeEvent {
    #[serde(default)]
    pub entities: Vec<EntityNotification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityNotification {
    pub name: String,
    pub id: String,
    pub operation: String,
    #[serde(default)]
    pub last_updated_time: Option<String>,
}

impl WebhookPayload {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn entity_count(&self) -> usize {
        self.event_notifications
            .iter()
            .filter_map(|n| n.data_change_event.as_ref())
            .map(|change| change.entities.len())
            .sum()
    }
}

/// Check a base64 HMAC-SHA256 signature of the raw body
pub fn verify_signature(body: &[u8], signature: &str, verifier_token: &str) -> bool {
    let Ok(provided) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(verifier_token.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.as_slice().ct_eq(provided.as_slice()).into()
}

/// Signature for a body, as QuickBooks would send it
pub fn sign_payload(body: &[u8], verifier_token: &str) -> ReconcileResult<String> {
    let mut mac = HmacSha256::new_from_slice(verifier_token.as_bytes())
        .map_err(|e| ReconcileError::Config(format!("invalid verifier token: {}", e)))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// What a notification asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Delete,
    Upsert,
}

impl OperationClass {
    pub fn classify(operation: &str) -> Self {
        const DELETE_LIKE: [&str; 4] = ["delete", "remove", "deleted", "removed"];
        if DELETE_LIKE
            .iter()
            .any(|op| operation.trim().eq_ignore_ascii_case(op))
        {
            OperationClass::Delete
        } else {
            OperationClass::Upsert
        }
    }
}

/// Entity kinds the engine handles; anything else is ignored
pub fn classify_entity(name: &str) -> Option<EntityKind> {
    [EntityKind::Invoice, EntityKind::Payment, EntityKind::CreditMemo]
        .into_iter()
        .find(|kind| name.trim().eq_ignore_ascii_case(kind.response_key()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied,
    Ignored,
    /// Nothing sensible to write, e.g. no local customer scope
    Skipped,
}

/// Counts for one delivery
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub entities_seen: usize,
    pub applied: usize,
    pub ignored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub customers_recomputed: Vec<String>,
    pub recompute_failures: Vec<String>,
}

pub struct WebhookDispatcher {
    fetcher: Arc<EntityFetcher>,
    records: RecordStore,
    recalculator: AggregateRecalculator,
    entity_timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(
        fetcher: Arc<EntityFetcher>,
        records: RecordStore,
        recalculator: AggregateRecalculator,
        entity_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            records,
            recalculator,
            entity_timeout,
        }
    }

    /// Apply every notification in the payload, then recompute touched customers
    pub async fn dispatch(&self, payload: &WebhookPayload) -> BatchReport {
        let mut report = BatchReport::default();
        let mut touched = BTreeSet::new();

        for notification in &payload.event_notifications {
            let Some(change) = &notification.data_change_event else {
                continue;
            };

            for entity in &change.entities {
                report.entities_seen += 1;
                let work = self.apply(&notification.realm_id, entity, &mut touched);

                match tokio::time::timeout(self.entity_timeout, work).await {
                    Ok(Ok(Outcome::Applied)) => report.applied += 1,
                    Ok(Ok(Outcome::Ignored)) => report.ignored += 1,
                    Ok(Ok(Outcome::Skipped)) => report.skipped += 1,
                    Ok(Err(e)) => {
                        report.failed += 1;
                        tracing::warn!(
                            realm_id = %notification.realm_id,
                            entity = %entity.name,
                            id = %entity.id,
                            operation = %entity.operation,
                            error = %e,
                            "Failed to apply webhook entity, skipping"
                        );
                    }
                    Err(_) => {
                        report.failed += 1;
                        tracing::warn!(
                            realm_id = %notification.realm_id,
                            entity = %entity.name,
                            id = %entity.id,
                            error = %ReconcileError::Timeout(self.entity_timeout),
                            "Webhook entity timed out, skipping"
                        );
                    }
                }
            }
        }

        for customer_ref in touched {
            match self.recalculator.recompute(&customer_ref).await {
                Ok(_) => report.customers_recomputed.push(customer_ref),
                Err(e) => {
                    tracing::error!(
                        customer_ref = %customer_ref,
                        error = %e,
                        "Aggregate recompute failed"
                    );
                    report.recompute_failures.push(customer_ref);
                }
            }
        }

        tracing::info!(
            entities = report.entities_seen,
            applied = report.applied,
            ignored = report.ignored,
            skipped = report.skipped,
            failed = report.failed,
            customers = report.customers_recomputed.len(),
            "Webhook batch processed"
        );

        report
    }

    async fn apply(
        &self,
        realm_id: &str,
        entity: &EntityNotification,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let Some(kind) = classify_entity(&entity.name) else {
            tracing::debug!(entity = %entity.name, id = %entity.id, "Ignoring unhandled entity type");
            return Ok(Outcome::Ignored);
        };
        let operation = OperationClass::classify(&entity.operation);

        tracing::debug!(
            realm_id = %realm_id,
            entity = %kind,
            id = %entity.id,
            operation = ?operation,
            "Applying webhook entity"
        );

        match (kind, operation) {
            (EntityKind::Invoice, OperationClass::Delete) => {
                self.delete_invoice(&entity.id, touched).await
            }
            (EntityKind::Invoice, OperationClass::Upsert) => {
                self.upsert_invoice(realm_id, &entity.id, touched).await
            }
            (EntityKind::Payment, OperationClass::Delete) => {
                self.delete_payment(realm_id, &entity.id, touched).await
            }
            (EntityKind::Payment, OperationClass::Upsert) => {
                self.upsert_payment(realm_id, &entity.id, touched).await
            }
            (EntityKind::CreditMemo, OperationClass::Delete) => {
                self.delete_credit_memo(realm_id, &entity.id, touched).await
            }
            (EntityKind::CreditMemo, OperationClass::Upsert) => {
                self.upsert_credit_memo(realm_id, &entity.id, touched).await
            }
        }
    }

    async fn delete_invoice(
        &self,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let Some(customer_ref) = self.records.find_owner(EntityKind::Invoice, id).await? else {
            tracing::debug!(id = %id, "Deleted invoice was never stored");
            return Ok(Outcome::Applied);
        };

        self.records
            .delete(&customer_ref, EntityKind::Invoice, id)
            .await?;
        touched.insert(customer_ref);
        Ok(Outcome::Applied)
    }

    async fn upsert_invoice(
        &self,
        realm_id: &str,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let invoice = self.fetcher.fetch_invoice(realm_id, id).await?;
        let previous_owner = self.records.find_owner(EntityKind::Invoice, id).await?;
        self.records.upsert(&invoice.customer_ref, &invoice).await?;
        touched.insert(invoice.customer_ref.clone());

        // Invoice IDs are unique across customers, so a reassigned invoice
        // must leave its old scope. Both customers are touched before the
        // delete so an interrupted move still recomputes them.
        if let Some(previous) = previous_owner.filter(|owner| *owner != invoice.customer_ref) {
            tracing::info!(
                invoice_id = %id,
                from = %previous,
                to = %invoice.customer_ref,
                "Invoice moved between customers"
            );
            touched.insert(previous.clone());
            self.records
                .delete(&previous, EntityKind::Invoice, id)
                .await?;
        }

        Ok(Outcome::Applied)
    }

    /// Deleting a payment removes the stored record and then stores it again
    /// from a fresh fetch. Credit memos only re-fetch when the delete fails.
    /// The two paths intentionally differ and should not be unified without a
    /// product decision.
    async fn delete_payment(
        &self,
        realm_id: &str,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        match self.records.find_owner(EntityKind::Payment, id).await {
            Ok(Some(customer_ref)) => {
                if let Err(e) = self
                    .records
                    .delete(&customer_ref, EntityKind::Payment, id)
                    .await
                {
                    tracing::warn!(id = %id, error = %e, "Payment delete failed, re-fetching anyway");
                }
            }
            Ok(None) => tracing::debug!(id = %id, "Deleted payment was never stored"),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Payment lookup failed, re-fetching anyway")
            }
        }

        self.upsert_payment(realm_id, id, touched).await
    }

    async fn upsert_payment(
        &self,
        realm_id: &str,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let payment = self.fetcher.fetch_payment(realm_id, id).await?;

        // Assumes no real cash payment totals zero. A zero-total payment
        // only moves existing credit, so the affected invoices are stored
        // instead of the payment itself.
        if payment.is_zero_total() {
            tracing::info!(
                payment_id = %id,
                invoices = payment.lines.len(),
                "Zero-total payment, refreshing linked invoices instead"
            );
            for line in &payment.lines {
                if let Err(e) = self.upsert_invoice(realm_id, &line.invoice_id, touched).await {
                    tracing::warn!(
                        payment_id = %id,
                        invoice_id = %line.invoice_id,
                        error = %e,
                        "Failed to refresh invoice linked to zero-total payment"
                    );
                }
            }
            return Ok(Outcome::Applied);
        }

        let Some(customer_ref) = self.owner_of_first_line(payment.first_invoice_id()).await? else {
            tracing::warn!(
                payment_id = %id,
                first_invoice_id = ?payment.first_invoice_id(),
                "Payment is not linked to a stored invoice, skipping"
            );
            return Ok(Outcome::Skipped);
        };

        self.records.upsert(&customer_ref, &payment).await?;
        touched.insert(customer_ref);
        Ok(Outcome::Applied)
    }

    async fn delete_credit_memo(
        &self,
        realm_id: &str,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let deleted = match self.records.find_owner(EntityKind::CreditMemo, id).await {
            Ok(Some(customer_ref)) => {
                match self
                    .records
                    .delete(&customer_ref, EntityKind::CreditMemo, id)
                    .await
                {
                    Ok(true) => Some(customer_ref),
                    Ok(false) => None,
                    Err(e) => {
                        tracing::warn!(id = %id, error = %e, "Credit memo delete failed");
                        None
                    }
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Credit memo lookup failed");
                None
            }
        };

        match deleted {
            Some(customer_ref) => {
                touched.insert(customer_ref);
                Ok(Outcome::Applied)
            }
            None => {
                tracing::info!(id = %id, "Credit memo not deleted, falling back to fetch");
                self.upsert_credit_memo(realm_id, id, touched).await
            }
        }
    }

    async fn upsert_credit_memo(
        &self,
        realm_id: &str,
        id: &str,
        touched: &mut BTreeSet<String>,
    ) -> ReconcileResult<Outcome> {
        let memo = self.fetcher.fetch_credit_memo(realm_id, id).await?;

        let Some(customer_ref) = self.owner_of_first_line(memo.first_invoice_id()).await? else {
            tracing::warn!(
                credit_memo_id = %id,
                first_invoice_id = ?memo.first_invoice_id(),
                "Credit memo is not linked to a stored invoice, skipping"
            );
            return Ok(Outcome::Skipped);
        };

        self.records.upsert(&customer_ref, &memo).await?;
        touched.insert(customer_ref);
        Ok(Outcome::Applied)
    }

    async fn owner_of_first_line(
        &self,
        invoice_id: Option<&str>,
    ) -> ReconcileResult<Option<String>> {
        match invoice_id {
            Some(invoice_id) => Ok(self
                .records
                .find_invoice_by_id(invoice_id)
                .await?
                .map(|(customer_ref, _)| customer_ref)),
            None => Ok(None),
        }
    }
}
