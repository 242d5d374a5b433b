//! Canonical entity reads from QuickBooks, mapped into record types

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Number, Value};

use crate::client::{AccountingApi, ApiCallError};
use crate::error::{ReconcileError, ReconcileResult};
use crate::records::{
    parse_minor_units, CreditMemoRecord, EntityKind, InvoiceRecord, LineApplication,
    PaymentRecord,
};
use crate::retry::RetryPolicy;
use crate::token::TokenManager;

/// QuickBooks keeps voided invoices with a zero total and this note prefix
const VOID_NOTE_PREFIX: &str = "Voided";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboInvoice {
    id: String,
    #[serde(default)]
    doc_number: Option<String>,
    customer_ref: QboRef,
    #[serde(default)]
    bill_email: Option<QboEmail>,
    meta_data: QboMetaData,
    #[serde(default)]
    total_amt: Option<Number>,
    #[serde(default)]
    balance: Option<Number>,
    #[serde(default)]
    private_note: Option<String>,
    #[serde(default)]
    custom_field: Vec<QboCustomField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboPayment {
    id: String,
    total_amt: Number,
    meta_data: QboMetaData,
    #[serde(default)]
    payment_method_ref: Option<QboRef>,
    #[serde(default)]
    line: Vec<QboLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboCreditMemo {
    id: String,
    #[serde(default)]
    line: Vec<QboLine>,
}

#[derive(Debug, Deserialize)]
struct QboRef {
    value: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboEmail {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboMetaData {
    create_time: String,
    last_updated_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboCustomField {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    string_value: Option<String>,
    #[serde(default)]
    number_value: Option<Number>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboLine {
    #[serde(default)]
    amount: Option<Number>,
    #[serde(default)]
    linked_txn: Vec<QboLinkedTxn>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QboLinkedTxn {
    txn_id: String,
    txn_type: String,
}

pub struct EntityFetcher {
    api: Arc<dyn AccountingApi>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
    hours_field: String,
}

impl EntityFetcher {
    pub fn new(
        api: Arc<dyn AccountingApi>,
        tokens: Arc<TokenManager>,
        retry: RetryPolicy,
        hours_field: impl Into<String>,
    ) -> Self {
        Self {
            api,
            tokens,
            retry,
            hours_field: hours_field.into(),
        }
    }

    pub async fn fetch_invoice(&self, tenant_id: &str, id: &str) -> ReconcileResult<InvoiceRecord> {
        let raw: QboInvoice = self.fetch(tenant_id, EntityKind::Invoice, id).await?;
        let invoice_id = raw.id.clone();
        self.map_invoice(raw, tenant_id)
            .map_err(|message| fetch_error(EntityKind::Invoice, &invoice_id, message))
    }

    pub async fn fetch_payment(&self, tenant_id: &str, id: &str) -> ReconcileResult<PaymentRecord> {
        let raw: QboPayment = self.fetch(tenant_id, EntityKind::Payment, id).await?;

        let total_amount_cents = money(&raw.total_amt)
            .map_err(|message| fetch_error(EntityKind::Payment, &raw.id, message))?;
        let lines = invoice_applications(&raw.line)
            .map_err(|message| fetch_error(EntityKind::Payment, &raw.id, message))?;

        Ok(PaymentRecord {
            payment_id: raw.id,
            created_at: raw.meta_data.create_time,
            total_amount_cents,
            payment_method: raw
                .payment_method_ref
                .map(|method| method.name.unwrap_or(method.value)),
            lines,
            tenant_id: tenant_id.to_string(),
        })
    }

    pub async fn fetch_credit_memo(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> ReconcileResult<CreditMemoRecord> {
        let raw: QboCreditMemo = self.fetch(tenant_id, EntityKind::CreditMemo, id).await?;
        let lines = invoice_applications(&raw.line)
            .map_err(|message| fetch_error(EntityKind::CreditMemo, &raw.id, message))?;

        Ok(CreditMemoRecord {
            credit_memo_id: raw.id,
            lines,
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Read one entity and decode its QuickBooks shape
    ///
    /// A 401 gets one forced token refresh and a second round of attempts.
    async fn fetch<T: DeserializeOwned>(
        &self,
        tenant_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> ReconcileResult<T> {
        let token = self.tokens.valid_token().await?;

        let raw = match self.read(&token.token, tenant_id, kind, id).await {
            Err(err) if err.is_unauthorized() => {
                tracing::warn!(
                    entity = %kind,
                    id = %id,
                    "Access token rejected, forcing refresh"
                );
                let token = self.tokens.force_refresh().await?;
                self.read(&token.token, tenant_id, kind, id).await
            }
            other => other,
        }
        .map_err(|e| fetch_error(kind, id, e.to_string()))?;

        serde_json::from_value(raw).map_err(|e| fetch_error(kind, id, e.to_string()))
    }

    async fn read(
        &self,
        access_token: &str,
        tenant_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Value, ApiCallError> {
        self.retry
            .run("entity_read", || {
                self.api.get_entity(access_token, tenant_id, kind, id)
            })
            .await
    }

    fn map_invoice(&self, raw: QboInvoice, tenant_id: &str) -> Result<InvoiceRecord, String> {
        let voided = raw
            .private_note
            .as_deref()
            .is_some_and(|note| note.starts_with(VOID_NOTE_PREFIX))
            && raw
                .total_amt
                .as_ref()
                .map(money)
                .transpose()?
                .unwrap_or(0)
                == 0;

        let (balance_cents, hours_purchased) = if voided {
            (None, None)
        } else {
            (
                raw.balance.as_ref().map(money).transpose()?,
                hours(&raw.custom_field, &self.hours_field),
            )
        };

        Ok(InvoiceRecord {
            invoice_id: raw.id,
            doc_number: raw.doc_number,
            customer_ref: raw.customer_ref.value,
            bill_email: raw.bill_email.and_then(|email| email.address),
            created_time: raw.meta_data.create_time,
            last_updated: raw.meta_data.last_updated_time,
            balance_cents,
            hours_purchased,
            tenant_id: Some(tenant_id.to_string()),
        })
    }
}

fn fetch_error(kind: EntityKind, id: &str, message: impl Into<String>) -> ReconcileError {
    ReconcileError::Fetch {
        entity: kind.response_key(),
        id: id.to_string(),
        message: message.into(),
    }
}

fn money(amount: &Number) -> Result<i64, String> {
    parse_minor_units(&amount.to_string())
}

/// Hours from the named custom field; missing or non-numeric is `None`
fn hours(fields: &[QboCustomField], name: &str) -> Option<f64> {
    let field = fields.iter().find(|f| f.name.as_deref() == Some(name))?;

    field
        .number_value
        .as_ref()
        .and_then(Number::as_f64)
        .or_else(|| {
            field
                .string_value
                .as_deref()
                .and_then(|v| v.trim().parse::<f64>().ok())
        })
        .filter(|h| h.is_finite())
}

/// Lines linked to invoices, in document order
fn invoice_applications(lines: &[QboLine]) -> Result<Vec<LineApplication>, String> {
    let mut applications = Vec::new();
    for line in lines {
        let applied_amount_cents = line.amount.as_ref().map(money).transpose()?.unwrap_or(0);
        for txn in &line.linked_txn {
            if txn.txn_type == "Invoice" {
                applications.push(LineApplication {
                    invoice_id: txn.txn_id.clone(),
                    applied_amount_cents,
                });
            }
        }
    }
    Ok(applications)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::testing::{
        connected_tokens, fast_retry, qbo_credit_memo, qbo_invoice, qbo_payment,
        qbo_voided_invoice, FakeAccounting, FakeOAuth, HOURS_FIELD, REALM,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    async fn fetcher(api: Arc<FakeAccounting>) -> (EntityFetcher, Arc<FakeOAuth>) {
        let docs = MemoryDocumentStore::new();
        let oauth = Arc::new(FakeOAuth::default());
        let tokens = connected_tokens(&docs, oauth.clone()).await;
        (EntityFetcher::new(api, tokens, fast_retry(), HOURS_FIELD), oauth)
    }

    #[tokio::test]
    async fn test_fetch_invoice_maps_fields() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(EntityKind::Invoice, "130", qbo_invoice("130", "C1", 150.25, Some(7.5)));
        let (fetcher, _) = fetcher(api).await;

        let invoice = fetcher.fetch_invoice(REALM, "130").await.unwrap();
        assert_eq!(invoice.invoice_id, "130");
        assert_eq!(invoice.doc_number.as_deref(), Some("INV-130"));
        assert_eq!(invoice.customer_ref, "C1");
        assert_eq!(invoice.bill_email.as_deref(), Some("ap@example.com"));
        assert_eq!(invoice.balance_cents, Some(15025));
        assert_eq!(invoice.hours_purchased, Some(7.5));
        assert_eq!(invoice.tenant_id.as_deref(), Some(REALM));
        assert_eq!(invoice.last_updated, "2024-03-02T11:30:00-08:00");
    }

    #[tokio::test]
    async fn test_voided_invoice_has_no_balance_or_hours() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(EntityKind::Invoice, "9", qbo_voided_invoice("9", "C1"));
        let (fetcher, _) = fetcher(api).await;

        let invoice = fetcher.fetch_invoice(REALM, "9").await.unwrap();
        assert!(invoice.is_voided());
    }

    #[tokio::test]
    async fn test_non_numeric_hours_is_none() {
        let api = Arc::new(FakeAccounting::default());
        let mut raw = qbo_invoice("5", "C1", 10.0, None);
        raw["CustomField"] = json!([{"Name": HOURS_FIELD, "StringValue": "lots"}]);
        api.insert(EntityKind::Invoice, "5", raw);
        let (fetcher, _) = fetcher(api).await;

        let invoice = fetcher.fetch_invoice(REALM, "5").await.unwrap();
        assert_eq!(invoice.balance_cents, Some(1000));
        assert_eq!(invoice.hours_purchased, None);
        assert!(!invoice.is_voided());
    }

    #[tokio::test]
    async fn test_exponent_amounts_are_parsed() {
        let api = Arc::new(FakeAccounting::default());
        let mut raw = qbo_invoice("6", "C1", 0.0, None);
        raw["Balance"] = serde_json::from_str("1e16").unwrap();
        api.insert(EntityKind::Invoice, "6", raw);
        let (fetcher, _) = fetcher(api).await;

        let invoice = fetcher.fetch_invoice(REALM, "6").await.unwrap();
        assert_eq!(invoice.balance_cents, Some(1_000_000_000_000_000_000));
    }

    #[tokio::test]
    async fn test_fetch_payment_collects_invoice_lines() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(
            EntityKind::Payment,
            "P1",
            qbo_payment("P1", 75.5, &[("130", 50.0), ("131", 25.5)]),
        );
        let (fetcher, _) = fetcher(api).await;

        let payment = fetcher.fetch_payment(REALM, "P1").await.unwrap();
        assert_eq!(payment.total_amount_cents, 7550);
        assert_eq!(payment.payment_method.as_deref(), Some("Check"));
        assert_eq!(payment.first_invoice_id(), Some("130"));
        assert_eq!(payment.lines[1].applied_amount_cents, 2550);
        assert_eq!(payment.tenant_id, REALM);
    }

    #[tokio::test]
    async fn test_fetch_credit_memo() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(EntityKind::CreditMemo, "CM1", qbo_credit_memo("CM1", &[("130", 20.0)]));
        let (fetcher, _) = fetcher(api).await;

        let memo = fetcher.fetch_credit_memo(REALM, "CM1").await.unwrap();
        assert_eq!(memo.credit_memo_id, "CM1");
        assert_eq!(memo.first_invoice_id(), Some("130"));
        assert_eq!(memo.lines[0].applied_amount_cents, 2000);
    }

    #[tokio::test]
    async fn test_missing_entity_is_fetch_error() {
        let api = Arc::new(FakeAccounting::default());
        let (fetcher, _) = fetcher(api.clone()).await;

        let err = fetcher.fetch_invoice(REALM, "404").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fetch { entity: "Invoice", .. }));
        // 404 is not retried
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let api = Arc::new(FakeAccounting::default());
        api.fail("130");
        let (fetcher, _) = fetcher(api.clone()).await;

        assert!(fetcher.fetch_invoice(REALM, "130").await.is_err());
        assert_eq!(api.calls(), fast_retry().max_attempts);
    }

    #[tokio::test]
    async fn test_unauthorized_forces_one_refresh() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(EntityKind::Invoice, "130", qbo_invoice("130", "C1", 1.0, None));
        api.unauthorized_once("130");
        let (fetcher, oauth) = fetcher(api.clone()).await;

        let invoice = fetcher.fetch_invoice(REALM, "130").await.unwrap();
        assert_eq!(invoice.balance_cents, Some(100));
        assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_entity_is_fetch_error() {
        let api = Arc::new(FakeAccounting::default());
        api.insert(EntityKind::Payment, "P2", json!({"Id": "P2"}));
        let (fetcher, _) = fetcher(api).await;

        let err = fetcher.fetch_payment(REALM, "P2").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Fetch { entity: "Payment", .. }));
    }
}
