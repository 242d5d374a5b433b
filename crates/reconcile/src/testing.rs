//! In-memory fakes for the QuickBooks traits, shared by unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::client::{AccountingApi, ApiCallError, OAuthProvider, TokenGrant};
use crate::error::ReconcileResult;
use crate::records::EntityKind;
use crate::retry::RetryPolicy;
use crate::store::{credential_path, DocumentStore, MemoryDocumentStore, WriteMode};
use crate::token::{CredentialRecord, TokenManager};

pub const REALM: &str = "realm-1";
pub const HOURS_FIELD: &str = "Hours Purchased";

#[derive(Default)]
pub struct FakeOAuth {
    pub exchange_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub revoked: bool,
    pub reject_code: bool,
    /// Simulate a grant that keeps the previous refresh token
    pub omit_refresh_token: bool,
    pub refresh_token_lifetime_secs: Option<i64>,
}

impl FakeOAuth {
    fn grant(&self, n: u32) -> TokenGrant {
        TokenGrant {
            access_token: format!("at-{}", n),
            refresh_token: (!self.omit_refresh_token).then(|| format!("rt-{}", n)),
            token_type: "bearer".to_string(),
            expires_in: 3600,
            x_refresh_token_expires_in: self.refresh_token_lifetime_secs,
        }
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuth {
    fn authorization_url(&self, state: &str) -> ReconcileResult<String> {
        Ok(format!("https://consent.test/authorize?state={}", state))
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, ApiCallError> {
        let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_code {
            return Err(ApiCallError::InvalidGrant(format!("code {} is invalid", code)));
        }
        Ok(self.grant(n))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ApiCallError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.revoked {
            return Err(ApiCallError::InvalidGrant("token revoked".to_string()));
        }
        Ok(self.grant(100 + n))
    }
}

/// Accounting API serving canned entity JSON
#[derive(Default)]
pub struct FakeAccounting {
    entities: Mutex<HashMap<(EntityKind, String), Value>>,
    failing: Mutex<HashSet<String>>,
    unauthorized_once: Mutex<HashSet<String>>,
    pub delay: Option<Duration>,
    pub calls: AtomicU32,
}

impl FakeAccounting {
    /// Every read sleeps for `delay` first
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn insert(&self, kind: EntityKind, id: &str, entity: Value) {
        self.entities
            .lock()
            .unwrap()
            .insert((kind, id.to_string()), entity);
    }

    pub fn remove(&self, kind: EntityKind, id: &str) {
        self.entities.lock().unwrap().remove(&(kind, id.to_string()));
    }

    /// Every read of `id` returns a 500
    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// The next read of `id` returns a 401
    pub fn unauthorized_once(&self, id: &str) {
        self.unauthorized_once.lock().unwrap().insert(id.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountingApi for FakeAccounting {
    async fn get_entity(
        &self,
        _access_token: &str,
        _tenant_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Value, ApiCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unauthorized_once.lock().unwrap().remove(id) {
            return Err(ApiCallError::Status {
                status: 401,
                message: "token expired".to_string(),
            });
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(ApiCallError::Status {
                status: 500,
                message: "internal error".to_string(),
            });
        }

        self.entities
            .lock()
            .unwrap()
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| ApiCallError::Status {
                status: 404,
                message: "Object Not Found".to_string(),
            })
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(1), 1)
}

pub fn credential(expires_in_secs: i64) -> CredentialRecord {
    let now = Utc::now();
    CredentialRecord {
        access_token: "at-0".to_string(),
        refresh_token: "rt-0".to_string(),
        token_type: "bearer".to_string(),
        expiry: now + chrono::Duration::seconds(expires_in_secs),
        tenant_id: REALM.to_string(),
        refresh_token_expiry: None,
        updated_at: now,
    }
}

pub async fn store_credential(docs: &MemoryDocumentStore, credential: &CredentialRecord) {
    docs.set(
        &credential_path("default").unwrap(),
        serde_json::to_value(credential).unwrap(),
        WriteMode::Overwrite,
    )
    .await
    .unwrap();
}

/// A token manager with a credential valid for an hour
pub async fn connected_tokens(
    docs: &MemoryDocumentStore,
    oauth: Arc<FakeOAuth>,
) -> Arc<TokenManager> {
    store_credential(docs, &credential(3600)).await;
    Arc::new(TokenManager::new(
        oauth,
        Arc::new(docs.clone()),
        "default",
        Duration::from_secs(300),
        fast_retry(),
    ))
}

pub fn qbo_invoice(id: &str, customer: &str, balance: f64, hours: Option<f64>) -> Value {
    let mut custom_fields = vec![json!({
        "DefinitionId": "2",
        "Name": "Project Code",
        "Type": "StringType",
        "StringValue": "P-7"
    })];
    if let Some(hours) = hours {
        custom_fields.push(json!({
            "DefinitionId": "1",
            "Name": HOURS_FIELD,
            "Type": "StringType",
            "StringValue": hours.to_string()
        }));
    }

    json!({
        "Id": id,
        "DocNumber": format!("INV-{}", id),
        "CustomerRef": {"value": customer, "name": format!("Customer {}", customer)},
        "BillEmail": {"Address": "ap@example.com"},
        "MetaData": {
            "CreateTime": "2024-03-01T10:00:00-08:00",
            "LastUpdatedTime": "2024-03-02T11:30:00-08:00"
        },
        "TotalAmt": balance,
        "Balance": balance,
        "CustomField": custom_fields
    })
}

pub fn qbo_voided_invoice(id: &str, customer: &str) -> Value {
    let mut invoice = qbo_invoice(id, customer, 0.0, Some(4.0));
    invoice["PrivateNote"] = json!("Voided");
    invoice
}

fn linked_lines(applications: &[(&str, f64)]) -> Value {
    Value::Array(
        applications
            .iter()
            .map(|(invoice_id, amount)| {
                json!({
                    "Amount": amount,
                    "LinkedTxn": [{"TxnId": invoice_id, "TxnType": "Invoice"}]
                })
            })
            .collect(),
    )
}

pub fn qbo_payment(id: &str, total: f64, applications: &[(&str, f64)]) -> Value {
    json!({
        "Id": id,
        "TotalAmt": total,
        "PaymentMethodRef": {"value": "3", "name": "Check"},
        "MetaData": {
            "CreateTime": "2024-03-05T09:00:00-08:00",
            "LastUpdatedTime": "2024-03-05T09:00:00-08:00"
        },
        "Line": linked_lines(applications)
    })
}

pub fn qbo_credit_memo(id: &str, applications: &[(&str, f64)]) -> Value {
    json!({
        "Id": id,
        "TotalAmt": applications.iter().map(|(_, a)| a).sum::<f64>(),
        "MetaData": {
            "CreateTime": "2024-03-06T09:00:00-08:00",
            "LastUpdatedTime": "2024-03-06T09:00:00-08:00"
        },
        "Line": linked_lines(applications)
    })
}

/// Memory store whose deletes stall, for exercising entity deadlines
#[derive(Clone)]
pub struct SlowDeleteStore {
    pub inner: MemoryDocumentStore,
    pub delay: Duration,
}

#[async_trait]
impl DocumentStore for SlowDeleteStore {
    async fn get(&self, path: &str) -> ReconcileResult<Option<Value>> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, data: Value, mode: WriteMode) -> ReconcileResult<()> {
        self.inner.set(path, data, mode).await
    }

    async fn delete(&self, path: &str) -> ReconcileResult<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(path).await
    }

    async fn list_children(
        &self,
        collection_path: &str,
    ) -> ReconcileResult<Vec<crate::store::Document>> {
        self.inner.list_children(collection_path).await
    }

    async fn list_collection_group(&self, collection: &str) -> ReconcileResult<Vec<String>> {
        self.inner.list_collection_group(collection).await
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> ReconcileResult<Vec<crate::store::Document>> {
        self.inner.find_by_field(collection, field, value).await
    }
}
