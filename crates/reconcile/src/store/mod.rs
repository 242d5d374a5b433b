//! Document store primitives and the typed record store built on them
//!
//! Documents live at slash-separated paths:
//!
//! | Path                                         | Document          |
//! |----------------------------------------------|-------------------|
//! | `credentials/{installation_id}`              | CredentialRecord  |
//! | `customers/{customer_ref}`                   | CustomerAggregate |
//! | `customers/{customer_ref}/invoices/{id}`     | InvoiceRecord     |
//! | `customers/{customer_ref}/payments/{id}`     | PaymentRecord     |
//! | `customers/{customer_ref}/credit_memos/{id}` | CreditMemoRecord  |

mod memory;
mod postgres;
mod record_store;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ReconcileError, ReconcileResult};
use crate::records::EntityKind;

pub use memory::MemoryDocumentStore;
pub use postgres::{create_pool, run_migrations, PgDocumentStore};
pub use record_store::RecordStore;

pub const CUSTOMERS: &str = "customers";
pub const CREDENTIALS: &str = "credentials";

/// How `set` treats an existing document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole document
    Overwrite,
    /// Merge top-level fields into the existing document
    Merge,
}

/// A stored document and its path
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: String,
    pub data: Value,
}

/// The document store operations the engine depends on
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> ReconcileResult<Option<Value>>;

    async fn set(&self, path: &str, data: Value, mode: WriteMode) -> ReconcileResult<()>;

    /// Returns whether a document existed at `path`
    async fn delete(&self, path: &str) -> ReconcileResult<bool>;

    /// Documents directly under a collection path, ordered by path
    async fn list_children(&self, collection_path: &str) -> ReconcileResult<Vec<Document>>;

    /// Paths of every document in a collection named `collection`, across
    /// all scopes, ordered by path
    async fn list_collection_group(&self, collection: &str) -> ReconcileResult<Vec<String>>;

    /// Documents in every collection named `collection` whose string
    /// field `field` equals `value`, across all scopes
    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> ReconcileResult<Vec<Document>>;
}

fn segment(value: &str) -> ReconcileResult<&str> {
    if value.is_empty() || value.contains('/') {
        return Err(ReconcileError::Store(format!(
            "invalid path segment '{}'",
            value
        )));
    }
    Ok(value)
}

pub fn customer_path(customer_ref: &str) -> ReconcileResult<String> {
    Ok(format!("{}/{}", CUSTOMERS, segment(customer_ref)?))
}

pub fn collection_path(customer_ref: &str, kind: EntityKind) -> ReconcileResult<String> {
    Ok(format!("{}/{}", customer_path(customer_ref)?, kind.collection()))
}

pub fn record_path(customer_ref: &str, kind: EntityKind, id: &str) -> ReconcileResult<String> {
    Ok(format!("{}/{}", collection_path(customer_ref, kind)?, segment(id)?))
}

pub fn credential_path(installation_id: &str) -> ReconcileResult<String> {
    Ok(format!("{}/{}", CREDENTIALS, segment(installation_id)?))
}

/// Everything before the last segment
pub(crate) fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Name of the collection a document belongs to
pub(crate) fn collection_of(path: &str) -> &str {
    let parent = parent_of(path);
    parent.rsplit('/').next().unwrap_or(parent)
}

/// The customer scope a document path sits under, if any
pub(crate) fn customer_of(path: &str) -> Option<&str> {
    let mut parts = path.split('/');
    match (parts.next(), parts.next()) {
        (Some(CUSTOMERS), Some(customer_ref)) if !customer_ref.is_empty() => Some(customer_ref),
        _ => None,
    }
}

/// Shallow merge used by `WriteMode::Merge`
pub(crate) fn merge_documents(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut current)), Value::Object(update)) => {
            for (key, value) in update {
                current.insert(key, value);
            }
            Value::Object(current)
        }
        (_, incoming) => incoming,
    }
}
