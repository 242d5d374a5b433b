//! Typed record persistence over a [`DocumentStore`]
//!
//! Every document read is decoded here, once, into a record type. Callers
//! never see raw JSON.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{
    collection_path, customer_of, customer_path, record_path, Document, DocumentStore, WriteMode,
    CUSTOMERS,
};
use crate::error::{ReconcileError, ReconcileResult};
use crate::records::{
    CreditMemoRecord, CustomerAggregate, EntityKind, InvoiceRecord, PaymentRecord, Record,
};

/// Entity snapshots scoped by customer, plus per-customer aggregates
#[derive(Clone)]
pub struct RecordStore {
    docs: Arc<dyn DocumentStore>,
}

impl RecordStore {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self { docs }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    /// Full overwrite of the record at its ID under the customer scope
    pub async fn upsert<R: Record>(&self, customer_ref: &str, record: &R) -> ReconcileResult<()> {
        let path = record_path(customer_ref, R::KIND, record.id())?;
        self.docs
            .set(&path, encode(&path, record)?, WriteMode::Overwrite)
            .await?;

        tracing::debug!(path = %path, "Record upserted");
        Ok(())
    }

    /// Returns whether a record existed
    pub async fn delete(
        &self,
        customer_ref: &str,
        kind: EntityKind,
        id: &str,
    ) -> ReconcileResult<bool> {
        let path = record_path(customer_ref, kind, id)?;
        let existed = self.docs.delete(&path).await?;

        tracing::debug!(path = %path, existed = existed, "Record deleted");
        Ok(existed)
    }

    pub async fn get<R: Record>(&self, customer_ref: &str, id: &str) -> ReconcileResult<Option<R>> {
        let path = record_path(customer_ref, R::KIND, id)?;
        match self.docs.get(&path).await? {
            Some(data) => Ok(Some(decode(&path, data)?)),
            None => Ok(None),
        }
    }

    /// Locate a record by ID without knowing its customer
    ///
    /// Returns the owning customer reference and the record.
    pub async fn find_by_id<R: Record>(&self, id: &str) -> ReconcileResult<Option<(String, R)>> {
        let matches = self
            .docs
            .find_by_field(R::KIND.collection(), R::KIND.id_field(), id)
            .await?;

        if matches.len() > 1 {
            tracing::warn!(
                entity = %R::KIND,
                id = %id,
                matches = matches.len(),
                "Record ID stored under more than one customer, using the first"
            );
        }

        let Some(Document { path, data }) = matches.into_iter().next() else {
            return Ok(None);
        };
        let customer_ref = customer_of(&path)
            .ok_or_else(|| ReconcileError::Decode {
                path: path.clone(),
                message: "document is not under a customer scope".to_string(),
            })?
            .to_string();

        Ok(Some((customer_ref, decode(&path, data)?)))
    }

    pub async fn find_invoice_by_id(
        &self,
        id: &str,
    ) -> ReconcileResult<Option<(String, InvoiceRecord)>> {
        self.find_by_id::<InvoiceRecord>(id).await
    }

    pub async fn find_payment_by_id(
        &self,
        id: &str,
    ) -> ReconcileResult<Option<(String, PaymentRecord)>> {
        self.find_by_id::<PaymentRecord>(id).await
    }

    pub async fn find_credit_memo_by_id(
        &self,
        id: &str,
    ) -> ReconcileResult<Option<(String, CreditMemoRecord)>> {
        self.find_by_id::<CreditMemoRecord>(id).await
    }

    /// Which customer a record of any kind is stored under
    pub async fn find_owner(&self, kind: EntityKind, id: &str) -> ReconcileResult<Option<String>> {
        let matches = self
            .docs
            .find_by_field(kind.collection(), kind.id_field(), id)
            .await?;

        Ok(matches
            .iter()
            .find_map(|doc| customer_of(&doc.path).map(str::to_string)))
    }

    pub async fn list_invoices(&self, customer_ref: &str) -> ReconcileResult<Vec<InvoiceRecord>> {
        let collection = collection_path(customer_ref, EntityKind::Invoice)?;
        self.docs
            .list_children(&collection)
            .await?
            .into_iter()
            .map(|doc| decode(&doc.path, doc.data))
            .collect()
    }

    pub async fn put_aggregate(&self, aggregate: &CustomerAggregate) -> ReconcileResult<()> {
        let path = customer_path(&aggregate.customer_ref)?;
        self.docs
            .set(&path, encode(&path, aggregate)?, WriteMode::Overwrite)
            .await
    }

    pub async fn get_aggregate(
        &self,
        customer_ref: &str,
    ) -> ReconcileResult<Option<CustomerAggregate>> {
        let path = customer_path(customer_ref)?;
        match self.docs.get(&path).await? {
            Some(data) => Ok(Some(decode(&path, data)?)),
            None => Ok(None),
        }
    }

    /// Customers that have an aggregate document or at least one invoice
    ///
    /// Invoices written without an aggregate (imports, or a first recompute
    /// that failed) still make their customer visible to the sweeps.
    pub async fn list_customers(&self) -> ReconcileResult<Vec<String>> {
        let mut customers: BTreeSet<String> = self
            .docs
            .list_children(CUSTOMERS)
            .await?
            .iter()
            .filter_map(|doc| customer_of(&doc.path).map(str::to_string))
            .collect();

        let invoice_paths = self
            .docs
            .list_collection_group(EntityKind::Invoice.collection())
            .await?;
        customers.extend(
            invoice_paths
                .iter()
                .filter_map(|path| customer_of(path).map(str::to_string)),
        );

        Ok(customers.into_iter().collect())
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> ReconcileResult<Value> {
    serde_json::to_value(value).map_err(|e| ReconcileError::Decode {
        path: path.to_string(),
        message: format!("failed to encode: {}", e),
    })
}

fn decode<T: DeserializeOwned>(path: &str, data: Value) -> ReconcileResult<T> {
    serde_json::from_value(data).map_err(|e| ReconcileError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}
