//! In-memory document store for tests and local development

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{collection_of, merge_documents, parent_of, Document, DocumentStore, WriteMode};
use crate::error::ReconcileResult;

/// Document store backed by an ordered map
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    /// Copy of every document, keyed by path
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.docs.read().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &str) -> ReconcileResult<Option<Value>> {
        Ok(self.docs.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, data: Value, mode: WriteMode) -> ReconcileResult<()> {
        let mut docs = self.docs.write().await;
        let value = match mode {
            WriteMode::Overwrite => data,
            WriteMode::Merge => merge_documents(docs.remove(path), data),
        };
        docs.insert(path.to_string(), value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> ReconcileResult<bool> {
        Ok(self.docs.write().await.remove(path).is_some())
    }

    async fn list_children(&self, collection_path: &str) -> ReconcileResult<Vec<Document>> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(path, _)| parent_of(path) == collection_path)
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn list_collection_group(&self, collection: &str) -> ReconcileResult<Vec<String>> {
        let docs = self.docs.read().await;
        Ok(docs
            .keys()
            .filter(|path| collection_of(path) == collection)
            .cloned()
            .collect())
    }

    async fn find_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> ReconcileResult<Vec<Document>> {
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|(path, data)| {
                collection_of(path) == collection
                    && data.get(field).and_then(Value::as_str) == Some(value)
            })
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect())
    }
}
