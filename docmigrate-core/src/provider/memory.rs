//! In-process provider.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DocumentMetadata, StorageAdapter, StorageError, StorageResult, StoredDocument};
use crate::digest::ContentDigest;

/// Process-local document store. Backs dry runs and every engine test that
/// does not care about a real backend.
pub struct InMemoryAdapter {
    label: String,
    documents: RwLock<BTreeMap<String, StoredDocument>>,
}

impl fmt::Debug for InMemoryAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .documents
            .try_read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryAdapter")
            .field("label", &self.label)
            .field("documents", &count)
            .finish()
    }
}

impl InMemoryAdapter {
    /// Empty store; `label` only shows up in `describe`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            documents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed a document without going through the adapter contract.
    pub async fn insert(&self, id: impl Into<String>, content: impl Into<Vec<u8>>) {
        let mut guard = self.documents.write().await;
        guard.insert(
            id.into(),
            StoredDocument {
                content: content.into(),
                metadata: DocumentMetadata::default(),
            },
        );
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Whether `id` is stored.
    pub async fn contains(&self, id: &str) -> bool {
        self.documents.read().await.contains_key(id)
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }

    async fn get(&self, id: &str) -> StorageResult<StoredDocument> {
        let guard = self.documents.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn put(
        &self,
        id: &str,
        content: &[u8],
        metadata: &DocumentMetadata,
    ) -> StorageResult<ContentDigest> {
        let mut guard = self.documents.write().await;
        guard.insert(
            id.to_string(),
            StoredDocument {
                content: content.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(ContentDigest::of(content))
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut guard = self.documents.write().await;
        guard
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let guard = self.documents.read().await;
        Ok(guard
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_returns_same_body_and_metadata() {
        let adapter = InMemoryAdapter::new("test");
        let metadata = DocumentMetadata {
            name: Some("RFC-001".into()),
            ..Default::default()
        };
        let digest = adapter.put("rfc-001", b"body", &metadata).await.unwrap();
        let stored = adapter.get("rfc-001").await.unwrap();
        assert_eq!(stored.content, b"body");
        assert_eq!(stored.metadata, metadata);
        assert_eq!(stored.digest(), digest);
    }

    #[tokio::test]
    async fn list_filters_by_prefix_in_sorted_order() {
        let adapter = InMemoryAdapter::new("test");
        adapter.insert("rfc/b", "2").await;
        adapter.insert("rfc/a", "1").await;
        adapter.insert("prd/a", "3").await;
        assert_eq!(adapter.list("rfc/").await.unwrap(), vec!["rfc/a", "rfc/b"]);
    }

    #[tokio::test]
    async fn delete_missing_document_is_not_found() {
        let adapter = InMemoryAdapter::new("test");
        let err = adapter.delete("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
