//! Metadata document store.
//!
//! The engine never assumes a particular backing database; it only needs a
//! versioned key-value interface with compare-and-swap writes. The CAS is
//! the engine's sole defense against overlapping ticks for the same index:
//! a conflicting write means another coordinator raced this one, and the
//! whole tick's effect is dropped.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use warden_core::metadata::ManagedIndexMetadata;

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The expected version did not match; the write was not applied.
    #[error("version conflict writing metadata for '{0}'")]
    Conflict(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Versioned document store for managed index metadata, keyed by index UUID.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read a metadata document and its current version.
    async fn get(
        &self,
        index_uuid: &str,
    ) -> Result<Option<(ManagedIndexMetadata, u64)>, StoreError>;

    /// Write a metadata document.
    ///
    /// `expected_version` of `None` means "create": the write fails with
    /// `Conflict` if a document already exists. Otherwise the write only
    /// applies if the stored version still matches. Returns the new version.
    async fn put(
        &self,
        index_uuid: &str,
        doc: &ManagedIndexMetadata,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Delete a metadata document (policy detached or index removed).
    async fn delete(&self, index_uuid: &str) -> Result<(), StoreError>;

    /// All metadata documents governed by one policy (bulk operations).
    async fn find_by_policy(&self, policy_id: &str)
        -> Result<Vec<ManagedIndexMetadata>, StoreError>;
}

/// In-memory metadata store with CAS semantics.
pub struct InMemoryMetadataStore {
    docs: RwLock<HashMap<String, (ManagedIndexMetadata, u64)>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(
        &self,
        index_uuid: &str,
    ) -> Result<Option<(ManagedIndexMetadata, u64)>, StoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|e| StoreError::Storage(format!("failed to acquire read lock: {}", e)))?;
        Ok(docs.get(index_uuid).cloned())
    }

    async fn put(
        &self,
        index_uuid: &str,
        doc: &ManagedIndexMetadata,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|e| StoreError::Storage(format!("failed to acquire write lock: {}", e)))?;

        let current = docs.get(index_uuid).map(|(_, v)| *v);
        match (expected_version, current) {
            (None, None) => {
                docs.insert(index_uuid.to_string(), (doc.clone(), 1));
                Ok(1)
            }
            (Some(expected), Some(actual)) if expected == actual => {
                let next = actual + 1;
                docs.insert(index_uuid.to_string(), (doc.clone(), next));
                Ok(next)
            }
            _ => Err(StoreError::Conflict(index_uuid.to_string())),
        }
    }

    async fn delete(&self, index_uuid: &str) -> Result<(), StoreError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|e| StoreError::Storage(format!("failed to acquire write lock: {}", e)))?;
        docs.remove(index_uuid);
        Ok(())
    }

    async fn find_by_policy(
        &self,
        policy_id: &str,
    ) -> Result<Vec<ManagedIndexMetadata>, StoreError> {
        let docs = self
            .docs
            .read()
            .map_err(|e| StoreError::Storage(format!("failed to acquire read lock: {}", e)))?;
        Ok(docs
            .values()
            .filter(|(doc, _)| doc.policy_id == policy_id)
            .map(|(doc, _)| doc.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_core::policy::Policy;

    fn sample_doc(uuid: &str) -> ManagedIndexMetadata {
        let policy = Policy::from_json(
            r#"{"policy_id": "p", "default_state": "a",
                "states": [{"name": "a", "actions": [], "transitions": []}]}"#,
        )
        .unwrap();
        ManagedIndexMetadata::initial("logs-1", uuid, &policy, 0, 0, Utc::now())
    }

    #[tokio::test]
    async fn create_then_update_with_matching_version() {
        let store = InMemoryMetadataStore::new();
        let doc = sample_doc("u1");

        let v1 = store.put("u1", &doc, None).await.unwrap();
        assert_eq!(v1, 1);

        let (loaded, version) = store.get("u1").await.unwrap().unwrap();
        assert_eq!(loaded, doc);

        let v2 = store.put("u1", &doc, Some(version)).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn create_conflicts_if_document_exists() {
        let store = InMemoryMetadataStore::new();
        let doc = sample_doc("u1");
        store.put("u1", &doc, None).await.unwrap();

        let err = store.put("u1", &doc, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryMetadataStore::new();
        let doc = sample_doc("u1");
        store.put("u1", &doc, None).await.unwrap();
        store.put("u1", &doc, Some(1)).await.unwrap();

        // A racing writer still holding version 1 loses.
        let err = store.put("u1", &doc, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn find_by_policy_filters() {
        let store = InMemoryMetadataStore::new();
        store.put("u1", &sample_doc("u1"), None).await.unwrap();
        let mut other = sample_doc("u2");
        other.policy_id = "other".to_string();
        store.put("u2", &other, None).await.unwrap();

        let found = store.find_by_policy("p").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index_uuid, "u1");
    }
}
