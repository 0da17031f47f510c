//! History storage backends.

use crate::error::HistoryError;
use crate::logger::HistoryFilter;
use crate::record::HistoryRecord;
use async_trait::async_trait;
use std::sync::RwLock;
use uuid::Uuid;
use warden_core::config::{HistoryBackend, HistoryConfig};

/// Trait for history storage backends.
///
/// Records are write-once: backends expose `store`, `query`, and `get`, but
/// never update or delete.
#[async_trait]
pub trait HistoryStorage: Send + Sync {
    /// Store a history record.
    async fn store(&self, record: HistoryRecord) -> Result<(), HistoryError>;

    /// Query history records with filters.
    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError>;

    /// Get a history record by ID.
    async fn get(&self, record_id: Uuid) -> Result<Option<HistoryRecord>, HistoryError>;
}

/// Create a storage backend based on configuration.
pub fn create_storage(config: &HistoryConfig) -> Result<Box<dyn HistoryStorage>, HistoryError> {
    match config.backend {
        HistoryBackend::Console => Ok(Box::new(ConsoleStorage)),
        HistoryBackend::File => {
            let path = config.file_path.as_deref().unwrap_or("warden-history.log");
            Ok(Box::new(FileStorage::new(path)?))
        }
        HistoryBackend::Memory => Ok(Box::new(MemoryStorage::new())),
        HistoryBackend::None => Ok(Box::new(NullStorage)),
    }
}

/// Console storage (human-readable log lines to stdout).
pub struct ConsoleStorage;

#[async_trait]
impl HistoryStorage for ConsoleStorage {
    async fn store(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        println!("{}", record.to_log_line());
        Ok(())
    }

    async fn query(&self, _filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        // Console storage doesn't support querying
        Ok(vec![])
    }

    async fn get(&self, _record_id: Uuid) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(None)
    }
}

/// Null storage (discards everything).
pub struct NullStorage;

#[async_trait]
impl HistoryStorage for NullStorage {
    async fn store(&self, _record: HistoryRecord) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn query(&self, _filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        Ok(vec![])
    }

    async fn get(&self, _record_id: Uuid) -> Result<Option<HistoryRecord>, HistoryError> {
        Ok(None)
    }
}

/// In-memory storage, used by tests and the simulator CLI.
pub struct MemoryStorage {
    records: RwLock<Vec<HistoryRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStorage for MemoryStorage {
    async fn store(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| HistoryError::StorageError(format!("failed to acquire write lock: {}", e)))?;
        records.push(record);
        Ok(())
    }

    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|e| HistoryError::StorageError(format!("failed to acquire read lock: {}", e)))?;
        Ok(apply_filter(&records, &filter))
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<HistoryRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|e| HistoryError::StorageError(format!("failed to acquire read lock: {}", e)))?;
        Ok(records.iter().find(|r| r.record_id == record_id).cloned())
    }
}

/// File storage (appends JSON Lines).
pub struct FileStorage {
    path: String,
    // In-memory cache for querying (a production backend would index the file)
    records: RwLock<Vec<HistoryRecord>>,
}

impl FileStorage {
    /// Create a new file storage.
    pub fn new(path: &str) -> Result<Self, HistoryError> {
        Ok(Self {
            path: path.to_string(),
            records: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl HistoryStorage for FileStorage {
    async fn store(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        let json = serde_json::to_string(&record)?;

        // Append to file
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)?;

        // Also store in memory for querying
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }

        Ok(())
    }

    async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|e| HistoryError::StorageError(format!("failed to acquire read lock: {}", e)))?;
        Ok(apply_filter(&records, &filter))
    }

    async fn get(&self, record_id: Uuid) -> Result<Option<HistoryRecord>, HistoryError> {
        let records = self
            .records
            .read()
            .map_err(|e| HistoryError::StorageError(format!("failed to acquire read lock: {}", e)))?;
        Ok(records.iter().find(|r| r.record_id == record_id).cloned())
    }
}

fn apply_filter(records: &[HistoryRecord], filter: &HistoryFilter) -> Vec<HistoryRecord> {
    let mut results: Vec<_> = records
        .iter()
        .filter(|r| {
            if let Some(ref index) = filter.index {
                if &r.index != index {
                    return false;
                }
            }
            if let Some(ref uuid) = filter.index_uuid {
                if &r.index_uuid != uuid {
                    return false;
                }
            }
            if let Some(ref policy) = filter.policy_id {
                if &r.policy_id != policy {
                    return false;
                }
            }
            if let Some(ref state) = filter.state {
                if r.state.as_ref() != Some(state) {
                    return false;
                }
            }
            if let Some(status) = filter.step_status {
                if r.step_status != Some(status) {
                    return false;
                }
            }
            if let Some(start) = filter.start_time {
                if r.recorded_at < start {
                    return false;
                }
            }
            if let Some(end) = filter.end_time {
                if r.recorded_at > end {
                    return false;
                }
            }
            true
        })
        .cloned()
        .collect();

    // Apply offset and limit
    if let Some(offset) = filter.offset {
        results = results.into_iter().skip(offset).collect();
    }
    if let Some(limit) = filter.limit {
        results.truncate(limit);
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_core::metadata::ManagedIndexMetadata;
    use warden_core::policy::Policy;

    fn record_for(index: &str, policy_id: &str) -> HistoryRecord {
        let policy = Policy::from_json(&format!(
            r#"{{"policy_id": "{}", "default_state": "a",
                "states": [{{"name": "a", "actions": [], "transitions": []}}]}}"#,
            policy_id
        ))
        .unwrap();
        let meta = ManagedIndexMetadata::initial(index, format!("uuid-{}", index), &policy, 0, 0, Utc::now());
        HistoryRecord::snapshot(&meta, Utc::now())
    }

    #[tokio::test]
    async fn memory_storage_filters_by_policy() {
        let storage = MemoryStorage::new();
        storage.store(record_for("logs-1", "p1")).await.unwrap();
        storage.store(record_for("logs-2", "p2")).await.unwrap();

        let results = storage
            .query(HistoryFilter {
                policy_id: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].index, "logs-1");
    }

    #[tokio::test]
    async fn memory_storage_get_by_id() {
        let storage = MemoryStorage::new();
        let record = record_for("logs-1", "p1");
        let id = record.record_id;
        storage.store(record).await.unwrap();

        assert!(storage.get(id).await.unwrap().is_some());
        assert!(storage.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.log");
        let storage = FileStorage::new(path.to_str().unwrap()).unwrap();

        storage.store(record_for("logs-1", "p1")).await.unwrap();
        storage.store(record_for("logs-2", "p1")).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["index"], "logs-1");
    }
}
