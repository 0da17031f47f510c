//! History logger implementation.
//!
//! Provides the `HistoryLogger` facade the runner writes through, plus the
//! filter type used to query stored records.

use std::sync::Arc;
use warden_core::config::HistoryConfig;

use crate::error::HistoryError;
use crate::record::HistoryRecord;
use crate::storage::{self, HistoryStorage, MemoryStorage, NullStorage};

/// The main history logger.
///
/// Thin facade over a storage backend; respects the `enabled` flag so the
/// runner never has to branch on configuration.
pub struct HistoryLogger {
    config: HistoryConfig,
    storage: Arc<dyn HistoryStorage>,
}

impl HistoryLogger {
    /// Create a new history logger with the given configuration.
    pub fn new(config: HistoryConfig) -> Result<Self, HistoryError> {
        let storage: Arc<dyn HistoryStorage> = if config.enabled {
            storage::create_storage(&config)?.into()
        } else {
            Arc::new(NullStorage)
        };
        Ok(Self { config, storage })
    }

    /// Create a logger with a custom storage backend.
    pub fn with_storage(config: HistoryConfig, storage: Arc<dyn HistoryStorage>) -> Self {
        Self { config, storage }
    }

    /// Create a disabled (no-op) logger.
    pub fn disabled() -> Self {
        Self {
            config: HistoryConfig {
                enabled: false,
                ..Default::default()
            },
            storage: Arc::new(NullStorage),
        }
    }

    /// Create an in-memory logger (useful for tests and the simulator).
    pub fn in_memory() -> Self {
        Self {
            config: HistoryConfig::default(),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Check if logging is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Append a history record.
    pub async fn record(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        if !self.config.enabled {
            return Ok(());
        }

        tracing::debug!(
            record_id = %record.record_id,
            index = %record.index,
            policy_id = %record.policy_id,
            step = record.step.as_deref().unwrap_or("-"),
            "History record"
        );

        self.storage.store(record).await
    }

    /// Query history records with filters.
    pub async fn query(&self, filter: HistoryFilter) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.storage.query(filter).await
    }

    /// Get recent records for one managed index.
    pub async fn recent_for_index(
        &self,
        index_uuid: &str,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        self.query(HistoryFilter {
            index_uuid: Some(index_uuid.to_string()),
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }
}

/// Filter for querying history records.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Filter by index name.
    pub index: Option<String>,
    /// Filter by index UUID.
    pub index_uuid: Option<String>,
    /// Filter by policy id.
    pub policy_id: Option<String>,
    /// Filter by state name.
    pub state: Option<String>,
    /// Filter by step status.
    pub step_status: Option<warden_core::metadata::StepStatus>,
    /// Filter by start time.
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Filter by end time.
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Offset for pagination.
    pub offset: Option<usize>,
}
