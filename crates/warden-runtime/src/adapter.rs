//! Adapter seams for the external substrates the engine depends on.
//!
//! The engine treats every administrative call as an opaque, retryable,
//! at-least-once operation. Each trait method maps to exactly one call; a
//! step awaits at most one of them per tick.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Outcome of one administrative call.
///
/// `AlreadyDone` is how idempotent calls report "the target was already in
/// the requested state". Steps treat it as success, never as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminAck {
    /// The call was accepted and applied.
    Acknowledged,
    /// The target was already in the requested state.
    AlreadyDone,
    /// A concurrent operation blocks this call; retry on a later tick.
    Busy(String),
    /// The call is permanently invalid against the current target.
    Rejected(String),
}

/// Progress of a long-running backend task (snapshot, rollup job).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskProgress {
    InProgress,
    Done,
    Failed(String),
}

/// A point-in-time observation of a managed index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexObservation {
    pub doc_count: u64,
    pub size_bytes: u64,
    pub creation_date: DateTime<Utc>,
    pub segment_count: u32,
    pub is_open: bool,
    pub read_only: bool,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Whether the index is the write target of an alias (rollover target).
    pub has_rollover_alias: bool,
    /// When the index rolled over, if it has.
    pub rolled_over_at: Option<DateTime<Utc>>,
}

/// Administrative operations against the cluster hosting managed indices.
///
/// Implementations must not block indefinitely: every method evaluates one
/// observation or issues one call and returns. Transport and unexpected
/// failures surface as `Err`; expected backend answers surface as the typed
/// acks above so steps can classify them.
#[async_trait]
pub trait IndexAdmin: Send + Sync {
    /// Observe the current state of an index. `None` if it no longer exists.
    async fn observe(&self, index: &str) -> anyhow::Result<Option<IndexObservation>>;

    /// Set or clear the index write block.
    async fn set_read_only(&self, index: &str, read_only: bool) -> anyhow::Result<AdminAck>;

    /// Update the replica count setting.
    async fn set_replica_count(&self, index: &str, replicas: u32) -> anyhow::Result<AdminAck>;

    /// Update the recovery priority setting.
    async fn set_index_priority(&self, index: &str, priority: u32) -> anyhow::Result<AdminAck>;

    /// Update allocation routing attributes.
    async fn set_allocation(
        &self,
        index: &str,
        require: &BTreeMap<String, String>,
        include: &BTreeMap<String, String>,
        exclude: &BTreeMap<String, String>,
    ) -> anyhow::Result<AdminAck>;

    async fn close_index(&self, index: &str) -> anyhow::Result<AdminAck>;

    async fn open_index(&self, index: &str) -> anyhow::Result<AdminAck>;

    async fn delete_index(&self, index: &str) -> anyhow::Result<AdminAck>;

    /// Roll the alias over to a new write index.
    async fn rollover(&self, index: &str) -> anyhow::Result<AdminAck>;

    /// Start a force-merge down to `max_num_segments` segments.
    async fn force_merge(&self, index: &str, max_num_segments: u32) -> anyhow::Result<AdminAck>;

    /// Start a snapshot of the index into the repository.
    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        index: &str,
    ) -> anyhow::Result<AdminAck>;

    /// Progress of a previously started snapshot.
    async fn snapshot_status(
        &self,
        repository: &str,
        snapshot: &str,
    ) -> anyhow::Result<TaskProgress>;

    /// Relocate all shards of the index onto a single node and block writes,
    /// in preparation for a shrink.
    async fn prepare_shrink(&self, index: &str) -> anyhow::Result<AdminAck>;

    /// Whether shard relocation started by `prepare_shrink` has finished.
    async fn relocation_done(&self, index: &str) -> anyhow::Result<bool>;

    /// Shrink the index into `target` with `num_shards` primary shards.
    async fn shrink(&self, index: &str, target: &str, num_shards: u32) -> anyhow::Result<AdminAck>;

    /// Whether the shrunken target index has fully recovered.
    async fn recovery_done(&self, index: &str) -> anyhow::Result<bool>;

    /// Create and start a rollup job over the index.
    async fn start_rollup_job(
        &self,
        job_id: &str,
        index: &str,
        config: &serde_json::Value,
    ) -> anyhow::Result<AdminAck>;

    /// Progress of a previously started rollup job.
    async fn rollup_job_status(&self, job_id: &str) -> anyhow::Result<TaskProgress>;
}

/// Delivery seam for rendered notification messages.
///
/// The engine only renders templates and hands the result off; routing,
/// formatting per destination, and retries live behind this trait.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, channel: &str, message: &str) -> anyhow::Result<()>;
}

/// Notification channel that logs instead of delivering.
pub struct LogNotificationChannel;

#[async_trait]
impl NotificationChannel for LogNotificationChannel {
    async fn send(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        tracing::info!(channel = %channel, message = %message, "notification");
        Ok(())
    }
}
