//! # warden-sim
//!
//! An in-memory simulated cluster implementing the runtime's `IndexAdmin`
//! seam. Used by integration tests and the CLI's `simulate` command to run
//! whole policies end-to-end without a real cluster.
//!
//! Long-running backend work (merges, snapshots, relocations, recoveries,
//! rollup jobs) is modeled as a countdown of status polls: each poll
//! advances the work one step, so a step that waits on it reports
//! `condition_not_met` a configurable number of times before completing.
//! Tests can also inject canned answers for specific operations to exercise
//! retry and failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use warden_runtime::adapter::{
    AdminAck, IndexAdmin, IndexObservation, NotificationChannel, TaskProgress,
};

/// How a newly created simulated index looks.
#[derive(Debug, Clone)]
pub struct SimIndexSpec {
    pub doc_count: u64,
    pub size_bytes: u64,
    pub segment_count: u32,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Index age; the creation date is backdated by this much.
    pub age: ChronoDuration,
    /// Whether the index is the write target of a rollover alias.
    pub has_rollover_alias: bool,
}

impl Default for SimIndexSpec {
    fn default() -> Self {
        Self {
            doc_count: 0,
            size_bytes: 0,
            segment_count: 1,
            number_of_shards: 1,
            number_of_replicas: 1,
            age: ChronoDuration::zero(),
            has_rollover_alias: false,
        }
    }
}

#[derive(Debug, Clone)]
struct SimIndex {
    doc_count: u64,
    size_bytes: u64,
    segment_count: u32,
    number_of_shards: u32,
    number_of_replicas: u32,
    priority: u32,
    creation_date: DateTime<Utc>,
    is_open: bool,
    read_only: bool,
    has_rollover_alias: bool,
    rolled_over_at: Option<DateTime<Utc>>,
    allocation: AllocationRouting,
    /// In-flight force merge: polls left until the target is reached.
    merge: Option<InFlight>,
    /// In-flight shard relocation (shrink preparation).
    relocation: Option<InFlight>,
    /// In-flight recovery (freshly shrunken target).
    recovery: Option<InFlight>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct AllocationRouting {
    require: BTreeMap<String, String>,
    include: BTreeMap<String, String>,
    exclude: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct InFlight {
    polls_remaining: u32,
    /// Segment target, for merges.
    target: u32,
}

/// Latency knobs: how many status polls in-flight work takes.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub merge_polls: u32,
    pub snapshot_polls: u32,
    pub relocation_polls: u32,
    pub recovery_polls: u32,
    pub rollup_polls: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            merge_polls: 1,
            snapshot_polls: 1,
            relocation_polls: 1,
            recovery_polls: 1,
            rollup_polls: 1,
        }
    }
}

/// A canned answer injected for one operation.
#[derive(Debug, Clone)]
pub enum InjectedResponse {
    Busy(String),
    Rejected(String),
    /// Surface as a transport error (`Err`), not a typed ack.
    Error(String),
}

/// Read-only view of one simulated index, for test assertions.
#[derive(Debug, Clone)]
pub struct SimIndexView {
    pub doc_count: u64,
    pub size_bytes: u64,
    pub segment_count: u32,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub priority: u32,
    pub is_open: bool,
    pub read_only: bool,
    pub rolled_over: bool,
}

/// The simulated cluster.
pub struct SimCluster {
    options: SimOptions,
    indices: RwLock<HashMap<String, SimIndex>>,
    /// (repository, snapshot) -> polls remaining.
    snapshots: RwLock<HashMap<(String, String), u32>>,
    /// job id -> polls remaining.
    rollup_jobs: RwLock<HashMap<String, u32>>,
    /// operation name -> queued canned answers.
    injections: Mutex<HashMap<String, VecDeque<InjectedResponse>>>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::with_options(SimOptions::default())
    }

    pub fn with_options(options: SimOptions) -> Self {
        Self {
            options,
            indices: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            rollup_jobs: RwLock::new(HashMap::new()),
            injections: Mutex::new(HashMap::new()),
        }
    }

    /// Create an index in the cluster.
    pub fn create_index(&self, name: &str, spec: SimIndexSpec) {
        let mut indices = self.indices.write().unwrap();
        indices.insert(
            name.to_string(),
            SimIndex {
                doc_count: spec.doc_count,
                size_bytes: spec.size_bytes,
                segment_count: spec.segment_count,
                number_of_shards: spec.number_of_shards,
                number_of_replicas: spec.number_of_replicas,
                priority: 1,
                creation_date: Utc::now() - spec.age,
                is_open: true,
                read_only: false,
                has_rollover_alias: spec.has_rollover_alias,
                rolled_over_at: None,
                allocation: AllocationRouting::default(),
                merge: None,
                relocation: None,
                recovery: None,
            },
        );
    }

    /// Add documents to an index (grows size proportionally).
    pub fn add_docs(&self, name: &str, docs: u64, bytes: u64) {
        let mut indices = self.indices.write().unwrap();
        if let Some(index) = indices.get_mut(name) {
            index.doc_count += docs;
            index.size_bytes += bytes;
        }
    }

    /// Read-only view of an index, for assertions.
    pub fn index(&self, name: &str) -> Option<SimIndexView> {
        let indices = self.indices.read().unwrap();
        indices.get(name).map(|i| SimIndexView {
            doc_count: i.doc_count,
            size_bytes: i.size_bytes,
            segment_count: i.segment_count,
            number_of_shards: i.number_of_shards,
            number_of_replicas: i.number_of_replicas,
            priority: i.priority,
            is_open: i.is_open,
            read_only: i.read_only,
            rolled_over: i.rolled_over_at.is_some(),
        })
    }

    pub fn index_exists(&self, name: &str) -> bool {
        self.indices.read().unwrap().contains_key(name)
    }

    /// Queue a canned answer for the next `times` calls of `operation`
    /// (operation names match the `IndexAdmin` method names).
    pub fn inject(&self, operation: &str, response: InjectedResponse, times: u32) {
        let mut injections = self.injections.lock().unwrap();
        let queue = injections.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(response.clone());
        }
    }

    /// Take the next injected answer for an operation, if any.
    fn take_injection(&self, operation: &str) -> Option<InjectedResponse> {
        let mut injections = self.injections.lock().unwrap();
        injections.get_mut(operation).and_then(|q| q.pop_front())
    }

    /// Apply an injection as an ack, or run the real operation.
    fn injected_ack(&self, operation: &str) -> Option<anyhow::Result<AdminAck>> {
        match self.take_injection(operation)? {
            InjectedResponse::Busy(m) => Some(Ok(AdminAck::Busy(m))),
            InjectedResponse::Rejected(m) => Some(Ok(AdminAck::Rejected(m))),
            InjectedResponse::Error(m) => Some(Err(anyhow::anyhow!(m))),
        }
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexAdmin for SimCluster {
    async fn observe(&self, index: &str) -> anyhow::Result<Option<IndexObservation>> {
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(None);
        };

        // Each observation advances an in-flight merge one step.
        if let Some(merge) = idx.merge.as_mut() {
            if merge.polls_remaining > 0 {
                merge.polls_remaining -= 1;
            }
            if merge.polls_remaining == 0 {
                idx.segment_count = merge.target;
                idx.merge = None;
            }
        }

        Ok(Some(IndexObservation {
            doc_count: idx.doc_count,
            size_bytes: idx.size_bytes,
            creation_date: idx.creation_date,
            segment_count: idx.segment_count,
            is_open: idx.is_open,
            read_only: idx.read_only,
            number_of_shards: idx.number_of_shards,
            number_of_replicas: idx.number_of_replicas,
            has_rollover_alias: idx.has_rollover_alias,
            rolled_over_at: idx.rolled_over_at,
        }))
    }

    async fn set_read_only(&self, index: &str, read_only: bool) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("set_read_only") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.read_only == read_only {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.read_only = read_only;
        Ok(AdminAck::Acknowledged)
    }

    async fn set_replica_count(&self, index: &str, replicas: u32) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("set_replica_count") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.number_of_replicas == replicas {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.number_of_replicas = replicas;
        Ok(AdminAck::Acknowledged)
    }

    async fn set_index_priority(&self, index: &str, priority: u32) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("set_index_priority") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.priority == priority {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.priority = priority;
        Ok(AdminAck::Acknowledged)
    }

    async fn set_allocation(
        &self,
        index: &str,
        require: &BTreeMap<String, String>,
        include: &BTreeMap<String, String>,
        exclude: &BTreeMap<String, String>,
    ) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("set_allocation") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        let routing = AllocationRouting {
            require: require.clone(),
            include: include.clone(),
            exclude: exclude.clone(),
        };
        if idx.allocation == routing {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.allocation = routing;
        Ok(AdminAck::Acknowledged)
    }

    async fn close_index(&self, index: &str) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("close_index") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if !idx.is_open {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.is_open = false;
        Ok(AdminAck::Acknowledged)
    }

    async fn open_index(&self, index: &str) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("open_index") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.is_open {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.is_open = true;
        Ok(AdminAck::Acknowledged)
    }

    async fn delete_index(&self, index: &str) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("delete_index") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        if indices.remove(index).is_none() {
            return Ok(AdminAck::AlreadyDone);
        }
        Ok(AdminAck::Acknowledged)
    }

    async fn rollover(&self, index: &str) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("rollover") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if !idx.has_rollover_alias {
            return Ok(AdminAck::Rejected(format!(
                "index '{}' is not the write target of a rollover alias",
                index
            )));
        }
        if idx.rolled_over_at.is_some() {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.rolled_over_at = Some(Utc::now());
        Ok(AdminAck::Acknowledged)
    }

    async fn force_merge(&self, index: &str, max_num_segments: u32) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("force_merge") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.segment_count <= max_num_segments {
            return Ok(AdminAck::AlreadyDone);
        }
        if idx.merge.is_some() {
            return Ok(AdminAck::Busy("merge already in progress".to_string()));
        }
        idx.merge = Some(InFlight {
            polls_remaining: self.options.merge_polls,
            target: max_num_segments,
        });
        Ok(AdminAck::Acknowledged)
    }

    async fn create_snapshot(
        &self,
        repository: &str,
        snapshot: &str,
        index: &str,
    ) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("create_snapshot") {
            return ack;
        }
        if !self.index_exists(index) {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        }
        let mut snapshots = self.snapshots.write().unwrap();
        let key = (repository.to_string(), snapshot.to_string());
        if snapshots.contains_key(&key) {
            return Ok(AdminAck::AlreadyDone);
        }
        snapshots.insert(key, self.options.snapshot_polls);
        Ok(AdminAck::Acknowledged)
    }

    async fn snapshot_status(
        &self,
        repository: &str,
        snapshot: &str,
    ) -> anyhow::Result<TaskProgress> {
        let mut snapshots = self.snapshots.write().unwrap();
        let key = (repository.to_string(), snapshot.to_string());
        match snapshots.get_mut(&key) {
            None => Ok(TaskProgress::Failed(format!(
                "unknown snapshot '{}/{}'",
                repository, snapshot
            ))),
            Some(polls) => {
                if *polls > 0 {
                    *polls -= 1;
                }
                Ok(if *polls == 0 {
                    TaskProgress::Done
                } else {
                    TaskProgress::InProgress
                })
            }
        }
    }

    async fn prepare_shrink(&self, index: &str) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("prepare_shrink") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if idx.relocation.is_some() {
            return Ok(AdminAck::AlreadyDone);
        }
        idx.read_only = true;
        idx.relocation = Some(InFlight {
            polls_remaining: self.options.relocation_polls,
            target: 0,
        });
        Ok(AdminAck::Acknowledged)
    }

    async fn relocation_done(&self, index: &str) -> anyhow::Result<bool> {
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(false);
        };
        match idx.relocation.as_mut() {
            None => Ok(false),
            Some(relocation) => {
                if relocation.polls_remaining > 0 {
                    relocation.polls_remaining -= 1;
                }
                Ok(relocation.polls_remaining == 0)
            }
        }
    }

    async fn shrink(&self, index: &str, target: &str, num_shards: u32) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("shrink") {
            return ack;
        }
        let mut indices = self.indices.write().unwrap();
        if indices.contains_key(target) {
            return Ok(AdminAck::AlreadyDone);
        }
        let Some(source) = indices.get(index).cloned() else {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        };
        if source.relocation.is_none() {
            return Ok(AdminAck::Busy(
                "source shards are not colocated yet".to_string(),
            ));
        }
        indices.insert(
            target.to_string(),
            SimIndex {
                number_of_shards: num_shards,
                creation_date: Utc::now(),
                has_rollover_alias: false,
                rolled_over_at: None,
                merge: None,
                relocation: None,
                recovery: Some(InFlight {
                    polls_remaining: self.options.recovery_polls,
                    target: 0,
                }),
                ..source
            },
        );
        Ok(AdminAck::Acknowledged)
    }

    async fn recovery_done(&self, index: &str) -> anyhow::Result<bool> {
        let mut indices = self.indices.write().unwrap();
        let Some(idx) = indices.get_mut(index) else {
            return Ok(false);
        };
        match idx.recovery.as_mut() {
            None => Ok(true),
            Some(recovery) => {
                if recovery.polls_remaining > 0 {
                    recovery.polls_remaining -= 1;
                }
                if recovery.polls_remaining == 0 {
                    idx.recovery = None;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn start_rollup_job(
        &self,
        job_id: &str,
        index: &str,
        _config: &serde_json::Value,
    ) -> anyhow::Result<AdminAck> {
        if let Some(ack) = self.injected_ack("start_rollup_job") {
            return ack;
        }
        if !self.index_exists(index) {
            return Ok(AdminAck::Rejected(format!("no such index '{}'", index)));
        }
        let mut jobs = self.rollup_jobs.write().unwrap();
        if jobs.contains_key(job_id) {
            return Ok(AdminAck::AlreadyDone);
        }
        jobs.insert(job_id.to_string(), self.options.rollup_polls);
        Ok(AdminAck::Acknowledged)
    }

    async fn rollup_job_status(&self, job_id: &str) -> anyhow::Result<TaskProgress> {
        let mut jobs = self.rollup_jobs.write().unwrap();
        match jobs.get_mut(job_id) {
            None => Ok(TaskProgress::Failed(format!("unknown rollup job '{}'", job_id))),
            Some(polls) => {
                if *polls > 0 {
                    *polls -= 1;
                }
                Ok(if *polls == 0 {
                    TaskProgress::Done
                } else {
                    TaskProgress::InProgress
                })
            }
        }
    }
}

/// Notification channel that records every message, for assertions.
pub struct RecordingNotificationChannel {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotificationChannel {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    /// All `(channel, message)` pairs sent so far.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }
}

impl Default for RecordingNotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotificationChannel {
    async fn send(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let cluster = SimCluster::new();
        cluster.create_index("logs-1", SimIndexSpec::default());

        assert_eq!(
            cluster.close_index("logs-1").await.unwrap(),
            AdminAck::Acknowledged
        );
        assert_eq!(
            cluster.close_index("logs-1").await.unwrap(),
            AdminAck::AlreadyDone
        );
        assert!(!cluster.index("logs-1").unwrap().is_open);
    }

    #[tokio::test]
    async fn merge_finishes_after_configured_polls() {
        let cluster = SimCluster::with_options(SimOptions {
            merge_polls: 2,
            ..Default::default()
        });
        cluster.create_index(
            "logs-1",
            SimIndexSpec {
                segment_count: 5,
                ..Default::default()
            },
        );

        assert_eq!(
            cluster.force_merge("logs-1", 1).await.unwrap(),
            AdminAck::Acknowledged
        );
        // First observation: still merging.
        let obs = cluster.observe("logs-1").await.unwrap().unwrap();
        assert_eq!(obs.segment_count, 5);
        // Second observation: done.
        let obs = cluster.observe("logs-1").await.unwrap().unwrap();
        assert_eq!(obs.segment_count, 1);
    }

    #[tokio::test]
    async fn rollover_requires_an_alias() {
        let cluster = SimCluster::new();
        cluster.create_index("logs-1", SimIndexSpec::default());
        assert!(matches!(
            cluster.rollover("logs-1").await.unwrap(),
            AdminAck::Rejected(_)
        ));

        cluster.create_index(
            "logs-2",
            SimIndexSpec {
                has_rollover_alias: true,
                ..Default::default()
            },
        );
        assert_eq!(cluster.rollover("logs-2").await.unwrap(), AdminAck::Acknowledged);
        assert_eq!(cluster.rollover("logs-2").await.unwrap(), AdminAck::AlreadyDone);
    }

    #[tokio::test]
    async fn injections_take_precedence() {
        let cluster = SimCluster::new();
        cluster.create_index("logs-1", SimIndexSpec::default());
        cluster.inject("close_index", InjectedResponse::Busy("shard moving".into()), 1);

        assert!(matches!(
            cluster.close_index("logs-1").await.unwrap(),
            AdminAck::Busy(_)
        ));
        // The injection is consumed; the real operation runs next.
        assert_eq!(
            cluster.close_index("logs-1").await.unwrap(),
            AdminAck::Acknowledged
        );
    }
}
