//! # warden-core
//!
//! Wire-contract document models shared across all Warden crates: the
//! policy document, the per-index managed metadata ("program counter"), and
//! the ambient engine configuration.
//!
//! Policies and metadata are JSON documents; their field names are part of
//! the wire contract and gated by `schema_version`. Everything here is plain
//! data; validation lives in `warden-policy` and execution in
//! `warden-runtime`.

pub mod config;
pub mod duration;
pub mod metadata;
pub mod policy;

pub use config::{ConfigError, EngineConfig, HistoryBackend, HistoryConfig};
pub use metadata::{
    ActionMetadata, ActionProperties, ManagedIndexMetadata, RetryInfo, ShrinkProperties,
    StateMetadata, StepMetadata, StepStatus, ValidationResult, ValidationStatus,
};
pub use policy::{
    Action, ActionKind, ActionRetry, AllocationConfig, Backoff, CloseConfig, DeleteConfig,
    ErrorNotification, ForceMergeConfig, IndexPriorityConfig, NotificationConfig, OpenConfig,
    Policy, ReadOnlyConfig, ReadWriteConfig, ReplicaCountConfig, RolloverConfig, RollupConfig,
    ShrinkConfig, SnapshotConfig, State, Transition, TransitionConditions,
};
