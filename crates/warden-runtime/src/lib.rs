//! # warden-runtime
//!
//! The policy execution engine: given a validated policy and a managed
//! index's persisted metadata, each scheduled tick selects exactly one step,
//! executes it against the cluster, applies timeout and retry policy, and
//! persists the updated metadata under optimistic concurrency.
//!
//! External substrates are trait seams:
//! - [`adapter::IndexAdmin`]: administrative calls against the cluster
//! - [`store::MetadataStore`]: versioned CAS document store
//! - [`adapter::NotificationChannel`]: rendered-message hand-off
//!
//! The engine holds no cross-index shared state; the metadata document is
//! the sole synchronization point.

pub mod adapter;
pub mod registry;
pub mod runner;
pub mod selector;
pub mod steps;
pub mod store;
pub mod transition;

pub use adapter::{
    AdminAck, IndexAdmin, IndexObservation, LogNotificationChannel, NotificationChannel,
    TaskProgress,
};
pub use registry::{ActionRegistry, StepName};
pub use runner::{Explain, Runner, TickContext, TickOutcome};
pub use selector::{select_step, Selection};
pub use steps::{execute_step, StepContext, StepOutcome};
pub use store::{InMemoryMetadataStore, MetadataStore, StoreError};
