//! End-to-end engine scenarios against the simulated cluster.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use warden_core::metadata::{ManagedIndexMetadata, StepStatus};
use warden_core::policy::Policy;
use warden_history::{HistoryFilter, HistoryLogger};
use warden_policy::PolicyValidator;
use warden_runtime::{
    ActionRegistry, IndexAdmin, InMemoryMetadataStore, MetadataStore, Runner, StepName,
    TickContext, TickOutcome,
};
use warden_sim::{
    InjectedResponse, RecordingNotificationChannel, SimCluster, SimIndexSpec, SimOptions,
};

struct Harness {
    cluster: Arc<SimCluster>,
    store: Arc<InMemoryMetadataStore>,
    notifications: Arc<RecordingNotificationChannel>,
    history: Arc<HistoryLogger>,
    runner: Runner,
    policy: Policy,
}

impl Harness {
    fn new(policy_json: &str) -> Self {
        Self::with_options(policy_json, SimOptions::default())
    }

    fn with_options(policy_json: &str, options: SimOptions) -> Self {
        let policy = Policy::from_json(policy_json).expect("policy must parse");
        PolicyValidator::new()
            .validate(&policy)
            .expect("policy must validate");

        let cluster = Arc::new(SimCluster::with_options(options));
        let store = Arc::new(InMemoryMetadataStore::new());
        let notifications = Arc::new(RecordingNotificationChannel::new());
        let history = Arc::new(HistoryLogger::in_memory());
        let runner = Runner::new(
            ActionRegistry::new(),
            cluster.clone(),
            store.clone(),
            notifications.clone(),
            history.clone(),
        );
        Self {
            cluster,
            store,
            notifications,
            history,
            runner,
            policy,
        }
    }

    async fn tick(&self, index: &str, uuid: &str) -> TickOutcome {
        self.runner
            .run_tick(&TickContext {
                index,
                index_uuid: uuid,
                policy: &self.policy,
                policy_seq_no: 1,
                policy_primary_term: 1,
            })
            .await
            .expect("tick must not error")
    }

    async fn metadata(&self, uuid: &str) -> ManagedIndexMetadata {
        self.store.get(uuid).await.unwrap().expect("metadata must exist").0
    }
}

fn executed(step: StepName, status: StepStatus) -> TickOutcome {
    TickOutcome::StepExecuted { step, status }
}

// =============================================================================
// Close-only policy: attach, execute, complete, then no-op.
// =============================================================================

#[tokio::test]
async fn close_policy_runs_to_completion() {
    let harness = Harness::new(
        r#"{"policy_id": "close-only", "default_state": "closed",
            "states": [{"name": "closed", "actions": [{"close": {}}], "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    // Tick 1 attaches the policy.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    let meta = harness.metadata("u1").await;
    assert_eq!(meta.state.as_ref().unwrap().name, "closed");
    assert!(!meta.policy_completed);

    // Tick 2 closes the index; the state has no transitions, so the policy
    // completes in the same tick.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
    assert!(!harness.cluster.index("logs-1").unwrap().is_open);
    let meta = harness.metadata("u1").await;
    assert!(meta.policy_completed);
    assert_eq!(meta.step.as_ref().unwrap().step_status, StepStatus::Completed);

    // Tick 3 is a no-op.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::AlreadyCompleted);
}

// =============================================================================
// Force merge: read-only, start the merge, poll it down to one segment.
// =============================================================================

#[tokio::test]
async fn force_merge_polls_until_segments_reach_target() {
    let harness = Harness::with_options(
        r#"{"policy_id": "compact", "default_state": "warm",
            "states": [{"name": "warm",
                "actions": [{"force_merge": {"max_num_segments": 1}}],
                "transitions": []}]}"#,
        SimOptions {
            merge_polls: 2,
            ..Default::default()
        },
    );
    harness.cluster.create_index(
        "logs-1",
        SimIndexSpec {
            segment_count: 3,
            ..Default::default()
        },
    );

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::SetReadOnly, StepStatus::Completed)
    );
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::CallForceMerge, StepStatus::Completed)
    );

    // The merge is still in flight; the action's scratch state holds the
    // segment target.
    let meta = harness.metadata("u1").await;
    assert_eq!(
        meta.action.as_ref().unwrap().properties.as_ref().unwrap().max_num_segments,
        Some(1)
    );
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::WaitForForceMerge, StepStatus::ConditionNotMet)
    );

    // Merge finished: the action completes and, with no transitions, so
    // does the policy. Scratch state is cleared with the action.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
    let index = harness.cluster.index("logs-1").unwrap();
    assert_eq!(index.segment_count, 1);
    assert!(index.read_only);
    let meta = harness.metadata("u1").await;
    assert!(meta.action.as_ref().unwrap().properties.is_none());
}

// =============================================================================
// Multi-action state: the runner advances one action per tick boundary.
// =============================================================================

#[tokio::test]
async fn state_executes_actions_in_order() {
    let harness = Harness::new(
        r#"{"policy_id": "tighten", "default_state": "warm",
            "states": [{"name": "warm",
                "actions": [
                    {"read_only": {}},
                    {"replica_count": {"number_of_replicas": 0}}
                ],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::SetReadOnly, StepStatus::Completed)
    );
    // The completed action hands over to the next one.
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::SetReplicaCount, StepStatus::Starting)
    );
    let meta = harness.metadata("u1").await;
    assert_eq!(meta.action.as_ref().unwrap().name, "replica_count");
    assert_eq!(meta.action.as_ref().unwrap().index, 1);

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
    let index = harness.cluster.index("logs-1").unwrap();
    assert!(index.read_only);
    assert_eq!(index.number_of_replicas, 0);
}

// =============================================================================
// Transitions: doc-count condition holds the index until data arrives.
// =============================================================================

#[tokio::test]
async fn doc_count_transition_fires_once_docs_arrive() {
    let harness = Harness::new(
        r#"{"policy_id": "age-out", "default_state": "first",
            "states": [
                {"name": "first", "actions": [],
                 "transitions": [{"state_name": "second", "conditions": {"min_doc_count": 5}}]},
                {"name": "second", "actions": [], "transitions": []}
            ]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    // 0 docs: the condition does not hold.
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::AttemptTransition, StepStatus::ConditionNotMet)
    );

    harness.cluster.add_docs("logs-1", 6, 600);

    assert_eq!(
        harness.tick("logs-1", "u1").await,
        TickOutcome::TransitionReady {
            to: "second".to_string()
        }
    );
    // The recorded transition is applied on the following tick.
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        TickOutcome::Transitioned {
            to: "second".to_string()
        }
    );
    let meta = harness.metadata("u1").await;
    assert_eq!(meta.state.as_ref().unwrap().name, "second");
    assert!(meta.action.is_none());

    // "second" has no actions and no transitions left.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
}

// =============================================================================
// Rollover: conditions gate the call; the rollover feeds rollover_age.
// =============================================================================

#[tokio::test]
async fn rollover_then_rollover_age_transition() {
    let harness = Harness::new(
        r#"{"policy_id": "hot-cold", "default_state": "hot",
            "states": [
                {"name": "hot",
                 "actions": [{"rollover": {"min_doc_count": 3}}],
                 "transitions": [{"state_name": "cold", "conditions": {"rollover_age": "0s"}}]},
                {"name": "cold", "actions": [{"read_only": {}}], "transitions": []}
            ]}"#,
    );
    harness.cluster.create_index(
        "logs-000001",
        SimIndexSpec {
            has_rollover_alias: true,
            ..Default::default()
        },
    );

    assert_eq!(harness.tick("logs-000001", "u1").await, TickOutcome::Initialized);
    // Below the doc threshold: the step politely waits.
    assert_eq!(
        harness.tick("logs-000001", "u1").await,
        executed(StepName::AttemptRollover, StepStatus::ConditionNotMet)
    );

    harness.cluster.add_docs("logs-000001", 5, 500);

    // Rollover executes. The inline transition check still sees the
    // pre-rollover observation, so the state change waits a tick.
    assert_eq!(
        harness.tick("logs-000001", "u1").await,
        executed(StepName::AttemptRollover, StepStatus::Completed)
    );
    let meta = harness.metadata("u1").await;
    assert_eq!(meta.rolled_over, Some(true));

    assert_eq!(
        harness.tick("logs-000001", "u1").await,
        TickOutcome::TransitionReady {
            to: "cold".to_string()
        }
    );
    assert_eq!(
        harness.tick("logs-000001", "u1").await,
        TickOutcome::Transitioned {
            to: "cold".to_string()
        }
    );
    assert_eq!(harness.tick("logs-000001", "u1").await, TickOutcome::PolicyCompleted);
    assert!(harness.cluster.index("logs-000001").unwrap().read_only);
}

// =============================================================================
// Shrink: four steps, scratch state carries the target across ticks.
// =============================================================================

#[tokio::test]
async fn shrink_creates_target_index() {
    let harness = Harness::new(
        r#"{"policy_id": "shrink", "default_state": "cold",
            "states": [{"name": "cold",
                "actions": [{"shrink": {"num_new_shards": 1}}],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index(
        "logs-1",
        SimIndexSpec {
            number_of_shards: 2,
            ..Default::default()
        },
    );

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::MoveShards, StepStatus::Completed)
    );
    let meta = harness.metadata("u1").await;
    let shrink = meta
        .action
        .as_ref()
        .unwrap()
        .properties
        .as_ref()
        .unwrap()
        .shrink
        .clone()
        .unwrap();
    assert_eq!(shrink.target_index, "logs-1_shrunken");
    assert_eq!(shrink.target_num_shards, 1);

    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::WaitForMoveShards, StepStatus::Completed)
    );
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::AttemptShrink, StepStatus::Completed)
    );
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);

    let target = harness.cluster.index("logs-1_shrunken").unwrap();
    assert_eq!(target.number_of_shards, 1);
}

// =============================================================================
// Snapshot: generated name is carried in action properties.
// =============================================================================

#[tokio::test]
async fn snapshot_waits_for_backend_completion() {
    let harness = Harness::new(
        r#"{"policy_id": "backup", "default_state": "safe",
            "states": [{"name": "safe",
                "actions": [{"snapshot": {"repository": "backups", "snapshot": "logs"}}],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::AttemptSnapshot, StepStatus::Completed)
    );
    let meta = harness.metadata("u1").await;
    let name = meta
        .action
        .as_ref()
        .unwrap()
        .properties
        .as_ref()
        .unwrap()
        .snapshot_name
        .clone()
        .unwrap();
    assert!(name.starts_with("logs-"));

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
}

// =============================================================================
// Retry accounting: maxRetries+1 failures stick the index until cleared.
// =============================================================================

#[tokio::test]
async fn retries_exhaust_then_explicit_retry_resumes() {
    let harness = Harness::new(
        r#"{"policy_id": "close-flaky", "default_state": "closed",
            "error_notification": {"channel": "ops",
                "message_template": "{{index}} failed: {{cause}}"},
            "states": [{"name": "closed",
                "actions": [{"retry": {"count": 2, "delay": "0s"}, "close": {}}],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());
    harness.cluster.inject(
        "close_index",
        InjectedResponse::Rejected("blocked by a concurrent restore".into()),
        3,
    );

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);

    // Failure 1 and 2 consume the retry budget.
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::CloseIndex, StepStatus::Failed)
    );
    assert_eq!(harness.metadata("u1").await.action.unwrap().consumed_retries, 1);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::CloseIndex, StepStatus::Failed)
    );
    assert_eq!(harness.metadata("u1").await.action.unwrap().consumed_retries, 2);

    // Failure 3 exhausts it: the whole index is stuck.
    let outcome = harness.tick("logs-1", "u1").await;
    assert!(matches!(outcome, TickOutcome::Failed { .. }));
    let meta = harness.metadata("u1").await;
    assert!(meta.retry_info.failed);
    assert!(meta.info.get("cause").is_some());

    // The error notification was rendered and handed off.
    let messages = harness.notifications.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "ops");
    assert!(messages[0].1.contains("logs-1"));

    // Further ticks are no-ops until the operator intervenes.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Stuck);
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Stuck);

    // Explicit retry clears the marker and execution resumes.
    assert!(harness.runner.retry_failed("u1").await.unwrap());
    let meta = harness.metadata("u1").await;
    assert!(!meta.retry_info.failed);
    assert_eq!(meta.action.as_ref().unwrap().consumed_retries, 0);

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
    assert!(!harness.cluster.index("logs-1").unwrap().is_open);
}

// =============================================================================
// Backoff: a failed step is not re-executed before its delay elapses.
// =============================================================================

#[tokio::test]
async fn failed_step_backs_off_between_retries() {
    let harness = Harness::new(
        r#"{"policy_id": "close-backoff", "default_state": "closed",
            "states": [{"name": "closed",
                "actions": [{"retry": {"count": 3, "delay": "1h"}, "close": {}}],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());
    harness
        .cluster
        .inject("close_index", InjectedResponse::Rejected("transient".into()), 1);

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(
        harness.tick("logs-1", "u1").await,
        executed(StepName::CloseIndex, StepStatus::Failed)
    );

    // The hour-long delay has not elapsed; the tick persists an observation
    // and does nothing else.
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::AwaitingRetry);
    assert!(harness.cluster.index("logs-1").unwrap().is_open);
}

// =============================================================================
// Timeout: a backdated action start fails the index regardless of outcome.
// =============================================================================

#[tokio::test]
async fn action_timeout_bypasses_retry_budget() {
    let harness = Harness::new(
        r#"{"policy_id": "hot", "default_state": "hot",
            "states": [{"name": "hot",
                "actions": [{"timeout": "1h",
                             "rollover": {"min_doc_count": 1000000}}],
                "transitions": []}]}"#,
    );
    harness.cluster.create_index(
        "logs-000001",
        SimIndexSpec {
            has_rollover_alias: true,
            ..Default::default()
        },
    );

    assert_eq!(harness.tick("logs-000001", "u1").await, TickOutcome::Initialized);
    // Conditions unmet: the step waits, consuming no retries.
    assert_eq!(
        harness.tick("logs-000001", "u1").await,
        executed(StepName::AttemptRollover, StepStatus::ConditionNotMet)
    );

    // Backdate the action start past the timeout.
    let (mut meta, version) = harness.store.get("u1").await.unwrap().unwrap();
    meta.action.as_mut().unwrap().start_time = Utc::now() - ChronoDuration::hours(2);
    harness.store.put("u1", &meta, Some(version)).await.unwrap();

    let outcome = harness.tick("logs-000001", "u1").await;
    match outcome {
        TickOutcome::Failed { cause } => assert!(cause.contains("timeout")),
        other => panic!("expected timeout failure, got {:?}", other),
    }
    assert!(harness.metadata("u1").await.retry_info.failed);
    assert_eq!(harness.tick("logs-000001", "u1").await, TickOutcome::Stuck);
}

// =============================================================================
// Idempotence: a step against an already-satisfied backend completes.
// =============================================================================

#[tokio::test]
async fn read_only_step_completes_when_already_read_only() {
    let harness = Harness::new(
        r#"{"policy_id": "freeze", "default_state": "frozen",
            "states": [{"name": "frozen", "actions": [{"read_only": {}}], "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());
    // Put the index into the target state out of band.
    harness.cluster.set_read_only("logs-1", true).await.unwrap();

    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::Initialized);
    assert_eq!(harness.tick("logs-1", "u1").await, TickOutcome::PolicyCompleted);
    let meta = harness.metadata("u1").await;
    assert_eq!(meta.step.as_ref().unwrap().step_status, StepStatus::Completed);
}

// =============================================================================
// History: terminal statuses are recorded, polling ticks are not.
// =============================================================================

#[tokio::test]
async fn history_skips_polling_noise() {
    let harness = Harness::new(
        r#"{"policy_id": "age-out", "default_state": "first",
            "states": [
                {"name": "first", "actions": [{"close": {}}],
                 "transitions": [{"state_name": "second", "conditions": {"min_doc_count": 5}}]},
                {"name": "second", "actions": [], "transitions": []}
            ]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    harness.tick("logs-1", "u1").await; // initialize
    harness.tick("logs-1", "u1").await; // close: completed
    harness.tick("logs-1", "u1").await; // transition poll: condition_not_met
    harness.tick("logs-1", "u1").await; // transition poll: condition_not_met

    let records = harness.history.query(HistoryFilter::default()).await.unwrap();
    assert!(!records.is_empty());
    assert!(records
        .iter()
        .all(|r| r.step_status != Some(StepStatus::ConditionNotMet)));
    assert!(records
        .iter()
        .any(|r| r.step.as_deref() == Some("close_index")
            && r.step_status == Some(StepStatus::Completed)));
}

// =============================================================================
// Explain: the live document is always readable.
// =============================================================================

#[tokio::test]
async fn explain_reads_the_live_document() {
    let harness = Harness::new(
        r#"{"policy_id": "close-only", "default_state": "closed",
            "states": [{"name": "closed", "actions": [{"close": {}}], "transitions": []}]}"#,
    );
    harness.cluster.create_index("logs-1", SimIndexSpec::default());

    assert!(harness.runner.explain("u1").await.unwrap().is_none());

    harness.tick("logs-1", "u1").await;
    let explain = harness.runner.explain("u1").await.unwrap().unwrap();
    assert_eq!(explain.metadata.policy_id, "close-only");
    assert_eq!(explain.version, 1);

    harness.tick("logs-1", "u1").await;
    let explain = harness.runner.explain("u1").await.unwrap().unwrap();
    assert!(explain.metadata.policy_completed);
}
