//! The per-tick runner.
//!
//! The scheduling substrate invokes `run_tick` once per managed index per
//! interval. One tick performs at most one unit of side-effecting work:
//! load metadata, select the step, execute it, apply timeout/retry policy,
//! persist under optimistic concurrency, and evaluate transitions when a
//! state's actions are exhausted.
//!
//! The CAS write in `persist` is the engine's only defense against
//! overlapping ticks for the same index. On conflict the whole tick's
//! effect is dropped; the next scheduled invocation starts from the
//! winner's document.

use crate::adapter::{IndexAdmin, IndexObservation, NotificationChannel};
use crate::registry::{ActionRegistry, StepName};
use crate::selector::{select_step, Selection};
use crate::steps::{execute_step, render_template, StepContext, StepOutcome};
use crate::store::{MetadataStore, StoreError};
use crate::transition;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use warden_core::metadata::{
    ActionMetadata, ManagedIndexMetadata, StateMetadata, StepMetadata, StepStatus,
    ValidationStatus,
};
use warden_core::policy::{Action, Policy, State};
use warden_history::{HistoryLogger, HistoryRecord};

/// Everything the scheduling substrate hands the runner for one tick.
pub struct TickContext<'a> {
    pub index: &'a str,
    pub index_uuid: &'a str,
    pub policy: &'a Policy,
    /// Version of the policy document, captured into new metadata.
    pub policy_seq_no: u64,
    pub policy_primary_term: u64,
}

/// Headline result of one tick. The full picture is the persisted metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// First tick: metadata initialized at the policy's default state.
    Initialized,
    /// The index is terminally failed and awaits an explicit retry call.
    Stuck,
    /// The policy had already completed for this index.
    AlreadyCompleted,
    /// A failed step's backoff delay has not elapsed; nothing was executed.
    AwaitingRetry,
    /// A step was executed (or re-polled).
    StepExecuted { step: StepName, status: StepStatus },
    /// A transition condition matched; the state change applies next tick.
    TransitionReady { to: String },
    /// A pending transition was applied; the index entered the new state.
    Transitioned { to: String },
    /// The policy completed for this index.
    PolicyCompleted,
    /// The managed index is now terminally failed.
    Failed { cause: String },
    /// Another writer raced this tick; all of its effects were dropped.
    DroppedOnConflict,
}

/// Live metadata view returned by the explain query.
#[derive(Debug, Clone)]
pub struct Explain {
    pub metadata: ManagedIndexMetadata,
    pub version: u64,
}

/// The per-tick coordinator.
pub struct Runner {
    registry: ActionRegistry,
    admin: Arc<dyn IndexAdmin>,
    store: Arc<dyn MetadataStore>,
    notifications: Arc<dyn NotificationChannel>,
    history: Arc<HistoryLogger>,
}

impl Runner {
    pub fn new(
        registry: ActionRegistry,
        admin: Arc<dyn IndexAdmin>,
        store: Arc<dyn MetadataStore>,
        notifications: Arc<dyn NotificationChannel>,
        history: Arc<HistoryLogger>,
    ) -> Self {
        Self {
            registry,
            admin,
            store,
            notifications,
            history,
        }
    }

    /// Run one tick for one managed index.
    ///
    /// Never panics into the scheduler: step failures are folded into the
    /// metadata document, and persistence conflicts are reported as
    /// `DroppedOnConflict` rather than errors.
    pub async fn run_tick(&self, job: &TickContext<'_>) -> anyhow::Result<TickOutcome> {
        let now = Utc::now();

        // 1. Load the metadata document, or initialize it on the first tick
        //    after the policy was attached.
        let (mut meta, version) = match self.store.get(job.index_uuid).await? {
            Some((meta, version)) => (meta, version),
            None => {
                let meta = ManagedIndexMetadata::initial(
                    job.index,
                    job.index_uuid,
                    job.policy,
                    job.policy_seq_no,
                    job.policy_primary_term,
                    now,
                );
                return match self.store.put(job.index_uuid, &meta, None).await {
                    Ok(_) => {
                        tracing::info!(
                            index = job.index,
                            policy_id = %job.policy.policy_id,
                            state = %job.policy.default_state,
                            "initialized managed index"
                        );
                        Ok(TickOutcome::Initialized)
                    }
                    Err(StoreError::Conflict(_)) => Ok(TickOutcome::DroppedOnConflict),
                    Err(e) => Err(e.into()),
                };
            }
        };

        // 2. A terminally failed index requires an explicit retry call.
        if meta.retry_info.failed {
            return Ok(TickOutcome::Stuck);
        }

        // 3. Nothing left to do.
        if meta.policy_completed {
            return Ok(TickOutcome::AlreadyCompleted);
        }

        // A transition recorded last tick is applied before anything else.
        if let Some(target) = meta.transition_to.take() {
            meta.state = Some(StateMetadata {
                name: target.clone(),
                start_time: now,
            });
            meta.action = None;
            meta.step = None;
            meta.set_info_message(format!("entered state '{}'", target));
            tracing::info!(index = job.index, state = %target, "state transition applied");
            return self
                .persist(job, &meta, version, false, TickOutcome::Transitioned { to: target })
                .await;
        }

        // 4. Resolve the current state against the policy document.
        let state_name = match &meta.state {
            Some(state) => state.name.clone(),
            None => {
                meta.state = Some(StateMetadata {
                    name: job.policy.default_state.clone(),
                    start_time: now,
                });
                return self
                    .persist(job, &meta, version, false, TickOutcome::Initialized)
                    .await;
            }
        };
        let Some(state) = job.policy.state(&state_name) else {
            let cause = format!(
                "state '{}' no longer exists in policy '{}'",
                state_name, job.policy.policy_id
            );
            return self.fail_and_persist(job, meta, version, cause).await;
        };

        // 5. Determine the current action; past the last action only the
        //    transition pseudo-action remains.
        let action_index = meta.action.as_ref().map(|a| a.index).unwrap_or(0);
        if action_index >= state.actions.len() {
            return self
                .evaluate_transitions(job, state, meta, version, None, now, None)
                .await;
        }
        let action = &state.actions[action_index];

        // The action object is rebuilt from the policy every tick; metadata
        // is the only durable state. Start fresh bookkeeping when the
        // recorded action does not match the policy's.
        let fresh = !meta.action.as_ref().is_some_and(|a| {
            a.index == action_index && a.name == action.kind.type_name()
        });
        if fresh {
            meta.action = Some(ActionMetadata::new(
                action.kind.type_name(),
                action_index,
                now,
            ));
        }

        // Per-action wall-clock timeout, checked before any execution and
        // bypassing the retry budget.
        if let Some(timeout) = action.timeout {
            let started = meta.action.as_ref().map(|a| a.start_time).unwrap_or(now);
            let limit = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
            if now.signed_duration_since(started) > limit {
                let cause = format!(
                    "action '{}' exceeded its timeout of {}",
                    action.kind.type_name(),
                    humantime::format_duration(timeout),
                );
                return self.fail_and_persist(job, meta, version, cause).await;
            }
        }

        // 6. Selector.
        match select_step(&self.registry, &action.kind, &meta) {
            Selection::ActionComplete => {
                self.advance_past_action(job, state, meta, version, action_index, now)
                    .await
            }
            Selection::Step(step) => {
                self.execute_and_apply(job, state, meta, version, action_index, action, step, now)
                    .await
            }
        }
    }

    /// The previous tick completed the action's last step; advance to the
    /// next action, or hand over to transition evaluation after the last.
    async fn advance_past_action(
        &self,
        job: &TickContext<'_>,
        state: &State,
        mut meta: ManagedIndexMetadata,
        version: u64,
        action_index: usize,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TickOutcome> {
        if let Some(action_meta) = meta.action.as_mut() {
            action_meta.properties = None;
        }

        if action_index + 1 < state.actions.len() {
            let next = &state.actions[action_index + 1];
            meta.action = Some(ActionMetadata::new(
                next.kind.type_name(),
                action_index + 1,
                now,
            ));
            meta.step = None;
            meta.set_info_message(format!("starting action '{}'", next.kind.type_name()));
            let outcome = TickOutcome::StepExecuted {
                step: self.registry.first_step(&next.kind),
                status: StepStatus::Starting,
            };
            return self.persist(job, &meta, version, false, outcome).await;
        }

        self.evaluate_transitions(job, state, meta, version, None, now, None)
            .await
    }

    /// Execute the selected step and fold its outcome into the metadata.
    #[allow(clippy::too_many_arguments)]
    async fn execute_and_apply(
        &self,
        job: &TickContext<'_>,
        state: &State,
        mut meta: ManagedIndexMetadata,
        version: u64,
        action_index: usize,
        action: &Action,
        step: StepName,
        now: DateTime<Utc>,
    ) -> anyhow::Result<TickOutcome> {
        // A failed step only re-executes once its backoff delay has passed.
        let retrying = meta
            .step
            .as_ref()
            .is_some_and(|s| s.step_status == StepStatus::Failed);
        if retrying {
            if let Some(action_meta) = meta.action.as_ref() {
                if let Some(last_retry) = action_meta.last_retry_time {
                    let wait = action
                        .retry
                        .backoff
                        .delay_for(action.retry.delay, action_meta.consumed_retries);
                    let ready = last_retry
                        + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::MAX);
                    if now < ready {
                        meta.set_info_message(format!(
                            "backing off until retry {} of step '{}'",
                            action_meta.consumed_retries, step
                        ));
                        return self
                            .persist(job, &meta, version, false, TickOutcome::AwaitingRetry)
                            .await;
                    }
                }
            }
        }

        // One observation per tick, shared by validation, the step, and any
        // inline transition evaluation.
        let (observation, observe_error) = match self.admin.observe(job.index).await {
            Ok(observation) => (observation, None),
            Err(e) => (None, Some(e)),
        };

        let outcome = if let Some(e) = observe_error {
            StepOutcome::failed(format!("failed to observe index: {}", e))
        } else {
            if let Some(validation) = self.registry.validate(&action.kind, observation.as_ref()) {
                if validation.status == ValidationStatus::Failed {
                    tracing::warn!(
                        index = job.index,
                        action = action.kind.type_name(),
                        message = %validation.message,
                        "action validation failed"
                    );
                }
                meta.info.insert(
                    "validation".to_string(),
                    format!("{}: {}", validation.status, validation.message),
                );
            }

            let ctx = StepContext {
                admin: self.admin.as_ref(),
                notifications: self.notifications.as_ref(),
                metadata: &meta,
                action,
                observation: observation.as_ref(),
                now,
            };
            match execute_step(&ctx, step).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        index = job.index,
                        step = %step,
                        error = %e,
                        "step execution error"
                    );
                    StepOutcome::failed(e.to_string())
                }
            }
        };

        tracing::debug!(
            index = job.index,
            state = %state.name,
            action = action.kind.type_name(),
            step = %step,
            status = %outcome.status,
            "step executed"
        );

        // Fold the outcome into the working metadata.
        let same_step = meta.step.as_ref().is_some_and(|s| s.name == step.as_str());
        let step_start = meta
            .step
            .as_ref()
            .filter(|_| same_step)
            .map(|s| s.start_time)
            .unwrap_or(now);
        meta.step = Some(StepMetadata {
            name: step.as_str().to_string(),
            start_time: step_start,
            step_status: outcome.status,
        });
        if outcome.rolled_over {
            meta.rolled_over = Some(true);
        }
        meta.set_info_message(outcome.message.clone());
        if let Some(properties) = outcome.properties.clone() {
            if let Some(action_meta) = meta.action.as_mut() {
                action_meta.properties = Some(properties);
            }
        }

        match outcome.status {
            StepStatus::Failed => {
                meta.set_info_cause(outcome.message.clone());
                let max_retries = action.retry.count;
                let consumed = meta.action.as_ref().map(|a| a.consumed_retries).unwrap_or(0);
                if consumed < max_retries {
                    if let Some(action_meta) = meta.action.as_mut() {
                        action_meta.consumed_retries = consumed + 1;
                        action_meta.last_retry_time = Some(now);
                        action_meta.failed = false;
                    }
                    let outcome = TickOutcome::StepExecuted {
                        step,
                        status: StepStatus::Failed,
                    };
                    self.persist(job, &meta, version, true, outcome).await
                } else {
                    let cause = format!(
                        "action '{}' failed after {} retries: {}",
                        action.kind.type_name(),
                        max_retries,
                        outcome.message
                    );
                    self.fail_and_persist(job, meta, version, cause).await
                }
            }

            StepStatus::Completed => {
                if let Some(action_meta) = meta.action.as_mut() {
                    action_meta.consumed_retries = 0;
                    action_meta.last_retry_time = None;
                }
                meta.info.remove("cause");

                if self.registry.next_step(&action.kind, step).is_none() {
                    // The action is complete; its scratch state dies with it.
                    if let Some(action_meta) = meta.action.as_mut() {
                        action_meta.properties = None;
                    }
                    if action_index + 1 >= state.actions.len() {
                        // Last action of the state: evaluate transitions in
                        // the same tick, reusing this tick's observation.
                        return self
                            .evaluate_transitions(
                                job,
                                state,
                                meta,
                                version,
                                observation,
                                now,
                                Some(step),
                            )
                            .await;
                    }
                }

                let outcome = TickOutcome::StepExecuted {
                    step,
                    status: StepStatus::Completed,
                };
                self.persist(job, &meta, version, true, outcome).await
            }

            StepStatus::ConditionNotMet | StepStatus::Starting => {
                let outcome = TickOutcome::StepExecuted {
                    step,
                    status: outcome.status,
                };
                self.persist(job, &meta, version, false, outcome).await
            }
        }
    }

    /// Evaluate the state's transitions against a fresh observation.
    ///
    /// With `inline_completed` set, evaluation runs inline in the tick that
    /// just completed the state's last action, and that step stays recorded
    /// in the metadata. Otherwise this is the dedicated evaluation tick and
    /// the transition pseudo-action is recorded instead.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_transitions(
        &self,
        job: &TickContext<'_>,
        state: &State,
        mut meta: ManagedIndexMetadata,
        version: u64,
        observation: Option<IndexObservation>,
        now: DateTime<Utc>,
        inline_completed: Option<StepName>,
    ) -> anyhow::Result<TickOutcome> {
        let as_pseudo_action = inline_completed.is_none();
        if as_pseudo_action {
            let keep = meta
                .action
                .as_ref()
                .is_some_and(|a| a.name == "transition");
            if !keep {
                meta.action = Some(ActionMetadata::new("transition", state.actions.len(), now));
            }
        }

        let observation = match observation {
            Some(observation) => Some(observation),
            None => self.admin.observe(job.index).await?,
        };
        let Some(observation) = observation else {
            let cause = "index no longer exists".to_string();
            return self.fail_and_persist(job, meta, version, cause).await;
        };

        match transition::evaluate(&state.transitions, &observation, &meta, now) {
            Some(matched) => {
                let target = matched.state_name.clone();
                meta.transition_to = Some(target.clone());
                if as_pseudo_action {
                    meta.step = Some(StepMetadata {
                        name: StepName::AttemptTransition.as_str().to_string(),
                        start_time: now,
                        step_status: StepStatus::Completed,
                    });
                }
                meta.set_info_message(format!(
                    "transition conditions met; moving to '{}'",
                    target
                ));
                self.persist(job, &meta, version, true, TickOutcome::TransitionReady { to: target })
                    .await
            }
            None if state.transitions.is_empty() => {
                meta.policy_completed = true;
                meta.set_info_message("policy completed");
                tracing::info!(
                    index = job.index,
                    policy_id = %job.policy.policy_id,
                    "policy completed"
                );
                self.persist(job, &meta, version, true, TickOutcome::PolicyCompleted)
                    .await
            }
            None => match inline_completed {
                // The step that finished the state's actions is still the
                // tick's unit of work; transitions simply did not match yet.
                Some(step) => {
                    let outcome = TickOutcome::StepExecuted {
                        step,
                        status: StepStatus::Completed,
                    };
                    self.persist(job, &meta, version, true, outcome).await
                }
                None => {
                    let same_step = meta
                        .step
                        .as_ref()
                        .is_some_and(|s| s.name == StepName::AttemptTransition.as_str());
                    let step_start = meta
                        .step
                        .as_ref()
                        .filter(|_| same_step)
                        .map(|s| s.start_time)
                        .unwrap_or(now);
                    meta.step = Some(StepMetadata {
                        name: StepName::AttemptTransition.as_str().to_string(),
                        start_time: step_start,
                        step_status: StepStatus::ConditionNotMet,
                    });
                    meta.set_info_message("no transition conditions met");
                    let outcome = TickOutcome::StepExecuted {
                        step: StepName::AttemptTransition,
                        status: StepStatus::ConditionNotMet,
                    };
                    self.persist(job, &meta, version, false, outcome).await
                }
            },
        }
    }

    /// Mark the index terminally failed, persist, and notify.
    async fn fail_and_persist(
        &self,
        job: &TickContext<'_>,
        mut meta: ManagedIndexMetadata,
        version: u64,
        cause: String,
    ) -> anyhow::Result<TickOutcome> {
        tracing::warn!(index = job.index, cause = %cause, "managed index failed");
        if let Some(action_meta) = meta.action.as_mut() {
            action_meta.failed = true;
            action_meta.properties = None;
        }
        if let Some(step_meta) = meta.step.as_mut() {
            step_meta.step_status = StepStatus::Failed;
        }
        meta.retry_info.failed = true;
        meta.set_info_message("managed index failed; awaiting explicit retry");
        meta.set_info_cause(cause.clone());

        let outcome = self
            .persist(job, &meta, version, true, TickOutcome::Failed { cause: cause.clone() })
            .await?;
        if !matches!(outcome, TickOutcome::DroppedOnConflict) {
            self.notify_failure(job, &meta, &cause).await;
        }
        Ok(outcome)
    }

    /// Render and hand off the policy's error notification, if any.
    /// Delivery failures are logged and swallowed.
    async fn notify_failure(&self, job: &TickContext<'_>, meta: &ManagedIndexMetadata, cause: &str) {
        let Some(notification) = &job.policy.error_notification else {
            return;
        };
        let message = render_template(
            &notification.message_template,
            &[
                ("index", job.index),
                ("policy_id", &job.policy.policy_id),
                (
                    "state",
                    meta.state.as_ref().map(|s| s.name.as_str()).unwrap_or("-"),
                ),
                ("cause", cause),
            ],
        );
        if let Err(e) = self.notifications.send(&notification.channel, &message).await {
            tracing::warn!(
                channel = %notification.channel,
                error = %e,
                "failed to deliver error notification"
            );
        }
    }

    /// Persist the working metadata under CAS and, for terminal step
    /// statuses, append a write-once history record. Polling ticks persist
    /// too (recording the latest observation) but stay out of the history.
    async fn persist(
        &self,
        job: &TickContext<'_>,
        meta: &ManagedIndexMetadata,
        version: u64,
        record_history: bool,
        outcome: TickOutcome,
    ) -> anyhow::Result<TickOutcome> {
        match self.store.put(job.index_uuid, meta, Some(version)).await {
            Ok(_) => {
                if record_history {
                    if let Err(e) = self
                        .history
                        .record(HistoryRecord::snapshot(meta, Utc::now()))
                        .await
                    {
                        tracing::warn!(index = job.index, error = %e, "failed to append history record");
                    }
                }
                Ok(outcome)
            }
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(
                    index = job.index,
                    "metadata write conflict; dropping tick effects"
                );
                Ok(TickOutcome::DroppedOnConflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Operator surface
    // =========================================================================

    /// Live metadata view for one managed index.
    pub async fn explain(&self, index_uuid: &str) -> anyhow::Result<Option<Explain>> {
        Ok(self
            .store
            .get(index_uuid)
            .await?
            .map(|(metadata, version)| Explain { metadata, version }))
    }

    /// Clear the terminal failure marker so execution resumes on the next
    /// tick. Returns whether anything was cleared.
    pub async fn retry_failed(&self, index_uuid: &str) -> anyhow::Result<bool> {
        let Some((mut meta, version)) = self.store.get(index_uuid).await? else {
            return Ok(false);
        };
        if !meta.retry_info.failed {
            return Ok(false);
        }

        meta.retry_info.failed = false;
        meta.retry_info.consumed_retries = 0;
        if let Some(action_meta) = meta.action.as_mut() {
            action_meta.failed = false;
            action_meta.consumed_retries = 0;
            action_meta.last_retry_time = None;
        }
        meta.info.remove("cause");
        meta.set_info_message("retry requested; resuming execution");

        match self.store.put(index_uuid, &meta, Some(version)).await {
            Ok(_) => {
                tracing::info!(index = %meta.index, "cleared terminal failure");
                Ok(true)
            }
            Err(StoreError::Conflict(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the terminal failure marker on every failed index governed by
    /// a policy. Returns the number of indices cleared.
    pub async fn retry_failed_by_policy(&self, policy_id: &str) -> anyhow::Result<usize> {
        let docs = self.store.find_by_policy(policy_id).await?;
        let mut cleared = 0;
        for doc in docs {
            if doc.retry_info.failed && self.retry_failed(&doc.index_uuid).await? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Detach the policy from an index by deleting its metadata document.
    pub async fn detach(&self, index_uuid: &str) -> anyhow::Result<()> {
        self.store.delete(index_uuid).await?;
        Ok(())
    }
}
