//! Step execution.
//!
//! A single table-driven dispatcher maps `(action variant, step name)` to
//! the administrative calls behind the `IndexAdmin` seam. Each step performs
//! at most one side-effecting call per tick and classifies the backend's
//! answer:
//!
//! - transient/in-progress conditions → `condition_not_met` (consumed
//!   against the action's retry budget, auto-recoverable)
//! - "already in the requested state" → `completed` (idempotent success)
//! - permanently invalid calls → `failed`
//!
//! Transport errors bubble up as `Err`; the runner maps them to `failed`
//! with the cause captured in the metadata's info map.

use crate::adapter::{AdminAck, IndexAdmin, IndexObservation, NotificationChannel, TaskProgress};
use crate::registry::StepName;
use anyhow::bail;
use chrono::{DateTime, Utc};
use warden_core::metadata::{ActionProperties, ManagedIndexMetadata, ShrinkProperties, StepStatus};
use warden_core::policy::{
    Action, ActionKind, ForceMergeConfig, NotificationConfig, RolloverConfig, RollupConfig,
    ShrinkConfig, SnapshotConfig,
};

/// Everything a step may consult while executing.
pub struct StepContext<'a> {
    pub admin: &'a dyn IndexAdmin,
    pub notifications: &'a dyn NotificationChannel,
    pub metadata: &'a ManagedIndexMetadata,
    pub action: &'a Action,
    /// The tick's observation of the index; `None` if it no longer exists.
    pub observation: Option<&'a IndexObservation>,
    pub now: DateTime<Utc>,
}

impl StepContext<'_> {
    fn index(&self) -> &str {
        &self.metadata.index
    }

    fn properties(&self) -> Option<&ActionProperties> {
        self.metadata
            .action
            .as_ref()
            .and_then(|a| a.properties.as_ref())
    }

    /// Millis timestamp used to suffix generated names, stable across
    /// retries of the same action.
    fn action_epoch_millis(&self) -> i64 {
        self.metadata
            .action
            .as_ref()
            .map(|a| a.start_time)
            .unwrap_or(self.now)
            .timestamp_millis()
    }
}

/// What one step execution produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub message: String,
    /// Replaces the action's scratch properties when set.
    pub properties: Option<ActionProperties>,
    /// Set by a successful rollover.
    pub rolled_over: bool,
}

impl StepOutcome {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Completed,
            message: message.into(),
            properties: None,
            rolled_over: false,
        }
    }

    pub fn condition_not_met(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::ConditionNotMet,
            message: message.into(),
            properties: None,
            rolled_over: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            message: message.into(),
            properties: None,
            rolled_over: false,
        }
    }

    fn with_properties(mut self, properties: ActionProperties) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Map an administrative ack onto a step outcome.
fn from_ack(ack: AdminAck, done: &str, already: &str) -> StepOutcome {
    match ack {
        AdminAck::Acknowledged => StepOutcome::completed(done),
        AdminAck::AlreadyDone => StepOutcome::completed(already),
        AdminAck::Busy(m) => StepOutcome::condition_not_met(m),
        AdminAck::Rejected(m) => StepOutcome::failed(m),
    }
}

/// Execute one step of the current action.
///
/// The `(action, step)` pairs matched here mirror the registry's step
/// tables; any other combination is unreachable for metadata produced by
/// the selector.
pub async fn execute_step(ctx: &StepContext<'_>, step: StepName) -> anyhow::Result<StepOutcome> {
    match (&ctx.action.kind, step) {
        (ActionKind::Rollover(config), StepName::AttemptRollover) => {
            attempt_rollover(ctx, config).await
        }

        (ActionKind::ForceMerge(_) | ActionKind::ReadOnly(_), StepName::SetReadOnly) => {
            let ack = ctx.admin.set_read_only(ctx.index(), true).await?;
            Ok(from_ack(ack, "set index to read-only", "index was already read-only"))
        }
        (ActionKind::ForceMerge(config), StepName::CallForceMerge) => {
            call_force_merge(ctx, config).await
        }
        (ActionKind::ForceMerge(config), StepName::WaitForForceMerge) => {
            wait_for_force_merge(ctx, config)
        }

        (ActionKind::ReadWrite(_), StepName::SetReadWrite) => {
            let ack = ctx.admin.set_read_only(ctx.index(), false).await?;
            Ok(from_ack(ack, "set index to read-write", "index was already writable"))
        }

        (ActionKind::ReplicaCount(config), StepName::SetReplicaCount) => {
            let ack = ctx
                .admin
                .set_replica_count(ctx.index(), config.number_of_replicas)
                .await?;
            Ok(from_ack(
                ack,
                &format!("set replica count to {}", config.number_of_replicas),
                "replica count already at target",
            ))
        }

        (ActionKind::IndexPriority(config), StepName::SetIndexPriority) => {
            let ack = ctx
                .admin
                .set_index_priority(ctx.index(), config.priority)
                .await?;
            Ok(from_ack(
                ack,
                &format!("set index priority to {}", config.priority),
                "index priority already at target",
            ))
        }

        (ActionKind::Allocation(config), StepName::SetAllocation) => {
            let ack = ctx
                .admin
                .set_allocation(ctx.index(), &config.require, &config.include, &config.exclude)
                .await?;
            Ok(from_ack(
                ack,
                "updated allocation routing",
                "allocation routing already at target",
            ))
        }

        (ActionKind::Close(_), StepName::CloseIndex) => {
            let ack = ctx.admin.close_index(ctx.index()).await?;
            Ok(from_ack(ack, "closed index", "index was already closed"))
        }

        (ActionKind::Open(_), StepName::OpenIndex) => {
            let ack = ctx.admin.open_index(ctx.index()).await?;
            Ok(from_ack(ack, "opened index", "index was already open"))
        }

        (ActionKind::Delete(_), StepName::DeleteIndex) => {
            let ack = ctx.admin.delete_index(ctx.index()).await?;
            Ok(from_ack(ack, "deleted index", "index was already deleted"))
        }

        (ActionKind::Snapshot(config), StepName::AttemptSnapshot) => {
            attempt_snapshot(ctx, config).await
        }
        (ActionKind::Snapshot(config), StepName::WaitForSnapshot) => {
            wait_for_snapshot(ctx, config).await
        }

        (ActionKind::Shrink(config), StepName::MoveShards) => move_shards(ctx, config).await,
        (ActionKind::Shrink(_), StepName::WaitForMoveShards) => {
            let done = ctx.admin.relocation_done(ctx.index()).await?;
            Ok(if done {
                StepOutcome::completed("all shards relocated onto one node")
            } else {
                StepOutcome::condition_not_met("waiting for shard relocation")
            })
        }
        (ActionKind::Shrink(_), StepName::AttemptShrink) => attempt_shrink(ctx).await,
        (ActionKind::Shrink(_), StepName::WaitForShrink) => wait_for_shrink(ctx).await,

        (ActionKind::Notification(config), StepName::SendNotification) => {
            send_notification(ctx, config).await
        }

        (ActionKind::Rollup(config), StepName::CreateRollupJob) => {
            create_rollup_job(ctx, config).await
        }
        (ActionKind::Rollup(_), StepName::WaitForRollup) => wait_for_rollup(ctx).await,

        (kind, step) => bail!(
            "step '{}' does not belong to action '{}'",
            step,
            kind.type_name()
        ),
    }
}

async fn attempt_rollover(
    ctx: &StepContext<'_>,
    config: &RolloverConfig,
) -> anyhow::Result<StepOutcome> {
    if ctx.metadata.rolled_over == Some(true) {
        return Ok(StepOutcome::completed("index has already rolled over"));
    }

    let Some(obs) = ctx.observation else {
        return Ok(StepOutcome::failed("index no longer exists"));
    };

    // Conditions are ORed, matching the rollover API: the first one the
    // index satisfies triggers the rollover. No conditions means roll now.
    let no_conditions = config.min_age.is_none()
        && config.min_doc_count.is_none()
        && config.min_size_bytes.is_none();
    let age_met = config.min_age.is_some_and(|min| {
        ctx.now.signed_duration_since(obs.creation_date)
            >= chrono::Duration::from_std(min).unwrap_or(chrono::Duration::MAX)
    });
    let docs_met = config.min_doc_count.is_some_and(|min| obs.doc_count >= min);
    let size_met = config
        .min_size_bytes
        .is_some_and(|min| obs.size_bytes >= min);

    if !(no_conditions || age_met || docs_met || size_met) {
        return Ok(StepOutcome::condition_not_met(format!(
            "rollover conditions not met (docs={}, size={}b)",
            obs.doc_count, obs.size_bytes
        )));
    }

    let ack = ctx.admin.rollover(ctx.index()).await?;
    let mut outcome = from_ack(ack, "rolled over", "index had already rolled over");
    if outcome.status == StepStatus::Completed {
        outcome.rolled_over = true;
    }
    Ok(outcome)
}

async fn call_force_merge(
    ctx: &StepContext<'_>,
    config: &ForceMergeConfig,
) -> anyhow::Result<StepOutcome> {
    let ack = ctx
        .admin
        .force_merge(ctx.index(), config.max_num_segments)
        .await?;
    let outcome = from_ack(
        ack,
        &format!("started force merge to {} segments", config.max_num_segments),
        "segments already at target",
    );
    if outcome.status == StepStatus::Completed {
        Ok(outcome.with_properties(ActionProperties {
            max_num_segments: Some(config.max_num_segments),
            ..Default::default()
        }))
    } else {
        Ok(outcome)
    }
}

fn wait_for_force_merge(
    ctx: &StepContext<'_>,
    config: &ForceMergeConfig,
) -> anyhow::Result<StepOutcome> {
    let Some(obs) = ctx.observation else {
        return Ok(StepOutcome::failed("index no longer exists"));
    };
    let target = ctx
        .properties()
        .and_then(|p| p.max_num_segments)
        .unwrap_or(config.max_num_segments);

    Ok(if obs.segment_count <= target {
        StepOutcome::completed(format!("merge finished at {} segments", obs.segment_count))
    } else {
        StepOutcome::condition_not_met(format!(
            "waiting for merge: {} segments above target {}",
            obs.segment_count, target
        ))
    })
}

async fn attempt_snapshot(
    ctx: &StepContext<'_>,
    config: &SnapshotConfig,
) -> anyhow::Result<StepOutcome> {
    let name = format!("{}-{}", config.snapshot, ctx.action_epoch_millis());
    let ack = ctx
        .admin
        .create_snapshot(&config.repository, &name, ctx.index())
        .await?;
    let outcome = from_ack(
        ack,
        &format!("started snapshot '{}'", name),
        "snapshot already exists",
    );
    if outcome.status == StepStatus::Completed {
        Ok(outcome.with_properties(ActionProperties {
            snapshot_name: Some(name),
            ..Default::default()
        }))
    } else {
        Ok(outcome)
    }
}

async fn wait_for_snapshot(
    ctx: &StepContext<'_>,
    config: &SnapshotConfig,
) -> anyhow::Result<StepOutcome> {
    let Some(name) = ctx.properties().and_then(|p| p.snapshot_name.clone()) else {
        return Ok(StepOutcome::failed(
            "snapshot name missing from action properties",
        ));
    };

    Ok(match ctx.admin.snapshot_status(&config.repository, &name).await? {
        TaskProgress::InProgress => {
            StepOutcome::condition_not_met(format!("snapshot '{}' in progress", name))
        }
        TaskProgress::Done => StepOutcome::completed(format!("snapshot '{}' finished", name)),
        TaskProgress::Failed(m) => {
            StepOutcome::failed(format!("snapshot '{}' failed: {}", name, m))
        }
    })
}

async fn move_shards(ctx: &StepContext<'_>, config: &ShrinkConfig) -> anyhow::Result<StepOutcome> {
    let Some(obs) = ctx.observation else {
        return Ok(StepOutcome::failed("index no longer exists"));
    };

    let target_num_shards = match target_shard_count(config, obs) {
        Ok(n) => n,
        Err(reason) => return Ok(StepOutcome::failed(reason)),
    };
    let suffix = config.target_index_suffix.as_deref().unwrap_or("_shrunken");
    let target_index = format!("{}{}", ctx.index(), suffix);

    let ack = ctx.admin.prepare_shrink(ctx.index()).await?;
    let outcome = from_ack(
        ack,
        "started shard relocation onto one node",
        "shards already colocated",
    );
    if outcome.status == StepStatus::Completed {
        Ok(outcome.with_properties(ActionProperties {
            shrink: Some(ShrinkProperties {
                target_index,
                target_num_shards,
            }),
            ..Default::default()
        }))
    } else {
        Ok(outcome)
    }
}

async fn attempt_shrink(ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
    let Some(props) = ctx.properties().and_then(|p| p.shrink.clone()) else {
        return Ok(StepOutcome::failed(
            "shrink target missing from action properties",
        ));
    };

    let ack = ctx
        .admin
        .shrink(ctx.index(), &props.target_index, props.target_num_shards)
        .await?;
    Ok(from_ack(
        ack,
        &format!(
            "started shrink into '{}' with {} shards",
            props.target_index, props.target_num_shards
        ),
        "shrink target already exists",
    ))
}

async fn wait_for_shrink(ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
    let Some(props) = ctx.properties().and_then(|p| p.shrink.clone()) else {
        return Ok(StepOutcome::failed(
            "shrink target missing from action properties",
        ));
    };

    let done = ctx.admin.recovery_done(&props.target_index).await?;
    Ok(if done {
        StepOutcome::completed(format!("shrunken index '{}' recovered", props.target_index))
    } else {
        StepOutcome::condition_not_met(format!(
            "waiting for recovery of '{}'",
            props.target_index
        ))
    })
}

async fn send_notification(
    ctx: &StepContext<'_>,
    config: &NotificationConfig,
) -> anyhow::Result<StepOutcome> {
    let message = render_template(
        &config.message_template,
        &[
            ("index", ctx.index()),
            ("policy_id", &ctx.metadata.policy_id),
            (
                "state",
                ctx.metadata
                    .state
                    .as_ref()
                    .map(|s| s.name.as_str())
                    .unwrap_or("-"),
            ),
        ],
    );
    ctx.notifications.send(&config.channel, &message).await?;
    Ok(StepOutcome::completed(format!(
        "sent notification to '{}'",
        config.channel
    )))
}

async fn create_rollup_job(
    ctx: &StepContext<'_>,
    config: &RollupConfig,
) -> anyhow::Result<StepOutcome> {
    let job_id = format!("{}-{}", config.job_id_prefix, ctx.action_epoch_millis());
    let ack = ctx
        .admin
        .start_rollup_job(&job_id, ctx.index(), &config.config)
        .await?;
    let outcome = from_ack(
        ack,
        &format!("started rollup job '{}'", job_id),
        "rollup job already exists",
    );
    if outcome.status == StepStatus::Completed {
        Ok(outcome.with_properties(ActionProperties {
            rollup_job_id: Some(job_id),
            ..Default::default()
        }))
    } else {
        Ok(outcome)
    }
}

async fn wait_for_rollup(ctx: &StepContext<'_>) -> anyhow::Result<StepOutcome> {
    let Some(job_id) = ctx.properties().and_then(|p| p.rollup_job_id.clone()) else {
        return Ok(StepOutcome::failed(
            "rollup job id missing from action properties",
        ));
    };

    Ok(match ctx.admin.rollup_job_status(&job_id).await? {
        TaskProgress::InProgress => {
            StepOutcome::condition_not_met(format!("rollup job '{}' running", job_id))
        }
        TaskProgress::Done => StepOutcome::completed(format!("rollup job '{}' finished", job_id)),
        TaskProgress::Failed(m) => {
            StepOutcome::failed(format!("rollup job '{}' failed: {}", job_id, m))
        }
    })
}

/// Compute the shrink target's primary shard count.
///
/// The target count must divide the source count; for size-derived options
/// the largest factor at or below the desired count is used.
fn target_shard_count(config: &ShrinkConfig, obs: &IndexObservation) -> Result<u32, String> {
    let source = obs.number_of_shards;
    if source <= 1 {
        return Err("index already has a single shard".to_string());
    }

    if let Some(n) = config.num_new_shards {
        if n >= source {
            return Err(format!(
                "num_new_shards {} is not below the current shard count {}",
                n, source
            ));
        }
        if source % n != 0 {
            return Err(format!(
                "num_new_shards {} does not divide the current shard count {}",
                n, source
            ));
        }
        return Ok(n);
    }

    let desired = if let Some(max) = config.max_shard_size_bytes {
        let per_shard = obs.size_bytes.div_ceil(max).max(1);
        u32::try_from(per_shard).unwrap_or(source)
    } else if let Some(pct) = config.percentage_of_source_shards {
        ((f64::from(source) * pct).floor() as u32).max(1)
    } else {
        return Err("no shrink sizing option set".to_string());
    };

    Ok(largest_factor_at_most(source, desired.min(source - 1)))
}

/// Largest factor of `n` that is at most `at_most` (at least 1).
fn largest_factor_at_most(n: u32, at_most: u32) -> u32 {
    (1..=at_most.max(1)).rev().find(|d| n % d == 0).unwrap_or(1)
}

/// Minimal `{{placeholder}}` substitution for notification templates.
pub(crate) fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{}}}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn observation(shards: u32, size_bytes: u64) -> IndexObservation {
        IndexObservation {
            doc_count: 0,
            size_bytes,
            creation_date: Utc::now(),
            segment_count: 1,
            is_open: true,
            read_only: false,
            number_of_shards: shards,
            number_of_replicas: 1,
            has_rollover_alias: false,
            rolled_over_at: None,
        }
    }

    #[test]
    fn renders_placeholders() {
        let message = render_template(
            "{{index}} entered {{state}}",
            &[("index", "logs-000001"), ("state", "warm")],
        );
        assert_eq!(message, "logs-000001 entered warm");
    }

    #[test]
    fn shard_count_from_explicit_option() {
        let config = ShrinkConfig {
            num_new_shards: Some(2),
            max_shard_size_bytes: None,
            percentage_of_source_shards: None,
            target_index_suffix: None,
        };
        assert_eq!(target_shard_count(&config, &observation(6, 0)), Ok(2));
        // Not a factor of the source count.
        assert!(target_shard_count(&config, &observation(5, 0)).is_err());
        // Not a reduction.
        assert!(target_shard_count(&config, &observation(2, 0)).is_err());
    }

    #[test]
    fn shard_count_from_percentage_picks_a_factor() {
        let config = ShrinkConfig {
            num_new_shards: None,
            max_shard_size_bytes: None,
            percentage_of_source_shards: Some(0.5),
            target_index_suffix: None,
        };
        // 50% of 6 = 3, which divides 6.
        assert_eq!(target_shard_count(&config, &observation(6, 0)), Ok(3));
        // 50% of 8 = 4.
        assert_eq!(target_shard_count(&config, &observation(8, 0)), Ok(4));
    }

    #[test]
    fn shard_count_from_max_size() {
        let config = ShrinkConfig {
            num_new_shards: None,
            max_shard_size_bytes: Some(100),
            percentage_of_source_shards: None,
            target_index_suffix: None,
        };
        // 250 bytes / 100 per shard = 3 desired; largest factor of 6 <= 3 is 3.
        assert_eq!(target_shard_count(&config, &observation(6, 250)), Ok(3));
        // 450 bytes -> 5 desired; largest factor of 6 <= 5 is 3.
        assert_eq!(target_shard_count(&config, &observation(6, 450)), Ok(3));
    }

    #[test]
    fn largest_factor_is_clamped_to_one() {
        assert_eq!(largest_factor_at_most(7, 6), 1);
        assert_eq!(largest_factor_at_most(12, 5), 4);
        assert_eq!(largest_factor_at_most(12, 0), 1);
    }
}
