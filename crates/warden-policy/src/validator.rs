//! Structural policy validation.
//!
//! Validates the invariants a policy document must satisfy before it can be
//! executed:
//! - the default state resolves to exactly one declared state
//! - state names are unique
//! - a delete action is the last action of its state, and that state has no
//!   transitions
//! - every transition targets a declared state
//! - transition conditions set exactly one condition and cron expressions
//!   parse
//! - action parameters are possible (shrink sizing, allocation routing,
//!   force-merge segment count, ...)
//!
//! Validation is independent of any managed index; it is run once per policy
//! write, never per tick.

use crate::error::PolicyError;
use std::collections::HashSet;
use std::str::FromStr;
use warden_core::policy::{Action, ActionKind, Policy, State, Transition};

/// Validates policy documents against structural invariants.
pub struct PolicyValidator;

impl PolicyValidator {
    /// Create a new policy validator.
    pub fn new() -> Self {
        Self
    }

    /// Validate a complete policy document.
    pub fn validate(&self, policy: &Policy) -> Result<(), PolicyError> {
        if policy.policy_id.trim().is_empty() {
            return Err(PolicyError::empty_policy_id());
        }

        if policy.states.is_empty() {
            return Err(PolicyError::no_states(&policy.policy_id));
        }

        let mut names = HashSet::new();
        for state in &policy.states {
            if !names.insert(state.name.as_str()) {
                return Err(PolicyError::duplicate_state_name(
                    &policy.policy_id,
                    &state.name,
                ));
            }
        }

        if !names.contains(policy.default_state.as_str()) {
            return Err(PolicyError::default_state_not_found(
                &policy.policy_id,
                &policy.default_state,
            ));
        }

        for state in &policy.states {
            self.validate_state(state, &names)?;
        }

        tracing::debug!(policy_id = %policy.policy_id, states = policy.states.len(), "policy validated");
        Ok(())
    }

    fn validate_state(&self, state: &State, state_names: &HashSet<&str>) -> Result<(), PolicyError> {
        let last = state.actions.len().saturating_sub(1);
        for (i, action) in state.actions.iter().enumerate() {
            if matches!(action.kind, ActionKind::Delete(_)) {
                if i != last {
                    return Err(PolicyError::delete_not_last(&state.name));
                }
                if !state.transitions.is_empty() {
                    return Err(PolicyError::transitions_after_delete(&state.name));
                }
            }
            self.validate_action(&state.name, action)?;
        }

        for transition in &state.transitions {
            self.validate_transition(&state.name, transition, state_names)?;
        }

        Ok(())
    }

    fn validate_transition(
        &self,
        state: &str,
        transition: &Transition,
        state_names: &HashSet<&str>,
    ) -> Result<(), PolicyError> {
        if !state_names.contains(transition.state_name.as_str()) {
            return Err(PolicyError::dangling_transition(state, &transition.state_name));
        }

        if let Some(conditions) = &transition.conditions {
            let set = conditions.set_count();
            if set != 1 {
                return Err(PolicyError::ambiguous_conditions(
                    state,
                    &transition.state_name,
                    set,
                ));
            }

            if let Some(expr) = &conditions.cron {
                if let Err(e) = cron::Schedule::from_str(expr) {
                    return Err(PolicyError::invalid_cron(state, expr, &e.to_string()));
                }
            }
        }

        Ok(())
    }

    fn validate_action(&self, state: &str, action: &Action) -> Result<(), PolicyError> {
        let name = action.kind.type_name();

        match &action.kind {
            ActionKind::ForceMerge(config) => {
                if config.max_num_segments == 0 {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "max_num_segments must be positive",
                    ));
                }
            }

            ActionKind::Shrink(config) => {
                let set = config.sizing_options();
                if set != 1 {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        format!(
                            "exactly one of num_new_shards, max_shard_size_bytes, \
                             percentage_of_source_shards must be set, found {}",
                            set
                        ),
                    ));
                }
                if let Some(n) = config.num_new_shards {
                    if n == 0 {
                        return Err(PolicyError::invalid_action(
                            state,
                            name,
                            "num_new_shards must be positive",
                        ));
                    }
                }
                if let Some(p) = config.percentage_of_source_shards {
                    if !(p > 0.0 && p < 1.0) {
                        return Err(PolicyError::invalid_action(
                            state,
                            name,
                            "percentage_of_source_shards must be in (0, 1)",
                        ));
                    }
                }
            }

            ActionKind::Allocation(config) => {
                if config.is_empty() {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "at least one of require, include, exclude must be non-empty",
                    ));
                }
            }

            ActionKind::Snapshot(config) => {
                if config.repository.trim().is_empty() || config.snapshot.trim().is_empty() {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "repository and snapshot must be non-empty",
                    ));
                }
            }

            ActionKind::Notification(config) => {
                if config.channel.trim().is_empty() {
                    return Err(PolicyError::invalid_action(state, name, "channel must be non-empty"));
                }
                if config.message_template.trim().is_empty() {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "message_template must be non-empty",
                    ));
                }
            }

            ActionKind::Rollup(config) => {
                if config.job_id_prefix.trim().is_empty() {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "job_id_prefix must be non-empty",
                    ));
                }
                if !config.config.is_object() {
                    return Err(PolicyError::invalid_action(
                        state,
                        name,
                        "config must be a JSON object",
                    ));
                }
            }

            // No parameters to check.
            ActionKind::Rollover(_)
            | ActionKind::ReadOnly(_)
            | ActionKind::ReadWrite(_)
            | ActionKind::ReplicaCount(_)
            | ActionKind::Close(_)
            | ActionKind::Open(_)
            | ActionKind::Delete(_)
            | ActionKind::IndexPriority(_) => {}
        }

        Ok(())
    }
}

impl Default for PolicyValidator {
    fn default() -> Self {
        Self::new()
    }
}
