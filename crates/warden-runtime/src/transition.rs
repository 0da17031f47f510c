//! Transition evaluation.
//!
//! Once a state's actions are exhausted, its transitions are evaluated in
//! list order against a fresh observation of the index; the first transition
//! whose condition holds (or which has no condition) wins. No match leaves
//! the index in its current state; conditions like age become true on a
//! later tick.

use crate::adapter::IndexObservation;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use warden_core::metadata::ManagedIndexMetadata;
use warden_core::policy::{Transition, TransitionConditions};

/// Find the first transition whose condition holds.
pub fn evaluate<'a>(
    transitions: &'a [Transition],
    observation: &IndexObservation,
    metadata: &ManagedIndexMetadata,
    now: DateTime<Utc>,
) -> Option<&'a Transition> {
    transitions.iter().find(|t| match &t.conditions {
        None => true,
        Some(conditions) => condition_holds(conditions, observation, metadata, now),
    })
}

fn condition_holds(
    conditions: &TransitionConditions,
    observation: &IndexObservation,
    metadata: &ManagedIndexMetadata,
    now: DateTime<Utc>,
) -> bool {
    if let Some(min_age) = conditions.min_age {
        let age = now.signed_duration_since(observation.creation_date);
        return age >= chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::MAX);
    }

    if let Some(min_docs) = conditions.min_doc_count {
        return observation.doc_count >= min_docs;
    }

    if let Some(min_size) = conditions.min_size_bytes {
        return observation.size_bytes >= min_size;
    }

    if let Some(expr) = &conditions.cron {
        // Matches once the expression's first firing after the state was
        // entered has passed. The validator guarantees the expression
        // parses; an unparseable one (schema drift) simply never matches.
        let Ok(schedule) = cron::Schedule::from_str(expr) else {
            return false;
        };
        let entered = metadata
            .state
            .as_ref()
            .map(|s| s.start_time)
            .unwrap_or(now);
        return schedule
            .after(&entered)
            .next()
            .is_some_and(|next| next <= now);
    }

    if let Some(min_rollover_age) = conditions.rollover_age {
        let Some(rolled_at) = observation.rolled_over_at else {
            return false;
        };
        let age = now.signed_duration_since(rolled_at);
        return age
            >= chrono::Duration::from_std(min_rollover_age).unwrap_or(chrono::Duration::MAX);
    }

    // Empty conditions object (rejected by the validator): never matches.
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use warden_core::policy::Policy;

    fn observation(doc_count: u64, age: ChronoDuration) -> IndexObservation {
        IndexObservation {
            doc_count,
            size_bytes: 0,
            creation_date: Utc::now() - age,
            segment_count: 1,
            is_open: true,
            read_only: false,
            number_of_shards: 1,
            number_of_replicas: 1,
            has_rollover_alias: false,
            rolled_over_at: None,
        }
    }

    fn metadata() -> ManagedIndexMetadata {
        let policy = Policy::from_json(
            r#"{"policy_id": "p", "default_state": "a",
                "states": [{"name": "a", "actions": [], "transitions": []}]}"#,
        )
        .unwrap();
        ManagedIndexMetadata::initial("logs-1", "u1", &policy, 0, 0, Utc::now())
    }

    fn doc_count_transition(target: &str, min: u64) -> Transition {
        Transition {
            state_name: target.to_string(),
            conditions: Some(TransitionConditions {
                min_doc_count: Some(min),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn first_matching_transition_wins() {
        let transitions = vec![
            doc_count_transition("warm", 1000),
            doc_count_transition("cold", 10),
        ];
        let now = Utc::now();

        let obs = observation(0, ChronoDuration::zero());
        assert!(evaluate(&transitions, &obs, &metadata(), now).is_none());

        let obs = observation(50, ChronoDuration::zero());
        let matched = evaluate(&transitions, &obs, &metadata(), now).unwrap();
        assert_eq!(matched.state_name, "cold");

        let obs = observation(5000, ChronoDuration::zero());
        let matched = evaluate(&transitions, &obs, &metadata(), now).unwrap();
        assert_eq!(matched.state_name, "warm");
    }

    #[test]
    fn unconditional_transition_always_matches() {
        let transitions = vec![Transition {
            state_name: "next".to_string(),
            conditions: None,
        }];
        let obs = observation(0, ChronoDuration::zero());
        assert!(evaluate(&transitions, &obs, &metadata(), Utc::now()).is_some());
    }

    #[test]
    fn min_age_compares_against_creation_date() {
        let transitions = vec![Transition {
            state_name: "old".to_string(),
            conditions: Some(TransitionConditions {
                min_age: Some(Duration::from_secs(7 * 24 * 3600)),
                ..Default::default()
            }),
        }];
        let now = Utc::now();

        let young = observation(0, ChronoDuration::days(1));
        assert!(evaluate(&transitions, &young, &metadata(), now).is_none());

        let old = observation(0, ChronoDuration::days(8));
        assert!(evaluate(&transitions, &old, &metadata(), now).is_some());
    }

    #[test]
    fn rollover_age_requires_a_rollover() {
        let transitions = vec![Transition {
            state_name: "next".to_string(),
            conditions: Some(TransitionConditions {
                rollover_age: Some(Duration::from_secs(3600)),
                ..Default::default()
            }),
        }];
        let now = Utc::now();

        let mut obs = observation(0, ChronoDuration::days(30));
        assert!(evaluate(&transitions, &obs, &metadata(), now).is_none());

        obs.rolled_over_at = Some(now - ChronoDuration::hours(2));
        assert!(evaluate(&transitions, &obs, &metadata(), now).is_some());

        obs.rolled_over_at = Some(now - ChronoDuration::minutes(5));
        assert!(evaluate(&transitions, &obs, &metadata(), now).is_none());
    }

    #[test]
    fn cron_matches_after_first_firing_since_state_entry() {
        // Every minute.
        let transitions = vec![Transition {
            state_name: "next".to_string(),
            conditions: Some(TransitionConditions {
                cron: Some("0 * * * * *".to_string()),
                ..Default::default()
            }),
        }];
        let obs = observation(0, ChronoDuration::zero());

        // State entered two minutes ago: a firing has passed.
        let mut meta = metadata();
        meta.state.as_mut().unwrap().start_time = Utc::now() - ChronoDuration::minutes(2);
        assert!(evaluate(&transitions, &obs, &meta, Utc::now()).is_some());
    }
}
