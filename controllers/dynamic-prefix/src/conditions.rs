//! Status condition handling.
//!
//! Mirrors the Kubernetes `meta.SetStatusCondition` contract:
//! `lastTransitionTime` moves only when the condition's status actually
//! flips; reason, message, and observedGeneration always track the latest
//! reconcile.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Build a condition stamped with the current time and generation.
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Insert or update a condition by type, preserving `lastTransitionTime`
/// when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Find a condition by type.
#[allow(dead_code)] // Used by tests; kept for status inspection helpers
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_kept_while_status_unchanged() {
        let mut conditions = Vec::new();

        set_condition(
            &mut conditions,
            new_condition("PrefixAcquired", STATUS_TRUE, "PrefixAcquired", "first", Some(1)),
        );
        let first_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            new_condition("PrefixAcquired", STATUS_TRUE, "PrefixAcquired", "second", Some(2)),
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn transition_time_moves_on_status_flip() {
        let mut conditions = vec![new_condition(
            "PrefixAcquired",
            STATUS_FALSE,
            "WaitingForPrefix",
            "waiting",
            Some(1),
        )];
        // Force an observably older timestamp.
        conditions[0].last_transition_time =
            Time(Utc::now() - chrono::Duration::seconds(90));
        let old_transition = conditions[0].last_transition_time.clone();

        set_condition(
            &mut conditions,
            new_condition("PrefixAcquired", STATUS_TRUE, "PrefixAcquired", "got it", Some(1)),
        );

        assert_ne!(conditions[0].last_transition_time, old_transition);
        assert_eq!(conditions[0].status, STATUS_TRUE);
    }

    #[test]
    fn distinct_types_coexist() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            new_condition("PrefixAcquired", STATUS_TRUE, "PrefixAcquired", "", None),
        );
        set_condition(
            &mut conditions,
            new_condition("Degraded", STATUS_FALSE, "Healthy", "", None),
        );

        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Degraded").is_some());
        assert!(find_condition(&conditions, "PoolsSynced").is_none());
    }
}
