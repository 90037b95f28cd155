//! Status projection and condition calculus
//!
//! `calculate_base_status` is a pure function of the observed ReplicaSets and
//! the rollout; strategy reconcilers fill in their sub-status and phase on
//! top. Conditions follow the native Deployment semantics: Progressing's
//! lastUpdateTime only advances on observable progress, which is what the
//! progress deadline measures against.

use super::replicaset;
use super::scale;
use crate::controller::clock;
use crate::crd::rollout::{
    ConditionStatus, Rollout, RolloutCondition, RolloutConditionType, RolloutStatus,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;

// Progressing condition reasons
pub const REASON_NEW_RS_CREATED: &str = "NewReplicaSetCreated";
pub const REASON_RS_UPDATED: &str = "ReplicaSetUpdated";
pub const REASON_NEW_RS_AVAILABLE: &str = "NewReplicaSetAvailable";
pub const REASON_PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";
pub const REASON_ROLLOUT_ABORTED: &str = "RolloutAborted";

// Available condition reasons
pub const REASON_MIN_AVAILABLE: &str = "MinimumReplicasAvailable";
pub const REASON_MIN_UNAVAILABLE: &str = "MinimumReplicasUnavailable";

// InvalidSpec reason
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

pub fn get_condition<'a>(
    status: &'a RolloutStatus,
    condition_type: RolloutConditionType,
) -> Option<&'a RolloutCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

/// Insert or update a condition.
///
/// When the status value is unchanged the lastTransitionTime is preserved;
/// when status, reason, and message are all unchanged the existing condition
/// is kept as-is so repeated reconciles do not churn timestamps.
pub fn set_condition(status: &mut RolloutStatus, mut condition: RolloutCondition) {
    if let Some(existing) = status
        .conditions
        .iter_mut()
        .find(|c| c.condition_type == condition.condition_type)
    {
        if existing.status == condition.status
            && existing.reason == condition.reason
            && existing.message == condition.message
        {
            return;
        }
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = condition;
    } else {
        status.conditions.push(condition);
    }
}

pub fn remove_condition(status: &mut RolloutStatus, condition_type: RolloutConditionType) {
    status
        .conditions
        .retain(|c| c.condition_type != condition_type);
}

pub fn new_condition(
    condition_type: RolloutConditionType,
    cond_status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> RolloutCondition {
    RolloutCondition {
        condition_type,
        status: cond_status,
        last_update_time: now.to_rfc3339(),
        last_transition_time: now.to_rfc3339(),
        reason: reason.to_string(),
        message: message.to_string(),
    }
}

/// Project the observed ReplicaSets into the rollout's status counts.
///
/// Pure: carries forward the step/pause/strategy bookkeeping from the
/// previous status and recomputes everything derivable from observation.
pub fn calculate_base_status(
    rollout: &Rollout,
    all_rss: &[ReplicaSet],
    new_rs: Option<&ReplicaSet>,
    pod_hash: &str,
) -> RolloutStatus {
    let previous = rollout.status.clone().unwrap_or_default();

    let observed_generation = replicaset::compute_spec_hash(rollout).ok();

    RolloutStatus {
        current_pod_hash: Some(pod_hash.to_string()),
        replicas: all_rss.iter().map(scale::actual_replicas).sum(),
        updated_replicas: new_rs.map(scale::actual_replicas).unwrap_or(0),
        ready_replicas: all_rss.iter().map(scale::ready_replicas).sum(),
        available_replicas: all_rss.iter().map(scale::available_replicas).sum(),
        observed_generation,
        ..previous
    }
}

/// A rollout is complete when the new ReplicaSet is saturated and every
/// other owned set has been scaled to zero.
pub fn is_complete(rollout: &Rollout, status: &RolloutStatus) -> bool {
    status.updated_replicas == rollout.spec.replicas
        && status.replicas == rollout.spec.replicas
        && status.available_replicas == rollout.spec.replicas
        && status.current_pod_hash.is_some()
}

/// Update the Available condition from the availability floor.
pub fn update_available_condition(
    rollout: &Rollout,
    status: &mut RolloutStatus,
    max_unavailable: i32,
    now: DateTime<Utc>,
) {
    let min_available = (rollout.spec.replicas - max_unavailable).max(0);
    let condition = if status.available_replicas >= min_available {
        new_condition(
            RolloutConditionType::Available,
            ConditionStatus::True,
            REASON_MIN_AVAILABLE,
            "Rollout has minimum availability",
            now,
        )
    } else {
        new_condition(
            RolloutConditionType::Available,
            ConditionStatus::False,
            REASON_MIN_UNAVAILABLE,
            "Rollout does not have minimum availability",
            now,
        )
    };
    set_condition(status, condition);
}

/// Whether observable progress happened between two status projections
fn has_progressed(previous: &RolloutStatus, current: &RolloutStatus) -> bool {
    current.updated_replicas > previous.updated_replicas
        || current.available_replicas > previous.available_replicas
        || current.replicas < previous.replicas
        || previous.current_pod_hash != current.current_pod_hash
}

/// Progress deadline check: True iff the Progressing condition has not been
/// refreshed within progressDeadlineSeconds. Never trips while paused.
pub fn deadline_exceeded(rollout: &Rollout, status: &RolloutStatus, now: DateTime<Utc>) -> bool {
    if rollout.spec.paused() || status.pause_start_time.is_some() {
        return false;
    }
    let Some(progressing) = get_condition(status, RolloutConditionType::Progressing) else {
        return false;
    };
    if progressing.reason == REASON_NEW_RS_AVAILABLE
        || progressing.reason == REASON_PROGRESS_DEADLINE_EXCEEDED
    {
        return progressing.reason == REASON_PROGRESS_DEADLINE_EXCEEDED;
    }
    clock::seconds_since(&progressing.last_update_time, now)
        .map(|elapsed| elapsed > rollout.spec.progress_deadline_seconds() as i64)
        .unwrap_or(false)
}

/// Update the Progressing condition.
///
/// - complete → True/NewReplicaSetAvailable (stable timestamps)
/// - observable progress → True/ReplicaSetUpdated with a fresh
///   lastUpdateTime (restarting the deadline clock)
/// - deadline exceeded while unpaused → False/ProgressDeadlineExceeded
pub fn update_progressing_condition(
    rollout: &Rollout,
    status: &mut RolloutStatus,
    now: DateTime<Utc>,
) {
    let previous = rollout.status.clone().unwrap_or_default();

    if is_complete(rollout, status) {
        set_condition(
            status,
            new_condition(
                RolloutConditionType::Progressing,
                ConditionStatus::True,
                REASON_NEW_RS_AVAILABLE,
                "Rollout has successfully progressed",
                now,
            ),
        );
        return;
    }

    if has_progressed(&previous, status)
        || get_condition(status, RolloutConditionType::Progressing).is_none()
    {
        // Fresh lastUpdateTime restarts the progress deadline.
        let reason = if previous.current_pod_hash != status.current_pod_hash {
            REASON_NEW_RS_CREATED
        } else {
            REASON_RS_UPDATED
        };
        let mut condition = new_condition(
            RolloutConditionType::Progressing,
            ConditionStatus::True,
            reason,
            "Rollout is progressing",
            now,
        );
        // Preserve the transition time across successive progress updates.
        if let Some(existing) = get_condition(status, RolloutConditionType::Progressing) {
            if existing.status == ConditionStatus::True {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
        }
        remove_condition(status, RolloutConditionType::Progressing);
        status.conditions.push(condition);
        return;
    }

    if deadline_exceeded(rollout, status, now) {
        set_condition(
            status,
            new_condition(
                RolloutConditionType::Progressing,
                ConditionStatus::False,
                REASON_PROGRESS_DEADLINE_EXCEEDED,
                &format!(
                    "Rollout exceeded its progress deadline of {}s",
                    rollout.spec.progress_deadline_seconds()
                ),
                now,
            ),
        );
    }
}

/// Whether the Progressing condition records an exceeded deadline
pub fn progress_deadline_condition_exceeded(status: &RolloutStatus) -> bool {
    get_condition(status, RolloutConditionType::Progressing)
        .map(|c| {
            c.status == ConditionStatus::False && c.reason == REASON_PROGRESS_DEADLINE_EXCEEDED
        })
        .unwrap_or(false)
}

/// Mark the rollout spec invalid. Every other condition is dropped so stale
/// progress state cannot linger next to an InvalidSpec verdict.
pub fn set_invalid_spec_condition(status: &mut RolloutStatus, message: &str, now: DateTime<Utc>) {
    let condition = new_condition(
        RolloutConditionType::InvalidSpec,
        ConditionStatus::True,
        REASON_INVALID_SPEC,
        message,
        now,
    );
    set_condition(status, condition);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::rollout::{RolloutSpec, RolloutStrategy};
    use k8s_openapi::api::apps::v1::ReplicaSetStatus;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use kube::api::ObjectMeta;

    fn rollout_with_replicas(replicas: i32) -> Rollout {
        Rollout {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: RolloutSpec {
                replicas,
                selector: LabelSelector::default(),
                template: PodTemplateSpec::default(),
                strategy: RolloutStrategy::default(),
                min_ready_seconds: None,
                progress_deadline_seconds: Some(600),
                revision_history_limit: None,
                paused: None,
                restart_at: None,
            },
            status: None,
        }
    }

    fn rs_with_counts(replicas: i32, ready: i32, available: i32) -> ReplicaSet {
        ReplicaSet {
            status: Some(ReplicaSetStatus {
                replicas,
                ready_replicas: Some(ready),
                available_replicas: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_status_sums_counts() {
        let rollout = rollout_with_replicas(5);
        let new_rs = rs_with_counts(2, 2, 1);
        let old_rs = rs_with_counts(3, 3, 3);
        let all = vec![new_rs.clone(), old_rs];

        let status = calculate_base_status(&rollout, &all, Some(&new_rs), "abc123");
        assert_eq!(status.replicas, 5);
        assert_eq!(status.updated_replicas, 2);
        assert_eq!(status.ready_replicas, 5);
        assert_eq!(status.available_replicas, 4);
        assert_eq!(status.current_pod_hash.as_deref(), Some("abc123"));
        assert!(status.observed_generation.is_some());
    }

    #[test]
    fn test_base_status_is_deterministic() {
        let rollout = rollout_with_replicas(3);
        let new_rs = rs_with_counts(3, 3, 3);
        let all = vec![new_rs.clone()];
        let a = calculate_base_status(&rollout, &all, Some(&new_rs), "h1");
        let b = calculate_base_status(&rollout, &all, Some(&new_rs), "h1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_available_condition_thresholds() {
        let rollout = rollout_with_replicas(10);
        let now = Utc::now();
        let mut status = RolloutStatus {
            available_replicas: 8,
            ..Default::default()
        };
        update_available_condition(&rollout, &mut status, 2, now);
        let cond = get_condition(&status, RolloutConditionType::Available).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);

        status.available_replicas = 7;
        update_available_condition(&rollout, &mut status, 2, now);
        let cond = get_condition(&status, RolloutConditionType::Available).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_MIN_UNAVAILABLE);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let mut status = RolloutStatus::default();
        set_condition(
            &mut status,
            new_condition(
                RolloutConditionType::Progressing,
                ConditionStatus::True,
                REASON_RS_UPDATED,
                "one",
                now,
            ),
        );
        set_condition(
            &mut status,
            new_condition(
                RolloutConditionType::Progressing,
                ConditionStatus::True,
                REASON_RS_UPDATED,
                "two",
                later,
            ),
        );
        let cond = get_condition(&status, RolloutConditionType::Progressing).unwrap();
        assert_eq!(cond.last_transition_time, now.to_rfc3339());
        assert_eq!(cond.message, "two");
    }

    #[test]
    fn test_set_condition_is_noop_when_unchanged() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let mut status = RolloutStatus::default();
        let cond = new_condition(
            RolloutConditionType::Available,
            ConditionStatus::True,
            REASON_MIN_AVAILABLE,
            "ok",
            now,
        );
        set_condition(&mut status, cond.clone());
        let mut unchanged = cond;
        unchanged.last_update_time = later.to_rfc3339();
        set_condition(&mut status, unchanged);
        let stored = get_condition(&status, RolloutConditionType::Available).unwrap();
        assert_eq!(stored.last_update_time, now.to_rfc3339());
    }

    #[test]
    fn test_progressing_complete_sets_new_rs_available() {
        let rollout = rollout_with_replicas(3);
        let now = Utc::now();
        let mut status = RolloutStatus {
            replicas: 3,
            updated_replicas: 3,
            available_replicas: 3,
            ready_replicas: 3,
            current_pod_hash: Some("h2".to_string()),
            ..Default::default()
        };
        update_progressing_condition(&rollout, &mut status, now);
        let cond = get_condition(&status, RolloutConditionType::Progressing).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, REASON_NEW_RS_AVAILABLE);
    }

    #[test]
    fn test_deadline_exceeded_after_stall() {
        let mut rollout = rollout_with_replicas(3);
        let start = Utc::now();
        let mut status = RolloutStatus {
            replicas: 3,
            updated_replicas: 1,
            available_replicas: 3,
            current_pod_hash: Some("h2".to_string()),
            ..Default::default()
        };
        status.conditions.push(new_condition(
            RolloutConditionType::Progressing,
            ConditionStatus::True,
            REASON_RS_UPDATED,
            "Rollout is progressing",
            start,
        ));

        // Within the deadline
        assert!(!deadline_exceeded(&rollout, &status, start + chrono::Duration::seconds(599)));
        // Past the deadline
        assert!(deadline_exceeded(&rollout, &status, start + chrono::Duration::seconds(601)));

        // Paused rollouts never trip the deadline
        rollout.spec.paused = Some(true);
        assert!(!deadline_exceeded(&rollout, &status, start + chrono::Duration::seconds(601)));
    }

    #[test]
    fn test_deadline_not_evaluated_when_complete() {
        let rollout = rollout_with_replicas(3);
        let start = Utc::now();
        let mut status = RolloutStatus::default();
        status.conditions.push(new_condition(
            RolloutConditionType::Progressing,
            ConditionStatus::True,
            REASON_NEW_RS_AVAILABLE,
            "done",
            start,
        ));
        assert!(!deadline_exceeded(&rollout, &status, start + chrono::Duration::days(1)));
    }
}
