//! Replica arithmetic for progressive scaling
//!
//! Pure functions deciding the next ReplicaSet sizes under the maxSurge /
//! maxUnavailable bounds. Percentages round up for surge and down for
//! unavailable; weight splits round in favor of the stable side.

use crate::crd::rollout::CanaryStrategy;
use k8s_openapi::api::apps::v1::ReplicaSet;

/// Parse an absolute count ("5") or percentage ("25%") of `total`.
///
/// Percentages round up when `round_up` is set (surge semantics) and down
/// otherwise (unavailable semantics). Malformed or out-of-range values
/// resolve to 0; validation rejects them before reconciliation.
pub fn resolve_int_or_percent(value: &str, total: i32, round_up: bool) -> i32 {
    if let Some(percent_str) = value.strip_suffix('%') {
        match percent_str.trim().parse::<i64>() {
            Ok(percent) if (0..=100).contains(&percent) => {
                let scaled = total as i64 * percent;
                let result = if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                };
                result as i32
            }
            _ => 0,
        }
    } else {
        match value.trim().parse::<i32>() {
            Ok(abs) if abs >= 0 => abs,
            _ => 0,
        }
    }
}

/// Whether a maxSurge/maxUnavailable value is well-formed
pub fn is_valid_int_or_percent(value: &str) -> bool {
    if let Some(percent_str) = value.strip_suffix('%') {
        matches!(percent_str.trim().parse::<i32>(), Ok(p) if (0..=100).contains(&p))
    } else {
        matches!(value.trim().parse::<i32>(), Ok(abs) if abs >= 0)
    }
}

/// Absolute maxSurge for the canary strategy (percentages round up)
pub fn max_surge(canary: &CanaryStrategy, replicas: i32) -> i32 {
    resolve_int_or_percent(canary.max_surge(), replicas, true)
}

/// Absolute maxUnavailable for the canary strategy (percentages round down)
pub fn max_unavailable(canary: &CanaryStrategy, replicas: i32) -> i32 {
    resolve_int_or_percent(canary.max_unavailable(), replicas, false)
}

/// Replicas the canary ReplicaSet should converge to for a traffic weight.
///
/// Rounds down: when the weight cannot be realized exactly with integer
/// replicas, the stable side keeps the extra pod.
pub fn canary_replicas_for_weight(desired: i32, weight: i32) -> i32 {
    if weight >= 100 {
        return desired;
    }
    if weight <= 0 {
        return 0;
    }
    ((desired as i64 * weight as i64) / 100) as i32
}

/// Spec'd replica count of a ReplicaSet
pub fn spec_replicas(rs: &ReplicaSet) -> i32 {
    rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// Actual (observed) replica count of a ReplicaSet
pub fn actual_replicas(rs: &ReplicaSet) -> i32 {
    rs.status.as_ref().map(|s| s.replicas).unwrap_or(0)
}

/// Ready replica count of a ReplicaSet
pub fn ready_replicas(rs: &ReplicaSet) -> i32 {
    rs.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

/// Available replica count of a ReplicaSet (ready for minReadySeconds)
pub fn available_replicas(rs: &ReplicaSet) -> i32 {
    rs.status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0)
}

/// Sum of spec'd replicas across ReplicaSets
pub fn total_spec_replicas(rss: &[ReplicaSet]) -> i32 {
    rss.iter().map(spec_replicas).sum()
}

/// Sum of available replicas across ReplicaSets
pub fn total_available_replicas(rss: &[ReplicaSet]) -> i32 {
    rss.iter().map(available_replicas).sum()
}

/// Target sizes for the canary and stable ReplicaSets for one reconcile.
///
/// Moves both sides one bounded step toward the converged weight split:
/// - the canary scales up first, limited so the total spec'd replicas never
///   exceed `desired + maxSurge`;
/// - the stable side scales down only as far as observed availability allows,
///   keeping available replicas at or above `desired - maxUnavailable`.
///
/// Repeated application converges to
/// `(canary_replicas_for_weight(desired, weight), desired - that)`.
pub fn calculate_canary_replica_counts(
    desired: i32,
    weight: i32,
    surge: i32,
    unavailable: i32,
    canary: ScaleInput,
    stable: ScaleInput,
) -> (i32, i32) {
    let converged_canary = canary_replicas_for_weight(desired, weight);
    let converged_stable = desired - converged_canary;

    let max_total = desired + surge;
    let min_available = (desired - unavailable).max(0);

    // Scale up the canary first, bounded by the surge ceiling over the
    // currently spec'd totals.
    let total_spec = canary.spec + stable.spec;
    let mut canary_target = canary.spec;
    if canary.spec < converged_canary {
        let headroom = (max_total - total_spec).max(0);
        canary_target = (canary.spec + headroom).min(converged_canary);
    } else if canary.spec > converged_canary {
        canary_target = converged_canary;
    }

    // Scale down the stable side only as observed availability allows.
    let mut stable_target = stable.spec;
    if stable.spec > converged_stable {
        let total_available = canary.available + stable.available;
        let scale_down_budget = (total_available - min_available).max(0);
        stable_target = (stable.spec - scale_down_budget).max(converged_stable);
    } else if stable.spec < converged_stable {
        // Rollback toward stable: grow it without waiting on the canary.
        let headroom = (max_total - total_spec).max(0);
        stable_target = (stable.spec + headroom).min(converged_stable);
    }

    (canary_target, stable_target)
}

/// Spec'd and observed-available sizes of one ReplicaSet
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleInput {
    pub spec: i32,
    pub available: i32,
}

impl ScaleInput {
    pub fn of(rs: &ReplicaSet) -> Self {
        Self {
            spec: spec_replicas(rs),
            available: available_replicas(rs),
        }
    }
}

/// Order ReplicaSets for scale-down: oldest first, ties broken by name.
pub fn sort_for_scale_down(rss: &mut [ReplicaSet]) {
    rss.sort_by(|a, b| {
        let a_ts = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let b_ts = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
        a_ts.cmp(&b_ts)
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}
