//! Pod restart sweep
//!
//! When spec.restartAt is set to a time in the past, every pod older than
//! that timestamp is deleted, one at a time, ordered stable first, then the
//! new ReplicaSet, then oldest-first. Pod deletion does not change the
//! owning ReplicaSet's availableReplicas, so no watch event fires; the
//! sweep requeues itself on a fixed cadence until it completes.

use super::reconcile::ReconcileError;
use super::replicaset;
use crate::controller::clock;
use crate::crd::rollout::Rollout;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use std::time::Duration;
use tracing::info;

/// Requeue cadence while a sweep is in progress
pub const RESTART_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Whether the rollout has a restart pending: restartAt is in the past and
/// has not been acknowledged by status.restartedAt.
pub fn needs_restart(rollout: &Rollout, now: DateTime<Utc>) -> bool {
    let Some(restart_at) = rollout.spec.restart_at.as_deref() else {
        return false;
    };
    let Some(restart_time) = clock::parse_rfc3339(restart_at) else {
        return false;
    };
    if restart_time > now {
        return false;
    }
    rollout
        .status
        .as_ref()
        .and_then(|s| s.restarted_at.as_deref())
        != Some(restart_at)
}

/// Order ReplicaSets for restart priority: stable, then new, then the rest
/// oldest-first.
pub fn sort_for_restart(
    rss: &mut [ReplicaSet],
    stable_hash: Option<&str>,
    new_hash: Option<&str>,
) {
    rss.sort_by(|a, b| {
        let rank = |rs: &ReplicaSet| -> u8 {
            let hash = replicaset::pod_hash_of(rs);
            if hash.is_some() && hash == stable_hash {
                0
            } else if hash.is_some() && hash == new_hash {
                1
            } else {
                2
            }
        };
        rank(a).cmp(&rank(b)).then_with(|| {
            let a_ts = a.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let b_ts = b.metadata.creation_timestamp.as_ref().map(|t| t.0);
            a_ts.cmp(&b_ts)
        })
    });
}

/// Outcome of one sweep pass
pub enum RestartOutcome {
    /// Every pod is newer than restartAt; record completion
    Completed,
    /// A pod was deleted (or one is still terminating); check again later
    InProgress,
    /// Not every ReplicaSet is fully available; deleting now would drop
    /// below capacity
    Blocked,
}

/// Run one pass of the sweep: delete at most one pod older than restartAt.
pub async fn reconcile_restart(
    rollout: &Rollout,
    owned: &[ReplicaSet],
    stable_hash: Option<&str>,
    new_hash: Option<&str>,
    pod_api: &Api<Pod>,
    now: DateTime<Utc>,
) -> Result<RestartOutcome, ReconcileError> {
    let Some(restart_at) = rollout.spec.restart_at.as_deref() else {
        return Ok(RestartOutcome::Completed);
    };
    let Some(restart_time) = clock::parse_rfc3339(restart_at) else {
        return Ok(RestartOutcome::Completed);
    };

    // Deleting pods while a set is below capacity would compound the
    // unavailability; wait for full availability first.
    for rs in owned {
        let desired = super::scale::spec_replicas(rs);
        if desired > 0 && super::scale::available_replicas(rs) != desired {
            info!(
                replicaset = %rs.name_any(),
                "Pod restart waiting for full availability"
            );
            return Ok(RestartOutcome::Blocked);
        }
    }

    let mut ordered: Vec<ReplicaSet> = owned
        .iter()
        .filter(|rs| super::scale::spec_replicas(rs) > 0)
        .cloned()
        .collect();
    sort_for_restart(&mut ordered, stable_hash, new_hash);

    for rs in &ordered {
        let Some(selector) = rs
            .spec
            .as_ref()
            .map(|s| super::reconcile::label_selector_query(&s.selector))
            .transpose()?
        else {
            continue;
        };
        let pods = pod_api
            .list(&ListParams::default().labels(&selector))
            .await?;

        // One terminating pod at a time keeps capacity loss bounded.
        if pods
            .items
            .iter()
            .any(|pod| pod.metadata.deletion_timestamp.is_some())
        {
            return Ok(RestartOutcome::InProgress);
        }

        for pod in &pods.items {
            let created = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let stale = created.map(|c| c < restart_time).unwrap_or(false);
            if stale {
                let pod_name = pod.name_any();
                info!(pod = %pod_name, restart_at = %restart_at, "Restarting pod older than restartAt");
                pod_api.delete(&pod_name, &Default::default()).await?;
                return Ok(RestartOutcome::InProgress);
            }
        }
    }

    Ok(RestartOutcome::Completed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::rollout::{
        RolloutSpec, RolloutStatus, RolloutStrategy, POD_TEMPLATE_HASH_LABEL,
    };
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use kube::api::ObjectMeta;

    fn rollout_with_restart(restart_at: Option<String>, restarted_at: Option<String>) -> Rollout {
        Rollout {
            metadata: ObjectMeta::default(),
            spec: RolloutSpec {
                replicas: 3,
                selector: LabelSelector::default(),
                template: PodTemplateSpec::default(),
                strategy: RolloutStrategy::default(),
                min_ready_seconds: None,
                progress_deadline_seconds: None,
                revision_history_limit: None,
                paused: None,
                restart_at,
            },
            status: restarted_at.map(|at| RolloutStatus {
                restarted_at: Some(at),
                ..Default::default()
            }),
        }
    }

    fn rs_with_hash(name: &str, hash: &str, created_secs: i64) -> ReplicaSet {
        use chrono::TimeZone;
        ReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string())]
                        .into_iter()
                        .collect(),
                ),
                creation_timestamp: Some(Time(
                    chrono::Utc
                        .timestamp_opt(1_700_000_000 + created_secs, 0)
                        .single()
                        .unwrap(),
                )),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_needs_restart_when_in_past_and_unacknowledged() {
        let now = chrono::Utc::now();
        let past = (now - chrono::Duration::minutes(5)).to_rfc3339();
        let rollout = rollout_with_restart(Some(past), None);
        assert!(needs_restart(&rollout, now));
    }

    #[test]
    fn test_no_restart_when_in_future() {
        let now = chrono::Utc::now();
        let future = (now + chrono::Duration::minutes(5)).to_rfc3339();
        let rollout = rollout_with_restart(Some(future), None);
        assert!(!needs_restart(&rollout, now));
    }

    #[test]
    fn test_no_restart_when_acknowledged() {
        let now = chrono::Utc::now();
        let past = (now - chrono::Duration::minutes(5)).to_rfc3339();
        let rollout = rollout_with_restart(Some(past.clone()), Some(past));
        assert!(!needs_restart(&rollout, now));
    }

    #[test]
    fn test_no_restart_without_spec_field() {
        let rollout = rollout_with_restart(None, None);
        assert!(!needs_restart(&rollout, chrono::Utc::now()));
    }

    #[test]
    fn test_restart_order_stable_then_new_then_oldest() {
        let mut rss = vec![
            rs_with_hash("old-b", "h-old-b", 200),
            rs_with_hash("new", "h-new", 300),
            rs_with_hash("old-a", "h-old-a", 100),
            rs_with_hash("stable", "h-stable", 250),
        ];
        sort_for_restart(&mut rss, Some("h-stable"), Some("h-new"));
        let names: Vec<_> = rss.iter().map(|rs| rs.name_any()).collect();
        assert_eq!(names, vec!["stable", "new", "old-a", "old-b"]);
    }
}
