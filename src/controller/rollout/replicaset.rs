//! Revision identity and ReplicaSet management
//!
//! A rollout revision is named by a stable content hash of its pod template.
//! This module computes that hash, finds or creates the ReplicaSet for the
//! current revision (adopting pre-existing ones), and carries the scaling
//! and cleanup primitives the strategy reconcilers drive.

use super::reconcile::ReconcileError;
use crate::crd::rollout::{
    CanaryStep, Rollout, MANAGED_LABEL, POD_TEMPLATE_HASH_LABEL, SCALE_DOWN_AT_LABEL,
};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Resource;
use tracing::{debug, info, warn};

/// FNV-1a over a byte stream. Deterministic across processes, unlike the
/// std DefaultHasher (SipHash with a random key).
fn fnv1a(bytes: impl Iterator<Item = u8>) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Strip labels the controller itself injects so that adopting a ReplicaSet
/// and re-hashing its template reproduces the original hash.
fn canonical_template(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut canonical = template.clone();
    if let Some(metadata) = canonical.metadata.as_mut() {
        if let Some(labels) = metadata.labels.as_mut() {
            labels.remove(POD_TEMPLATE_HASH_LABEL);
            labels.remove(MANAGED_LABEL);
            if labels.is_empty() {
                metadata.labels = None;
            }
        }
    }
    canonical
}

/// Compute the 10-character revision hash of a pod template.
///
/// The template is canonicalized (controller-injected labels removed) and
/// serialized to JSON; `k8s-openapi` maps are BTreeMaps, so key order is
/// stable. The collision counter feeds the hash input so that renaming after
/// a collision yields a fresh name.
pub fn compute_pod_template_hash(
    template: &PodTemplateSpec,
    collision_count: Option<i32>,
) -> Result<String, ReconcileError> {
    let canonical = canonical_template(template);
    let json = serde_json::to_string(&canonical)
        .map_err(|e| ReconcileError::SerializationError(e.to_string()))?;

    let collision_bytes = collision_count.map(|c| c.to_le_bytes());
    let bytes = json
        .as_bytes()
        .iter()
        .copied()
        .chain(collision_bytes.into_iter().flatten());

    Ok(format!("{:016x}", fnv1a(bytes))[..10].to_string())
}

/// Hash of the canary step list; a change invalidates the step index
pub fn compute_step_hash(steps: &[CanaryStep]) -> Result<String, ReconcileError> {
    let json = serde_json::to_string(steps)
        .map_err(|e| ReconcileError::SerializationError(e.to_string()))?;
    Ok(format!("{:016x}", fnv1a(json.bytes()))[..10].to_string())
}

/// Stable hash of the whole rollout spec, persisted as observedGeneration
pub fn compute_spec_hash(rollout: &Rollout) -> Result<String, ReconcileError> {
    let json = serde_json::to_string(&rollout.spec)
        .map_err(|e| ReconcileError::SerializationError(e.to_string()))?;
    Ok(format!("{:016x}", fnv1a(json.bytes()))[..10].to_string())
}

/// The revision hash a ReplicaSet carries, if the controller labeled it
pub fn pod_hash_of(rs: &ReplicaSet) -> Option<&str> {
    rs.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(POD_TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}

/// A ReplicaSet is saturated when every desired pod has been available for
/// minReadySeconds (which the ReplicaSet's own availableReplicas accounting
/// enforces).
pub fn is_saturated(desired: i32, rs: &ReplicaSet) -> bool {
    super::scale::spec_replicas(rs) == desired
        && super::scale::available_replicas(rs) == desired
}

/// Whether this rollout controller-owns the ReplicaSet
pub fn is_owned_by(rollout: &Rollout, rs: &ReplicaSet) -> bool {
    let rollout_uid = rollout.meta().uid.as_deref();
    rs.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter().any(|r| {
                r.controller.unwrap_or(false)
                    && r.kind == "Rollout"
                    && Some(r.uid.as_str()) == rollout_uid
            })
        })
        .unwrap_or(false)
}

/// Build the ReplicaSet for a revision: name `{rollout}-{hash}`, the
/// revision and managed labels on both the object and its pod template, the
/// rollout's selector narrowed by the revision label, and a controller owner
/// reference.
pub fn build_replica_set(
    rollout: &Rollout,
    pod_hash: &str,
    replicas: i32,
) -> Result<ReplicaSet, ReconcileError> {
    let rollout_name = rollout
        .metadata
        .name
        .as_ref()
        .ok_or(ReconcileError::MissingName)?;
    let namespace = rollout.metadata.namespace.clone();

    let mut template = rollout.spec.template.clone();
    let mut pod_labels = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    pod_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.to_string());
    pod_labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    let mut template_metadata = template.metadata.take().unwrap_or_default();
    template_metadata.labels = Some(pod_labels.clone());
    template.metadata = Some(template_metadata);

    let mut selector = rollout.spec.selector.clone();
    let mut match_labels = selector.match_labels.take().unwrap_or_default();
    match_labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.to_string());
    selector.match_labels = Some(match_labels);

    Ok(ReplicaSet {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", rollout_name, pod_hash)),
            namespace,
            labels: Some(pod_labels),
            owner_references: rollout.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            selector,
            template: Some(template),
            min_ready_seconds: Some(rollout.spec.min_ready_seconds()),
        }),
        status: None,
    })
}

/// Outcome of establishing the revision's ReplicaSet
pub enum RevisionOutcome {
    /// The ReplicaSet for the current revision, existing or freshly created
    Ready(Box<ReplicaSet>),
    /// A differently-shaped ReplicaSet already owns the name; the caller
    /// records the bumped collision count and retries next reconcile
    Collision(i32),
}

/// Find, adopt, or create the ReplicaSet for the current pod-template hash.
///
/// Matching is by revision label among the owned sets; a same-named set with
/// different template content bumps the collision counter (the hash input
/// changes, so the retry produces a fresh name).
pub async fn sync_revision(
    rs_api: &Api<ReplicaSet>,
    rollout: &Rollout,
    owned: &[ReplicaSet],
    pod_hash: &str,
    collision_count: Option<i32>,
) -> Result<RevisionOutcome, ReconcileError> {
    if let Some(existing) = owned.iter().find(|rs| pod_hash_of(rs) == Some(pod_hash)) {
        let adopted = adopt_replica_set(rs_api, rollout, existing, pod_hash).await?;
        return Ok(RevisionOutcome::Ready(Box::new(adopted)));
    }

    // Initial size is zero; the strategy decides the scale-up.
    let desired = build_replica_set(rollout, pod_hash, 0)?;
    let desired_name = desired
        .metadata
        .name
        .clone()
        .ok_or(ReconcileError::ReplicaSetMissingName)?;

    match rs_api.create(&PostParams::default(), &desired).await {
        Ok(created) => {
            info!(
                replicaset = %desired_name,
                pod_hash = %pod_hash,
                "Created ReplicaSet for new revision"
            );
            Ok(RevisionOutcome::Ready(Box::new(created)))
        }
        Err(kube::Error::Api(err)) if err.code == 409 => {
            // Name taken by something we do not own or with different
            // content: count the collision and rehash next reconcile.
            let next = collision_count.unwrap_or(0) + 1;
            warn!(
                replicaset = %desired_name,
                collision_count = next,
                "ReplicaSet name collision, bumping collision count"
            );
            Ok(RevisionOutcome::Collision(next))
        }
        Err(e) => Err(ReconcileError::KubeError(e)),
    }
}

/// Ensure an existing ReplicaSet of ours carries the revision labels and a
/// controller owner reference. Per adoption rules a missing owner reference
/// is rewritten; a set controller-owned by someone else is left alone.
async fn adopt_replica_set(
    rs_api: &Api<ReplicaSet>,
    rollout: &Rollout,
    rs: &ReplicaSet,
    pod_hash: &str,
) -> Result<ReplicaSet, ReconcileError> {
    let rs_name = rs
        .metadata
        .name
        .as_ref()
        .ok_or(ReconcileError::ReplicaSetMissingName)?;

    let has_owner = rs
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.controller.unwrap_or(false)))
        .unwrap_or(false);

    if has_owner && !is_owned_by(rollout, rs) {
        warn!(
            replicaset = %rs_name,
            "ReplicaSet matches revision but is owned by another controller, skipping adoption"
        );
        return Ok(rs.clone());
    }

    let labels_ok = rs
        .metadata
        .labels
        .as_ref()
        .map(|l| {
            l.get(POD_TEMPLATE_HASH_LABEL).map(String::as_str) == Some(pod_hash)
                && l.get(MANAGED_LABEL).map(String::as_str) == Some("true")
        })
        .unwrap_or(false);

    if has_owner && labels_ok {
        return Ok(rs.clone());
    }

    debug!(replicaset = %rs_name, "Adopting ReplicaSet for current revision");
    let patch = serde_json::json!({
        "metadata": {
            "labels": {
                (POD_TEMPLATE_HASH_LABEL): pod_hash,
                (MANAGED_LABEL): "true",
            },
            "ownerReferences": rollout.controller_owner_ref(&()).map(|r| vec![r]),
        }
    });
    let adopted = rs_api
        .patch(rs_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(adopted)
}

/// Scale a ReplicaSet to the target size. No-op when already there.
/// Returns true when a patch was issued.
pub async fn scale_replica_set(
    rs_api: &Api<ReplicaSet>,
    rs: &ReplicaSet,
    replicas: i32,
) -> Result<bool, ReconcileError> {
    let rs_name = rs
        .metadata
        .name
        .as_ref()
        .ok_or(ReconcileError::ReplicaSetMissingName)?;
    let current = super::scale::spec_replicas(rs);
    if current == replicas {
        debug!(replicaset = %rs_name, replicas, "ReplicaSet already at target scale");
        return Ok(false);
    }

    info!(
        replicaset = %rs_name,
        current,
        desired = replicas,
        "Scaling ReplicaSet"
    );
    let patch = serde_json::json!({ "spec": { "replicas": replicas } });
    rs_api
        .patch(rs_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Read the scale-down-at label written during the blue-green delay
pub fn scale_down_at(rs: &ReplicaSet) -> Option<&str> {
    rs.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(SCALE_DOWN_AT_LABEL))
        .map(String::as_str)
}

/// Annotate an old ReplicaSet with the time it becomes eligible for
/// scale-down. Clearing passes None.
pub async fn set_scale_down_at(
    rs_api: &Api<ReplicaSet>,
    rs: &ReplicaSet,
    at: Option<&str>,
) -> Result<(), ReconcileError> {
    let rs_name = rs
        .metadata
        .name
        .as_ref()
        .ok_or(ReconcileError::ReplicaSetMissingName)?;
    if scale_down_at(rs) == at {
        return Ok(());
    }
    let patch = serde_json::json!({
        "metadata": { "labels": { (SCALE_DOWN_AT_LABEL): at } }
    });
    rs_api
        .patch(rs_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Delete zero-sized historical ReplicaSets beyond the revision history
/// limit, oldest first. Only sets with no pods are eligible.
pub async fn cleanup_old_replica_sets(
    rs_api: &Api<ReplicaSet>,
    old: &[ReplicaSet],
    limit: i32,
) -> Result<(), ReconcileError> {
    let mut deletable: Vec<ReplicaSet> = old
        .iter()
        .filter(|rs| {
            super::scale::spec_replicas(rs) == 0 && super::scale::actual_replicas(rs) == 0
        })
        .cloned()
        .collect();
    let excess = deletable.len() as i32 - limit;
    if excess <= 0 {
        return Ok(());
    }

    super::scale::sort_for_scale_down(&mut deletable);
    for rs in deletable.iter().take(excess as usize) {
        let rs_name = rs
            .metadata
            .name
            .as_ref()
            .ok_or(ReconcileError::ReplicaSetMissingName)?;
        info!(replicaset = %rs_name, "Deleting ReplicaSet beyond revision history limit");
        match rs_api.delete(rs_name, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => return Err(ReconcileError::KubeError(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::crd::rollout::{RolloutSpec, RolloutStrategy};
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn test_template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(
                    [("app".to_string(), "demo".to_string())].into_iter().collect(),
                ),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn test_rollout() -> Rollout {
        Rollout {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: RolloutSpec {
                replicas: 3,
                selector: LabelSelector {
                    match_labels: Some(
                        [("app".to_string(), "demo".to_string())].into_iter().collect(),
                    ),
                    ..Default::default()
                },
                template: test_template("demo:1.0"),
                strategy: RolloutStrategy::default(),
                min_ready_seconds: None,
                progress_deadline_seconds: None,
                revision_history_limit: None,
                paused: None,
                restart_at: None,
            },
            status: None,
        }
    }

    #[test]
    fn test_hash_is_stable_across_deep_copies() {
        let template = test_template("demo:1.0");
        let copy = template.clone();
        assert_eq!(
            compute_pod_template_hash(&template, None).unwrap(),
            compute_pod_template_hash(&copy, None).unwrap()
        );
    }

    #[test]
    fn test_hash_changes_with_template_content() {
        let a = compute_pod_template_hash(&test_template("demo:1.0"), None).unwrap();
        let b = compute_pod_template_hash(&test_template("demo:2.0"), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_ignores_controller_injected_labels() {
        let plain = test_template("demo:1.0");
        let mut labeled = plain.clone();
        labeled
            .metadata
            .as_mut()
            .unwrap()
            .labels
            .as_mut()
            .unwrap()
            .insert(POD_TEMPLATE_HASH_LABEL.to_string(), "abcdef0123".to_string());
        assert_eq!(
            compute_pod_template_hash(&plain, None).unwrap(),
            compute_pod_template_hash(&labeled, None).unwrap()
        );
    }

    #[test]
    fn test_collision_count_changes_hash() {
        let template = test_template("demo:1.0");
        let without = compute_pod_template_hash(&template, None).unwrap();
        let with = compute_pod_template_hash(&template, Some(1)).unwrap();
        assert_ne!(without, with);
    }

    #[test]
    fn test_step_hash_tracks_step_changes() {
        let steps_a = vec![CanaryStep {
            set_weight: Some(20),
            ..Default::default()
        }];
        let steps_b = vec![CanaryStep {
            set_weight: Some(30),
            ..Default::default()
        }];
        assert_ne!(
            compute_step_hash(&steps_a).unwrap(),
            compute_step_hash(&steps_b).unwrap()
        );
        assert_eq!(
            compute_step_hash(&steps_a).unwrap(),
            compute_step_hash(&steps_a.clone()).unwrap()
        );
    }

    #[test]
    fn test_build_replica_set_shape() {
        let rollout = test_rollout();
        let hash = compute_pod_template_hash(&rollout.spec.template, None).unwrap();
        let rs = build_replica_set(&rollout, &hash, 3).unwrap();

        assert_eq!(rs.metadata.name.as_deref(), Some(format!("demo-{hash}").as_str()));
        assert_eq!(rs.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(rs.spec.as_ref().unwrap().replicas, Some(3));

        let labels = rs.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(POD_TEMPLATE_HASH_LABEL), Some(&hash));
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));

        let selector_labels = rs
            .spec
            .as_ref()
            .unwrap()
            .selector
            .match_labels
            .as_ref()
            .unwrap();
        assert_eq!(selector_labels.get(POD_TEMPLATE_HASH_LABEL), Some(&hash));

        let owner = &rs.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Rollout");
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_adopted_template_rehashes_to_same_revision() {
        // Building a ReplicaSet injects labels into the template; hashing the
        // built template must reproduce the original revision hash.
        let rollout = test_rollout();
        let hash = compute_pod_template_hash(&rollout.spec.template, None).unwrap();
        let rs = build_replica_set(&rollout, &hash, 3).unwrap();
        let stored = rs.spec.as_ref().unwrap().template.as_ref().unwrap();
        assert_eq!(compute_pod_template_hash(stored, None).unwrap(), hash);
    }

    #[test]
    fn test_is_saturated() {
        let rollout = test_rollout();
        let hash = compute_pod_template_hash(&rollout.spec.template, None).unwrap();
        let mut rs = build_replica_set(&rollout, &hash, 3).unwrap();
        assert!(!is_saturated(3, &rs));

        rs.status = Some(k8s_openapi::api::apps::v1::ReplicaSetStatus {
            replicas: 3,
            available_replicas: Some(3),
            ready_replicas: Some(3),
            ..Default::default()
        });
        assert!(is_saturated(3, &rs));
        assert!(!is_saturated(4, &rs));
    }

    #[test]
    fn test_is_owned_by_checks_controller_uid() {
        let rollout = test_rollout();
        let hash = compute_pod_template_hash(&rollout.spec.template, None).unwrap();
        let rs = build_replica_set(&rollout, &hash, 3).unwrap();
        assert!(is_owned_by(&rollout, &rs));

        let mut other = rollout.clone();
        other.metadata.uid = Some("uid-2".to_string());
        assert!(!is_owned_by(&other, &rs));
    }
}
