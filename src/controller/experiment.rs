//! Experiment reconciler
//!
//! Experiments run short-lived ReplicaSets built from their templates. Once
//! every template is available the duration timer starts; when it elapses
//! the experiment concludes Successful and its ReplicaSets scale to zero.
//! Missing availability past the progress deadline concludes Failed. The
//! canary `experiment` step creates these and watches the terminal phase.

use crate::controller::clock::{self, Clock};
use crate::crd::experiment::{
    Experiment, ExperimentPhase, ExperimentSpec, ExperimentStatus, ExperimentTemplate,
    ExperimentTemplateStatus,
};
use crate::crd::rollout::{
    ExperimentSpecRef, Rollout, RolloutExperimentStep, MANAGED_LABEL, POD_TEMPLATE_HASH_LABEL,
};
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const RESYNC: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Experiment missing namespace")]
    MissingNamespace,

    #[error("Experiment missing name")]
    MissingName,
}

/// Deterministic name for the experiment gating a rollout step
pub fn experiment_name(rollout_name: &str, pod_hash: &str, step_index: i32) -> String {
    format!("{rollout_name}-{pod_hash}-{step_index}")
}

/// Build the Experiment for a canary step. Each template clones the rollout
/// pod template of the referenced revision (stable or canary).
pub fn build_experiment(
    rollout: &Rollout,
    step: &RolloutExperimentStep,
    pod_hash: &str,
    stable_template: Option<&k8s_openapi::api::core::v1::PodTemplateSpec>,
    step_index: i32,
) -> Experiment {
    let rollout_name = rollout.name_any();
    let templates = step
        .templates
        .iter()
        .map(|t| {
            let template = match t.spec_ref {
                ExperimentSpecRef::Canary => rollout.spec.template.clone(),
                ExperimentSpecRef::Stable => stable_template
                    .cloned()
                    .unwrap_or_else(|| rollout.spec.template.clone()),
            };
            ExperimentTemplate {
                name: t.name.clone(),
                replicas: t.replicas,
                selector: rollout.spec.selector.clone(),
                template,
            }
        })
        .collect();

    Experiment {
        metadata: ObjectMeta {
            name: Some(experiment_name(&rollout_name, pod_hash, step_index)),
            namespace: rollout.meta().namespace.clone(),
            labels: Some(
                [(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: rollout.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: ExperimentSpec {
            templates,
            duration: step.duration,
            progress_deadline_seconds: rollout.spec.progress_deadline_seconds,
        },
        status: None,
    }
}

/// Name of the ReplicaSet run for one experiment template
fn template_rs_name(experiment_name: &str, template_name: &str) -> String {
    format!("{experiment_name}-{template_name}")
}

fn build_template_rs(experiment: &Experiment, template: &ExperimentTemplate) -> ReplicaSet {
    let exp_name = experiment.name_any();
    let mut pod_template = template.template.clone();
    let mut labels = pod_template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(
        "experiments.virta.io/template".to_string(),
        template.name.clone(),
    );
    let mut metadata = pod_template.metadata.take().unwrap_or_default();
    metadata.labels = Some(labels.clone());
    pod_template.metadata = Some(metadata);

    let mut selector = template.selector.clone();
    let mut match_labels = selector.match_labels.take().unwrap_or_default();
    match_labels.insert(
        "experiments.virta.io/template".to_string(),
        template.name.clone(),
    );
    selector.match_labels = Some(match_labels);

    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(template_rs_name(&exp_name, &template.name)),
            namespace: experiment.meta().namespace.clone(),
            labels: Some(labels),
            owner_references: experiment.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(template.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: selector.match_labels,
                match_expressions: selector.match_expressions,
            },
            template: Some(pod_template),
            min_ready_seconds: None,
        }),
        status: None,
    }
}

/// Derive the next experiment status from the observed template ReplicaSets.
pub fn compute_next_status(
    experiment: &Experiment,
    template_rss: &[(String, Option<ReplicaSet>)],
    now: chrono::DateTime<chrono::Utc>,
) -> (ExperimentStatus, Option<Duration>) {
    let mut status = experiment.status.clone().unwrap_or_default();
    if status.phase.is_terminal() {
        return (status, None);
    }

    status.template_statuses = template_rss
        .iter()
        .map(|(name, rs)| ExperimentTemplateStatus {
            name: name.clone(),
            replicas: rs
                .as_ref()
                .map(|rs| crate::controller::rollout::scale::actual_replicas(rs))
                .unwrap_or(0),
            ready_replicas: rs
                .as_ref()
                .map(|rs| crate::controller::rollout::scale::ready_replicas(rs))
                .unwrap_or(0),
            available_replicas: rs
                .as_ref()
                .map(|rs| crate::controller::rollout::scale::available_replicas(rs))
                .unwrap_or(0),
        })
        .collect();

    let all_available = experiment.spec.templates.iter().all(|t| {
        let desired = t.replicas.unwrap_or(1);
        status
            .template_statuses
            .iter()
            .find(|s| s.name == t.name)
            .map(|s| s.available_replicas >= desired)
            .unwrap_or(false)
    });

    if all_available && status.available_at.is_none() {
        status.available_at = Some(now.to_rfc3339());
    }

    if let Some(available_at) = status.available_at.clone() {
        status.phase = ExperimentPhase::Running;
        match experiment.spec.duration {
            None => (status, Some(RESYNC)),
            Some(duration) => {
                let elapsed = clock::seconds_since(&available_at, now).unwrap_or(0).max(0);
                if elapsed >= duration as i64 {
                    status.phase = ExperimentPhase::Successful;
                    status.message = Some("Experiment ran its full duration".to_string());
                    (status, None)
                } else {
                    let remaining = Duration::from_secs((duration as i64 - elapsed) as u64);
                    (status, Some(remaining))
                }
            }
        }
    } else {
        // Not yet available: fail once the progress deadline passes.
        let deadline = experiment.spec.progress_deadline_seconds.unwrap_or(600);
        let started = experiment
            .meta()
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(now);
        let elapsed = now.signed_duration_since(started).num_seconds();
        if elapsed > deadline as i64 {
            status.phase = ExperimentPhase::Failed;
            status.message = Some(format!(
                "Experiment templates were not available within {deadline}s"
            ));
            (status, None)
        } else {
            status.phase = ExperimentPhase::Pending;
            (status, Some(RESYNC))
        }
    }
}

pub struct ExperimentContext {
    pub client: kube::Client,
    pub clock: Arc<dyn Clock>,
}

/// Reconcile one Experiment: ensure template ReplicaSets exist (scaled to
/// zero once terminal), recompute status, requeue at the next deadline.
pub async fn reconcile_experiment(
    experiment: Arc<Experiment>,
    ctx: Arc<ExperimentContext>,
) -> Result<Action, ExperimentError> {
    let namespace = experiment
        .namespace()
        .ok_or(ExperimentError::MissingNamespace)?;
    let name = experiment.name_any();
    let rs_api: Api<ReplicaSet> = Api::namespaced(ctx.client.clone(), &namespace);

    let terminal = experiment
        .status
        .as_ref()
        .map(|s| s.phase.is_terminal())
        .unwrap_or(false);

    let mut template_rss: Vec<(String, Option<ReplicaSet>)> = Vec::new();
    for template in &experiment.spec.templates {
        let rs_name = template_rs_name(&name, &template.name);
        let existing = match rs_api.get(&rs_name).await {
            Ok(rs) => Some(rs),
            Err(kube::Error::Api(err)) if err.code == 404 => None,
            Err(e) => return Err(ExperimentError::KubeError(e)),
        };
        if existing.is_none() && !terminal {
            info!(experiment = %name, replicaset = %rs_name, "Creating experiment ReplicaSet");
            let rs = build_template_rs(&experiment, template);
            rs_api.create(&PostParams::default(), &rs).await?;
            template_rss.push((template.name.clone(), Some(rs)));
            continue;
        }
        if terminal {
            // Terminal experiments release their pods.
            let needs_scale_down = existing
                .as_ref()
                .map(|rs| crate::controller::rollout::scale::spec_replicas(rs) != 0)
                .unwrap_or(false);
            if needs_scale_down {
                let patch = serde_json::json!({ "spec": { "replicas": 0 } });
                rs_api
                    .patch(&rs_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
            }
        }
        template_rss.push((template.name.clone(), existing));
    }

    let (status, requeue) = compute_next_status(&experiment, &template_rss, ctx.clock.now());
    if experiment.status.as_ref() != Some(&status) {
        let api: Api<Experiment> = Api::namespaced(ctx.client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
    }

    match requeue {
        Some(delay) => Ok(Action::requeue(delay.max(Duration::from_secs(1)))),
        None => Ok(Action::await_change()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::controller::clock::MockClock;
    use k8s_openapi::api::apps::v1::ReplicaSetStatus;

    fn experiment_with(duration: Option<i32>) -> Experiment {
        Experiment {
            metadata: ObjectMeta {
                name: Some("demo-abc-3".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ExperimentSpec {
                templates: vec![ExperimentTemplate {
                    name: "baseline".to_string(),
                    replicas: Some(2),
                    selector: LabelSelector::default(),
                    template: Default::default(),
                }],
                duration,
                progress_deadline_seconds: Some(600),
            },
            status: None,
        }
    }

    fn available_rs(available: i32) -> ReplicaSet {
        ReplicaSet {
            status: Some(ReplicaSetStatus {
                replicas: available,
                ready_replicas: Some(available),
                available_replicas: Some(available),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pending_until_templates_available() {
        let clock = MockClock::new(chrono::Utc::now());
        let experiment = experiment_with(Some(60));
        let (status, requeue) = compute_next_status(
            &experiment,
            &[("baseline".to_string(), Some(available_rs(1)))],
            clock.now(),
        );
        assert_eq!(status.phase, ExperimentPhase::Pending);
        assert!(status.available_at.is_none());
        assert!(requeue.is_some());
    }

    #[test]
    fn test_duration_starts_when_available() {
        let clock = MockClock::new(chrono::Utc::now());
        let experiment = experiment_with(Some(60));
        let (status, requeue) = compute_next_status(
            &experiment,
            &[("baseline".to_string(), Some(available_rs(2)))],
            clock.now(),
        );
        assert_eq!(status.phase, ExperimentPhase::Running);
        assert!(status.available_at.is_some());
        assert_eq!(requeue, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_concludes_successful_after_duration() {
        let clock = MockClock::new(chrono::Utc::now());
        let mut experiment = experiment_with(Some(60));
        experiment.status = Some(ExperimentStatus {
            phase: ExperimentPhase::Running,
            available_at: Some((clock.now() - chrono::Duration::seconds(61)).to_rfc3339()),
            ..Default::default()
        });
        let (status, requeue) = compute_next_status(
            &experiment,
            &[("baseline".to_string(), Some(available_rs(2)))],
            clock.now(),
        );
        assert_eq!(status.phase, ExperimentPhase::Successful);
        assert!(requeue.is_none());
    }

    #[test]
    fn test_fails_past_progress_deadline() {
        let now = chrono::Utc::now();
        let mut experiment = experiment_with(Some(60));
        experiment.metadata.creation_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                now - chrono::Duration::seconds(700),
            ));
        let (status, requeue) =
            compute_next_status(&experiment, &[("baseline".to_string(), None)], now);
        assert_eq!(status.phase, ExperimentPhase::Failed);
        assert!(requeue.is_none());
    }

    #[test]
    fn test_terminal_experiment_is_fixed_point() {
        let clock = MockClock::new(chrono::Utc::now());
        let mut experiment = experiment_with(Some(60));
        experiment.status = Some(ExperimentStatus {
            phase: ExperimentPhase::Successful,
            ..Default::default()
        });
        let (status, requeue) = compute_next_status(&experiment, &[], clock.now());
        assert_eq!(status.phase, ExperimentPhase::Successful);
        assert!(requeue.is_none());
    }
}
