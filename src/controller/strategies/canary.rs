//! Canary deployment strategy
//!
//! Walks the ordered step list, shifting replicas (and router weight) from
//! the stable ReplicaSet to the canary. A changed step list or pod template
//! resets the index; a failed analysis or experiment aborts: the canary
//! scales to zero, the weight returns to zero, and the rollout degrades
//! until the spec changes.

use super::{RolloutStrategy, StrategyError, StrategyOutcome, IDLE_INTERVAL, RESYNC_INTERVAL};
use crate::controller::analysis;
use crate::controller::clock;
use crate::controller::events::reasons;
use crate::controller::experiment;
use crate::controller::rollout::reconcile::{Context, ReconcileError};
use crate::controller::rollout::replicaset::{self, RevisionOutcome};
use crate::controller::rollout::scale::{self, ScaleInput};
use crate::controller::rollout::status::{self as status_calc};
use crate::controller::trafficrouting::{self, TrafficError};
use crate::crd::analysis::{AnalysisPhase, AnalysisRun, AnalysisTemplate};
use crate::crd::experiment::{Experiment, ExperimentPhase};
use crate::controller::rollout::service;
use crate::crd::rollout::{
    CanaryStep, ConditionStatus, Phase, Rollout, RolloutConditionType, RolloutStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::api::{Api, PostParams};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tick cadence while an analysis or experiment gate is pending
const GATE_INTERVAL: Duration = Duration::from_secs(10);

pub struct CanaryStrategyHandler;

/// Traffic weight in effect at a step index: the most recent setWeight at or
/// before it, 0 before any setWeight, 100 past the end of the list.
pub fn effective_weight(steps: &[CanaryStep], step_index: i32) -> i32 {
    if step_index as usize >= steps.len() {
        return 100;
    }
    steps[..=step_index as usize]
        .iter()
        .rev()
        .find_map(|step| step.set_weight)
        .unwrap_or(0)
}

/// What the current step wants this reconcile to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepVerdict {
    /// Move to the next step
    Advance,
    /// Stay on this step; look again after the delay
    Wait(Duration),
    /// Gate failed: abort the rollout
    Abort,
}

/// Judge a pause step given when the pause started.
///
/// A timed pause advances once the duration elapsed; an indefinite pause
/// advances only on the promote annotation.
pub fn pause_verdict(
    step_duration: Option<i32>,
    pause_start: Option<&str>,
    promote_requested: bool,
    now: DateTime<Utc>,
) -> StepVerdict {
    if promote_requested {
        return StepVerdict::Advance;
    }
    match step_duration {
        None => StepVerdict::Wait(RESYNC_INTERVAL),
        Some(duration) => match pause_start {
            None => StepVerdict::Wait(Duration::from_secs(duration.max(1) as u64)),
            Some(start) => {
                let elapsed = clock::seconds_since(start, now).unwrap_or(0).max(0);
                if elapsed >= duration as i64 {
                    StepVerdict::Advance
                } else {
                    StepVerdict::Wait(Duration::from_secs((duration as i64 - elapsed).max(1) as u64))
                }
            }
        },
    }
}

/// The step index carried into this reconcile. A changed step list or pod
/// template restarts the walk.
pub fn initial_step_index(
    previous: &RolloutStatus,
    pod_hash: &str,
    step_hash: &str,
) -> (i32, bool) {
    let reset = previous.current_step_hash.as_deref() != Some(step_hash)
        || previous.current_pod_hash.as_deref() != Some(pod_hash);
    if reset {
        (0, true)
    } else {
        (previous.current_step_index.unwrap_or(0), false)
    }
}

/// Whether a previous reconcile aborted this same revision and step list
pub fn is_aborted(previous: &RolloutStatus, pod_hash: &str, step_hash: &str) -> bool {
    previous.phase == Some(Phase::Degraded)
        && previous.current_pod_hash.as_deref() == Some(pod_hash)
        && previous.current_step_hash.as_deref() == Some(step_hash)
}

#[allow(clippy::too_many_arguments)]
fn sync_status(
    rollout: &Rollout,
    all_rss: &[ReplicaSet],
    new_rs: &ReplicaSet,
    pod_hash: &str,
    stable_hash: Option<&str>,
    step_hash: &str,
    step_index: Option<i32>,
    pause_start: Option<String>,
    phase: Phase,
    message: &str,
    now: DateTime<Utc>,
) -> RolloutStatus {
    let mut status = status_calc::calculate_base_status(rollout, all_rss, Some(new_rs), pod_hash);
    status.canary.stable_rs = stable_hash.map(String::from);
    status.current_step_hash = Some(step_hash.to_string());
    status.current_step_index = step_index;
    status.pause_start_time = pause_start;
    status.hpa_replicas = status.replicas;
    status.phase = Some(phase);
    status.message = Some(message.to_string());

    let canary = rollout.spec.strategy.canary.as_ref();
    let max_unavailable = canary
        .map(|c| scale::max_unavailable(c, rollout.spec.replicas))
        .unwrap_or(0);
    status_calc::update_available_condition(rollout, &mut status, max_unavailable, now);
    status_calc::update_progressing_condition(rollout, &mut status, now);
    if status_calc::progress_deadline_condition_exceeded(&status) {
        status.phase = Some(Phase::Degraded);
        status.message = Some(format!(
            "Rollout has not progressed within {}s",
            rollout.spec.progress_deadline_seconds()
        ));
    }
    if phase == Phase::Degraded {
        status_calc::set_condition(
            &mut status,
            status_calc::new_condition(
                RolloutConditionType::Progressing,
                ConditionStatus::False,
                status_calc::REASON_ROLLOUT_ABORTED,
                message,
                now,
            ),
        );
    }
    status
}

#[async_trait]
impl RolloutStrategy for CanaryStrategyHandler {
    fn name(&self) -> &'static str {
        "canary"
    }

    async fn reconcile(
        &self,
        rollout: &Arc<Rollout>,
        owned: &[ReplicaSet],
        ctx: &Context,
    ) -> Result<StrategyOutcome, StrategyError> {
        let canary = rollout
            .spec
            .strategy
            .canary
            .as_ref()
            .ok_or(ReconcileError::MissingStrategy)?;
        let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
        let name = rollout.name_any();
        let now = ctx.clock.now();
        let replicas = rollout.spec.replicas;

        let rs_api: Api<ReplicaSet> = Api::namespaced(ctx.client.clone(), &namespace);

        let previous = rollout.status.clone().unwrap_or_default();
        let collision_count = previous.collision_count;
        let pod_hash =
            replicaset::compute_pod_template_hash(&rollout.spec.template, collision_count)?;
        let step_hash = replicaset::compute_step_hash(&canary.steps)?;

        // 1. Sync revision.
        let new_rs = match replicaset::sync_revision(&rs_api, rollout, owned, &pod_hash, collision_count)
            .await?
        {
            RevisionOutcome::Ready(rs) => *rs,
            RevisionOutcome::Collision(next) => {
                let mut status = previous.clone();
                status.collision_count = Some(next);
                return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
            }
        };
        let old_rss: Vec<ReplicaSet> = owned
            .iter()
            .filter(|rs| replicaset::pod_hash_of(rs) != Some(pod_hash.as_str()))
            .cloned()
            .collect();
        let mut all_rss = old_rss.clone();
        all_rss.push(new_rs.clone());

        // Designate the stable ReplicaSet. With no history the new set is
        // stable by definition and the step list is skipped.
        let stable_hash = previous.canary.stable_rs.clone();
        let stable_rs = stable_hash
            .as_deref()
            .and_then(|h| old_rss.iter().find(|rs| replicaset::pod_hash_of(rs) == Some(h)))
            .cloned();
        let fresh_rollout = stable_hash.is_none()
            || (stable_hash.as_deref() != Some(pod_hash.as_str()) && stable_rs.is_none());

        // 2. No template change from stable (or nothing to shift from):
        // saturate the new set, retire the rest, done.
        if fresh_rollout || stable_hash.as_deref() == Some(pod_hash.as_str()) {
            replicaset::scale_replica_set(&rs_api, &new_rs, replicas).await?;
            for rs in old_rss.iter().filter(|rs| scale::spec_replicas(rs) > 0) {
                replicaset::scale_replica_set(&rs_api, rs, 0).await?;
            }
            sync_canary_services(ctx, canary, &namespace, &pod_hash, &pod_hash).await?;
            if let Some(router) = trafficrouting::router_for(rollout, &ctx.client) {
                route_weight(ctx, rollout, router.as_ref(), 0).await?;
            }

            let step_count = canary.steps.len() as i32;
            let mut status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                Some(&pod_hash),
                &step_hash,
                Some(step_count),
                None,
                Phase::Progressing,
                "Stable revision is current",
                now,
            );
            if status_calc::is_complete(rollout, &status) {
                status.phase = Some(Phase::Healthy);
                status.message = Some("Rollout is healthy".to_string());
                replicaset::cleanup_old_replica_sets(
                    &rs_api,
                    &old_rss,
                    rollout.spec.revision_history_limit(),
                )
                .await?;
                return Ok(StrategyOutcome::new(status, IDLE_INTERVAL));
            }
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        }

        // From here on a genuine canary is in flight: the stable set exists
        // and differs from the new revision.
        let stable_hash = stable_hash.unwrap_or_default();
        let Some(stable_rs) = stable_rs else {
            // Covered by the fresh_rollout branch; kept as a guard against
            // racing deletes of the stable set.
            let status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                None,
                &step_hash,
                None,
                None,
                Phase::Progressing,
                "Stable ReplicaSet disappeared; redesignating",
                now,
            );
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        };

        let (mut step_index, reset) = initial_step_index(&previous, &pod_hash, &step_hash);
        let mut pause_start = if reset {
            None
        } else {
            previous.pause_start_time.clone()
        };
        let aborted = is_aborted(&previous, &pod_hash, &step_hash);
        let step_count = canary.steps.len() as i32;

        // 3. Scale toward the weight in effect.
        let weight = if aborted {
            0
        } else if step_index >= step_count {
            100
        } else {
            effective_weight(&canary.steps, step_index)
        };
        let surge = scale::max_surge(canary, replicas);
        let unavailable = scale::max_unavailable(canary, replicas);
        let (canary_target, stable_target) = scale::calculate_canary_replica_counts(
            replicas,
            weight,
            surge,
            unavailable,
            ScaleInput::of(&new_rs),
            ScaleInput::of(&stable_rs),
        );
        replicaset::scale_replica_set(&rs_api, &new_rs, canary_target).await?;
        replicaset::scale_replica_set(&rs_api, &stable_rs, stable_target).await?;
        // Older sets that are neither stable nor canary scale straight to zero.
        for rs in old_rss.iter().filter(|rs| {
            replicaset::pod_hash_of(rs) != Some(stable_hash.as_str())
                && scale::spec_replicas(rs) > 0
        }) {
            replicaset::scale_replica_set(&rs_api, rs, 0).await?;
        }

        // 4. Keep the canary/stable services pinned to their revisions, then
        // push the weight into the traffic router.
        sync_canary_services(ctx, canary, &namespace, &pod_hash, &stable_hash).await?;
        if let Some(router) = trafficrouting::router_for(rollout, &ctx.client) {
            if !route_weight(ctx, rollout, router.as_ref(), weight).await? {
                let status = sync_status(
                    rollout,
                    &all_rss,
                    &new_rs,
                    &pod_hash,
                    Some(&stable_hash),
                    &step_hash,
                    Some(step_index),
                    pause_start,
                    Phase::Progressing,
                    "Traffic routing is not reconciled",
                    now,
                );
                return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
            }
        }

        if aborted {
            let status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                Some(&stable_hash),
                &step_hash,
                Some(0),
                None,
                Phase::Degraded,
                "Rollout aborted; update the spec to retry",
                now,
            );
            return Ok(StrategyOutcome::new(status, IDLE_INTERVAL));
        }

        // User pause outranks every step.
        if rollout.spec.paused() {
            let pause_start = pause_start.unwrap_or_else(|| now.to_rfc3339());
            let status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                Some(&stable_hash),
                &step_hash,
                Some(step_index),
                Some(pause_start),
                Phase::Paused,
                "Rollout is paused by spec.paused",
                now,
            );
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        }

        // 5. Current step.
        let mut phase = Phase::Progressing;
        let mut message = format!("Executing step {} of {}", step_index, step_count);
        let mut requeue = RESYNC_INTERVAL;
        let mut abort_reason: Option<String> = None;

        if step_index < step_count {
            let step = &canary.steps[step_index as usize];
            let verdict = if step.set_weight.is_some() {
                // Advance once the observed split converged on the weight.
                let converged_canary = scale::canary_replicas_for_weight(replicas, weight);
                let converged_stable = replicas - converged_canary;
                let done = scale::spec_replicas(&new_rs) == converged_canary
                    && scale::available_replicas(&new_rs) >= converged_canary
                    && scale::spec_replicas(&stable_rs) == converged_stable;
                if done {
                    StepVerdict::Advance
                } else {
                    StepVerdict::Wait(RESYNC_INTERVAL)
                }
            } else if let Some(pause) = step.pause.as_ref() {
                if pause_start.is_none() {
                    pause_start = Some(now.to_rfc3339());
                }
                phase = Phase::Paused;
                message = format!("Paused at step {}", step_index);
                pause_verdict(
                    pause.duration,
                    pause_start.as_deref(),
                    super::blue_green::has_promote_annotation(rollout),
                    now,
                )
            } else if let Some(analysis_step) = step.analysis.as_ref() {
                match analysis_gate(ctx, rollout, &namespace, analysis_step, &pod_hash, step_index)
                    .await?
                {
                    GateState::Pending => StepVerdict::Wait(GATE_INTERVAL),
                    GateState::Passed => StepVerdict::Advance,
                    GateState::Failed(reason) => {
                        abort_reason = Some(reason);
                        StepVerdict::Abort
                    }
                    GateState::Missing(detail) => {
                        ctx.events
                            .publish(
                                &rollout.object_ref(&()),
                                EventType::Warning,
                                reasons::ANALYSIS_RUN_FAILED,
                                detail.clone(),
                            )
                            .await;
                        message = detail;
                        StepVerdict::Wait(RESYNC_INTERVAL)
                    }
                }
            } else if let Some(experiment_step) = step.experiment.as_ref() {
                match experiment_gate(
                    ctx,
                    rollout,
                    &namespace,
                    experiment_step,
                    &pod_hash,
                    &stable_rs,
                    step_index,
                )
                .await?
                {
                    GateState::Pending => StepVerdict::Wait(GATE_INTERVAL),
                    GateState::Passed => StepVerdict::Advance,
                    GateState::Failed(reason) => {
                        abort_reason = Some(reason);
                        StepVerdict::Abort
                    }
                    GateState::Missing(detail) => {
                        message = detail;
                        StepVerdict::Wait(RESYNC_INTERVAL)
                    }
                }
            } else {
                // Validation rejects empty steps; skip defensively.
                StepVerdict::Advance
            };

            match verdict {
                StepVerdict::Advance => {
                    if phase == Phase::Paused
                        && super::blue_green::has_promote_annotation(rollout)
                    {
                        remove_promote_annotation(ctx, &namespace, &name).await;
                    }
                    step_index += 1;
                    pause_start = None;
                    phase = Phase::Progressing;
                    message = format!("Advanced to step {} of {}", step_index, step_count);
                    requeue = Duration::from_secs(1);
                    info!(rollout = %name, step = step_index, "Canary step advanced");
                }
                StepVerdict::Wait(delay) => {
                    requeue = delay;
                }
                StepVerdict::Abort => {
                    let reason = abort_reason.unwrap_or_else(|| "gate failed".to_string());
                    warn!(rollout = %name, reason = %reason, "Aborting canary rollout");
                    ctx.events
                        .publish(
                            &rollout.object_ref(&()),
                            EventType::Warning,
                            reasons::ROLLOUT_ABORTED,
                            reason.clone(),
                        )
                        .await;
                    // Scale the canary down and restore the weight now; the
                    // Degraded status keeps it that way.
                    replicaset::scale_replica_set(&rs_api, &new_rs, 0).await?;
                    replicaset::scale_replica_set(&rs_api, &stable_rs, replicas).await?;
                    if let Some(router) = trafficrouting::router_for(rollout, &ctx.client) {
                        route_weight(ctx, rollout, router.as_ref(), 0).await?;
                    }
                    let status = sync_status(
                        rollout,
                        &all_rss,
                        &new_rs,
                        &pod_hash,
                        Some(&stable_hash),
                        &step_hash,
                        Some(0),
                        None,
                        Phase::Degraded,
                        &reason,
                        now,
                    );
                    return Ok(StrategyOutcome::new(status, IDLE_INTERVAL));
                }
            }
        }

        // 6. Completion: all steps done and the canary is saturated.
        if step_index >= step_count {
            if replicaset::is_saturated(replicas, &new_rs) {
                info!(rollout = %name, pod_hash = %pod_hash, "Promoting canary to stable");
                ctx.events
                    .publish(
                        &rollout.object_ref(&()),
                        EventType::Normal,
                        reasons::ROLLOUT_COMPLETED,
                        format!("Canary promoted; revision {} is stable", pod_hash),
                    )
                    .await;
                let mut status = sync_status(
                    rollout,
                    &all_rss,
                    &new_rs,
                    &pod_hash,
                    Some(&pod_hash),
                    &step_hash,
                    None,
                    None,
                    Phase::Progressing,
                    "Canary promoted to stable",
                    now,
                );
                status.current_step_index = None;
                return Ok(StrategyOutcome::new(status, Duration::from_secs(1)));
            }
            message = "Waiting for canary to saturate before promotion".to_string();
        }

        let status = sync_status(
            rollout,
            &all_rss,
            &new_rs,
            &pod_hash,
            Some(&stable_hash),
            &step_hash,
            Some(step_index),
            pause_start,
            phase,
            &message,
            now,
        );
        Ok(StrategyOutcome::new(status, requeue))
    }
}

/// Point the optional canary/stable services at their revisions. The
/// selectors only ever narrow by the revision label; service shape stays
/// user-owned.
async fn sync_canary_services(
    ctx: &Context,
    canary: &crate::crd::rollout::CanaryStrategy,
    namespace: &str,
    canary_hash: &str,
    stable_hash: &str,
) -> Result<(), StrategyError> {
    use k8s_openapi::api::core::v1::Service;
    let svc_api: kube::Api<Service> = kube::Api::namespaced(ctx.client.clone(), namespace);

    if let Some(canary_service) = canary.canary_service.as_deref() {
        let svc = service::get_service(&svc_api, canary_service).await?;
        service::switch_selector(&svc_api, &svc, canary_hash).await?;
    }
    if let Some(stable_service) = canary.stable_service.as_deref() {
        let svc = service::get_service(&svc_api, stable_service).await?;
        service::switch_selector(&svc_api, &svc, stable_hash).await?;
    }
    Ok(())
}

/// Gate outcome for analysis and experiment steps
enum GateState {
    Pending,
    Passed,
    Failed(String),
    Missing(String),
}

/// Push a weight into the router. Ownership violations and missing stable
/// ingresses degrade to a Warning event without failing the reconcile; the
/// caller keeps the rollout in place and retries.
async fn route_weight(
    ctx: &Context,
    rollout: &Arc<Rollout>,
    router: &dyn trafficrouting::TrafficRouter,
    weight: i32,
) -> Result<bool, StrategyError> {
    match router.reconcile(weight).await {
        Ok(()) => Ok(true),
        Err(TrafficError::OwnershipViolation(object)) => {
            ctx.events
                .publish(
                    &rollout.object_ref(&()),
                    EventType::Warning,
                    reasons::OWNERSHIP_VIOLATION,
                    format!("{object} is not owned by this rollout; refusing to modify it"),
                )
                .await;
            Ok(false)
        }
        Err(TrafficError::StableIngressNotFound(ingress)) => {
            ctx.events
                .publish(
                    &rollout.object_ref(&()),
                    EventType::Warning,
                    reasons::INGRESS_NOT_FOUND,
                    format!("Stable ingress {ingress} not found"),
                )
                .await;
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Look up (or create) the AnalysisRun gating this step and map its phase.
async fn analysis_gate(
    ctx: &Context,
    rollout: &Arc<Rollout>,
    namespace: &str,
    step: &crate::crd::rollout::RolloutAnalysisStep,
    pod_hash: &str,
    step_index: i32,
) -> Result<GateState, StrategyError> {
    let run_api: Api<AnalysisRun> = Api::namespaced(ctx.client.clone(), namespace);
    let run_name = analysis::analysis_run_name(&rollout.name_any(), pod_hash, step_index);

    match run_api.get(&run_name).await {
        Ok(run) => {
            let phase = run.status.map(|s| s.phase).unwrap_or_default();
            Ok(match phase {
                AnalysisPhase::Successful => GateState::Passed,
                AnalysisPhase::Failed | AnalysisPhase::Error | AnalysisPhase::Inconclusive => {
                    GateState::Failed(format!(
                        "AnalysisRun {run_name} concluded {:?}",
                        phase
                    ))
                }
                _ => GateState::Pending,
            })
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let template_api: Api<AnalysisTemplate> =
                Api::namespaced(ctx.client.clone(), namespace);
            let template = match template_api.get(&step.template_name).await {
                Ok(template) => template,
                Err(kube::Error::Api(err)) if err.code == 404 => {
                    return Ok(GateState::Missing(analysis::template_not_found_message(
                        &step.template_name,
                    )));
                }
                Err(e) => return Err(StrategyError::KubeError(e)),
            };
            let run = analysis::build_analysis_run(rollout, &template, step, pod_hash, step_index)
                .map_err(StrategyError::Analysis)?;
            info!(analysisrun = %run_name, "Starting analysis run for canary step");
            match run_api.create(&PostParams::default(), &run).await {
                Ok(_) => Ok(GateState::Pending),
                // Lost a race with ourselves; next reconcile reads it.
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(GateState::Pending),
                Err(e) => Err(StrategyError::KubeError(e)),
            }
        }
        Err(e) => Err(StrategyError::KubeError(e)),
    }
}

/// Look up (or create) the Experiment gating this step and map its phase.
async fn experiment_gate(
    ctx: &Context,
    rollout: &Arc<Rollout>,
    namespace: &str,
    step: &crate::crd::rollout::RolloutExperimentStep,
    pod_hash: &str,
    stable_rs: &ReplicaSet,
    step_index: i32,
) -> Result<GateState, StrategyError> {
    let exp_api: Api<Experiment> = Api::namespaced(ctx.client.clone(), namespace);
    let exp_name = experiment::experiment_name(&rollout.name_any(), pod_hash, step_index);

    match exp_api.get(&exp_name).await {
        Ok(exp) => {
            let phase = exp.status.map(|s| s.phase).unwrap_or_default();
            Ok(match phase {
                ExperimentPhase::Successful => GateState::Passed,
                ExperimentPhase::Failed => {
                    GateState::Failed(format!("Experiment {exp_name} failed"))
                }
                _ => GateState::Pending,
            })
        }
        Err(kube::Error::Api(err)) if err.code == 404 => {
            let stable_template = stable_rs
                .spec
                .as_ref()
                .and_then(|s| s.template.clone());
            let exp = experiment::build_experiment(
                rollout,
                step,
                pod_hash,
                stable_template.as_ref(),
                step_index,
            );
            info!(experiment = %exp_name, "Starting experiment for canary step");
            match exp_api.create(&PostParams::default(), &exp).await {
                Ok(_) => Ok(GateState::Pending),
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(GateState::Pending),
                Err(e) => Err(StrategyError::KubeError(e)),
            }
        }
        Err(e) => Err(StrategyError::KubeError(e)),
    }
}

/// Best-effort removal of the promote annotation after a manual resume
async fn remove_promote_annotation(ctx: &Context, namespace: &str, name: &str) {
    use kube::api::{Patch, PatchParams};
    let api: Api<Rollout> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": { "annotations": { (super::blue_green::PROMOTE_ANNOTATION): null } }
    });
    if let Err(e) = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(rollout = %name, error = %e, "Failed to remove promote annotation");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "canary_test.rs"]
mod tests;
