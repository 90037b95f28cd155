//! Blue-Green deployment strategy
//!
//! Ordered decision procedure: saturate the new ReplicaSet, switch the
//! preview service, sit in the promotion gate, switch the active service,
//! wait out the scale-down delay, scale down the old sets, then garbage
//! collect history. Each step that is not done yet persists status and
//! requeues; the next reconcile resumes from observed state.

use super::{RolloutStrategy, StrategyError, StrategyOutcome, IDLE_INTERVAL, RESYNC_INTERVAL};
use crate::controller::clock;
use crate::controller::events::reasons;
use crate::controller::rollout::reconcile::Context;
use crate::controller::rollout::replicaset::{self, RevisionOutcome};
use crate::controller::rollout::scale;
use crate::controller::rollout::service;
use crate::controller::rollout::status::{self as status_calc};
use crate::crd::rollout::{BlueGreenStrategy, Phase, Rollout, RolloutStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use kube::runtime::events::EventType;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Annotation a user sets to promote a rollout held in the promotion gate.
/// Removed by the controller once the promotion happens.
pub const PROMOTE_ANNOTATION: &str = "virta.io/promote";

pub struct BlueGreenStrategyHandler;

/// Verdict of the promotion gate before the active-service switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionGate {
    /// Clear to switch the active service
    Proceed,
    /// Paused until a user acts (spec.paused flips false or the promote
    /// annotation appears)
    Hold,
    /// Auto-promotion pending: proceed after this long
    Wait(Duration),
}

pub fn has_promote_annotation(rollout: &Rollout) -> bool {
    rollout
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(PROMOTE_ANNOTATION))
        .map(|value| value == "true")
        .unwrap_or(false)
}

/// Decide whether the active service may switch to the new revision.
///
/// A user pause always holds. With auto-promotion disabled the gate holds
/// until the promote annotation appears. With auto-promotion enabled the
/// gate waits out autoPromotionSeconds measured from pauseStartTime.
pub fn promotion_gate(
    rollout: &Rollout,
    blue_green: &BlueGreenStrategy,
    pause_start: Option<&str>,
    now: DateTime<Utc>,
) -> PromotionGate {
    if rollout.spec.paused() {
        return PromotionGate::Hold;
    }
    if has_promote_annotation(rollout) {
        return PromotionGate::Proceed;
    }
    if !blue_green.auto_promotion_enabled() {
        return PromotionGate::Hold;
    }
    match blue_green.auto_promotion_seconds {
        None => PromotionGate::Proceed,
        Some(auto_seconds) => match pause_start {
            None => PromotionGate::Wait(Duration::from_secs(auto_seconds.max(0) as u64)),
            Some(start) => {
                let elapsed = clock::seconds_since(start, now).unwrap_or(0).max(0);
                if elapsed >= auto_seconds as i64 {
                    PromotionGate::Proceed
                } else {
                    PromotionGate::Wait(Duration::from_secs((auto_seconds as i64 - elapsed) as u64))
                }
            }
        },
    }
}

/// Time left in the scale-down delay; None once elapsed
pub fn scale_down_delay_remaining(
    start: &str,
    delay_seconds: i32,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = clock::seconds_since(start, now)?.max(0);
    if elapsed >= delay_seconds as i64 {
        None
    } else {
        Some(Duration::from_secs((delay_seconds as i64 - elapsed) as u64))
    }
}

/// Project the blue-green status for this reconcile.
///
/// Selector fields mirror what the services actually select;
/// scaleDownDelayStartTime starts when the active service reaches the new
/// revision and clears when it points elsewhere or nothing old remains.
#[allow(clippy::too_many_arguments)]
pub fn sync_status(
    rollout: &Rollout,
    all_rss: &[ReplicaSet],
    new_rs: &ReplicaSet,
    pod_hash: &str,
    active_svc: &Service,
    preview_svc: Option<&Service>,
    pause_start: Option<String>,
    phase: Phase,
    message: &str,
    now: DateTime<Utc>,
) -> RolloutStatus {
    let mut status = status_calc::calculate_base_status(rollout, all_rss, Some(new_rs), pod_hash);

    let active_selector = service::selector_hash(active_svc).map(String::from);
    status.blue_green.active_selector = active_selector.clone();
    status.blue_green.preview_selector = preview_svc
        .and_then(service::selector_hash)
        .map(String::from);

    let active_rs = all_rss
        .iter()
        .find(|rs| replicaset::pod_hash_of(rs) == active_selector.as_deref());
    let old_replicas: i32 = all_rss
        .iter()
        .filter(|rs| replicaset::pod_hash_of(rs) != Some(pod_hash))
        .map(scale::spec_replicas)
        .sum();

    match active_rs {
        Some(rs) => {
            status.hpa_replicas = scale::actual_replicas(rs);
            status.selector = rs
                .spec
                .as_ref()
                .and_then(|s| s.selector.match_labels.as_ref())
                .map(|labels| {
                    labels
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(",")
                });
        }
        None => {
            status.hpa_replicas = status.replicas;
        }
    }

    if active_selector.as_deref() == Some(pod_hash) {
        if status.blue_green.scale_down_delay_start_time.is_none() {
            status.blue_green.scale_down_delay_start_time = Some(now.to_rfc3339());
        }
    }
    if active_selector.as_deref() != Some(pod_hash) || old_replicas == 0 {
        status.blue_green.scale_down_delay_start_time = None;
    }

    status.pause_start_time = pause_start;
    status.phase = Some(phase);
    status.message = Some(message.to_string());

    status_calc::update_available_condition(rollout, &mut status, 0, now);
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
                crate::crd::rollout::RolloutConditionType::Progressing,
                crate::crd::rollout::ConditionStatus::False,
                status_calc::REASON_PROGRESS_DEADLINE_EXCEEDED,
                message,
                now,
            ),
        );
    }

    status
}

#[async_trait]
impl RolloutStrategy for BlueGreenStrategyHandler {
    fn name(&self) -> &'static str {
        "blue-green"
    }

    async fn reconcile(
        &self,
        rollout: &Arc<Rollout>,
        owned: &[ReplicaSet],
        ctx: &Context,
    ) -> Result<StrategyOutcome, StrategyError> {
        let blue_green = rollout
            .spec
            .strategy
            .blue_green
            .as_ref()
            .ok_or(crate::controller::rollout::reconcile::ReconcileError::MissingStrategy)?;
        let namespace = rollout
            .namespace()
            .ok_or(crate::controller::rollout::reconcile::ReconcileError::MissingNamespace)?;
        let name = rollout.name_any();
        let now = ctx.clock.now();

        let rs_api: Api<ReplicaSet> = Api::namespaced(ctx.client.clone(), &namespace);
        let svc_api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

        let active_svc = service::get_service(&svc_api, &blue_green.active_service).await?;
        let preview_svc = match blue_green.preview_service.as_deref() {
            Some(preview_name) => Some(service::get_service(&svc_api, preview_name).await?),
            None => None,
        };

        let previous = rollout.status.clone().unwrap_or_default();
        let collision_count = previous.collision_count;
        let pod_hash =
            replicaset::compute_pod_template_hash(&rollout.spec.template, collision_count)?;

        // 1. Sync revision: the new ReplicaSet must exist.
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

        let active_hash = service::selector_hash(&active_svc).map(String::from);
        let promoted = active_hash.as_deref() == Some(pod_hash.as_str());

        // 2. Scale up the new ReplicaSet; previewReplicaCount bounds it
        // until the promotion checkpoint clears.
        let checkpoint = previous
            .blue_green
            .scale_up_preview_check_point
            .unwrap_or(false);
        let desired_new = match blue_green.preview_replica_count {
            Some(preview_count) if !promoted && !checkpoint => preview_count,
            _ => rollout.spec.replicas,
        };
        replicaset::scale_replica_set(&rs_api, &new_rs, desired_new).await?;
        if !replicaset::is_saturated(desired_new, &new_rs) {
            let status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                &active_svc,
                preview_svc.as_ref(),
                previous.pause_start_time.clone(),
                Phase::Progressing,
                &format!("Waiting for ReplicaSet {} to saturate", new_rs.name_any()),
                now,
            );
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        }

        // 3. Switch the preview service at the saturated new ReplicaSet.
        if let Some(preview) = preview_svc.as_ref() {
            if service::switch_selector(&svc_api, preview, &pod_hash).await? {
                ctx.events
                    .publish(
                        &rollout.object_ref(&()),
                        EventType::Normal,
                        reasons::SWITCHED_SERVICE_SELECTOR,
                        format!(
                            "Preview service {} switched to revision {}",
                            preview.name_any(),
                            pod_hash
                        ),
                    )
                    .await;
                let status = sync_status(
                    rollout,
                    &all_rss,
                    &new_rs,
                    &pod_hash,
                    &active_svc,
                    preview_svc.as_ref(),
                    previous.pause_start_time.clone(),
                    Phase::PreviewActive,
                    "Preview service switched to the new revision",
                    now,
                );
                return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
            }
        }

        if !promoted {
            // 4. Promotion gate.
            match promotion_gate(rollout, blue_green, previous.pause_start_time.as_deref(), now) {
                PromotionGate::Hold => {
                    let pause_start = previous
                        .pause_start_time
                        .clone()
                        .unwrap_or_else(|| now.to_rfc3339());
                    if previous.pause_start_time.is_none() {
                        ctx.events
                            .publish(
                                &rollout.object_ref(&()),
                                EventType::Normal,
                                reasons::ROLLOUT_PAUSED,
                                "Rollout paused before active service switch".to_string(),
                            )
                            .await;
                    }
                    let status = sync_status(
                        rollout,
                        &all_rss,
                        &new_rs,
                        &pod_hash,
                        &active_svc,
                        preview_svc.as_ref(),
                        Some(pause_start),
                        Phase::Paused,
                        "Rollout is paused awaiting promotion",
                        now,
                    );
                    return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
                }
                PromotionGate::Wait(remaining) => {
                    let pause_start = previous
                        .pause_start_time
                        .clone()
                        .unwrap_or_else(|| now.to_rfc3339());
                    let status = sync_status(
                        rollout,
                        &all_rss,
                        &new_rs,
                        &pod_hash,
                        &active_svc,
                        preview_svc.as_ref(),
                        Some(pause_start),
                        Phase::PromotionDelay,
                        "Waiting for auto-promotion delay",
                        now,
                    );
                    return Ok(StrategyOutcome::new(status, remaining.max(Duration::from_secs(1))));
                }
                PromotionGate::Proceed => {}
            }

            // Preview-sized rollouts scale to full before the switch.
            if blue_green.preview_replica_count.is_some() && !checkpoint {
                let mut status = sync_status(
                    rollout,
                    &all_rss,
                    &new_rs,
                    &pod_hash,
                    &active_svc,
                    preview_svc.as_ref(),
                    None,
                    Phase::Progressing,
                    "Scaling new ReplicaSet to full size before promotion",
                    now,
                );
                status.blue_green.scale_up_preview_check_point = Some(true);
                replicaset::scale_replica_set(&rs_api, &new_rs, rollout.spec.replicas).await?;
                return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
            }

            // 5. Switch the active service.
            service::switch_selector(&svc_api, &active_svc, &pod_hash).await?;
            ctx.events
                .publish(
                    &rollout.object_ref(&()),
                    EventType::Normal,
                    reasons::SWITCHED_SERVICE_SELECTOR,
                    format!(
                        "Active service {} switched to revision {}",
                        active_svc.name_any(),
                        pod_hash
                    ),
                )
                .await;
            if has_promote_annotation(rollout) {
                remove_promote_annotation(ctx, &namespace, &name).await;
            }

            // Re-read the switched selector into the status projection.
            let mut switched_active = active_svc.clone();
            if let Some(spec) = switched_active.spec.as_mut() {
                let mut selector = spec.selector.clone().unwrap_or_default();
                selector.insert(
                    crate::crd::rollout::POD_TEMPLATE_HASH_LABEL.to_string(),
                    pod_hash.clone(),
                );
                spec.selector = Some(selector);
            }
            let mut status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                &switched_active,
                preview_svc.as_ref(),
                None,
                Phase::ScaleDownDelay,
                "Active service switched; waiting out scale-down delay",
                now,
            );
            status.blue_green.scale_up_preview_check_point = None;
            let delay = Duration::from_secs(blue_green.scale_down_delay_seconds().max(0) as u64);
            return Ok(StrategyOutcome::new(status, delay.max(Duration::from_secs(1))));
        }

        // 6. Scale-down delay for old ReplicaSets still running pods.
        let old_with_pods: Vec<&ReplicaSet> = old_rss
            .iter()
            .filter(|rs| scale::spec_replicas(rs) > 0)
            .collect();
        if !old_with_pods.is_empty() {
            let delay_seconds = blue_green.scale_down_delay_seconds();
            if let Some(start) = previous.blue_green.scale_down_delay_start_time.as_deref() {
                if let Some(remaining) = scale_down_delay_remaining(start, delay_seconds, now) {
                    // Record when each old set becomes eligible for retirement.
                    if let Some(eligible_at) = clock::parse_rfc3339(start)
                        .map(|s| (s + chrono::Duration::seconds(delay_seconds as i64)).to_rfc3339())
                    {
                        for rs in &old_with_pods {
                            replicaset::set_scale_down_at(&rs_api, rs, Some(&eligible_at)).await?;
                        }
                    }
                    let status = sync_status(
                        rollout,
                        &all_rss,
                        &new_rs,
                        &pod_hash,
                        &active_svc,
                        preview_svc.as_ref(),
                        None,
                        Phase::ScaleDownDelay,
                        "Waiting out scale-down delay before retiring old ReplicaSets",
                        now,
                    );
                    return Ok(StrategyOutcome::new(status, remaining.max(Duration::from_secs(1))));
                }
            } else {
                // Status sync stamps the start; wait the full delay.
                let status = sync_status(
                    rollout,
                    &all_rss,
                    &new_rs,
                    &pod_hash,
                    &active_svc,
                    preview_svc.as_ref(),
                    None,
                    Phase::ScaleDownDelay,
                    "Starting scale-down delay",
                    now,
                );
                return Ok(StrategyOutcome::new(
                    status,
                    Duration::from_secs(delay_seconds.max(1) as u64),
                ));
            }

            // 7. Delay elapsed: retire every old ReplicaSet with pods.
            let mut sorted: Vec<ReplicaSet> = old_with_pods.into_iter().cloned().collect();
            scale::sort_for_scale_down(&mut sorted);
            for rs in &sorted {
                replicaset::scale_replica_set(&rs_api, rs, 0).await?;
                replicaset::set_scale_down_at(&rs_api, rs, None).await?;
            }
            info!(rollout = %name, "Scaled down old ReplicaSets");
            let status = sync_status(
                rollout,
                &all_rss,
                &new_rs,
                &pod_hash,
                &active_svc,
                preview_svc.as_ref(),
                None,
                Phase::Progressing,
                "Old ReplicaSets scaling down",
                now,
            );
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        }

        // 8. Complete: converged on the new revision.
        let mut status = sync_status(
            rollout,
            &all_rss,
            &new_rs,
            &pod_hash,
            &active_svc,
            preview_svc.as_ref(),
            None,
            Phase::Healthy,
            "Rollout is healthy",
            now,
        );
        status.blue_green.scale_up_preview_check_point = None;

        if status_calc::is_complete(rollout, &status) {
            let limit = blue_green
                .scale_down_delay_revision_limit
                .map(|l| l.min(rollout.spec.revision_history_limit()))
                .unwrap_or_else(|| rollout.spec.revision_history_limit());
            replicaset::cleanup_old_replica_sets(&rs_api, &old_rss, limit).await?;
            if previous.phase != Some(Phase::Healthy) {
                ctx.events
                    .publish(
                        &rollout.object_ref(&()),
                        EventType::Normal,
                        reasons::ROLLOUT_COMPLETED,
                        format!("Rollout completed revision {}", pod_hash),
                    )
                    .await;
            }
        } else {
            status.phase = Some(Phase::Progressing);
            status.message = Some("Waiting for replica counts to converge".to_string());
            return Ok(StrategyOutcome::new(status, RESYNC_INTERVAL));
        }

        Ok(StrategyOutcome::new(status, IDLE_INTERVAL))
    }
}

/// Best-effort removal of the promote annotation after a promotion
async fn remove_promote_annotation(ctx: &Context, namespace: &str, name: &str) {
    let api: Api<Rollout> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = serde_json::json!({
        "metadata": { "annotations": { (PROMOTE_ANNOTATION): null } }
    });
    if let Err(e) = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        tracing::warn!(rollout = %name, error = %e, "Failed to remove promote annotation");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "blue_green_test.rs"]
mod tests;
