//! Top-level rollout reconciliation
//!
//! Order per key: fetch collaborators, validate the spec, run the pod
//! restart sweep, dispatch to the strategy reconciler, persist status,
//! requeue at the earliest deadline. All mutation flows through here and
//! the strategies; nothing in memory is shared across keys.

use crate::controller::clock::Clock;
use crate::controller::events::{reasons, EventPublisher};
use crate::controller::rollout::restart::{self, RestartOutcome};
use crate::controller::rollout::{replicaset, status as status_calc, validation};
use crate::controller::strategies::{self, StrategyError};
use crate::crd::rollout::{Phase, Rollout, RolloutConditionType, RolloutStatus};
use crate::server::SharedMetrics;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Rollout missing namespace")]
    MissingNamespace,

    #[error("Rollout missing name")]
    MissingName,

    #[error("Rollout has no strategy configured")]
    MissingStrategy,

    #[error("ReplicaSet missing name in metadata")]
    ReplicaSetMissingName,

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("failed to serialize object: {0}")]
    SerializationError(String),

    #[error("invalid Rollout spec: {0}")]
    ValidationError(String),

    #[error("strategy reconciliation failed: {0}")]
    Strategy(Box<StrategyError>),
}

impl From<StrategyError> for ReconcileError {
    fn from(e: StrategyError) -> Self {
        ReconcileError::Strategy(Box::new(e))
    }
}

pub struct Context {
    pub client: kube::Client,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventPublisher>,
    /// Controller metrics; None disables recording
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        client: kube::Client,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            client,
            clock,
            events,
            metrics,
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)] // Test helper - panicking is acceptable
    pub fn new_mock(clock: Arc<dyn Clock>) -> Self {
        // reqwest/kube use rustls; a provider must be installed once.
        // install_default() is idempotent.
        let _ = rustls::crypto::ring::default_provider().install_default();

        // The client is never actually used by unit tests; a minimal config
        // keeps construction offline.
        let mut config = kube::Config::new("https://localhost:8080".parse().unwrap());
        config.default_namespace = "default".to_string();
        config.accept_invalid_certs = true;
        let client = kube::Client::try_from(config).unwrap();

        Context {
            client,
            clock,
            events: Arc::new(crate::controller::events::MemoryEventPublisher::new()),
            metrics: None,
        }
    }
}

/// Render a full LabelSelector (matchLabels + matchExpressions) as a
/// Kubernetes label-query string.
///
/// An empty render is refused: listing with an empty query selects the
/// whole namespace, and validation already rejects empty selectors, so an
/// empty result here can only mean an unsupported expression slipped
/// through.
pub fn label_selector_query(
    selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector,
) -> Result<String, ReconcileError> {
    let mut terms: Vec<String> = Vec::new();

    if let Some(labels) = selector.match_labels.as_ref() {
        terms.extend(labels.iter().map(|(k, v)| format!("{k}={v}")));
    }

    for expr in selector.match_expressions.iter().flatten() {
        let values = expr
            .values
            .as_ref()
            .map(|v| v.join(","))
            .unwrap_or_default();
        match expr.operator.as_str() {
            "In" => terms.push(format!("{} in ({values})", expr.key)),
            "NotIn" => terms.push(format!("{} notin ({values})", expr.key)),
            "Exists" => terms.push(expr.key.clone()),
            "DoesNotExist" => terms.push(format!("!{}", expr.key)),
            other => {
                return Err(ReconcileError::ValidationError(format!(
                    "spec.selector.matchExpressions has unsupported operator: {other}"
                )))
            }
        }
    }

    if terms.is_empty() {
        return Err(ReconcileError::ValidationError(
            "spec.selector renders to an empty label query".to_string(),
        ));
    }
    Ok(terms.join(","))
}

/// List the ReplicaSets this rollout may manage: those matching its pod
/// selector that are either controller-owned by it or not controller-owned
/// at all (adoptable orphans).
pub async fn list_owned_replica_sets(
    rs_api: &Api<ReplicaSet>,
    rollout: &Rollout,
) -> Result<Vec<ReplicaSet>, ReconcileError> {
    let selector = label_selector_query(&rollout.spec.selector)?;

    let listed = rs_api.list(&ListParams::default().labels(&selector)).await?;
    Ok(listed
        .items
        .into_iter()
        .filter(|rs| {
            let controller_owned = rs
                .metadata
                .owner_references
                .as_ref()
                .map(|refs| refs.iter().any(|r| r.controller.unwrap_or(false)))
                .unwrap_or(false);
            !controller_owned || replicaset::is_owned_by(rollout, rs)
        })
        .collect())
}

/// Reconcile one rollout key.
///
/// Returns the requeue action; errors route to the controller's error
/// policy for backoff.
pub async fn reconcile(rollout: Arc<Rollout>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start_time = std::time::Instant::now();
    let namespace = rollout.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = rollout.name_any();
    let now = ctx.clock.now();

    info!(rollout = %name, namespace = %namespace, "Reconciling Rollout");

    // Validate before any state change. Invalid specs get the InvalidSpec
    // condition and no requeue until the spec changes.
    if let Err(message) = validation::validate_rollout(&rollout) {
        warn!(rollout = %name, error = %message, "Rollout spec validation failed");
        ctx.events
            .publish(
                &rollout.object_ref(&()),
                EventType::Warning,
                reasons::INVALID_SPEC,
                message.clone(),
            )
            .await;

        let mut status = rollout.status.clone().unwrap_or_default();
        status_calc::set_invalid_spec_condition(&mut status, &message, now);
        status.phase = Some(Phase::Degraded);
        status.message = Some(message);
        persist_status(&ctx, &namespace, &name, &rollout, status).await?;

        if let Some(metrics) = ctx.metrics.as_ref() {
            metrics.record_reconciliation_error("invalid", start_time.elapsed().as_secs_f64());
        }
        return Ok(Action::await_change());
    }

    let rs_api: Api<ReplicaSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let owned = list_owned_replica_sets(&rs_api, &rollout).await?;

    // Pod restart sweep, ahead of strategy work.
    let mut restart_completed_at: Option<String> = None;
    let mut restart_in_progress = false;
    if restart::needs_restart(&rollout, now) {
        let previous = rollout.status.clone().unwrap_or_default();
        let new_hash =
            replicaset::compute_pod_template_hash(&rollout.spec.template, previous.collision_count)?;
        let stable_hash = previous
            .canary
            .stable_rs
            .clone()
            .or_else(|| previous.blue_green.active_selector.clone());
        let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

        match restart::reconcile_restart(
            &rollout,
            &owned,
            stable_hash.as_deref(),
            Some(new_hash.as_str()),
            &pod_api,
            now,
        )
        .await?
        {
            RestartOutcome::Completed => {
                info!(rollout = %name, "Pod restart sweep completed");
                restart_completed_at = rollout.spec.restart_at.clone();
            }
            RestartOutcome::InProgress | RestartOutcome::Blocked => {
                restart_in_progress = true;
            }
        }
    }

    // Dispatch to the strategy.
    let strategy = strategies::select_strategy(&rollout);
    let outcome = match strategy.reconcile(&rollout, &owned, &ctx).await {
        Ok(outcome) => outcome,
        Err(StrategyError::Reconcile(ReconcileError::ServiceNotFound(service))) => {
            // Referenced service is missing: surface it and retry without
            // changing state.
            warn!(rollout = %name, service = %service, "Referenced service not found");
            ctx.events
                .publish(
                    &rollout.object_ref(&()),
                    EventType::Warning,
                    reasons::SERVICE_NOT_FOUND,
                    format!("Referenced service {service} not found"),
                )
                .await;
            if let Some(metrics) = ctx.metrics.as_ref() {
                metrics.record_reconciliation_error(
                    strategy.name(),
                    start_time.elapsed().as_secs_f64(),
                );
            }
            return Ok(Action::requeue(strategies::RESYNC_INTERVAL));
        }
        Err(e) => {
            if let Some(metrics) = ctx.metrics.as_ref() {
                metrics.record_reconciliation_error(
                    strategy.name(),
                    start_time.elapsed().as_secs_f64(),
                );
            }
            return Err(e.into());
        }
    };

    let mut status = outcome.status;
    // A passing validation clears any stale InvalidSpec verdict.
    status_calc::remove_condition(&mut status, RolloutConditionType::InvalidSpec);
    if let Some(restarted_at) = restart_completed_at {
        status.restarted_at = Some(restarted_at);
    } else if let Some(previous) = rollout.status.as_ref() {
        status.restarted_at = previous.restarted_at.clone();
    }

    persist_status(&ctx, &namespace, &name, &rollout, status.clone()).await?;

    if let Some(metrics) = ctx.metrics.as_ref() {
        metrics.record_reconciliation_success(strategy.name(), start_time.elapsed().as_secs_f64());
        if let Some(phase) = status.phase {
            metrics.set_rollout_phase(&namespace, &name, &format!("{phase:?}"));
        }
    }

    let requeue = if restart_in_progress {
        outcome.requeue_after.min(restart::RESTART_CHECK_INTERVAL)
    } else {
        outcome.requeue_after
    };
    Ok(Action::requeue(requeue.max(Duration::from_secs(1))))
}

/// Persist the status subresource when it changed. The whole status object
/// is written in one merge patch; spec fields are never touched.
async fn persist_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    rollout: &Rollout,
    status: RolloutStatus,
) -> Result<(), ReconcileError> {
    if rollout.status.as_ref() == Some(&status) {
        return Ok(());
    }

    info!(
        rollout = %name,
        phase = ?status.phase,
        step = ?status.current_step_index,
        "Updating Rollout status"
    );
    let api: Api<Rollout> = Api::namespaced(ctx.client.clone(), namespace);
    match api
        .patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(rollout = %name, error = %e, "Failed to update status");
            Err(ReconcileError::KubeError(e))
        }
    }
}
