//! Strategy reconcilers for rollouts
//!
//! Each update strategy implements [`RolloutStrategy`]: given the rollout
//! and the owned ReplicaSets it drives the cluster one step toward the
//! declared state and produces the next status plus a requeue deadline.
//! Validation guarantees exactly one strategy is configured before dispatch.

pub mod blue_green;
pub mod canary;

use crate::controller::analysis::AnalysisError;
use crate::controller::rollout::reconcile::{Context, ReconcileError};
use crate::controller::trafficrouting::TrafficError;
use crate::crd::rollout::{Rollout, RolloutStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Requeue cadence for wait states driven by cluster convergence; watches
/// usually fire sooner, this is the liveness resync.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue cadence once a rollout is healthy and quiescent
pub const IDLE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("traffic routing failed: {0}")]
    Traffic(#[from] TrafficError),

    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
}

/// Result of one strategy reconcile: the status to persist and when to look
/// again.
pub struct StrategyOutcome {
    pub status: RolloutStatus,
    pub requeue_after: Duration,
}

impl StrategyOutcome {
    pub fn new(status: RolloutStatus, requeue_after: Duration) -> Self {
        Self {
            status,
            requeue_after,
        }
    }
}

#[async_trait]
pub trait RolloutStrategy: Send + Sync {
    /// Strategy name for logging and metrics labels
    fn name(&self) -> &'static str;

    /// Drive one reconcile of this strategy. Idempotent: with converged
    /// cluster state it issues no patches and returns an equal status.
    async fn reconcile(
        &self,
        rollout: &Arc<Rollout>,
        owned: &[ReplicaSet],
        ctx: &Context,
    ) -> Result<StrategyOutcome, StrategyError>;
}

/// Select the strategy handler. Callers validate the spec first, so a
/// missing strategy cannot reach dispatch; blue-green wins the impossible
/// tie for determinism.
pub fn select_strategy(rollout: &Rollout) -> Box<dyn RolloutStrategy> {
    if rollout.spec.strategy.blue_green.is_some() {
        Box::new(blue_green::BlueGreenStrategyHandler)
    } else {
        Box::new(canary::CanaryStrategyHandler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::rollout::{BlueGreenStrategy, CanaryStrategy, RolloutSpec, RolloutStrategy as RolloutStrategySpec};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    fn rollout_with(strategy: RolloutStrategySpec) -> Rollout {
        Rollout {
            metadata: kube::api::ObjectMeta {
                name: Some("test-rollout".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: RolloutSpec {
                replicas: 3,
                selector: LabelSelector::default(),
                template: PodTemplateSpec::default(),
                strategy,
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
    fn test_select_strategy_blue_green() {
        let rollout = rollout_with(RolloutStrategySpec {
            blue_green: Some(BlueGreenStrategy {
                active_service: "app-active".to_string(),
                preview_service: None,
                preview_replica_count: None,
                auto_promotion_enabled: None,
                auto_promotion_seconds: None,
                scale_down_delay_seconds: None,
                scale_down_delay_revision_limit: None,
            }),
            canary: None,
        });
        assert_eq!(select_strategy(&rollout).name(), "blue-green");
    }

    #[test]
    fn test_select_strategy_canary() {
        let rollout = rollout_with(RolloutStrategySpec {
            blue_green: None,
            canary: Some(CanaryStrategy::default()),
        });
        assert_eq!(select_strategy(&rollout).name(), "canary");
    }
}
