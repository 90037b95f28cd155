//! Traffic router plug-ins
//!
//! Uniform contract for pushing a canary weight (0-100) into an external
//! routing substrate. Reconcile is idempotent: repeated calls with the same
//! weight issue no patches.

pub mod nginx;
pub mod smi;

use crate::crd::rollout::Rollout;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("stable ingress {0} not found")]
    StableIngressNotFound(String),

    #[error("ingress {0} has no rule using service {1} as a backend")]
    NoStableBackend(String, String),

    #[error("{0} already exists but is not owned by this rollout")]
    OwnershipViolation(String),

    #[error("canary strategy is missing the {0} service")]
    MissingService(&'static str),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Uniform reconcile contract for routing substrates
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Router type name, e.g. "Nginx" or "SMI"
    fn type_name(&self) -> &'static str;

    /// Drive the substrate to route `desired_weight` percent of traffic to
    /// the canary service. Must be an idempotent no-op when already there.
    async fn reconcile(&self, desired_weight: i32) -> Result<(), TrafficError>;
}

/// Resolve the router configured on the rollout's canary strategy, if any
pub fn router_for(
    rollout: &Arc<Rollout>,
    client: &kube::Client,
) -> Option<Box<dyn TrafficRouter>> {
    let routing = rollout
        .spec
        .strategy
        .canary
        .as_ref()?
        .traffic_routing
        .as_ref()?;

    if routing.nginx.is_some() {
        return Some(Box::new(nginx::NginxRouter::new(
            rollout.clone(),
            client.clone(),
        )));
    }
    if routing.smi.is_some() {
        return Some(Box::new(smi::SmiRouter::new(rollout.clone(), client.clone())));
    }
    None
}
