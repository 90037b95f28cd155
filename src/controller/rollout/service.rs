//! Service selector management
//!
//! Blue-green switches traffic by repointing the active/preview Services'
//! selectors at a revision hash; canary keeps the optional canary/stable
//! Services pinned the same way.

use super::reconcile::ReconcileError;
use crate::crd::rollout::POD_TEMPLATE_HASH_LABEL;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use tracing::info;

/// The revision hash a Service currently selects, if any
pub fn selector_hash(service: &Service) -> Option<&str> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(|selector| selector.get(POD_TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}

/// Fetch a Service by name. Not-found is surfaced as a dedicated error so
/// the caller can emit a Warning event and retry without changing state.
pub async fn get_service(
    svc_api: &Api<Service>,
    name: &str,
) -> Result<Service, ReconcileError> {
    match svc_api.get(name).await {
        Ok(svc) => Ok(svc),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            Err(ReconcileError::ServiceNotFound(name.to_string()))
        }
        Err(e) => Err(ReconcileError::KubeError(e)),
    }
}

/// Point a Service's selector at the given revision hash. No-op when the
/// selector already matches. Returns true when a patch was issued.
pub async fn switch_selector(
    svc_api: &Api<Service>,
    service: &Service,
    pod_hash: &str,
) -> Result<bool, ReconcileError> {
    let name = service
        .metadata
        .name
        .as_ref()
        .ok_or(ReconcileError::MissingName)?;
    if selector_hash(service) == Some(pod_hash) {
        return Ok(false);
    }

    info!(service = %name, pod_hash = %pod_hash, "Switching service selector");
    let patch = serde_json::json!({
        "spec": { "selector": { (POD_TEMPLATE_HASH_LABEL): pod_hash } }
    });
    svc_api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}
