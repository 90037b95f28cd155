//! Nginx ingress traffic router
//!
//! Maintains a companion "<stable>-canary" ingress that mirrors the stable
//! ingress's rules with backends pointed at the canary service, carrying the
//! nginx canary-weight annotation. The companion is owner-referenced to the
//! rollout; an unowned or foreign-owned companion is never modified.

use super::{TrafficError, TrafficRouter};
use crate::crd::rollout::{NginxTrafficRouting, Rollout};
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const ROUTER_TYPE: &str = "Nginx";

/// Build the desired canary ingress from the stable one.
///
/// Every rule backend referencing the stable service is repointed at the
/// canary service; an ingress with no such rule is a configuration error.
/// Annotations carry `<prefix>/canary: "true"` and `<prefix>/canary-weight`.
pub fn desired_canary_ingress(
    rollout: &Rollout,
    config: &NginxTrafficRouting,
    stable_service: &str,
    canary_service: &str,
    stable_ingress: &Ingress,
    desired_weight: i32,
) -> Result<Ingress, TrafficError> {
    let stable_name = stable_ingress.name_any();
    let canary_name = canary_ingress_name(&stable_name);
    let prefix = config.annotation_prefix();

    let mut spec = stable_ingress.spec.clone().unwrap_or_default();
    let mut has_stable_backend = false;
    if let Some(rules) = spec.rules.as_mut() {
        for rule in rules {
            if let Some(http) = rule.http.as_mut() {
                for path in &mut http.paths {
                    if let Some(service) = path.backend.service.as_mut() {
                        if service.name == stable_service {
                            has_stable_backend = true;
                            service.name = canary_service.to_string();
                        }
                    }
                }
            }
        }
    }
    if !has_stable_backend {
        return Err(TrafficError::NoStableBackend(
            stable_name,
            stable_service.to_string(),
        ));
    }

    let mut labels = stable_ingress.labels().clone();
    // The instance label would make GitOps tooling prune the companion.
    labels.remove("app.kubernetes.io/instance");

    let mut annotations: BTreeMap<String, String> = stable_ingress.annotations().clone();
    annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
    if let Some(additional) = config.additional_ingress_annotations.as_ref() {
        for (key, value) in additional {
            let key = if key.starts_with(prefix) {
                key.clone()
            } else {
                format!("{prefix}/{key}")
            };
            annotations.insert(key, value.clone());
        }
    }
    // canary-by-header / canary-by-cookie, if copied above, take precedence
    // inside nginx itself; weight is always written.
    annotations.insert(format!("{prefix}/canary"), "true".to_string());
    annotations.insert(
        format!("{prefix}/canary-weight"),
        desired_weight.to_string(),
    );

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(canary_name),
            namespace: stable_ingress.metadata.namespace.clone(),
            labels: if labels.is_empty() { None } else { Some(labels) },
            annotations: Some(annotations),
            owner_references: rollout.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

pub fn canary_ingress_name(stable_ingress_name: &str) -> String {
    format!("{stable_ingress_name}-canary")
}

/// Whether the live companion differs from the desired one in any field the
/// controller manages (spec, annotations, labels).
pub fn ingress_needs_update(current: &Ingress, desired: &Ingress) -> bool {
    current.spec != desired.spec
        || current.metadata.annotations != desired.metadata.annotations
        || current.metadata.labels != desired.metadata.labels
}

pub struct NginxRouter {
    rollout: Arc<Rollout>,
    client: kube::Client,
}

impl NginxRouter {
    pub fn new(rollout: Arc<Rollout>, client: kube::Client) -> Self {
        Self { rollout, client }
    }

    fn config(&self) -> Result<(&NginxTrafficRouting, &str, &str), TrafficError> {
        let canary = self
            .rollout
            .spec
            .strategy
            .canary
            .as_ref()
            .ok_or(TrafficError::MissingService("canary"))?;
        let config = canary
            .traffic_routing
            .as_ref()
            .and_then(|r| r.nginx.as_ref())
            .ok_or(TrafficError::MissingService("canary"))?;
        let canary_service = canary
            .canary_service
            .as_deref()
            .ok_or(TrafficError::MissingService("canary"))?;
        let stable_service = canary
            .stable_service
            .as_deref()
            .ok_or(TrafficError::MissingService("stable"))?;
        Ok((config, stable_service, canary_service))
    }
}

#[async_trait]
impl TrafficRouter for NginxRouter {
    fn type_name(&self) -> &'static str {
        ROUTER_TYPE
    }

    async fn reconcile(&self, desired_weight: i32) -> Result<(), TrafficError> {
        let (config, stable_service, canary_service) = self.config()?;
        let namespace = self.rollout.namespace().unwrap_or_default();
        let ingress_api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);

        let stable_ingress = match ingress_api.get(&config.stable_ingress).await {
            Ok(ingress) => ingress,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                return Err(TrafficError::StableIngressNotFound(
                    config.stable_ingress.clone(),
                ));
            }
            Err(e) => return Err(TrafficError::KubeError(e)),
        };

        let desired = desired_canary_ingress(
            &self.rollout,
            config,
            stable_service,
            canary_service,
            &stable_ingress,
            desired_weight,
        )?;
        let canary_name = canary_ingress_name(&config.stable_ingress);

        let current = match ingress_api.get(&canary_name).await {
            Ok(ingress) => Some(ingress),
            Err(kube::Error::Api(err)) if err.code == 404 => None,
            Err(e) => return Err(TrafficError::KubeError(e)),
        };

        let Some(current) = current else {
            info!(
                ingress = %canary_name,
                weight = desired_weight,
                "Creating canary ingress"
            );
            ingress_api.create(&PostParams::default(), &desired).await?;
            return Ok(());
        };

        // A companion created outside this controller must not be touched.
        let rollout_uid = self.rollout.meta().uid.as_deref().unwrap_or_default();
        let owned = current
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.uid == rollout_uid))
            .unwrap_or(false);
        if !owned {
            return Err(TrafficError::OwnershipViolation(canary_name));
        }

        if !ingress_needs_update(&current, &desired) {
            debug!(ingress = %canary_name, "Canary ingress already at desired state");
            return Ok(());
        }

        info!(
            ingress = %canary_name,
            weight = desired_weight,
            "Patching canary ingress"
        );
        let patch = serde_json::json!({
            "metadata": {
                "annotations": desired.metadata.annotations,
                "labels": desired.metadata.labels,
            },
            "spec": desired.spec,
        });
        ingress_api
            .patch(&canary_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "nginx_test.rs"]
mod tests;
