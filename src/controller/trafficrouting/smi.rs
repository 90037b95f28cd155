//! SMI TrafficSplit traffic router
//!
//! Maintains a `split.smi-spec.io` TrafficSplit whose root service is the
//! stable service (or an explicit root) and whose backends split traffic
//! between the canary and stable services as `{canary: w, stable: 100-w}`.
//! The split is accessed through a DynamicObject so no SMI client crate is
//! required.

use super::{TrafficError, TrafficRouter};
use crate::crd::rollout::{Rollout, SmiTrafficRouting};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

pub const ROUTER_TYPE: &str = "SMI";

fn traffic_split_resource() -> ApiResource {
    ApiResource {
        group: "split.smi-spec.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "split.smi-spec.io/v1alpha1".to_string(),
        kind: "TrafficSplit".to_string(),
        plural: "trafficsplits".to_string(),
    }
}

/// Desired TrafficSplit spec for a weight, as the wire-format JSON value
pub fn desired_traffic_split_spec(
    root_service: &str,
    stable_service: &str,
    canary_service: &str,
    desired_weight: i32,
) -> serde_json::Value {
    serde_json::json!({
        "service": root_service,
        "backends": [
            { "service": canary_service, "weight": desired_weight },
            { "service": stable_service, "weight": 100 - desired_weight },
        ]
    })
}

pub struct SmiRouter {
    rollout: Arc<Rollout>,
    client: kube::Client,
}

impl SmiRouter {
    pub fn new(rollout: Arc<Rollout>, client: kube::Client) -> Self {
        Self { rollout, client }
    }

    fn config(&self) -> Result<(&SmiTrafficRouting, &str, &str), TrafficError> {
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
            .and_then(|r| r.smi.as_ref())
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
impl TrafficRouter for SmiRouter {
    fn type_name(&self) -> &'static str {
        ROUTER_TYPE
    }

    async fn reconcile(&self, desired_weight: i32) -> Result<(), TrafficError> {
        let (config, stable_service, canary_service) = self.config()?;
        let namespace = self.rollout.namespace().unwrap_or_default();
        let rollout_name = self.rollout.name_any();

        let split_name = config
            .traffic_split_name
            .clone()
            .unwrap_or_else(|| rollout_name.clone());
        let root_service = config.root_service.as_deref().unwrap_or(stable_service);
        let desired_spec = desired_traffic_split_spec(
            root_service,
            stable_service,
            canary_service,
            desired_weight,
        );

        let resource = traffic_split_resource();
        let split_api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);

        let current = match split_api.get(&split_name).await {
            Ok(split) => Some(split),
            Err(kube::Error::Api(err)) if err.code == 404 => None,
            Err(e) => return Err(TrafficError::KubeError(e)),
        };

        let Some(current) = current else {
            info!(
                trafficsplit = %split_name,
                weight = desired_weight,
                "Creating TrafficSplit"
            );
            let mut split = DynamicObject::new(&split_name, &resource);
            split.metadata.namespace = Some(namespace);
            split.metadata.owner_references =
                self.rollout.controller_owner_ref(&()).map(|r| vec![r]);
            split.data = serde_json::json!({ "spec": desired_spec });
            split_api.create(&PostParams::default(), &split).await?;
            return Ok(());
        };

        // Never mutate a split this rollout does not own.
        let rollout_uid = self.rollout.meta().uid.as_deref().unwrap_or_default();
        let owned = current
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| {
                refs.iter()
                    .any(|r| r.controller.unwrap_or(false) && r.uid == rollout_uid)
            })
            .unwrap_or(false);
        if !owned {
            return Err(TrafficError::OwnershipViolation(split_name));
        }

        if current.data.get("spec") == Some(&desired_spec) {
            debug!(trafficsplit = %split_name, "TrafficSplit already at desired weight");
            return Ok(());
        }

        info!(
            trafficsplit = %split_name,
            weight = desired_weight,
            "Patching TrafficSplit"
        );
        split_api
            .patch(
                &split_name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({ "spec": desired_spec })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_spec_splits_weight() {
        let spec = desired_traffic_split_spec("demo-root", "demo-stable", "demo-canary", 30);
        assert_eq!(spec["service"], "demo-root");
        assert_eq!(spec["backends"][0]["service"], "demo-canary");
        assert_eq!(spec["backends"][0]["weight"], 30);
        assert_eq!(spec["backends"][1]["service"], "demo-stable");
        assert_eq!(spec["backends"][1]["weight"], 70);
    }

    #[test]
    fn test_desired_spec_is_idempotent() {
        let a = desired_traffic_split_spec("root", "stable", "canary", 50);
        let b = desired_traffic_split_spec("root", "stable", "canary", 50);
        assert_eq!(a, b);
    }

    #[test]
    fn test_weight_bounds() {
        let zero = desired_traffic_split_spec("root", "stable", "canary", 0);
        assert_eq!(zero["backends"][0]["weight"], 0);
        assert_eq!(zero["backends"][1]["weight"], 100);

        let full = desired_traffic_split_spec("root", "stable", "canary", 100);
        assert_eq!(full["backends"][0]["weight"], 100);
        assert_eq!(full["backends"][1]["weight"], 0);
    }
}
