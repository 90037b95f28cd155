//! Kubernetes Event recording
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so reconcilers can
//! emit Normal/Warning events without talking to the API server in tests.
//!
//! Events are fire-and-forget: failures are logged and never propagate. A
//! failed event must never fail a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Well-known event reasons, as shown by `kubectl get events`
pub mod reasons {
    pub const SWITCHED_SERVICE_SELECTOR: &str = "SwitchedServiceSelector";
    pub const ROLLOUT_PAUSED: &str = "RolloutPaused";
    pub const ROLLOUT_COMPLETED: &str = "RolloutCompleted";
    pub const ROLLOUT_ABORTED: &str = "RolloutAborted";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const SERVICE_NOT_FOUND: &str = "ServiceNotFound";
    pub const INGRESS_NOT_FOUND: &str = "IngressNotFound";
    pub const OWNERSHIP_VIOLATION: &str = "OwnershipViolation";
    pub const ANALYSIS_RUN_FAILED: &str = "AnalysisRunFailed";
}

/// Trait for publishing Kubernetes Events on rollout objects
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event. `type_` is Normal or Warning, `reason` a
    /// machine-readable constant from [`reasons`], `note` the human detail.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// The controller name appears as the reportingComponent on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Records events in memory; used by unit tests and as a no-op sink
#[derive(Default)]
pub struct MemoryEventPublisher {
    events: std::sync::Mutex<Vec<(String, String)>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// (reason, note) pairs published so far
    pub fn recorded(&self) -> Vec<(String, String)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        reason: &str,
        note: String,
    ) {
        if let Ok(mut events) = self.events.lock() {
            events.push((reason.to_string(), note));
        }
    }
}
