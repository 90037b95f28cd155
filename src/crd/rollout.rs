use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the pod-template hash. Written to every ReplicaSet the
/// controller creates (and to its pod template) so that services can select
/// exactly one revision.
pub const POD_TEMPLATE_HASH_LABEL: &str = "rollouts.virta.io/pod-template-hash";

/// Marks ReplicaSets managed by VIRTA so native Deployment controllers
/// never adopt them.
pub const MANAGED_LABEL: &str = "rollouts.virta.io/managed";

/// RFC3339 timestamp label on old ReplicaSets that are waiting out the
/// blue-green scale-down delay.
pub const SCALE_DOWN_AT_LABEL: &str = "rollouts.virta.io/scale-down-at";

/// Rollout is a Custom Resource for managing progressive delivery
///
/// Extends Deployment semantics with blue-green and canary update strategies.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "virta.io",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced,
    status = "RolloutStatus",
    shortname = "ro",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Up-to-date", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct RolloutSpec {
    /// Number of desired pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector for pods. Immutable after the first reconcile.
    pub selector: LabelSelector,

    /// Template describes the pods that will be created. Its content hash is
    /// the revision identity of the rollout.
    pub template: PodTemplateSpec,

    /// Deployment strategy; exactly one of blueGreen or canary
    pub strategy: RolloutStrategy,

    /// Minimum seconds a new pod must be ready without crashing to count as
    /// available. Defaults to 0.
    #[serde(rename = "minReadySeconds", skip_serializing_if = "Option::is_none")]
    pub min_ready_seconds: Option<i32>,

    /// Maximum time in seconds for the rollout to make progress before the
    /// Progressing condition turns False. Defaults to 600.
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,

    /// Number of old ReplicaSets to retain. Defaults to 10.
    #[serde(
        rename = "revisionHistoryLimit",
        skip_serializing_if = "Option::is_none"
    )]
    pub revision_history_limit: Option<i32>,

    /// Pauses the rollout at its current step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,

    /// When set to a time in the past, every pod older than this timestamp is
    /// restarted, one at a time
    #[serde(rename = "restartAt", skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<String>,
}

fn default_replicas() -> i32 {
    1
}

impl RolloutSpec {
    pub fn min_ready_seconds(&self) -> i32 {
        self.min_ready_seconds.unwrap_or(0)
    }

    pub fn progress_deadline_seconds(&self) -> i32 {
        self.progress_deadline_seconds.unwrap_or(600)
    }

    pub fn revision_history_limit(&self) -> i32 {
        self.revision_history_limit.unwrap_or(10)
    }

    pub fn paused(&self) -> bool {
        self.paused.unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutStrategy {
    /// Blue-Green deployment strategy
    #[serde(rename = "blueGreen", skip_serializing_if = "Option::is_none")]
    pub blue_green: Option<BlueGreenStrategy>,

    /// Canary deployment strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStrategy>,
}

/// Blue-Green deployment strategy
///
/// Maintains two full environments. User traffic reaches the active service;
/// the preview service fronts the candidate for smoke testing until the
/// active selector is switched over.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct BlueGreenStrategy {
    /// Name of the service whose selector is switched to the new revision on
    /// promotion (receives production traffic)
    #[serde(rename = "activeService")]
    pub active_service: String,

    /// Name of the service that selects the candidate pods before promotion
    #[serde(rename = "previewService", skip_serializing_if = "Option::is_none")]
    pub preview_service: Option<String>,

    /// Number of replicas to run under the preview service before the
    /// switchover. The new ReplicaSet is scaled to full size before the
    /// active service switches.
    #[serde(
        rename = "previewReplicaCount",
        skip_serializing_if = "Option::is_none"
    )]
    pub preview_replica_count: Option<i32>,

    /// Whether the new ReplicaSet is promoted to the active service
    /// automatically. Defaults to true; when false the rollout pauses until
    /// spec.paused is reset to false.
    #[serde(
        rename = "autoPromotionEnabled",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_promotion_enabled: Option<bool>,

    /// Seconds to pause before auto-promoting once the new ReplicaSet is ready
    #[serde(
        rename = "autoPromotionSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub auto_promotion_seconds: Option<i32>,

    /// Delay before scaling down the previous ReplicaSet after the active
    /// switch. Defaults to 30; a minimum of 30 seconds is recommended to let
    /// iptables propagation settle across nodes.
    #[serde(
        rename = "scaleDownDelaySeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay_seconds: Option<i32>,

    /// Number of old ReplicaSets that may wait out the scale-down delay at a
    /// time. Must not exceed revisionHistoryLimit.
    #[serde(
        rename = "scaleDownDelayRevisionLimit",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay_revision_limit: Option<i32>,
}

impl BlueGreenStrategy {
    pub fn auto_promotion_enabled(&self) -> bool {
        self.auto_promotion_enabled.unwrap_or(true)
    }

    pub fn scale_down_delay_seconds(&self) -> i32 {
        self.scale_down_delay_seconds.unwrap_or(30)
    }
}

/// Canary deployment strategy
///
/// Walks an ordered step list, shifting replicas (and, when a traffic router
/// is configured, request weight) from the stable ReplicaSet to the canary.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryStrategy {
    /// Name of the service selecting canary pods
    #[serde(rename = "canaryService", skip_serializing_if = "Option::is_none")]
    pub canary_service: Option<String>,

    /// Name of the service selecting stable pods
    #[serde(rename = "stableService", skip_serializing_if = "Option::is_none")]
    pub stable_service: Option<String>,

    /// Ordered steps of the canary progression
    #[serde(default)]
    pub steps: Vec<CanaryStep>,

    /// Maximum pods above spec.replicas during the update. Absolute number
    /// (e.g. "5") or percentage (e.g. "25%", rounded up). Defaults to "25%".
    #[serde(rename = "maxSurge", skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<String>,

    /// Maximum pods below spec.replicas during the update. Absolute number or
    /// percentage (rounded down). Defaults to "25%". Cannot be 0 when
    /// maxSurge is 0.
    #[serde(rename = "maxUnavailable", skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<String>,

    /// Traffic routing configuration. When omitted the weight is implied by
    /// the replica ratio alone.
    #[serde(rename = "trafficRouting", skip_serializing_if = "Option::is_none")]
    pub traffic_routing: Option<TrafficRouting>,
}

impl CanaryStrategy {
    pub fn max_surge(&self) -> &str {
        self.max_surge.as_deref().unwrap_or("25%")
    }

    pub fn max_unavailable(&self) -> &str {
        self.max_unavailable.as_deref().unwrap_or("25%")
    }
}

/// One canary step. Exactly one of the fields may be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct CanaryStep {
    /// Percentage of traffic to route to the canary (0-100)
    #[serde(rename = "setWeight", skip_serializing_if = "Option::is_none")]
    pub set_weight: Option<i32>,

    /// Pause the rollout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<RolloutPause>,

    /// Gate the step on an AnalysisRun
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RolloutAnalysisStep>,

    /// Gate the step on a sibling Experiment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<RolloutExperimentStep>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct RolloutPause {
    /// Seconds to wait before moving to the next step. When omitted the
    /// rollout pauses indefinitely until spec.paused is reset to false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
}

/// Analysis gate: instantiates the named AnalysisTemplate as an AnalysisRun
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct RolloutAnalysisStep {
    /// Name of the AnalysisTemplate in the rollout's namespace
    #[serde(rename = "templateName")]
    pub template_name: String,

    /// Arguments resolved into the run's metric queries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<AnalysisStepArg>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct AnalysisStepArg {
    pub name: String,
    pub value: String,
}

/// Experiment gate: runs short-lived ReplicaSets from the named templates
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct RolloutExperimentStep {
    /// Templates to run for the experiment
    pub templates: Vec<ExperimentStepTemplate>,

    /// Seconds the experiment runs once available. When omitted it runs
    /// until it is concluded externally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct ExperimentStepTemplate {
    /// Template name, unique within the experiment
    pub name: String,

    /// Which rollout revision the template pods are built from
    #[serde(rename = "specRef")]
    pub spec_ref: ExperimentSpecRef,

    /// Replicas for this template. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ExperimentSpecRef {
    #[serde(rename = "stable")]
    Stable,
    #[serde(rename = "canary")]
    Canary,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct TrafficRouting {
    /// Nginx ingress controller routing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx: Option<NginxTrafficRouting>,

    /// SMI TrafficSplit routing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smi: Option<SmiTrafficRouting>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct NginxTrafficRouting {
    /// Name of the ingress fronting the stable service. The controller
    /// maintains a companion "<name>-canary" ingress carrying the canary
    /// weight annotation.
    #[serde(rename = "stableIngress")]
    pub stable_ingress: String,

    /// Annotation prefix for the canary annotations. Defaults to
    /// "nginx.ingress.kubernetes.io".
    #[serde(rename = "annotationPrefix", skip_serializing_if = "Option::is_none")]
    pub annotation_prefix: Option<String>,

    /// Extra annotations copied onto the canary ingress, prefixed unless
    /// already carrying the annotation prefix
    #[serde(
        rename = "additionalIngressAnnotations",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_ingress_annotations: Option<BTreeMap<String, String>>,
}

impl NginxTrafficRouting {
    pub fn annotation_prefix(&self) -> &str {
        self.annotation_prefix
            .as_deref()
            .unwrap_or("nginx.ingress.kubernetes.io")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct SmiTrafficRouting {
    /// Name of the TrafficSplit. Defaults to the rollout name.
    #[serde(rename = "trafficSplitName", skip_serializing_if = "Option::is_none")]
    pub traffic_split_name: Option<String>,

    /// Root service of the split. Defaults to the stable service.
    #[serde(rename = "rootService", skip_serializing_if = "Option::is_none")]
    pub root_service: Option<String>,
}

/// Phase of a Rollout
///
/// Summarizes the state machine position for humans and printcolumns; the
/// authoritative state lives in the conditions and strategy sub-statuses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Actively moving replicas or traffic toward the new revision
    #[default]
    Progressing,
    /// The preview service points at the new revision, awaiting promotion
    PreviewActive,
    /// Paused by the user or by a pause step / promotion gate
    Paused,
    /// Waiting out autoPromotionSeconds before switching the active service
    PromotionDelay,
    /// Active service switched; old ReplicaSets wait out the scale-down delay
    ScaleDownDelay,
    /// All ReplicaSets converged on the current revision
    Healthy,
    /// Progress deadline exceeded or a gate failed
    Degraded,
}

/// Type of a rollout condition, mirroring native Deployment conditions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RolloutConditionType {
    Available,
    Progressing,
    ReplicaFailure,
    InvalidSpec,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition of a Rollout at a point in time
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct RolloutCondition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub condition_type: RolloutConditionType,

    /// True, False, or Unknown
    pub status: ConditionStatus,

    /// Last time this condition was updated (RFC3339)
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: String,

    /// Last time the condition transitioned between statuses (RFC3339)
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,

    /// Machine-readable reason for the last transition
    pub reason: String,

    /// Human-readable detail
    pub message: String,
}

/// Status of the Rollout. Rewritten wholesale each reconcile; never merged
/// field by field.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RolloutStatus {
    /// Hash of the current pod template; identity of the newest revision
    #[serde(rename = "currentPodHash", skip_serializing_if = "Option::is_none")]
    pub current_pod_hash: Option<String>,

    /// Hash of the current canary step list; a change resets the step index
    #[serde(rename = "currentStepHash", skip_serializing_if = "Option::is_none")]
    pub current_step_hash: Option<String>,

    /// Current canary step index in [0, steps.len()]
    #[serde(rename = "currentStepIndex", skip_serializing_if = "Option::is_none")]
    pub current_step_index: Option<i32>,

    /// Total non-terminated pods across owned ReplicaSets
    #[serde(default)]
    pub replicas: i32,

    /// Non-terminated pods running the desired template
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    /// Ready pods across owned ReplicaSets
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    /// Pods available (ready for at least minReadySeconds)
    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,

    /// Non-terminated replicas receiving active traffic (HPA target)
    #[serde(rename = "HPAReplicas", default)]
    pub hpa_replicas: i32,

    /// Selector identifying the pods receiving active traffic (HPA target)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Set while the rollout sits in a pause gate (RFC3339)
    #[serde(rename = "pauseStartTime", skip_serializing_if = "Option::is_none")]
    pub pause_start_time: Option<String>,

    /// Conditions of the rollout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<RolloutCondition>,

    /// Stable hash of the observed spec
    #[serde(
        rename = "observedGeneration",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<String>,

    /// Hash collisions encountered while naming ReplicaSets
    #[serde(rename = "collisionCount", skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Blue-green specific status
    #[serde(rename = "blueGreen", default)]
    pub blue_green: BlueGreenStatus,

    /// Canary specific status
    #[serde(default)]
    pub canary: CanaryStatus,

    /// Completion marker of the last pod-restart sweep (RFC3339)
    #[serde(rename = "restartedAt", skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<String>,

    /// Lifecycle phase for humans and printcolumns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Human-readable summary of the phase
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BlueGreenStatus {
    /// Pod-template hash the active service currently selects
    #[serde(rename = "activeSelector", skip_serializing_if = "Option::is_none")]
    pub active_selector: Option<String>,

    /// Pod-template hash the preview service currently selects
    #[serde(rename = "previewSelector", skip_serializing_if = "Option::is_none")]
    pub preview_selector: Option<String>,

    /// Start of the scale-down delay, set when the active service switches
    #[serde(
        rename = "scaleDownDelayStartTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_down_delay_start_time: Option<String>,

    /// The preview ReplicaSet is cleared to scale to full size after resume
    #[serde(
        rename = "scaleUpPreviewCheckPoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub scale_up_preview_check_point: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    /// Pod-template hash of the last ReplicaSet that completed every step
    #[serde(rename = "stableRS", skip_serializing_if = "Option::is_none")]
    pub stable_rs: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "rollout_test.rs"]
mod tests;
