use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Experiment runs a set of short-lived ReplicaSets for a bounded duration
///
/// Created by the canary `experiment` step; the rollout advances when the
/// experiment concludes Successful and aborts when it concludes Failed.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "virta.io",
    version = "v1alpha1",
    kind = "Experiment",
    namespaced,
    status = "ExperimentStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExperimentSpec {
    /// Pod templates run during the experiment
    pub templates: Vec<ExperimentTemplate>,

    /// Seconds to run once every template is available. When omitted the
    /// experiment runs until concluded externally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,

    /// Maximum seconds for the experiment to become available before it is
    /// considered failed. Defaults to 600.
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct ExperimentTemplate {
    /// Name identifying the ReplicaSet run for this template
    pub name: String,

    /// Number of desired pods. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for the template's pods
    pub selector: LabelSelector,

    /// Pod shape to run
    pub template: PodTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ExperimentPhase {
    #[default]
    Pending,
    Running,
    Successful,
    Failed,
}

impl ExperimentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentPhase::Successful | ExperimentPhase::Failed)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentStatus {
    /// Aggregate phase of the experiment
    #[serde(default)]
    pub phase: ExperimentPhase,

    /// When every template became available and the duration timer started
    #[serde(rename = "availableAt", skip_serializing_if = "Option::is_none")]
    pub available_at: Option<String>,

    /// Per-template replica counts
    #[serde(rename = "templateStatuses", default, skip_serializing_if = "Vec::is_empty")]
    pub template_statuses: Vec<ExperimentTemplateStatus>,

    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ExperimentTemplateStatus {
    pub name: String,

    #[serde(default)]
    pub replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "availableReplicas", default)]
    pub available_replicas: i32,
}
