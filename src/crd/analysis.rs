use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Most recent measurements retained per metric
pub const MEASUREMENT_HISTORY_LIMIT: usize = 10;

/// AnalysisTemplate holds the reusable definition of a promotion gate
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "virta.io",
    version = "v1alpha1",
    kind = "AnalysisTemplate",
    namespaced
)]
pub struct AnalysisTemplateSpec {
    /// Metrics to query as part of an analysis run
    pub metrics: Vec<AnalysisMetric>,
}

/// A metric queried and judged over the course of an analysis run
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct AnalysisMetric {
    /// Name of the metric, unique within the template
    pub name: String,

    /// Seconds between measurements. When omitted the metric is measured
    /// exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<i32>,

    /// Expression judging a measurement successful, evaluated against the
    /// measured value bound to `result` (e.g. "result < 0.95")
    #[serde(rename = "successCondition", skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,

    /// Expression judging a measurement failed. When both conditions match,
    /// or neither does, the measurement is Inconclusive.
    #[serde(rename = "failureCondition", skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,

    /// Failed measurements tolerated before the whole metric is Failed.
    /// Defaults to 1.
    #[serde(rename = "maxFailures", skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<i32>,

    /// Fail the entire run as soon as this metric fails
    #[serde(rename = "failFast", skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,

    /// Provider performing the measurement
    pub provider: AnalysisProvider,
}

impl AnalysisMetric {
    pub fn max_failures(&self) -> i32 {
        self.max_failures.unwrap_or(1)
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast.unwrap_or(false)
    }
}

/// External system used to verify the analysis. Exactly one field is set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
pub struct AnalysisProvider {
    /// Prometheus instant query
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusMetric>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct PrometheusMetric {
    /// Address of the Prometheus server. Falls back to the controller-wide
    /// address when omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Raw PromQL query. Occurrences of "{{args.<name>}}" are replaced with
    /// the run's arguments.
    pub query: String,
}

/// AnalysisRun is an instantiation of an AnalysisTemplate
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "virta.io",
    version = "v1alpha1",
    kind = "AnalysisRun",
    namespaced,
    status = "AnalysisRunStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct AnalysisRunSpec {
    /// Metrics copied from the template at instantiation time
    pub metrics: Vec<AnalysisMetric>,

    /// Arguments substituted into provider queries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<AnalysisArgument>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct AnalysisArgument {
    pub name: String,
    pub value: String,
}

/// Overall status of an AnalysisRun, a metric, or a single measurement
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AnalysisPhase {
    #[default]
    Pending,
    Running,
    Successful,
    Failed,
    Error,
    Inconclusive,
}

impl AnalysisPhase {
    /// A terminal phase will never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AnalysisPhase::Successful
                | AnalysisPhase::Failed
                | AnalysisPhase::Error
                | AnalysisPhase::Inconclusive
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, AnalysisPhase::Failed | AnalysisPhase::Error)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AnalysisRunStatus {
    /// Aggregate phase of the run
    #[serde(default)]
    pub phase: AnalysisPhase,

    /// Per-metric results keyed by metric name
    #[serde(rename = "metricResults", default)]
    pub metric_results: BTreeMap<String, MetricResult>,

    /// Human-readable detail, set when the run fails or errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Most recent measurements for a single metric
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MetricResult {
    /// Name of the metric
    pub name: String,

    /// Aggregate phase of the metric
    #[serde(default)]
    pub phase: AnalysisPhase,

    /// Bounded history of measurements, newest last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<Measurement>,

    /// Times a measurement came back Failed
    #[serde(default)]
    pub failures: i32,
}

impl MetricResult {
    pub fn last_measurement(&self) -> Option<&Measurement> {
        self.measurements.last()
    }
}

/// A point-in-time result value of a single metric
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Measurement {
    /// Phase of this single measurement
    #[serde(default)]
    pub phase: AnalysisPhase,

    /// When this measurement started (RFC3339)
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// When this measurement finished and the value was collected (RFC3339)
    #[serde(rename = "finishedAt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    /// Measured value, absent when the provider errored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Provider-specific metadata (e.g. job id for long-running providers)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}
