//! Metric provider plug-ins for analysis runs
//!
//! A provider performs one measurement of one metric. Point-in-time
//! providers (Prometheus) resolve inside `run`; long-running providers start
//! a job in `run` and complete it through `resume`. Provider errors never
//! escape as `Err` — they become measurements with an Error phase so the
//! analysis state machine owns every outcome.

pub mod prometheus;

use crate::crd::analysis::{AnalysisMetric, AnalysisRun, Measurement};
use async_trait::async_trait;

#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Provider type name, e.g. "Prometheus"
    fn type_name(&self) -> &'static str;

    /// Start (and, for point-in-time providers, finish) one measurement
    async fn run(&self, run: &AnalysisRun, metric: &AnalysisMetric) -> Measurement;

    /// Poll an in-flight measurement of a long-running provider
    async fn resume(
        &self,
        run: &AnalysisRun,
        metric: &AnalysisMetric,
        measurement: Measurement,
    ) -> Measurement;

    /// Cancel an in-flight measurement
    async fn terminate(
        &self,
        run: &AnalysisRun,
        metric: &AnalysisMetric,
        measurement: Measurement,
    ) -> Measurement;

    /// Release provider-side resources for measurements beyond `limit`.
    /// Point-in-time providers have nothing to collect.
    async fn garbage_collect(&self, run: &AnalysisRun, metric: &AnalysisMetric, limit: usize);
}
