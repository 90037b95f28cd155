//! Prometheus metric provider
//!
//! Point-in-time provider: `run` executes an instant query and resolves the
//! measurement immediately. The query may reference run arguments as
//! `{{args.<name>}}`.

use super::MetricProvider;
use crate::controller::clock::Clock;
use crate::crd::analysis::{AnalysisMetric, AnalysisPhase, AnalysisRun, Measurement};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const PROVIDER_TYPE: &str = "Prometheus";

#[derive(Debug, Error)]
pub enum PrometheusError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("metric has no prometheus provider configured")]
    NotConfigured,

    #[error("no Prometheus server address configured")]
    NoServerAddress,

    #[error("failed to parse response: {0}")]
    ParseError(String),

    #[error("no data returned from Prometheus")]
    NoData,

    #[error("invalid metric value: {0}")]
    InvalidValue(String),
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Parse an instant query response and extract the first sample value
fn parse_instant_query(json_response: &str) -> Result<f64, PrometheusError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| PrometheusError::ParseError(format!("invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(PrometheusError::HttpError(format!(
            "query failed with status: {}",
            response.status
        )));
    }

    let result = response.data.result.first().ok_or(PrometheusError::NoData)?;
    let value = result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| PrometheusError::ParseError(format!("invalid value: {}", e)))?;

    if value.is_nan() {
        return Err(PrometheusError::InvalidValue("NaN".to_string()));
    }
    if value.is_infinite() {
        return Err(PrometheusError::InvalidValue("infinity".to_string()));
    }

    Ok(value)
}

/// Substitute `{{args.<name>}}` references with run argument values
fn resolve_query(query: &str, run: &AnalysisRun) -> String {
    let mut resolved = query.to_string();
    for arg in &run.spec.arguments {
        resolved = resolved.replace(&format!("{{{{args.{}}}}}", arg.name), &arg.value);
    }
    resolved
}

pub struct PrometheusProvider {
    /// Controller-wide fallback when the metric does not name a server
    default_address: Option<String>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl PrometheusProvider {
    pub fn new(default_address: Option<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_address,
            client: reqwest::Client::new(),
            clock,
        }
    }

    async fn query_instant(
        &self,
        run: &AnalysisRun,
        metric: &AnalysisMetric,
    ) -> Result<f64, PrometheusError> {
        let prom = metric
            .provider
            .prometheus
            .as_ref()
            .ok_or(PrometheusError::NotConfigured)?;
        let server = prom
            .server
            .as_deref()
            .or(self.default_address.as_deref())
            .ok_or(PrometheusError::NoServerAddress)?;

        let query = resolve_query(&prom.query, run);
        let url = format!("{}/api/v1/query", server.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .query(&[("query", query.as_str())])
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| PrometheusError::HttpError(format!("request failed: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| PrometheusError::HttpError(format!("failed to read response: {}", e)))?;

        parse_instant_query(&body)
    }
}

#[async_trait]
impl MetricProvider for PrometheusProvider {
    fn type_name(&self) -> &'static str {
        PROVIDER_TYPE
    }

    async fn run(&self, run: &AnalysisRun, metric: &AnalysisMetric) -> Measurement {
        let started_at = self.clock.now().to_rfc3339();
        match self.query_instant(run, metric).await {
            Ok(value) => Measurement {
                phase: AnalysisPhase::Pending,
                started_at: Some(started_at),
                finished_at: Some(self.clock.now().to_rfc3339()),
                value: Some(value),
                metadata: Default::default(),
            },
            Err(e) => {
                warn!(metric = %metric.name, error = %e, "Prometheus measurement failed");
                Measurement {
                    phase: AnalysisPhase::Error,
                    started_at: Some(started_at),
                    finished_at: Some(self.clock.now().to_rfc3339()),
                    value: None,
                    metadata: [("error".to_string(), e.to_string())].into_iter().collect(),
                }
            }
        }
    }

    async fn resume(
        &self,
        run: &AnalysisRun,
        metric: &AnalysisMetric,
        _measurement: Measurement,
    ) -> Measurement {
        // Point-in-time provider: re-running is the only sensible resume.
        self.run(run, metric).await
    }

    async fn terminate(
        &self,
        _run: &AnalysisRun,
        _metric: &AnalysisMetric,
        mut measurement: Measurement,
    ) -> Measurement {
        measurement.finished_at = Some(self.clock.now().to_rfc3339());
        measurement
    }

    async fn garbage_collect(&self, _run: &AnalysisRun, _metric: &AnalysisMetric, _limit: usize) {
        // Nothing held server-side for instant queries.
    }
}
