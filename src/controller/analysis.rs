//! Analysis runner
//!
//! Drives AnalysisRuns: at each tick the due metrics are measured through
//! their provider, the measurement value is judged against the success and
//! failure conditions, and the aggregate run phase is derived. The rollout
//! strategies only ever look at the aggregate phase.

use crate::controller::clock::{self, Clock};
use crate::controller::metricproviders::MetricProvider;
use crate::crd::analysis::{
    AnalysisMetric, AnalysisPhase, AnalysisRun, AnalysisRunSpec, AnalysisRunStatus,
    AnalysisTemplate, Measurement, MetricResult, MEASUREMENT_HISTORY_LIMIT,
};
use crate::crd::rollout::{Rollout, RolloutAnalysisStep, POD_TEMPLATE_HASH_LABEL};
use chrono::{DateTime, Utc};
use kube::api::{Api, ObjectMeta, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Tick cadence while a metric is mid-measurement or has no interval hint
const DEFAULT_TICK: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("AnalysisRun missing namespace")]
    MissingNamespace,
}

/// Comparison operator of a condition expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConditionOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

/// A parsed condition of the form `result <op> <number>`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Condition {
    op: ConditionOp,
    threshold: f64,
}

impl Condition {
    /// Parse expressions like "result > 0.95" or "result<=10".
    pub fn parse(expr: &str) -> Result<Condition, String> {
        let rest = expr
            .trim()
            .strip_prefix("result")
            .ok_or_else(|| format!("condition must compare `result`: {expr}"))?
            .trim_start();

        // Two-character operators first.
        let (op, rest) = if let Some(r) = rest.strip_prefix(">=") {
            (ConditionOp::Ge, r)
        } else if let Some(r) = rest.strip_prefix("<=") {
            (ConditionOp::Le, r)
        } else if let Some(r) = rest.strip_prefix("==") {
            (ConditionOp::Eq, r)
        } else if let Some(r) = rest.strip_prefix("!=") {
            (ConditionOp::Ne, r)
        } else if let Some(r) = rest.strip_prefix('>') {
            (ConditionOp::Gt, r)
        } else if let Some(r) = rest.strip_prefix('<') {
            (ConditionOp::Lt, r)
        } else {
            return Err(format!("unsupported operator in condition: {expr}"));
        };

        let threshold = rest
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("condition threshold is not a number: {expr}"))?;

        Ok(Condition { op, threshold })
    }

    pub fn eval(&self, value: f64) -> bool {
        match self.op {
            ConditionOp::Gt => value > self.threshold,
            ConditionOp::Ge => value >= self.threshold,
            ConditionOp::Lt => value < self.threshold,
            ConditionOp::Le => value <= self.threshold,
            ConditionOp::Eq => value == self.threshold,
            ConditionOp::Ne => value != self.threshold,
        }
    }
}

/// Judge one measured value against the metric's conditions.
///
/// With both conditions present: both matching or neither matching is
/// Inconclusive, otherwise the matching side wins. A lone condition implies
/// its complement. No conditions at all means every measurement succeeds.
/// Unparseable conditions are judged Inconclusive rather than guessed at.
pub fn assess_value(metric: &AnalysisMetric, value: f64) -> AnalysisPhase {
    let success = metric
        .success_condition
        .as_deref()
        .map(|expr| Condition::parse(expr).map(|c| c.eval(value)));
    let failure = metric
        .failure_condition
        .as_deref()
        .map(|expr| Condition::parse(expr).map(|c| c.eval(value)));

    match (success, failure) {
        (Some(Err(_)), _) | (_, Some(Err(_))) => AnalysisPhase::Inconclusive,
        (Some(Ok(true)), Some(Ok(true))) => AnalysisPhase::Inconclusive,
        (Some(Ok(false)), Some(Ok(false))) => AnalysisPhase::Inconclusive,
        (_, Some(Ok(true))) => AnalysisPhase::Failed,
        (Some(Ok(true)), _) => AnalysisPhase::Successful,
        (Some(Ok(false)), None) => AnalysisPhase::Failed,
        (None, Some(Ok(false))) => AnalysisPhase::Successful,
        (None, None) => AnalysisPhase::Successful,
    }
}

/// Whether the metric needs another measurement now
fn metric_due(metric: &AnalysisMetric, result: &MetricResult, now: DateTime<Utc>) -> bool {
    if result.phase.is_terminal() {
        return false;
    }
    let Some(last) = result.last_measurement() else {
        return true;
    };
    // In-flight long-running measurement: the resume path handles it.
    if matches!(last.phase, AnalysisPhase::Pending | AnalysisPhase::Running) {
        return true;
    }
    match metric.interval {
        Some(interval) => last
            .finished_at
            .as_deref()
            .and_then(|at| clock::seconds_since(at, now))
            .map(|elapsed| elapsed >= interval as i64)
            .unwrap_or(true),
        // One-shot metric already measured.
        None => false,
    }
}

/// Fold a fresh measurement into the metric's result: judge the value,
/// bound the history, count failures, derive the metric phase.
pub fn apply_measurement(
    metric: &AnalysisMetric,
    result: &mut MetricResult,
    mut measurement: Measurement,
) {
    if let Some(value) = measurement.value {
        if measurement.phase != AnalysisPhase::Error {
            measurement.phase = assess_value(metric, value);
        }
    }

    if measurement.phase == AnalysisPhase::Failed {
        result.failures += 1;
    }

    result.measurements.push(measurement);
    if result.measurements.len() > MEASUREMENT_HISTORY_LIMIT {
        let excess = result.measurements.len() - MEASUREMENT_HISTORY_LIMIT;
        result.measurements.drain(..excess);
    }

    result.phase = if result.failures >= metric.max_failures() {
        AnalysisPhase::Failed
    } else {
        match result.last_measurement().map(|m| m.phase) {
            Some(AnalysisPhase::Error) => AnalysisPhase::Error,
            Some(phase) if phase.is_terminal() && metric.interval.is_none() => phase,
            _ => AnalysisPhase::Running,
        }
    };
}

/// Derive the aggregate run phase from the per-metric results.
///
/// Any Failed or Error metric fails the run. The run is Successful once
/// every metric's latest measurement is terminal and Successful; a metric
/// whose latest measurement failed below its maxFailures budget keeps the
/// run Running so the interval re-measures it.
pub fn aggregate_run_phase(
    metrics: &[AnalysisMetric],
    status: &AnalysisRunStatus,
) -> AnalysisPhase {
    let mut inconclusive = false;
    for metric in metrics {
        let Some(result) = status.metric_results.get(&metric.name) else {
            return AnalysisPhase::Running;
        };
        match result.phase {
            AnalysisPhase::Failed => return AnalysisPhase::Failed,
            AnalysisPhase::Error => return AnalysisPhase::Error,
            AnalysisPhase::Inconclusive => {
                inconclusive = true;
                continue;
            }
            _ => {}
        }
        match result.last_measurement().map(|m| m.phase) {
            Some(AnalysisPhase::Successful) => {}
            Some(AnalysisPhase::Inconclusive) if metric.interval.is_none() => {
                inconclusive = true;
            }
            _ => return AnalysisPhase::Running,
        }
    }
    if inconclusive {
        AnalysisPhase::Inconclusive
    } else {
        AnalysisPhase::Successful
    }
}

/// Run every due metric once and produce the next status plus the delay
/// until the following tick (None once terminal).
pub async fn compute_next_status(
    run: &AnalysisRun,
    provider: &dyn MetricProvider,
    now: DateTime<Utc>,
) -> (AnalysisRunStatus, Option<Duration>) {
    let mut status = run.status.clone().unwrap_or_default();
    if status.phase.is_terminal() {
        return (status, None);
    }
    status.phase = AnalysisPhase::Running;

    for metric in &run.spec.metrics {
        let result = status
            .metric_results
            .entry(metric.name.clone())
            .or_insert_with(|| MetricResult {
                name: metric.name.clone(),
                ..Default::default()
            });

        if !metric_due(metric, result, now) {
            continue;
        }

        let in_flight = result
            .last_measurement()
            .map(|m| matches!(m.phase, AnalysisPhase::Pending | AnalysisPhase::Running))
            .unwrap_or(false);

        let measurement = if in_flight {
            let Some(last) = result.measurements.pop() else {
                continue;
            };
            provider.resume(run, metric, last).await
        } else {
            provider.run(run, metric).await
        };

        apply_measurement(metric, result, measurement);
        provider
            .garbage_collect(run, metric, MEASUREMENT_HISTORY_LIMIT)
            .await;
    }

    let phase = aggregate_run_phase(&run.spec.metrics, &status);
    status.phase = phase;
    if phase == AnalysisPhase::Failed {
        let failed = run
            .spec
            .metrics
            .iter()
            .filter(|m| {
                status
                    .metric_results
                    .get(&m.name)
                    .map(|r| r.phase == AnalysisPhase::Failed)
                    .unwrap_or(false)
            })
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        status.message = Some(format!("metric(s) failed: {failed}"));
    }

    let requeue = if phase.is_terminal() {
        None
    } else {
        let next_interval = run
            .spec
            .metrics
            .iter()
            .filter_map(|m| m.interval)
            .min()
            .map(|secs| Duration::from_secs(secs.max(1) as u64))
            .unwrap_or(DEFAULT_TICK);
        Some(next_interval)
    };

    (status, requeue)
}

pub struct AnalysisContext {
    pub client: kube::Client,
    pub clock: Arc<dyn Clock>,
    pub provider: Arc<dyn MetricProvider>,
}

/// Reconcile one AnalysisRun key: measure due metrics, persist the status
/// when it changed, requeue at the next measurement deadline.
pub async fn reconcile_analysis_run(
    run: Arc<AnalysisRun>,
    ctx: Arc<AnalysisContext>,
) -> Result<Action, AnalysisError> {
    let namespace = run.namespace().ok_or(AnalysisError::MissingNamespace)?;
    let name = run.name_any();

    let (status, requeue) = compute_next_status(&run, ctx.provider.as_ref(), ctx.clock.now()).await;

    if run.status.as_ref() != Some(&status) {
        info!(
            analysisrun = %name,
            phase = ?status.phase,
            "Updating AnalysisRun status"
        );
        let api: Api<AnalysisRun> = Api::namespaced(ctx.client.clone(), &namespace);
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": status })),
        )
        .await?;
    }

    match requeue {
        Some(delay) => Ok(Action::requeue(delay)),
        None => Ok(Action::await_change()),
    }
}

/// Deterministic name for the run gating a rollout step. The same step of
/// the same revision always maps to the same run, keeping creation idempotent.
pub fn analysis_run_name(rollout_name: &str, pod_hash: &str, step_index: i32) -> String {
    format!("{rollout_name}-{pod_hash}-{step_index}")
}

/// Instantiate the template as an AnalysisRun owned by the rollout. Step
/// arguments are appended after the implicit rollout/revision arguments so
/// user values win on name clashes.
pub fn build_analysis_run(
    rollout: &Rollout,
    template: &AnalysisTemplate,
    step: &RolloutAnalysisStep,
    pod_hash: &str,
    step_index: i32,
) -> Result<AnalysisRun, AnalysisError> {
    let rollout_name = rollout.name_any();
    let mut arguments = vec![
        crate::crd::analysis::AnalysisArgument {
            name: "rollout".to_string(),
            value: rollout_name.clone(),
        },
        crate::crd::analysis::AnalysisArgument {
            name: "pod-template-hash".to_string(),
            value: pod_hash.to_string(),
        },
    ];
    for arg in &step.args {
        arguments.push(crate::crd::analysis::AnalysisArgument {
            name: arg.name.clone(),
            value: arg.value.clone(),
        });
    }

    Ok(AnalysisRun {
        metadata: ObjectMeta {
            name: Some(analysis_run_name(&rollout_name, pod_hash, step_index)),
            namespace: rollout.meta().namespace.clone(),
            labels: Some(
                [(POD_TEMPLATE_HASH_LABEL.to_string(), pod_hash.to_string())]
                    .into_iter()
                    .collect(),
            ),
            owner_references: rollout.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: AnalysisRunSpec {
            metrics: template.spec.metrics.clone(),
            arguments,
        },
        status: None,
    })
}

/// Message surfaced when the canary gate cannot find its template
pub fn template_not_found_message(template_name: &str) -> String {
    let message = format!("AnalysisTemplate {template_name} not found");
    warn!("{message}");
    message
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "analysis_test.rs"]
mod tests;
