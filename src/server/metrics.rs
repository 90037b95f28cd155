//! Prometheus metrics for the VIRTA controller
//!
//! Exposes controller health and rollout activity:
//! - Reconciliation counts and durations
//! - Rollout phase per rollout (encoded as an ordinal gauge)

use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Ordinal encoding of the rollout phase for the phase gauge
fn phase_ordinal(phase: &str) -> i64 {
    match phase {
        "Progressing" => 1,
        "PreviewActive" => 2,
        "Paused" => 3,
        "PromotionDelay" => 4,
        "ScaleDownDelay" => 5,
        "Healthy" => 6,
        "Degraded" => 7,
        _ => 0,
    }
}

/// Controller metrics registry
///
/// Thread-safe container for all controller metrics. Clone is cheap.
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Total reconciliations by result (success, error)
    pub reconciliations_total: IntCounterVec,
    /// Reconciliation duration in seconds, labeled by strategy
    pub reconciliation_duration_seconds: HistogramVec,
    /// Rollout phase per rollout (1=Progressing .. 7=Degraded)
    pub rollout_phase: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "virta_reconciliations_total",
                "Total number of reconciliations",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconciliation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "virta_reconciliation_duration_seconds",
                "Duration of reconciliation in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["strategy"],
        )?;
        registry.register(Box::new(reconciliation_duration_seconds.clone()))?;

        let rollout_phase = IntGaugeVec::new(
            Opts::new(
                "virta_rollout_phase",
                "Rollout phase: 1=Progressing 2=PreviewActive 3=Paused 4=PromotionDelay 5=ScaleDownDelay 6=Healthy 7=Degraded",
            ),
            &["namespace", "rollout"],
        )?;
        registry.register(Box::new(rollout_phase.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration_seconds,
            rollout_phase,
        })
    }

    pub fn record_reconciliation_success(&self, strategy: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["success"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_error(&self, strategy: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["error"])
            .inc();
        self.reconciliation_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    pub fn set_rollout_phase(&self, namespace: &str, rollout: &str, phase: &str) {
        self.rollout_phase
            .with_label_values(&[namespace, rollout])
            .set(phase_ordinal(phase));
    }

    /// Encode all metrics to the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Shared metrics handle for use across the controller
pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
