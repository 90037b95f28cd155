use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::runtime::controller::Action;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use virta::controller::analysis::{
    reconcile_analysis_run, AnalysisContext, AnalysisError,
};
use virta::controller::clock::{Clock, SystemClock};
use virta::controller::events::KubeEventPublisher;
use virta::controller::experiment::{
    reconcile_experiment, ExperimentContext, ExperimentError,
};
use virta::controller::metricproviders::prometheus::PrometheusProvider;
use virta::controller::{reconcile, Context, ReconcileError};
use virta::crd::analysis::AnalysisRun;
use virta::crd::experiment::Experiment;
use virta::crd::rollout::Rollout;
use virta::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};

/// Default port for health endpoints
const HEALTH_PORT: u16 = 8080;

fn health_port() -> u16 {
    std::env::var("VIRTA_HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(HEALTH_PORT)
}

/// Controller-wide Prometheus address for analysis metrics, if configured
fn prometheus_address() -> Option<String> {
    std::env::var("VIRTA_PROMETHEUS_ADDRESS")
        .ok()
        .filter(|v| !v.is_empty())
}

/// Error policy for the rollout controller: retry with backoff.
///
/// Uses `warn!` since reconciliation errors are expected and retried.
pub fn error_policy(_rollout: Arc<Rollout>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!("Reconcile error (will retry): {:?}", error);
    if let Some(metrics) = ctx.metrics.as_ref() {
        metrics.record_reconciliation_error("unknown", 0.0);
    }
    Action::requeue(Duration::from_secs(10))
}

fn analysis_error_policy(
    _run: Arc<AnalysisRun>,
    error: &AnalysisError,
    _ctx: Arc<AnalysisContext>,
) -> Action {
    warn!("AnalysisRun reconcile error (will retry): {:?}", error);
    Action::requeue(Duration::from_secs(10))
}

fn experiment_error_policy(
    _experiment: Arc<Experiment>,
    error: &ExperimentError,
    _ctx: Arc<ExperimentContext>,
) -> Action {
    warn!("Experiment reconcile error (will retry): {:?}", error);
    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting VIRTA progressive delivery controller");

    let (shutdown_controller, _shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics().map_err(|e| anyhow::anyhow!("metrics registry: {e}"))?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    // Health and metrics server in the background.
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let port = health_port();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = Arc::new(KubeEventPublisher::new(client.clone(), "virta-controller"));

    let prometheus = prometheus_address();
    match &prometheus {
        Some(address) => info!(address = %address, "Prometheus analysis provider configured"),
        None => info!("No Prometheus address configured; analysis metrics need per-metric servers"),
    }

    let ctx = Arc::new(Context::new(
        client.clone(),
        clock.clone(),
        events,
        Some(metrics.clone()),
    ));
    let analysis_ctx = Arc::new(AnalysisContext {
        client: client.clone(),
        clock: clock.clone(),
        provider: Arc::new(PrometheusProvider::new(prometheus, clock.clone())),
    });
    let experiment_ctx = Arc::new(ExperimentContext {
        client: client.clone(),
        clock: clock.clone(),
    });

    // Rollouts drive ReplicaSets; changes to owned sets retrigger the owner.
    let rollouts = Api::<Rollout>::all(client.clone());
    let rollout_controller = Controller::new(rollouts, watcher::Config::default())
        .owns(
            Api::<ReplicaSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled rollout: {:?}", o);
            }
            // Errors are logged in error_policy, no duplicate logging.
        });

    let runs = Api::<AnalysisRun>::all(client.clone());
    let analysis_controller = Controller::new(runs, watcher::Config::default())
        .run(reconcile_analysis_run, analysis_error_policy, analysis_ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled analysis run: {:?}", o);
            }
        });

    let experiments = Api::<Experiment>::all(client.clone());
    let experiment_controller = Controller::new(experiments, watcher::Config::default())
        .owns(
            Api::<ReplicaSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .run(reconcile_experiment, experiment_error_policy, experiment_ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled experiment: {:?}", o);
            }
        });

    readiness.set_ready();
    info!("Controller ready, starting reconciliation loops");

    tokio::select! {
        _ = futures::future::join3(rollout_controller, analysis_controller, experiment_controller) => {
            info!("Controller streams ended");
        }
        signal = wait_for_signal() => {
            info!(signal = signal, "Initiating graceful shutdown");
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    health_handle.abort();
    info!("VIRTA controller shut down gracefully");
    Ok(())
}
