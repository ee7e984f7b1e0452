//! `core-server` — the event-processing runtime's executable.
//!
//! Loads `AppConfig`, constructs a `Supervisor` with a demo in-process
//! `Processor`, serves `/healthz` and `/metrics`, and shuts down gracefully
//! on `SIGINT`/`SIGTERM`.

use anyhow::Result;
use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use core_common::{Event, ProcessingOutcome};
use core_config::AppConfig;
use core_metrics::MetricsCollector;
use core_supervisor::{Processor, Supervisor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Stands in for a real egress implementation: every event succeeds after a
/// brief simulated processing delay. A production deployment swaps this for
/// whatever backend actually handles events.
struct DemoProcessor;

#[async_trait]
impl Processor for DemoProcessor {
    async fn process(&self, event: &Event) -> ProcessingOutcome {
        tokio::time::sleep(Duration::from_millis(5)).await;
        info!(event_id = %event.id, priority = ?event.priority, "event processed");
        ProcessingOutcome::Success
    }
}

#[derive(Clone)]
struct ApiState {
    supervisor: Arc<Supervisor>,
    metrics: Arc<MetricsCollector>,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instances: usize,
    queue_depth: u64,
}

async fn healthz(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        instances: state.supervisor.registry().len(),
        queue_depth: state.supervisor.queue().metrics().current_size,
    })
}

async fn metrics(State(state): State<ApiState>) -> String {
    state.metrics.tick();
    state.prometheus.render()
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    core_common::logging::init_default_logging();

    info!("starting core-server");

    let config = AppConfig::load().map_err(|err| anyhow::anyhow!("failed to load configuration: {err}"))?;
    let prometheus = core_metrics::install_prometheus_recorder();

    let shutdown_timeout = Duration::from_secs(config.instances.shutdown_timeout_seconds);
    let port = config.server.port;
    let host = config.server.host.clone();

    let supervisor = Supervisor::new(config, Arc::new(DemoProcessor))
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    supervisor.start().await;

    let state = ApiState {
        supervisor: supervisor.clone(),
        metrics: supervisor.metrics_collector().clone(),
        prometheus,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "http surface listening");

    let server_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!(%err, "http server exited with error");
        }
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    server_task.abort();
    supervisor.shutdown(shutdown_timeout).await;

    info!("core-server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => { warn!("received SIGTERM"); }
    }
}
