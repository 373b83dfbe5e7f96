//! Daemon gauges and the HTTP endpoint that exposes them.

use std::net::SocketAddr;

use axum::{extract::Extension, http::StatusCode, routing::get, Router};
use prometheus::{Gauge, Registry, TextEncoder};
use tracing::{error, info};

pub const METRICS_ROUTE: &str = "/metrics";

/// Gauges owned by the reconciliation loop. The backend status gauges
/// live in the metrics scraper, registered against the same registry.
pub struct DaemonMetrics {
    pub last_retry_run_time: Gauge,
    pub healthy_file_configs: Gauge,
    pub unhealthy_file_configs: Gauge,
}

impl DaemonMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let last_retry_run_time = Gauge::new(
            "last_retry_run_time",
            "Unix timestamp of the most recent retry cycle",
        )?;
        let healthy_file_configs = Gauge::new(
            "healthy_file_configs",
            "Stored files with enough shards on live backends",
        )?;
        let unhealthy_file_configs = Gauge::new(
            "unhealthy_file_configs",
            "Stored files below their data shard requirement",
        )?;
        registry.register(Box::new(last_retry_run_time.clone()))?;
        registry.register(Box::new(healthy_file_configs.clone()))?;
        registry.register(Box::new(unhealthy_file_configs.clone()))?;
        Ok(Self {
            last_retry_run_time,
            healthy_file_configs,
            unhealthy_file_configs,
        })
    }
}

/// Expose the registry for prometheus agents to poll. Runs until the
/// daemon exits; a bind failure is logged and leaves the daemon up,
/// matching the treatment of a failed scrape.
pub async fn serve_metrics(registry: Registry, port: u16) {
    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .layer(Extension(registry));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Could not bind metrics endpoint");
            return;
        }
    };
    info!(port, "Serving metrics on {}", METRICS_ROUTE);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server exited");
    }
}

async fn metrics(Extension(registry): Extension<Registry>) -> (StatusCode, String) {
    let metric_families = registry.gather();
    match TextEncoder.encode_to_string(&metric_families) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {e}"),
        ),
    }
}
